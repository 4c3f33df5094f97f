pub mod detector;

pub use detector::LinguaDetector;

use std::collections::HashMap;
use tracing::debug;

use crate::config::LanguageConfig;

/// A statistical language detector returning lowercase ISO 639-1 codes
#[cfg_attr(test, mockall::automock)]
pub trait LanguageDetector: Send + Sync {
    /// Candidate languages ranked by confidence, highest first
    fn confidence_values(&self, text: &str) -> Vec<(String, f64)>;

    /// Single best guess
    fn detect(&self, text: &str) -> Option<String>;
}

/// Best-guess language of review text, defaulting to English
pub struct LanguageIdentifier {
    detector: Box<dyn LanguageDetector>,
    config: LanguageConfig,
}

impl LanguageIdentifier {
    pub fn new(config: LanguageConfig) -> Self {
        Self::with_detector(Box::new(LinguaDetector::new()), config)
    }

    pub fn with_detector(detector: Box<dyn LanguageDetector>, config: LanguageConfig) -> Self {
        Self { detector, config }
    }

    pub fn detect_language(&self, text: &str) -> String {
        let text = text.trim();
        if text.chars().count() < self.config.min_length {
            return self.config.fallback_language.clone();
        }

        if let Some((code, confidence)) = self.detector.confidence_values(text).into_iter().next() {
            if confidence > self.config.confidence_threshold {
                debug!("Detected {} with confidence {:.2}", code, confidence);
                return code;
            }
            debug!(
                "Top candidate {} below threshold ({:.2}), voting over {} samples",
                code, confidence, self.config.vote_samples
            );
        }

        let samples: Vec<String> = (0..self.config.vote_samples)
            .filter_map(|_| self.detector.detect(text))
            .collect();
        majority(&samples).unwrap_or_else(|| self.config.fallback_language.clone())
    }
}

/// Most frequent answer; ties go to the answer seen first
fn majority(samples: &[String]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for sample in samples {
        *counts.entry(sample.as_str()).or_insert(0) += 1;
    }

    let mut best: Option<(&str, usize)> = None;
    for sample in samples {
        let count = counts[sample.as_str()];
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((sample.as_str(), count));
        }
    }
    best.map(|(code, _)| code.to_string())
}
