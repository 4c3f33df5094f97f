use lingua::{LanguageDetector as Lingua, LanguageDetectorBuilder};

use super::LanguageDetector;

/// Detector over every language lingua knows
pub struct LinguaDetector {
    inner: Lingua,
}

impl LinguaDetector {
    pub fn new() -> Self {
        Self {
            inner: LanguageDetectorBuilder::from_all_languages().build(),
        }
    }
}

impl Default for LinguaDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageDetector for LinguaDetector {
    fn confidence_values(&self, text: &str) -> Vec<(String, f64)> {
        self.inner
            .compute_language_confidence_values(text)
            .into_iter()
            .map(|(language, confidence)| (language.iso_code_639_1().to_string(), confidence))
            .collect()
    }

    fn detect(&self, text: &str) -> Option<String> {
        self.inner
            .detect_language_of(text)
            .map(|language| language.iso_code_639_1().to_string())
    }
}
