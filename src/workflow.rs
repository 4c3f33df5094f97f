use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::BackendKind;
use crate::config::Config;
use crate::error::Result;
use crate::language::LanguageIdentifier;
use crate::normalize::SentimentLabel;
use crate::predictor::{PredictionResult, SentimentPredictor};
use crate::store::ReviewRecord;
use crate::translate::{TranslationOutcome, Translator};

const UNDECIDED_TOLERANCE: f64 = 1e-6;

/// Optional details submitted alongside a review
#[derive(Debug, Clone, Default)]
pub struct ReviewMetadata {
    pub movie_id: Option<u64>,
    pub movie_title: Option<String>,
    pub rating: Option<f64>,
}

/// Sentiment of a review after detection and translation
#[derive(Debug, Clone)]
pub struct Analysis {
    pub language: String,
    pub translation: TranslationOutcome,
    pub prediction: PredictionResult,
}

/// Detect, translate and predict for submitted reviews
pub struct ReviewWorkflow {
    identifier: LanguageIdentifier,
    translator: Translator,
    predictor: SentimentPredictor,
}

impl ReviewWorkflow {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self::with_parts(
            LanguageIdentifier::new(config.language.clone()),
            Translator::new(&config.translate)?,
            SentimentPredictor::new(config),
        ))
    }

    pub fn with_parts(
        identifier: LanguageIdentifier,
        translator: Translator,
        predictor: SentimentPredictor,
    ) -> Self {
        Self {
            identifier,
            translator,
            predictor,
        }
    }

    pub fn predictor(&self) -> &SentimentPredictor {
        &self.predictor
    }

    pub async fn run(&self, text: &str, kind: BackendKind) -> Analysis {
        let language = self.identifier.detect_language(text);
        let translation = self.translator.translate_to_english(text, &language).await;
        let prediction = self.predictor.predict_sentiment(&translation.text, kind);

        Analysis {
            language,
            translation,
            prediction,
        }
    }

    pub async fn analyze(
        &self,
        text: &str,
        kind: BackendKind,
        metadata: &ReviewMetadata,
    ) -> ReviewRecord {
        let analysis = self.run(text, kind).await;
        info!(
            "Review analyzed: {} ({:.2}) via {} [{}]",
            analysis.prediction.label,
            analysis.prediction.score,
            analysis.prediction.backend_used,
            analysis.language
        );

        let mut record = ReviewRecord {
            review_id: Uuid::new_v4(),
            movie_id: metadata.movie_id,
            movie_title: metadata.movie_title.clone(),
            rating: metadata.rating,
            original_text: text.to_string(),
            original_language: String::new(),
            translated_text: None,
            translation_model: None,
            was_translated: false,
            sentiment_label: SentimentLabel::Neutral,
            sentiment_score: 0.5,
            model_used: String::new(),
            timestamp: Utc::now(),
            storage_fallback: None,
        };
        apply(&mut record, analysis);
        record
    }

    /// Re-analyze records left undecided, returning how many now have a verdict
    pub async fn recompute(&self, records: &mut [ReviewRecord], kind: BackendKind) -> usize {
        let pending: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, record)| needs_recompute(record))
            .map(|(index, _)| index)
            .collect();
        info!("{} of {} reviews need recomputing", pending.len(), records.len());

        let pb = ProgressBar::new(pending.len() as u64);
        match ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            Ok(style) => pb.set_style(style.progress_chars("#>-")),
            Err(e) => warn!("Invalid progress template: {}", e),
        }

        let mut fixed = 0;
        for index in pending {
            let record = &mut records[index];
            let text = record.source_text().to_string();
            if text.trim().is_empty() {
                warn!("Review {} has no text to analyze", record.review_id);
                pb.inc(1);
                continue;
            }

            let analysis = self.run(&text, kind).await;
            apply(record, analysis);
            if !needs_recompute(record) {
                fixed += 1;
            }
            pb.inc(1);
        }

        pb.finish_with_message("done");
        info!("Recomputed sentiment for {} reviews", fixed);
        fixed
    }
}

/// Undecided label or a score sitting on even odds
pub fn needs_recompute(record: &ReviewRecord) -> bool {
    !record.sentiment_label.is_decided()
        || (record.sentiment_score - 0.5).abs() <= UNDECIDED_TOLERANCE
}

fn apply(record: &mut ReviewRecord, analysis: Analysis) {
    record.original_language = analysis.language;
    if analysis.translation.translated {
        record.translated_text = Some(analysis.translation.text);
        record.translation_model = analysis.translation.model;
        record.was_translated = true;
    } else {
        record.translated_text = None;
        record.translation_model = None;
        record.was_translated = false;
    }
    record.sentiment_label = analysis.prediction.label;
    record.sentiment_score = analysis.prediction.score;
    record.model_used = analysis.prediction.backend_used.as_str().to_string();
}
