use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::heuristic::classify_keywords;
use crate::backend::{Backend, BackendKind};
use crate::config::{Config, PredictorConfig};
use crate::normalize::{normalize, Normalized, SentimentLabel};
use crate::quality::QualityFilter;
use crate::registry::BackendRegistry;

pub const GARBAGE_WARNING: &str = "Text appears to be irrelevant or garbage";

const LIGHT_BACKENDS: [BackendKind; 2] = [BackendKind::Linear, BackendKind::Ensemble];

/// What actually produced a prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendUsed {
    Transformer,
    Recurrent,
    Linear,
    Ensemble,
    /// Keyword classifier, used when no backend loads
    Heuristic,
    /// Input rejected before any backend ran
    None,
}

impl From<BackendKind> for BackendUsed {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Transformer => BackendUsed::Transformer,
            BackendKind::Recurrent => BackendUsed::Recurrent,
            BackendKind::Linear => BackendUsed::Linear,
            BackendKind::Ensemble => BackendUsed::Ensemble,
        }
    }
}

impl BackendUsed {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendUsed::Transformer => "transformer",
            BackendUsed::Recurrent => "recurrent",
            BackendUsed::Linear => "linear",
            BackendUsed::Ensemble => "ensemble",
            BackendUsed::Heuristic => "heuristic",
            BackendUsed::None => "none",
        }
    }
}

impl fmt::Display for BackendUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub label: SentimentLabel,
    pub score: f64,
    pub prob_positive: f64,
    pub prob_negative: f64,
    pub entropy: f64,
    /// Wall-clock seconds spent in the call
    pub elapsed_time: f64,
    pub requested: BackendKind,
    pub backend_used: BackendUsed,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictionResult {
    fn from_normalized(normalized: Normalized, requested: BackendKind, used: BackendUsed) -> Self {
        Self {
            label: normalized.label,
            score: normalized.score,
            prob_positive: normalized.prob_positive,
            prob_negative: normalized.prob_negative,
            entropy: normalized.entropy,
            elapsed_time: 0.0,
            requested,
            backend_used: used,
            warning: None,
            error: None,
        }
    }

    /// Even odds with a sentinel label
    fn undecided(label: SentimentLabel, requested: BackendKind, used: BackendUsed) -> Self {
        Self {
            label,
            score: 0.5,
            prob_positive: 0.5,
            prob_negative: 0.5,
            entropy: 1.0,
            elapsed_time: 0.0,
            requested,
            backend_used: used,
            warning: None,
            error: None,
        }
    }

    fn with_warning(mut self, warning: Option<String>) -> Self {
        self.warning = warning;
        self
    }
}

/// Entry point for sentiment prediction on English text.
///
/// Always returns a result: rejected input is Neutral, unavailable backends are
/// substituted along the fallback order, and prediction failures become an
/// Error result.
pub struct SentimentPredictor {
    registry: Arc<BackendRegistry>,
    filter: QualityFilter,
    fallback_order: Vec<BackendKind>,
    default_backend: BackendKind,
}

impl SentimentPredictor {
    pub fn new(config: &Config) -> Self {
        let registry = Arc::new(BackendRegistry::new(config));
        Self::with_registry(registry, &config.predictor, QualityFilter::from(&config.quality))
    }

    pub fn with_registry(
        registry: Arc<BackendRegistry>,
        config: &PredictorConfig,
        filter: QualityFilter,
    ) -> Self {
        Self {
            registry,
            filter,
            fallback_order: config.fallback_order.clone(),
            default_backend: config.default_backend,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn default_backend(&self) -> BackendKind {
        self.default_backend
    }

    pub fn get_available_models(&self) -> Vec<BackendKind> {
        self.registry.available_models()
    }

    pub fn predict_sentiment(&self, text: &str, requested: BackendKind) -> PredictionResult {
        let start = Instant::now();
        let mut result = self.dispatch(text, requested);
        result.elapsed_time = start.elapsed().as_secs_f64();
        result
    }

    fn dispatch(&self, text: &str, requested: BackendKind) -> PredictionResult {
        if let Some(reason) = self.filter.check(text) {
            debug!("Input rejected by quality filter: {:?}", reason);
            return PredictionResult::undecided(SentimentLabel::Neutral, requested, BackendUsed::None)
                .with_warning(Some(GARBAGE_WARNING.to_string()));
        }

        match self.resolve(requested) {
            Some((backend, warning)) => self.run(backend.as_ref(), text, requested).with_warning(warning),
            None => {
                warn!("No backend could be loaded, using keyword heuristic");
                heuristic_result(text, requested).with_warning(Some(format!(
                    "{} unavailable, using {} instead",
                    requested,
                    BackendUsed::Heuristic
                )))
            }
        }
    }

    /// Find a loadable backend, returning it with the substitution warning, if any
    fn resolve(&self, requested: BackendKind) -> Option<(Arc<dyn Backend>, Option<String>)> {
        let mut visited = HashSet::new();

        if self.registry.is_memory_limited() && requested.is_heavy() {
            for light in LIGHT_BACKENDS {
                visited.insert(light);
                if let Some(backend) = self.acquire(light) {
                    info!("Using {} instead of {} (memory limited environment)", light, requested);
                    let warning = format!(
                        "Using {} instead of {} (memory limited environment)",
                        light, requested
                    );
                    return Some((backend, Some(warning)));
                }
            }
        }

        let candidates = std::iter::once(requested).chain(self.fallback_order.iter().copied());
        for kind in candidates {
            if !visited.insert(kind) {
                continue;
            }
            if let Some(backend) = self.acquire(kind) {
                let warning = (kind != requested).then(|| {
                    warn!("{} unavailable, falling back to {}", requested, kind);
                    format!("{} unavailable, using {} instead", requested, kind)
                });
                return Some((backend, warning));
            }
        }

        None
    }

    fn acquire(&self, kind: BackendKind) -> Option<Arc<dyn Backend>> {
        if self.registry.ensure_loaded(kind) {
            self.registry.get(kind)
        } else {
            None
        }
    }

    fn run(&self, backend: &dyn Backend, text: &str, requested: BackendKind) -> PredictionResult {
        let used = BackendUsed::from(backend.kind());
        match backend.predict(text).and_then(normalize) {
            Ok(normalized) => PredictionResult::from_normalized(normalized, requested, used),
            Err(e) => {
                warn!("Prediction with {} failed: {}", used, e);
                let mut result = PredictionResult::undecided(SentimentLabel::Error, requested, used);
                result.error = Some(e.to_string());
                result
            }
        }
    }
}

fn heuristic_result(text: &str, requested: BackendKind) -> PredictionResult {
    match classify_keywords(text)
        .raw_prediction()
        .and_then(|raw| normalize(raw).ok())
    {
        Some(normalized) => {
            PredictionResult::from_normalized(normalized, requested, BackendUsed::Heuristic)
        }
        None => PredictionResult::undecided(SentimentLabel::Neutral, requested, BackendUsed::Heuristic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pipeline::tests::logistic_pipeline;
    use crate::backend::pipeline::PipelineBackend;
    use crate::backend::RawPrediction;
    use crate::registry::testing::{attempts, fixed, BrokenBackend, FakeLoader};

    fn predictor(loader: FakeLoader, memory_limited: bool) -> SentimentPredictor {
        let registry = Arc::new(BackendRegistry::with_loader(Box::new(loader), memory_limited));
        SentimentPredictor::with_registry(
            registry,
            &Config::default().predictor,
            QualityFilter::default(),
        )
    }

    fn linear_loader() -> FakeLoader {
        FakeLoader::default().with(Arc::new(PipelineBackend::new(
            BackendKind::Linear,
            logistic_pipeline(),
        )))
    }

    #[test]
    fn test_garbage_is_neutral_without_backend() {
        let loader = linear_loader();
        let counter = Arc::clone(&loader.attempts);
        let predictor = predictor(loader, false);

        for text in ["aaaaaaaaaa", "a s d f g h"] {
            let result = predictor.predict_sentiment(text, BackendKind::Linear);
            assert_eq!(result.label, SentimentLabel::Neutral);
            assert_eq!(result.score, 0.5);
            assert_eq!(result.entropy, 1.0);
            assert_eq!(result.backend_used, BackendUsed::None);
            assert_eq!(result.warning.as_deref(), Some(GARBAGE_WARNING));
        }
        assert_eq!(attempts(&counter, BackendKind::Linear), 0);
    }

    #[test]
    fn test_linear_positive_review() {
        let predictor = predictor(linear_loader(), false);
        let result = predictor.predict_sentiment(
            "This movie was absolutely wonderful, I loved it",
            BackendKind::Linear,
        );

        assert_eq!(result.label, SentimentLabel::Positive);
        assert!(result.score > 0.5);
        assert!((result.prob_positive + result.prob_negative - 1.0).abs() < 1e-6);
        assert_eq!(result.score, result.prob_positive.max(result.prob_negative));
        assert_eq!(result.backend_used, BackendUsed::Linear);
        assert!(result.warning.is_none());
    }

    #[test]
    fn test_repeated_predictions_agree() {
        let predictor = predictor(linear_loader(), false);
        let text = "terrible acting, I hate this movie";
        let first = predictor.predict_sentiment(text, BackendKind::Linear);
        let second = predictor.predict_sentiment(text, BackendKind::Linear);
        assert_eq!(first.label, second.label);
        assert_eq!(first.score, second.score);
    }

    #[test]
    fn test_placeholder_transformer_falls_back_with_warning() {
        let loader = linear_loader().with_placeholder(BackendKind::Transformer);
        let predictor = predictor(loader, false);

        let result = predictor.predict_sentiment(
            "This movie was absolutely wonderful, I loved it",
            BackendKind::Transformer,
        );
        assert_ne!(result.label, SentimentLabel::Error);
        assert_eq!(result.backend_used, BackendUsed::Linear);
        assert_eq!(result.requested, BackendKind::Transformer);
        assert_eq!(
            result.warning.as_deref(),
            Some("transformer unavailable, using linear instead")
        );
    }

    #[test]
    fn test_each_kind_is_tried_once() {
        let loader = FakeLoader::default();
        let counter = Arc::clone(&loader.attempts);
        let registry = Arc::new(BackendRegistry::with_loader(Box::new(loader), false));
        let mut config = Config::default().predictor;
        config.fallback_order = vec![
            BackendKind::Recurrent,
            BackendKind::Linear,
            BackendKind::Recurrent,
            BackendKind::Linear,
        ];
        let predictor =
            SentimentPredictor::with_registry(registry, &config, QualityFilter::default());

        let result = predictor.predict_sentiment("An amazing journey", BackendKind::Recurrent);
        assert_eq!(result.backend_used, BackendUsed::Heuristic);
        assert_eq!(attempts(&counter, BackendKind::Recurrent), 1);
        assert_eq!(attempts(&counter, BackendKind::Linear), 1);
        assert_eq!(attempts(&counter, BackendKind::Ensemble), 0);
    }

    #[test]
    fn test_heuristic_when_nothing_loads() {
        let predictor = predictor(FakeLoader::default(), false);

        let negative = predictor.predict_sentiment("Great cast but a boring plot", BackendKind::Linear);
        assert_eq!(negative.label, SentimentLabel::Negative);
        assert_eq!(negative.score, 0.75);
        assert_eq!(negative.backend_used, BackendUsed::Heuristic);
        assert_eq!(
            negative.warning.as_deref(),
            Some("linear unavailable, using heuristic instead")
        );

        let neutral = predictor.predict_sentiment("It was a film with actors", BackendKind::Linear);
        assert_eq!(neutral.label, SentimentLabel::Neutral);
        assert_eq!(neutral.score, 0.5);
    }

    #[test]
    fn test_memory_limited_redirects_heavy_requests() {
        let loader = FakeLoader::default()
            .with(fixed(BackendKind::Transformer, RawPrediction::Sigmoid(0.9)))
            .with(fixed(
                BackendKind::Ensemble,
                RawPrediction::Distribution { negative: 0.3, positive: 0.7 },
            ));
        let counter = Arc::clone(&loader.attempts);
        let predictor = predictor(loader, true);

        let result = predictor.predict_sentiment("A gripping, moving story", BackendKind::Transformer);
        assert_eq!(result.backend_used, BackendUsed::Ensemble);
        assert_eq!(
            result.warning.as_deref(),
            Some("Using ensemble instead of transformer (memory limited environment)")
        );
        assert_eq!(attempts(&counter, BackendKind::Transformer), 0);

        // Light requests are not redirected
        let result = predictor.predict_sentiment("A gripping, moving story", BackendKind::Ensemble);
        assert!(result.warning.is_none());
    }

    #[test]
    fn test_prediction_failure_becomes_error_result() {
        let loader = FakeLoader::default().with(Arc::new(BrokenBackend(BackendKind::Recurrent)));
        let predictor = predictor(loader, false);

        let result = predictor.predict_sentiment("A gripping, moving story", BackendKind::Recurrent);
        assert_eq!(result.label, SentimentLabel::Error);
        assert_eq!(result.score, 0.5);
        assert_eq!(result.backend_used, BackendUsed::Recurrent);
        assert!(result.error.as_deref().unwrap_or_default().contains("malformed tensor"));
    }

    #[test]
    fn test_result_serializes_backend_names() {
        let predictor = predictor(linear_loader(), false);
        let result = predictor.predict_sentiment("aaaaaaaaaa", BackendKind::Transformer);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["backend_used"], "none");
        assert_eq!(json["requested"], "transformer");
        assert_eq!(json["label"], "Neutral");
        assert!(json.get("error").is_none());
    }
}
