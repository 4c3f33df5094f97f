// Translation to English
//
// Two tiers of models are tried for a source language:
// - a language-specific model from a fixed table
// - a multilingual model, used when no specific model exists or it fails
//
// Engines are loaded through an `EngineLoader` and kept in a bounded LRU cache
// keyed by model name. Models run behind an inference endpoint or locally as
// Marian models. Successful translations can also be kept on disk.

pub mod cache;
pub mod http;
pub mod marian;

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use cache::{format_duration, TranslationCache, TranslationCacheEntry};
pub use http::{HttpEngine, HttpEngineLoader};
pub use marian::{MarianEngine, MarianEngineLoader};

use crate::config::{EngineKind, TranslateConfig};
use crate::error::{CriticError, Result};

pub const ENGLISH: &str = "en";

/// Language-specific models, keyed by lowercase ISO 639-1 code
const LANGUAGE_MODELS: &[(&str, &str)] = &[
    ("es", "Helsinki-NLP/opus-mt-es-en"),
    ("pt", "Helsinki-NLP/opus-mt-pt-en"),
    ("fr", "Helsinki-NLP/opus-mt-fr-en"),
    ("de", "Helsinki-NLP/opus-mt-de-en"),
    ("it", "Helsinki-NLP/opus-mt-it-en"),
    ("nl", "Helsinki-NLP/opus-mt-nl-en"),
    ("ru", "Helsinki-NLP/opus-mt-ru-en"),
    ("pl", "Helsinki-NLP/opus-mt-pl-en"),
    ("uk", "Helsinki-NLP/opus-mt-uk-en"),
    ("ro", "Helsinki-NLP/opus-mt-ro-en"),
    ("sv", "Helsinki-NLP/opus-mt-sv-en"),
    ("da", "Helsinki-NLP/opus-mt-da-en"),
    ("no", "Helsinki-NLP/opus-mt-no-en"),
    ("nb", "Helsinki-NLP/opus-mt-no-en"),
    ("nn", "Helsinki-NLP/opus-mt-no-en"),
    ("fi", "Helsinki-NLP/opus-mt-fi-en"),
    ("zh", "Helsinki-NLP/opus-mt-zh-en"),
    ("zh-cn", "Helsinki-NLP/opus-mt-zh-en"),
    ("zh-tw", "Helsinki-NLP/opus-mt-zh-en"),
    ("ja", "Helsinki-NLP/opus-mt-ja-en"),
    ("ko", "Helsinki-NLP/opus-mt-ko-en"),
    ("vi", "Helsinki-NLP/opus-mt-vi-en"),
    ("th", "Helsinki-NLP/opus-mt-th-en"),
    ("id", "Helsinki-NLP/opus-mt-id-en"),
    ("ms", "Helsinki-NLP/opus-mt-ms-en"),
    ("ar", "Helsinki-NLP/opus-mt-ar-en"),
    ("he", "Helsinki-NLP/opus-mt-he-en"),
    ("fa", "Helsinki-NLP/opus-mt-fa-en"),
    ("tr", "Helsinki-NLP/opus-mt-tr-en"),
    ("hi", "Helsinki-NLP/opus-mt-hi-en"),
    ("bn", "Helsinki-NLP/opus-mt-bn-en"),
    ("cs", "Helsinki-NLP/opus-mt-cs-en"),
    ("el", "Helsinki-NLP/opus-mt-el-en"),
];

pub fn model_for_language(code: &str) -> Option<&'static str> {
    let code = code.trim().to_lowercase();
    LANGUAGE_MODELS
        .iter()
        .find(|(lang, _)| *lang == code)
        .map(|(_, model)| *model)
}

/// A loaded translation model
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranslationEngine: Send + Sync {
    async fn translate(&self, text: &str, max_length: usize) -> Result<String>;
}

/// Loads translation models by name
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load(&self, model: &str) -> Result<Arc<dyn TranslationEngine>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationOutcome {
    pub text: String,
    pub translated: bool,
    pub model: Option<String>,
}

impl TranslationOutcome {
    pub fn untranslated(text: &str) -> Self {
        Self {
            text: text.to_string(),
            translated: false,
            model: None,
        }
    }
}

pub struct Translator {
    loader: Box<dyn EngineLoader>,
    engines: Mutex<LruCache<String, Arc<dyn TranslationEngine>>>,
    cache: Option<TranslationCache>,
    multilingual_model: String,
    max_length: usize,
}

impl Translator {
    pub fn new(config: &TranslateConfig) -> Result<Self> {
        let loader: Box<dyn EngineLoader> = match config.engine {
            EngineKind::Http => Box::new(HttpEngineLoader::new(config)?),
            EngineKind::Marian => Box::new(MarianEngineLoader::new(config)),
        };
        info!("Translation engine: {:?}", config.engine);
        Ok(Self::with_loader(loader, config))
    }

    pub fn with_loader(loader: Box<dyn EngineLoader>, config: &TranslateConfig) -> Self {
        let capacity = NonZeroUsize::new(config.engine_cache_size).unwrap_or(NonZeroUsize::MIN);
        let cache = config
            .persistent_cache
            .then(|| TranslationCache::new(config.cache_dir.clone()));

        Self {
            loader,
            engines: Mutex::new(LruCache::new(capacity)),
            cache,
            multilingual_model: config.multilingual_model.clone(),
            max_length: config.max_length,
        }
    }

    pub fn persistent_cache(&self) -> Option<&TranslationCache> {
        self.cache.as_ref()
    }

    /// Translate to English, never failing: untranslatable text comes back as is
    pub async fn translate_to_english(&self, text: &str, source_lang: &str) -> TranslationOutcome {
        if source_lang.trim().eq_ignore_ascii_case(ENGLISH) {
            return TranslationOutcome::untranslated(text);
        }

        let primary = model_for_language(source_lang).unwrap_or(self.multilingual_model.as_str());
        match self.translate_with(text, primary).await {
            Ok(translation) => return translated(translation, primary),
            Err(e) => warn!("Translation from {} with {} failed: {}", source_lang, primary, e),
        }

        if primary != self.multilingual_model {
            info!("Retrying with multilingual model {}", self.multilingual_model);
            match self.translate_with(text, &self.multilingual_model).await {
                Ok(translation) => return translated(translation, &self.multilingual_model),
                Err(e) => warn!(
                    "Multilingual translation with {} failed: {}",
                    self.multilingual_model, e
                ),
            }
        }

        warn!("Keeping original {} text untranslated", source_lang);
        TranslationOutcome::untranslated(text)
    }

    async fn translate_with(&self, text: &str, model: &str) -> Result<String> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.load(text, model).await {
                return Ok(cached);
            }
        }

        let engine = self.engine(model).await?;
        let translation = engine.translate(text, self.max_length).await?;
        if translation.trim().is_empty() {
            return Err(CriticError::Translation(format!("{} returned nothing", model)));
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save(text, model, &translation).await {
                warn!("Failed to save translation to persistent cache: {}", e);
            }
        }
        Ok(translation)
    }

    /// Cached engine for `model`, loading it on first use
    async fn engine(&self, model: &str) -> Result<Arc<dyn TranslationEngine>> {
        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(model) {
            return Ok(Arc::clone(engine));
        }

        debug!("Loading translation model {}", model);
        let engine = self.loader.load(model).await?;
        engines.put(model.to_string(), Arc::clone(&engine));
        Ok(engine)
    }
}

fn translated(text: String, model: &str) -> TranslationOutcome {
    TranslationOutcome {
        text,
        translated: true,
        model: Some(model.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use mockall::predicate::eq;

    const SPANISH_MODEL: &str = "Helsinki-NLP/opus-mt-es-en";
    const MULTILINGUAL_MODEL: &str = "Helsinki-NLP/opus-mt-mul-en";

    fn config() -> TranslateConfig {
        let mut config = Config::default().translate;
        config.persistent_cache = false;
        config
    }

    fn engine(reply: Result<String>) -> Arc<dyn TranslationEngine> {
        let mut engine = MockTranslationEngine::new();
        let reply = std::sync::Mutex::new(Some(reply));
        engine.expect_translate().returning(move |_, _| {
            match reply.lock().unwrap().take() {
                Some(reply) => reply,
                None => Err(CriticError::Translation("engine exhausted".to_string())),
            }
        });
        Arc::new(engine)
    }

    fn echo_engine(prefix: &'static str) -> Arc<dyn TranslationEngine> {
        let mut engine = MockTranslationEngine::new();
        engine
            .expect_translate()
            .returning(move |text, _| Ok(format!("{}{}", prefix, text)));
        Arc::new(engine)
    }

    #[test]
    fn test_model_table() {
        assert_eq!(model_for_language("es"), Some(SPANISH_MODEL));
        assert_eq!(model_for_language("zh-CN"), Some("Helsinki-NLP/opus-mt-zh-en"));
        assert_eq!(model_for_language("sw"), None);
        assert_eq!(model_for_language("nb"), Some("Helsinki-NLP/opus-mt-no-en"));
        assert_eq!(model_for_language("nn"), Some("Helsinki-NLP/opus-mt-no-en"));
        assert_eq!(LANGUAGE_MODELS.len(), 33);
    }

    #[tokio::test]
    async fn test_english_is_untouched() {
        let mut loader = MockEngineLoader::new();
        loader.expect_load().times(0);
        let translator = Translator::with_loader(Box::new(loader), &config());

        let outcome = translator.translate_to_english("Loved it", "en").await;
        assert_eq!(outcome, TranslationOutcome::untranslated("Loved it"));
    }

    #[tokio::test]
    async fn test_language_model_is_used_and_reused() {
        let mut loader = MockEngineLoader::new();
        loader
            .expect_load()
            .with(eq(SPANISH_MODEL))
            .times(1)
            .returning(|_| Ok(echo_engine("EN: ")));
        let translator = Translator::with_loader(Box::new(loader), &config());

        for text in ["la odio", "muy bonita"] {
            let outcome = translator.translate_to_english(text, "es").await;
            assert!(outcome.translated);
            assert_eq!(outcome.text, format!("EN: {}", text));
            assert_eq!(outcome.model.as_deref(), Some(SPANISH_MODEL));
        }
    }

    #[tokio::test]
    async fn test_unknown_language_uses_multilingual_model() {
        let mut loader = MockEngineLoader::new();
        loader
            .expect_load()
            .with(eq(MULTILINGUAL_MODEL))
            .times(1)
            .returning(|_| Ok(echo_engine("")));
        let translator = Translator::with_loader(Box::new(loader), &config());

        let outcome = translator.translate_to_english("Filamu nzuri sana", "sw").await;
        assert_eq!(outcome.model.as_deref(), Some(MULTILINGUAL_MODEL));
    }

    #[tokio::test]
    async fn test_failed_language_model_retries_multilingual_once() {
        let mut loader = MockEngineLoader::new();
        loader
            .expect_load()
            .with(eq(SPANISH_MODEL))
            .times(1)
            .returning(|_| Ok(engine(Err(CriticError::Translation("503".to_string())))));
        loader
            .expect_load()
            .with(eq(MULTILINGUAL_MODEL))
            .times(1)
            .returning(|_| Ok(engine(Ok("I hate it".to_string()))));
        let translator = Translator::with_loader(Box::new(loader), &config());

        let outcome = translator.translate_to_english("la odio", "es").await;
        assert_eq!(outcome.text, "I hate it");
        assert_eq!(outcome.model.as_deref(), Some(MULTILINGUAL_MODEL));
    }

    #[tokio::test]
    async fn test_total_failure_returns_original_text() {
        let mut loader = MockEngineLoader::new();
        loader
            .expect_load()
            .times(2)
            .returning(|model| Err(CriticError::Translation(format!("{} not found", model))));
        let translator = Translator::with_loader(Box::new(loader), &config());

        let outcome = translator.translate_to_english("la odio", "es").await;
        assert_eq!(outcome, TranslationOutcome::untranslated("la odio"));
    }

    #[tokio::test]
    async fn test_load_failures_are_not_cached() {
        let mut loader = MockEngineLoader::new();
        let mut seq = mockall::Sequence::new();
        loader
            .expect_load()
            .with(eq(MULTILINGUAL_MODEL))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(CriticError::Translation("timeout".to_string())));
        loader
            .expect_load()
            .with(eq(MULTILINGUAL_MODEL))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(echo_engine("")));
        let translator = Translator::with_loader(Box::new(loader), &config());

        assert!(!translator.translate_to_english("Filamu nzuri", "sw").await.translated);
        assert!(translator.translate_to_english("Filamu nzuri", "sw").await.translated);
    }

    #[tokio::test]
    async fn test_persistent_cache_skips_the_engine() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = config();
        config.persistent_cache = true;
        config.cache_dir = temp.path().to_path_buf();

        let mut loader = MockEngineLoader::new();
        loader
            .expect_load()
            .times(1)
            .returning(|_| Ok(engine(Ok("I hate it".to_string()))));
        let translator = Translator::with_loader(Box::new(loader), &config);
        assert_eq!(translator.translate_to_english("la odio", "es").await.text, "I hate it");

        let mut loader = MockEngineLoader::new();
        loader.expect_load().times(0);
        let translator = Translator::with_loader(Box::new(loader), &config);
        let outcome = translator.translate_to_english("la odio", "es").await;
        assert_eq!(outcome.text, "I hate it");
        assert!(outcome.translated);
    }

    #[tokio::test]
    async fn test_marian_engine_selected_from_config() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = config();
        config.engine = EngineKind::Marian;
        config.marian_dir = temp.path().to_path_buf();
        config.marian_download = false;
        config.max_length = 2;
        marian::tests::write_tiny_model(
            &MarianEngineLoader::new(&config).model_dir(SPANISH_MODEL),
            5,
        );

        let translator = Translator::new(&config).unwrap();
        let outcome = translator.translate_to_english("la odio", "es").await;
        assert!(outcome.translated);
        assert_eq!(outcome.text, "great great");
        assert_eq!(outcome.model.as_deref(), Some(SPANISH_MODEL));
    }
}
