use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::backend::BackendKind;
use crate::error::{Result, CriticError};

// Default values for fields added after the first config format
fn default_engine_cache_size() -> usize {
    20
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_marian_dir() -> PathBuf {
    PathBuf::from("models").join("translation")
}

fn default_marian_download() -> bool {
    true
}

fn default_tokenizer_file() -> String {
    "tokenizer.json".to_string()
}

fn default_fallback_order() -> Vec<BackendKind> {
    vec![
        BackendKind::Linear,
        BackendKind::Ensemble,
        BackendKind::Recurrent,
        BackendKind::Transformer,
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub models: ModelsConfig,
    pub language: LanguageConfig,
    pub translate: TranslateConfig,
    pub quality: QualityConfig,
    pub predictor: PredictorConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Directory holding the fine-tuned transformer (config.json, tokenizer.json, weights)
    pub transformer_dir: PathBuf,
    /// Recurrent network checkpoint (safetensors or PyTorch pickle)
    pub recurrent_checkpoint: PathBuf,
    /// Word-to-index vocabulary for the recurrent network
    pub recurrent_vocab: PathBuf,
    /// Serialized TF-IDF + logistic regression pipeline
    pub linear_pipeline: PathBuf,
    /// Serialized TF-IDF + random forest pipeline
    pub ensemble_pipeline: PathBuf,
    /// Public model used when the local transformer cannot fit in memory
    pub remote_transformer: String,
    /// Allow downloading the public transformer as a fallback
    pub remote_fallback: bool,
    /// Maximum number of tokens fed to the transformer
    pub max_tokens: usize,
    /// Fixed sequence length for the recurrent network
    pub recurrent_max_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Texts shorter than this (after trimming) are assumed to be English
    pub min_length: usize,
    /// Confidence above which the top ranked language is accepted directly
    pub confidence_threshold: f64,
    /// Number of single-best detections used for the majority vote
    pub vote_samples: usize,
    /// Language returned when detection fails
    pub fallback_language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateConfig {
    /// Inference endpoint serving translation models
    pub inference_endpoint: String,
    /// Hub endpoint used to verify that a model exists before first use
    pub hub_endpoint: String,
    /// Verify models against the hub when they are first loaded
    pub verify_models: bool,
    /// API token; falls back to the HF_TOKEN environment variable
    pub api_token: Option<String>,
    /// Model used when no language-specific model exists or it fails
    pub multilingual_model: String,
    /// Maximum generated length for a translation
    pub max_length: usize,
    /// Number of loaded translation engines kept in memory
    #[serde(default = "default_engine_cache_size")]
    pub engine_cache_size: usize,
    /// HTTP timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Keep successful translations on disk
    pub persistent_cache: bool,
    /// Directory of the persistent translation cache
    pub cache_dir: PathBuf,
    /// Where translation models run
    #[serde(default)]
    pub engine: EngineKind,
    /// Local Marian models, one `org--name` directory per model
    #[serde(default = "default_marian_dir")]
    pub marian_dir: PathBuf,
    /// Download Marian models missing from `marian_dir`
    #[serde(default = "default_marian_download")]
    pub marian_download: bool,
    /// Tokenizer file for the source side of a Marian model
    #[serde(default = "default_tokenizer_file")]
    pub source_tokenizer: String,
    /// Tokenizer file for the target side of a Marian model
    #[serde(default = "default_tokenizer_file")]
    pub target_tokenizer: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Hugging Face-compatible inference endpoint
    #[default]
    Http,
    /// Marian models run locally with candle
    Marian,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Minimum trimmed length in characters
    pub min_length: usize,
    /// Consecutive repetitions of one character that mark garbage
    pub max_char_run: usize,
    /// Minimum vowel ratio over non-space characters
    pub min_vowel_ratio: f64,
    /// Maximum share of single-character tokens
    pub max_single_char_ratio: f64,
    /// Maximum share of short tokens before the whitelist check applies
    pub max_short_token_ratio: f64,
    /// Tokens up to this length count as short
    pub short_token_length: usize,
    /// Minimum whitelisted short words that rescue a short-token text
    pub min_recognizable: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLimitMode {
    /// Probe environment markers, hostname and available memory
    Auto,
    /// Always treat the environment as memory limited
    Always,
    /// Never redirect heavy backends
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Backend used when none is requested
    pub default_backend: BackendKind,
    /// Order in which alternate backends are tried
    #[serde(default = "default_fallback_order")]
    pub fallback_order: Vec<BackendKind>,
    /// Memory limited environment detection
    pub memory_limit: MemoryLimitMode,
    /// Environment variables that mark a constrained host when set to true/1
    pub memory_env_markers: Vec<String>,
    /// Hostname fragments that mark a constrained host
    pub memory_hostname_patterns: Vec<String>,
    /// Available memory (GB) below which the host counts as constrained
    pub min_available_gb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON-lines file used as local review storage
    pub backup_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let model_dir = PathBuf::from("models");
        Self {
            models: ModelsConfig {
                transformer_dir: model_dir.join("distilbert_final"),
                recurrent_checkpoint: model_dir.join("lstm_final.safetensors"),
                recurrent_vocab: model_dir.join("vocab_lstm.json"),
                linear_pipeline: model_dir.join("logistic_regression_tfidf.json"),
                ensemble_pipeline: model_dir.join("random_forest.json"),
                remote_transformer: "distilbert-base-uncased-finetuned-sst-2-english".to_string(),
                remote_fallback: true,
                max_tokens: 512,
                recurrent_max_length: 200,
            },
            language: LanguageConfig {
                min_length: 5,
                confidence_threshold: 0.7,
                vote_samples: 3,
                fallback_language: "en".to_string(),
            },
            translate: TranslateConfig {
                inference_endpoint: "https://api-inference.huggingface.co".to_string(),
                hub_endpoint: "https://huggingface.co".to_string(),
                verify_models: true,
                api_token: None,
                multilingual_model: "Helsinki-NLP/opus-mt-mul-en".to_string(),
                max_length: 512,
                engine_cache_size: 20,
                timeout_secs: 60,
                persistent_cache: true,
                cache_dir: PathBuf::from(".critic/cache/translations"),
                engine: EngineKind::Http,
                marian_dir: default_marian_dir(),
                marian_download: default_marian_download(),
                source_tokenizer: default_tokenizer_file(),
                target_tokenizer: default_tokenizer_file(),
            },
            quality: QualityConfig {
                min_length: 5,
                max_char_run: 5,
                min_vowel_ratio: 0.15,
                max_single_char_ratio: 0.5,
                max_short_token_ratio: 0.7,
                short_token_length: 3,
                min_recognizable: 2,
            },
            predictor: PredictorConfig {
                default_backend: BackendKind::Transformer,
                fallback_order: default_fallback_order(),
                memory_limit: MemoryLimitMode::Auto,
                memory_env_markers: vec![
                    "STREAMLIT_SERVER_HEADLESS".to_string(),
                    "CRITIC_MEMORY_LIMITED".to_string(),
                ],
                memory_hostname_patterns: vec![
                    "streamlit".to_string(),
                    "cloud".to_string(),
                    "container".to_string(),
                    "docker".to_string(),
                ],
                min_available_gb: 2.0,
            },
            store: StoreConfig {
                backup_path: PathBuf::from("local_reviews_backup.jsonl"),
            },
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CriticError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| CriticError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CriticError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| CriticError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }
}
