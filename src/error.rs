use thiserror::Error;

#[derive(Error, Debug)]
pub enum CriticError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Model error: {0}")]
    Model(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Placeholder artifact instead of real weights: {0}")]
    Placeholder(String),

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Review store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, CriticError>;
