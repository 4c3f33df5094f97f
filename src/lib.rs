//! Critic - multilingual movie review sentiment
//!
//! Detects the language of a review, translates it to English and classifies
//! its sentiment with one of several local backends, falling back along a
//! configured chain down to a keyword heuristic.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod language;
pub mod normalize;
pub mod predictor;
pub mod quality;
pub mod registry;
pub mod store;
pub mod translate;
pub mod workflow;

pub use backend::{Backend, BackendKind, RawPrediction};
pub use config::Config;
pub use error::{CriticError, Result};
pub use language::LanguageIdentifier;
pub use normalize::SentimentLabel;
pub use predictor::{BackendUsed, PredictionResult, SentimentPredictor};
pub use store::{ReviewRecord, ReviewStore};
pub use translate::{TranslationOutcome, Translator};
pub use workflow::{ReviewMetadata, ReviewWorkflow};
