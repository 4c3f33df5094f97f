// Sentiment backends
//
// Every backend answers the same question, "what is the class distribution over
// {Negative, Positive} for this English text", but reports it in its native shape:
// - Transformer: softmax over the classification head
// - Recurrent: a single sigmoid score
// - Linear / Ensemble: a fitted text pipeline with an optional probability query
//
// The shapes are carried by `RawPrediction` and turned into a comparable result by
// `crate::normalize`.

pub mod artifact;
pub mod heuristic;
pub mod pipeline;
pub mod recurrent;
pub mod transformer;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CriticError, Result};

/// The closed set of prediction backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[serde(alias = "distilbert")]
    Transformer,
    #[serde(alias = "lstm")]
    Recurrent,
    #[serde(alias = "logistic")]
    Linear,
    #[serde(alias = "random_forest", alias = "forest")]
    Ensemble,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Transformer,
        BackendKind::Recurrent,
        BackendKind::Linear,
        BackendKind::Ensemble,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Transformer => "transformer",
            BackendKind::Recurrent => "recurrent",
            BackendKind::Linear => "linear",
            BackendKind::Ensemble => "ensemble",
        }
    }

    /// Backends that need a lot of memory to load
    pub fn is_heavy(&self) -> bool {
        matches!(self, BackendKind::Transformer | BackendKind::Recurrent)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CriticError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "transformer" | "distilbert" => Ok(BackendKind::Transformer),
            "recurrent" | "lstm" => Ok(BackendKind::Recurrent),
            "linear" | "logistic" => Ok(BackendKind::Linear),
            "ensemble" | "random_forest" | "forest" => Ok(BackendKind::Ensemble),
            _ => Err(CriticError::Config(format!(
                "Invalid backend '{}'. Valid backends: transformer, recurrent, linear, ensemble",
                s
            ))),
        }
    }
}

/// Backend output before normalization
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawPrediction {
    /// Probability of the positive class from a sigmoid head
    Sigmoid(f64),
    /// Probabilities of both classes
    Distribution { negative: f64, positive: f64 },
    /// Predicted class only, for classifiers without a probability query
    LabelOnly { positive: bool },
}

/// A loaded backend that classifies English text
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn predict(&self, text: &str) -> Result<RawPrediction>;
}
