use serde::{Deserialize, Serialize};
use std::fmt;

use crate::backend::RawPrediction;
use crate::error::{CriticError, Result};

/// Confidence reported by classifiers that only predict a label
pub const LABEL_ONLY_CONFIDENCE: f64 = 0.85;
/// Entropy reported by classifiers that only predict a label
pub const LABEL_ONLY_ENTROPY: f64 = 0.5;

const ENTROPY_EPSILON: f64 = 1e-10;
const SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SentimentLabel {
    Positive,
    Negative,
    /// Rejected input or an undecided heuristic
    Neutral,
    Error,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "Positive",
            SentimentLabel::Negative => "Negative",
            SentimentLabel::Neutral => "Neutral",
            SentimentLabel::Error => "Error",
        }
    }

    pub fn is_decided(&self) -> bool {
        matches!(self, SentimentLabel::Positive | SentimentLabel::Negative)
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend output in the common shape
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalized {
    pub label: SentimentLabel,
    pub score: f64,
    pub prob_positive: f64,
    pub prob_negative: f64,
    pub entropy: f64,
}

/// Binary Shannon entropy in bits, clamped to [0, 1]
pub fn binary_entropy(p0: f64, p1: f64) -> f64 {
    let h = -(p0 * (p0 + ENTROPY_EPSILON).log2() + p1 * (p1 + ENTROPY_EPSILON).log2());
    h.clamp(0.0, 1.0)
}

pub fn normalize(raw: RawPrediction) -> Result<Normalized> {
    match raw {
        RawPrediction::Sigmoid(p) => {
            check_probability(p)?;
            let label = if p > 0.5 {
                SentimentLabel::Positive
            } else {
                SentimentLabel::Negative
            };
            Ok(from_pair(label, 1.0 - p, p))
        }
        RawPrediction::Distribution { negative, positive } => {
            check_probability(negative)?;
            check_probability(positive)?;
            let total = negative + positive;
            if total <= 0.0 {
                return Err(CriticError::Artifact(
                    "Backend returned an all-zero distribution".to_string(),
                ));
            }
            let (negative, positive) = if (total - 1.0).abs() > SUM_TOLERANCE {
                (negative / total, positive / total)
            } else {
                (negative, 1.0 - negative)
            };
            let label = if positive > negative {
                SentimentLabel::Positive
            } else {
                SentimentLabel::Negative
            };
            Ok(from_pair(label, negative, positive))
        }
        RawPrediction::LabelOnly { positive } => {
            let (label, prob_positive) = if positive {
                (SentimentLabel::Positive, LABEL_ONLY_CONFIDENCE)
            } else {
                (SentimentLabel::Negative, 1.0 - LABEL_ONLY_CONFIDENCE)
            };
            Ok(Normalized {
                label,
                score: LABEL_ONLY_CONFIDENCE,
                prob_positive,
                prob_negative: 1.0 - prob_positive,
                entropy: LABEL_ONLY_ENTROPY,
            })
        }
    }
}

fn from_pair(label: SentimentLabel, negative: f64, positive: f64) -> Normalized {
    Normalized {
        label,
        score: negative.max(positive),
        prob_positive: positive,
        prob_negative: negative,
        entropy: binary_entropy(negative, positive),
    }
}

fn check_probability(p: f64) -> Result<()> {
    if p.is_finite() && (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(CriticError::Artifact(format!("Backend returned probability {}", p)))
    }
}
