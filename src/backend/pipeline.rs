use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

use super::artifact::{first_success, require_real};
use super::{Backend, BackendKind, RawPrediction};
use crate::error::{CriticError, Result};

fn default_ngram_range() -> (usize, usize) {
    (1, 1)
}

fn default_lowercase() -> bool {
    true
}

fn default_norm() -> Option<Norm> {
    Some(Norm::L2)
}

/// Two or more word characters, the default token pattern of common TF-IDF exporters
fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\w\w+\b").expect("token pattern is valid"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Norm {
    L1,
    L2,
}

/// Sparse feature vector keyed by vocabulary index
pub type Features = HashMap<usize, f64>;

/// Fitted TF-IDF vectorizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfidfVectorizer {
    pub vocabulary: HashMap<String, usize>,
    pub idf: Vec<f64>,
    #[serde(default = "default_ngram_range")]
    pub ngram_range: (usize, usize),
    #[serde(default = "default_lowercase")]
    pub lowercase: bool,
    #[serde(default)]
    pub sublinear_tf: bool,
    #[serde(default = "default_norm")]
    pub norm: Option<Norm>,
    #[serde(default)]
    pub stop_words: Vec<String>,
}

impl TfidfVectorizer {
    pub fn transform(&self, text: &str) -> Features {
        let document = if self.lowercase {
            text.to_lowercase()
        } else {
            text.to_string()
        };

        let tokens: Vec<&str> = token_pattern()
            .find_iter(&document)
            .map(|m| m.as_str())
            .filter(|t| !self.stop_words.iter().any(|s| s == t))
            .collect();

        let mut counts: Features = HashMap::new();
        let (min_n, max_n) = self.ngram_range;
        for n in min_n.max(1)..=max_n {
            for window in tokens.windows(n) {
                let term = window.join(" ");
                if let Some(&index) = self.vocabulary.get(&term) {
                    *counts.entry(index).or_insert(0.0) += 1.0;
                }
            }
        }

        let mut features: Features = counts
            .into_iter()
            .map(|(index, tf)| {
                let tf = if self.sublinear_tf { 1.0 + tf.ln() } else { tf };
                (index, tf * self.idf.get(index).copied().unwrap_or(1.0))
            })
            .collect();

        let norm = match self.norm {
            Some(Norm::L2) => features.values().map(|v| v * v).sum::<f64>().sqrt(),
            Some(Norm::L1) => features.values().map(|v| v.abs()).sum::<f64>(),
            None => 1.0,
        };
        if norm > 0.0 {
            for value in features.values_mut() {
                *value /= norm;
            }
        }

        features
    }

    fn validate(&self) -> Result<()> {
        if let Some((term, index)) = self.vocabulary.iter().find(|(_, i)| **i >= self.idf.len()) {
            return Err(CriticError::Artifact(format!(
                "Vocabulary term '{}' has index {} but only {} idf weights exist",
                term,
                index,
                self.idf.len()
            )));
        }
        if self.ngram_range.0 > self.ngram_range.1 {
            return Err(CriticError::Artifact(format!(
                "Invalid ngram range {:?}",
                self.ngram_range
            )));
        }
        Ok(())
    }
}

/// One fitted decision tree in parallel-array form.
///
/// A node is a leaf when `children_left[node] == -1`; `value[node]` holds the
/// class weights (negative, positive) at that node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub children_left: Vec<i64>,
    pub children_right: Vec<i64>,
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    pub value: Vec<[f64; 2]>,
}

impl DecisionTree {
    /// Class probabilities of the leaf reached by `features`
    fn leaf_distribution(&self, features: &Features) -> [f64; 2] {
        let mut node = 0usize;

        // A valid tree reaches a leaf in fewer steps than it has nodes
        for _ in 0..self.value.len() {
            let left = self.children_left[node];
            if left < 0 {
                break;
            }
            let x = features
                .get(&(self.feature[node] as usize))
                .copied()
                .unwrap_or(0.0);
            node = if x <= self.threshold[node] {
                left as usize
            } else {
                self.children_right[node] as usize
            };
        }

        let [negative, positive] = self.value[node];
        let total = negative + positive;
        if total > 0.0 {
            [negative / total, positive / total]
        } else {
            [0.5, 0.5]
        }
    }

    fn validate(&self, n_features: usize) -> Result<()> {
        let n = self.value.len();
        if n == 0
            || self.children_left.len() != n
            || self.children_right.len() != n
            || self.feature.len() != n
            || self.threshold.len() != n
        {
            return Err(CriticError::Artifact(
                "Decision tree arrays are empty or have different lengths".to_string(),
            ));
        }

        for node in 0..n {
            let (left, right) = (self.children_left[node], self.children_right[node]);
            if left < 0 {
                continue;
            }
            let in_range = |child: i64| child > 0 && (child as usize) < n;
            if !in_range(left) || !in_range(right) {
                return Err(CriticError::Artifact(format!(
                    "Decision tree node {} points outside the tree",
                    node
                )));
            }
            let feature = self.feature[node];
            if feature < 0 || feature as usize >= n_features {
                return Err(CriticError::Artifact(format!(
                    "Decision tree node {} splits on unknown feature {}",
                    node, feature
                )));
            }
        }

        Ok(())
    }
}

/// Fitted classifier over TF-IDF features
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Classifier {
    Logistic { coef: Vec<f64>, intercept: f64 },
    RandomForest { trees: Vec<DecisionTree> },
    /// Linear decision function without a probability query
    LinearSvc { coef: Vec<f64>, intercept: f64 },
}

impl Classifier {
    pub fn predict(&self, features: &Features) -> RawPrediction {
        match self {
            Classifier::Logistic { coef, intercept } => {
                let z = decision_function(coef, *intercept, features);
                let positive = 1.0 / (1.0 + (-z).exp());
                RawPrediction::Distribution {
                    negative: 1.0 - positive,
                    positive,
                }
            }
            Classifier::RandomForest { trees } => {
                let (negative, positive) = trees
                    .iter()
                    .map(|tree| tree.leaf_distribution(features))
                    .fold((0.0, 0.0), |(n, p), [tn, tp]| (n + tn, p + tp));
                let count = trees.len().max(1) as f64;
                RawPrediction::Distribution {
                    negative: negative / count,
                    positive: positive / count,
                }
            }
            Classifier::LinearSvc { coef, intercept } => RawPrediction::LabelOnly {
                positive: decision_function(coef, *intercept, features) > 0.0,
            },
        }
    }

    pub fn has_probabilities(&self) -> bool {
        !matches!(self, Classifier::LinearSvc { .. })
    }

    fn validate(&self, n_features: usize) -> Result<()> {
        match self {
            Classifier::Logistic { coef, .. } | Classifier::LinearSvc { coef, .. } => {
                if coef.len() != n_features {
                    return Err(CriticError::Artifact(format!(
                        "Classifier has {} coefficients for {} features",
                        coef.len(),
                        n_features
                    )));
                }
                Ok(())
            }
            Classifier::RandomForest { trees } => {
                if trees.is_empty() {
                    return Err(CriticError::Artifact("Random forest has no trees".to_string()));
                }
                trees.iter().try_for_each(|tree| tree.validate(n_features))
            }
        }
    }
}

fn decision_function(coef: &[f64], intercept: f64, features: &Features) -> f64 {
    intercept
        + features
            .iter()
            .map(|(&index, &value)| coef.get(index).copied().unwrap_or(0.0) * value)
            .sum::<f64>()
}

/// Vectorizer and classifier fitted together, accepting raw text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPipeline {
    pub vectorizer: TfidfVectorizer,
    pub classifier: Classifier,
}

impl TextPipeline {
    /// Load a serialized pipeline, trying JSON first and TOML second
    pub fn load(path: &Path) -> Result<Self> {
        require_real(path)?;

        let from_json: &dyn Fn(&Path) -> Result<TextPipeline> = &|p| {
            let reader = BufReader::new(File::open(p)?);
            Ok(serde_json::from_reader(reader)?)
        };
        let from_toml: &dyn Fn(&Path) -> Result<TextPipeline> = &|p| {
            let content = std::fs::read_to_string(p)?;
            Ok(toml::from_str(&content)?)
        };

        let pipeline = first_success(path, &[("JSON", from_json), ("TOML", from_toml)])?;
        pipeline.validate()?;

        debug!(
            "Loaded text pipeline from {} ({} terms, probabilities: {})",
            path.display(),
            pipeline.vectorizer.vocabulary.len(),
            pipeline.classifier.has_probabilities()
        );
        Ok(pipeline)
    }

    pub fn validate(&self) -> Result<()> {
        self.vectorizer.validate()?;
        self.classifier.validate(self.vectorizer.idf.len())
    }

    pub fn predict(&self, text: &str) -> RawPrediction {
        let features = self.vectorizer.transform(text);
        self.classifier.predict(&features)
    }
}

/// Linear and ensemble backends share the pipeline implementation
pub struct PipelineBackend {
    kind: BackendKind,
    pipeline: TextPipeline,
}

impl PipelineBackend {
    pub fn new(kind: BackendKind, pipeline: TextPipeline) -> Self {
        Self { kind, pipeline }
    }

    pub fn load(kind: BackendKind, path: &Path) -> Result<Self> {
        let pipeline = TextPipeline::load(path)?;
        info!("✓ {} pipeline loaded from {}", kind, path.display());
        Ok(Self::new(kind, pipeline))
    }
}

impl Backend for PipelineBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn predict(&self, text: &str) -> Result<RawPrediction> {
        Ok(self.pipeline.predict(text))
    }
}
