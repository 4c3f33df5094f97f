use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::distilbert::{Config as DistilBertConfig, DistilBertModel};
use std::path::{Path, PathBuf};
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info, warn};

use super::artifact::require_real;
use super::{Backend, BackendKind, RawPrediction};
use crate::config::ModelsConfig;
use crate::error::{CriticError, Result};

const WEIGHT_FILES: [&str; 2] = ["model.safetensors", "pytorch_model.bin"];

/// [CLS], [SEP] and at least one word
const MIN_TOKENS: usize = 3;

/// Load errors containing one of these mean the host ran out of memory
const MEMORY_SIGNATURES: &[&str] = &[
    "header too large",
    "deserializing header",
    "out of memory",
    "cannot allocate",
    "memory allocation",
    "not enough memory",
    "paging file",
];

pub fn is_memory_error(message: &str) -> bool {
    let message = message.to_lowercase();
    MEMORY_SIGNATURES.iter().any(|s| message.contains(s))
}

/// Files making up a fine-tuned sequence classifier
#[derive(Debug, Clone)]
struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

impl ModelFiles {
    fn local(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(CriticError::FileNotFound(dir.display().to_string()));
        }

        let weights = WEIGHT_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
            .ok_or_else(|| CriticError::FileNotFound(dir.join(WEIGHT_FILES[0]).display().to_string()))?;

        let files = Self {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights,
        };
        require_real(&files.weights)?;
        require_real(&files.config)?;
        require_real(&files.tokenizer)?;
        Ok(files)
    }

    fn remote(model_id: &str) -> Result<Self> {
        info!("Downloading transformer from the model hub: {}", model_id);
        let hub_error = |file: &str, e: hf_hub::api::sync::ApiError| {
            CriticError::Artifact(format!("Failed to fetch {} for {}: {}", file, model_id, e))
        };

        let api = hf_hub::api::sync::Api::new().map_err(|e| hub_error("API client", e))?;
        let repo = api.model(model_id.to_string());

        let config = repo.get("config.json").map_err(|e| hub_error("config.json", e))?;
        let tokenizer = repo
            .get("tokenizer.json")
            .map_err(|e| hub_error("tokenizer.json", e))?;
        let weights = repo
            .get(WEIGHT_FILES[0])
            .or_else(|_| repo.get(WEIGHT_FILES[1]))
            .map_err(|e| hub_error("weights", e))?;

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

/// Positions of the two classes in the classification head output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelMap {
    pub negative: usize,
    pub positive: usize,
}

impl Default for LabelMap {
    fn default() -> Self {
        Self {
            negative: 0,
            positive: 1,
        }
    }
}

impl LabelMap {
    /// Read `id2label` from a model config; labels are matched on "neg" and "pos"
    pub fn from_config(config: &serde_json::Value) -> Self {
        let Some(id2label) = config.get("id2label").and_then(|v| v.as_object()) else {
            return Self::default();
        };

        let mut negative = None;
        let mut positive = None;
        for (id, label) in id2label {
            let (Ok(id), Some(label)) = (id.parse::<usize>(), label.as_str()) else {
                continue;
            };
            let label = label.to_lowercase();
            if label.contains("neg") {
                negative = Some(id);
            } else if label.contains("pos") {
                positive = Some(id);
            }
        }

        match (negative, positive) {
            (Some(negative), Some(positive)) if negative != positive => Self { negative, positive },
            _ => Self::default(),
        }
    }

    fn num_labels(&self) -> usize {
        self.negative.max(self.positive) + 1
    }
}

/// Fine-tuned DistilBERT sequence classifier
pub struct TransformerBackend {
    model: DistilBertModel,
    pre_classifier: Option<Linear>,
    classifier: Linear,
    tokenizer: Tokenizer,
    labels: LabelMap,
    device: Device,
    source: String,
}

impl TransformerBackend {
    /// Load the local model; fall back to the public model only when the host runs out of memory
    pub fn load(config: &ModelsConfig) -> Result<Self> {
        let files = ModelFiles::local(&config.transformer_dir)?;

        match Self::from_files(&files, config.max_tokens, &config.transformer_dir.display().to_string()) {
            Ok(backend) => Ok(backend),
            Err(e) if config.remote_fallback && is_memory_error(&e.to_string()) => {
                warn!(
                    "Local transformer does not fit in memory ({}), trying {}",
                    e, config.remote_transformer
                );
                let files = ModelFiles::remote(&config.remote_transformer)?;
                Self::from_files(&files, config.max_tokens, &config.remote_transformer)
            }
            Err(e) => Err(e),
        }
    }

    fn from_files(files: &ModelFiles, max_tokens: usize, source: &str) -> Result<Self> {
        if max_tokens < MIN_TOKENS {
            return Err(CriticError::Config(format!(
                "max_tokens must be at least {}, got {}",
                MIN_TOKENS, max_tokens
            )));
        }
        let device = Device::Cpu;

        let config_str = std::fs::read_to_string(&files.config)?;
        let config_json: serde_json::Value = serde_json::from_str(&config_str)?;
        let model_config: DistilBertConfig = serde_json::from_str(&config_str)?;
        let hidden_size = config_json
            .get("dim")
            .or_else(|| config_json.get("hidden_size"))
            .and_then(|v| v.as_u64())
            .unwrap_or(768) as usize;
        let labels = LabelMap::from_config(&config_json);

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| CriticError::Tokenizer(format!("Failed to load tokenizer: {}", e)))?;
        // Truncation inside the tokenizer keeps [CLS] and [SEP]
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_tokens,
                ..Default::default()
            }))
            .map_err(|e| CriticError::Tokenizer(format!("Invalid truncation: {}", e)))?;

        let is_safetensors = files
            .weights
            .extension()
            .map(|ext| ext == "safetensors")
            .unwrap_or(false);
        let vb = if is_safetensors {
            unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], DType::F32, &device)? }
        } else {
            VarBuilder::from_pth(&files.weights, DType::F32, &device)?
        };

        let model = DistilBertModel::load(vb.pp("distilbert"), &model_config)?;
        let pre_classifier = if vb.contains_tensor("pre_classifier.weight") {
            Some(candle_nn::linear(hidden_size, hidden_size, vb.pp("pre_classifier"))?)
        } else {
            debug!("No pre_classifier in {}, classifying the [CLS] state directly", source);
            None
        };
        let classifier = candle_nn::linear(hidden_size, labels.num_labels(), vb.pp("classifier"))?;

        info!(
            "✓ Transformer loaded from {} (negative={}, positive={})",
            source, labels.negative, labels.positive
        );
        Ok(Self {
            model,
            pre_classifier,
            classifier,
            tokenizer,
            labels,
            device,
            source: source.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Backend for TransformerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Transformer
    }

    fn predict(&self, text: &str) -> Result<RawPrediction> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| CriticError::Tokenizer(format!("Tokenization failed: {}", e)))?;
        debug!("Transformer input: {} tokens", encoding.get_ids().len());

        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;

        // DistilBERT here expects 1 for positions to mask out
        let inverted_mask: Vec<u8> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| if m == 0 { 1u8 } else { 0u8 })
            .collect();
        let attention_mask = Tensor::new(inverted_mask.as_slice(), &self.device)?.unsqueeze(0)?;

        let hidden_states = self.model.forward(&input_ids, &attention_mask)?;
        let cls = hidden_states.i((0, 0, ..))?.unsqueeze(0)?;
        let pooled = match &self.pre_classifier {
            Some(layer) => layer.forward(&cls)?.relu()?,
            None => cls,
        };
        let logits = self.classifier.forward(&pooled)?;
        let probs: Vec<f32> = candle_nn::ops::softmax(&logits, D::Minus1)?
            .squeeze(0)?
            .to_vec1()?;

        let class = |index: usize| -> Result<f64> {
            probs.get(index).map(|p| *p as f64).ok_or_else(|| {
                CriticError::Artifact(format!("Classification head has no class {}", index))
            })
        };
        Ok(RawPrediction::Distribution {
            negative: class(self.labels.negative)?,
            positive: class(self.labels.positive)?,
        })
    }
}
