use async_trait::async_trait;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::marian::{Config as MarianConfig, MTModel};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::{EngineLoader, TranslationEngine};
use crate::backend::artifact::require_real;
use crate::config::TranslateConfig;
use crate::error::{CriticError, Result};

const CONFIG_FILE: &str = "config.json";
const WEIGHT_FILES: [&str; 2] = ["model.safetensors", "pytorch_model.bin"];

/// Files making up one opus-mt model
#[derive(Debug, Clone)]
struct MarianFiles {
    config: PathBuf,
    weights: PathBuf,
    source_tokenizer: PathBuf,
    target_tokenizer: PathBuf,
}

/// Model state mutated by every generation (the decoder keeps a KV cache)
struct MarianState {
    model: MTModel,
    config: MarianConfig,
    source_tokenizer: Tokenizer,
    target_tokenizer: Tokenizer,
    device: Device,
}

impl MarianState {
    fn load(files: &MarianFiles) -> Result<Self> {
        let device = Device::Cpu;
        let config = read_config(&files.config)?;

        let tokenizer = |path: &Path| {
            Tokenizer::from_file(path).map_err(|e| {
                CriticError::Tokenizer(format!("Failed to load {}: {}", path.display(), e))
            })
        };
        let source_tokenizer = tokenizer(&files.source_tokenizer)?;
        let target_tokenizer = tokenizer(&files.target_tokenizer)?;

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
        let model = MTModel::new(&config, vb)?;

        Ok(Self {
            model,
            config,
            source_tokenizer,
            target_tokenizer,
            device,
        })
    }

    /// Greedy decoding until end of sentence or `max_length` tokens
    fn generate(&mut self, text: &str, max_length: usize) -> Result<String> {
        self.model.reset_kv_cache();
        let positions = self.config.max_position_embeddings.saturating_sub(1);

        let encoding = self
            .source_tokenizer
            .encode(text, true)
            .map_err(|e| CriticError::Tokenizer(format!("Tokenization failed: {}", e)))?;
        let mut source_ids = encoding.get_ids().to_vec();
        source_ids.truncate(positions);
        source_ids.push(self.config.eos_token_id);

        let source = Tensor::new(source_ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let encoded = self.model.encoder().forward(&source, 0)?;

        let mut token_ids = vec![self.config.decoder_start_token_id];
        for step in 0..max_length.min(positions) {
            // Only the newest token is fed once the cache is warm
            let context = if step == 0 { token_ids.len() } else { 1 };
            let start = token_ids.len().saturating_sub(context);
            let input = Tensor::new(&token_ids[start..], &self.device)?.unsqueeze(0)?;

            let logits = self.model.decode(&input, &encoded, start)?.squeeze(0)?;
            let last = logits.get(logits.dim(0)? - 1)?;
            let token = last.argmax(D::Minus1)?.to_scalar::<u32>()?;
            if token == self.config.eos_token_id || token == self.config.forced_eos_token_id {
                break;
            }
            token_ids.push(token);
        }
        debug!("Generated {} tokens from {} source tokens", token_ids.len() - 1, source_ids.len());

        let output: Vec<u32> = token_ids[1..]
            .iter()
            .copied()
            .filter(|&id| id != self.config.pad_token_id)
            .collect();
        let translation = self
            .target_tokenizer
            .decode(&output, true)
            .map_err(|e| CriticError::Tokenizer(format!("Detokenization failed: {}", e)))?;

        let translation = translation.trim();
        if translation.is_empty() {
            return Err(CriticError::Translation("Empty translation generated".to_string()));
        }
        Ok(translation.to_string())
    }
}

/// Read a model config, filling fields older exports leave out
fn read_config(path: &Path) -> Result<MarianConfig> {
    let mut value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let Some(fields) = value.as_object_mut() else {
        return Err(CriticError::Artifact(format!("{} is not a JSON object", path.display())));
    };

    if let Some(eos) = fields.get("eos_token_id").cloned() {
        fields.entry("forced_eos_token_id").or_insert(eos);
    }
    for key in ["share_encoder_decoder_embeddings", "use_cache", "is_encoder_decoder"] {
        fields.entry(key).or_insert(serde_json::Value::Bool(true));
    }
    fields
        .entry("activation_function")
        .or_insert(serde_json::Value::String("swish".to_string()));

    Ok(serde_json::from_value(value)?)
}

/// One opus-mt model running locally
pub struct MarianEngine {
    state: Arc<Mutex<MarianState>>,
}

#[async_trait]
impl TranslationEngine for MarianEngine {
    async fn translate(&self, text: &str, max_length: usize) -> Result<String> {
        let state = Arc::clone(&self.state);
        let text = text.to_string();

        tokio::task::spawn_blocking(move || {
            let mut state = state
                .lock()
                .map_err(|_| CriticError::Translation("Marian model lock poisoned".to_string()))?;
            state.generate(&text, max_length)
        })
        .await
        .map_err(|e| CriticError::Translation(format!("Translation task failed: {}", e)))?
    }
}

/// Loads opus-mt models from `marian_dir`, downloading missing ones when allowed
#[derive(Debug, Clone)]
pub struct MarianEngineLoader {
    models_dir: PathBuf,
    download: bool,
    source_tokenizer: String,
    target_tokenizer: String,
}

impl MarianEngineLoader {
    pub fn new(config: &TranslateConfig) -> Self {
        Self {
            models_dir: config.marian_dir.clone(),
            download: config.marian_download,
            source_tokenizer: config.source_tokenizer.clone(),
            target_tokenizer: config.target_tokenizer.clone(),
        }
    }

    /// `Helsinki-NLP/opus-mt-es-en` lives in `Helsinki-NLP--opus-mt-es-en`
    pub fn model_dir(&self, model: &str) -> PathBuf {
        self.models_dir.join(model.replace('/', "--"))
    }

    fn local(&self, model: &str) -> Result<MarianFiles> {
        let dir = self.model_dir(model);
        if !dir.is_dir() {
            return Err(CriticError::FileNotFound(dir.display().to_string()));
        }

        let weights = WEIGHT_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
            .ok_or_else(|| CriticError::FileNotFound(dir.join(WEIGHT_FILES[0]).display().to_string()))?;

        let files = MarianFiles {
            config: dir.join(CONFIG_FILE),
            weights,
            source_tokenizer: dir.join(&self.source_tokenizer),
            target_tokenizer: dir.join(&self.target_tokenizer),
        };
        require_real(&files.config)?;
        require_real(&files.weights)?;
        require_real(&files.source_tokenizer)?;
        require_real(&files.target_tokenizer)?;
        Ok(files)
    }

    fn remote(&self, model: &str) -> Result<MarianFiles> {
        info!("Downloading translation model from the model hub: {}", model);
        let hub_error = |file: &str, e: hf_hub::api::sync::ApiError| {
            CriticError::Translation(format!("Failed to fetch {} for {}: {}", file, model, e))
        };

        let api = hf_hub::api::sync::Api::new().map_err(|e| hub_error("API client", e))?;
        let repo = api.model(model.to_string());

        Ok(MarianFiles {
            config: repo.get(CONFIG_FILE).map_err(|e| hub_error(CONFIG_FILE, e))?,
            weights: repo
                .get(WEIGHT_FILES[0])
                .or_else(|_| repo.get(WEIGHT_FILES[1]))
                .map_err(|e| hub_error("weights", e))?,
            source_tokenizer: repo
                .get(&self.source_tokenizer)
                .map_err(|e| hub_error(&self.source_tokenizer, e))?,
            target_tokenizer: repo
                .get(&self.target_tokenizer)
                .map_err(|e| hub_error(&self.target_tokenizer, e))?,
        })
    }

    fn files(&self, model: &str) -> Result<MarianFiles> {
        match self.local(model) {
            Ok(files) => Ok(files),
            Err(CriticError::FileNotFound(path)) if self.download => {
                debug!("{} not found locally", path);
                self.remote(model)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl EngineLoader for MarianEngineLoader {
    async fn load(&self, model: &str) -> Result<Arc<dyn TranslationEngine>> {
        let loader = self.clone();
        let name = model.to_string();

        let state = tokio::task::spawn_blocking(move || {
            let files = loader.files(&name)?;
            MarianState::load(&files)
        })
        .await
        .map_err(|e| CriticError::Translation(format!("Model loading task failed: {}", e)))??;

        info!("Translation model '{}' loaded locally", model);
        Ok(Arc::new(MarianEngine {
            state: Arc::new(Mutex::new(state)),
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    const SPANISH_MODEL: &str = "Helsinki-NLP/opus-mt-es-en";
    /// Target token the tiny model is biased towards
    const GREAT: u32 = 5;
    const EOS: u32 = 1;

    fn tiny_config() -> serde_json::Value {
        json!({
            "vocab_size": 8,
            "decoder_vocab_size": 8,
            "max_position_embeddings": 32,
            "encoder_layers": 1,
            "encoder_ffn_dim": 16,
            "encoder_attention_heads": 2,
            "decoder_layers": 1,
            "decoder_ffn_dim": 16,
            "decoder_attention_heads": 2,
            "d_model": 8,
            "decoder_start_token_id": 0,
            "scale_embedding": true,
            "pad_token_id": 0,
            "eos_token_id": EOS,
        })
    }

    fn tokenizer() -> serde_json::Value {
        let special = |id: u32, content: &str| {
            json!({
                "id": id,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true,
            })
        };
        json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [special(0, "<pad>"), special(1, "</s>"), special(2, "<unk>")],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {
                    "<pad>": 0, "</s>": 1, "<unk>": 2, "la": 3,
                    "odio": 4, "great": 5, "movie": 6, "bad": 7
                },
                "unk_token": "<unk>"
            }
        })
    }

    /// Write a tiny opus-mt model whose output logits are dominated by `favoured`
    pub fn write_tiny_model(dir: &Path, favoured: u32) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), tiny_config().to_string()).unwrap();
        std::fs::write(dir.join("tokenizer.json"), tokenizer().to_string()).unwrap();

        let device = Device::Cpu;
        let config = read_config(&dir.join(CONFIG_FILE)).unwrap();
        let mut varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        MTModel::new(&config, vb).unwrap();

        let mut bias = vec![0f32; 8];
        bias[favoured as usize] = 100.0;
        varmap
            .set_one("final_logits_bias", Tensor::from_vec(bias, (1, 8), &device).unwrap())
            .unwrap();
        varmap.save(dir.join("model.safetensors")).unwrap();
    }

    fn loader(models_dir: &Path, download: bool) -> MarianEngineLoader {
        let mut config = Config::default().translate;
        config.marian_dir = models_dir.to_path_buf();
        config.marian_download = download;
        MarianEngineLoader::new(&config)
    }

    #[test]
    fn test_read_config_fills_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, tiny_config().to_string()).unwrap();

        let config = read_config(&path).unwrap();
        assert_eq!(config.forced_eos_token_id, EOS);
        assert!(config.share_encoder_decoder_embeddings);
        assert_eq!(config.activation_function, candle_nn::Activation::Swish);

        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(read_config(&path), Err(CriticError::Artifact(_))));
    }

    #[test]
    fn test_model_dir_layout() {
        let loader = loader(Path::new("models/translation"), false);
        assert_eq!(
            loader.model_dir(SPANISH_MODEL),
            Path::new("models/translation/Helsinki-NLP--opus-mt-es-en")
        );
    }

    #[tokio::test]
    async fn test_local_model_translates_greedily() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path(), false);
        write_tiny_model(&loader.model_dir(SPANISH_MODEL), GREAT);

        let engine = loader.load(SPANISH_MODEL).await.unwrap();
        assert_eq!(engine.translate("la odio", 3).await.unwrap(), "great great great");
        // The cache is reset between calls
        assert_eq!(engine.translate("la odio", 2).await.unwrap(), "great great");
    }

    #[tokio::test]
    async fn test_immediate_end_of_sentence_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path(), false);
        write_tiny_model(&loader.model_dir(SPANISH_MODEL), EOS);

        let engine = loader.load(SPANISH_MODEL).await.unwrap();
        assert!(matches!(
            engine.translate("la odio", 5).await,
            Err(CriticError::Translation(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_model_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let result = loader(dir.path(), false).load(SPANISH_MODEL).await;
        assert!(matches!(result, Err(CriticError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_placeholder_weights_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path(), true);
        let model_dir = loader.model_dir(SPANISH_MODEL);
        write_tiny_model(&model_dir, GREAT);
        std::fs::write(
            model_dir.join("model.safetensors"),
            "version https://git-lfs.github.com/spec/v1\noid sha256:abc\nsize 300000000\n",
        )
        .unwrap();

        // Placeholders are reported, not silently replaced by a download
        assert!(matches!(
            loader.load(SPANISH_MODEL).await,
            Err(CriticError::Placeholder(_))
        ));
    }
}
