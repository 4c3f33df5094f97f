use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::rnn::{Direction, LSTMConfig, LSTM, RNN};
use candle_nn::{Embedding, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::artifact::{first_success, require_real};
use super::{Backend, BackendKind, RawPrediction};
use crate::error::{CriticError, Result};

pub const UNKNOWN_TOKEN: &str = "<unk>";
pub const PAD_TOKEN: &str = "<pad>";

const DEFAULT_VOCAB_SIZE: usize = 10_000;
const DEFAULT_EMBEDDING_DIM: usize = 128;
const DEFAULT_HIDDEN_DIM: usize = 256;
const DEFAULT_NUM_LAYERS: usize = 2;

type StateDict = HashMap<String, Tensor>;

/// Word-to-index mapping used by the recurrent network
#[derive(Debug, Clone)]
pub struct Vocabulary {
    index: HashMap<String, u32>,
    unknown: u32,
    pad: u32,
}

impl Vocabulary {
    pub fn new(index: HashMap<String, u32>) -> Self {
        let unknown = index.get(UNKNOWN_TOKEN).copied().unwrap_or(1);
        let pad = index.get(PAD_TOKEN).copied().unwrap_or(0);
        Self { index, unknown, pad }
    }

    pub fn load(path: &Path) -> Result<Self> {
        require_real(path)?;
        let reader = BufReader::new(File::open(path)?);
        let index: HashMap<String, u32> = serde_json::from_reader(reader)?;
        Ok(Self::new(index))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Lowercase whitespace tokens, truncated or padded to exactly `max_length` ids.
    ///
    /// Ids outside the embedding table map to the unknown token.
    pub fn encode(&self, text: &str, max_length: usize, vocab_size: usize) -> Vec<u32> {
        let mut ids: Vec<u32> = text
            .to_lowercase()
            .split_whitespace()
            .take(max_length)
            .map(|word| match self.index.get(word) {
                Some(&id) if (id as usize) < vocab_size => id,
                _ => self.unknown,
            })
            .collect();
        ids.resize(max_length, self.pad);
        ids
    }
}

/// Network dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrentParams {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    #[serde(alias = "n_layers")]
    pub num_layers: usize,
}

impl RecurrentParams {
    pub fn defaults(vocab_len: Option<usize>) -> Self {
        Self {
            vocab_size: vocab_len.filter(|n| *n > 0).unwrap_or(DEFAULT_VOCAB_SIZE),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            hidden_dim: DEFAULT_HIDDEN_DIM,
            num_layers: DEFAULT_NUM_LAYERS,
        }
    }

    /// Resolve dimensions from a `<checkpoint>.json` sidecar, else the tensor shapes, else defaults
    pub fn resolve(checkpoint: &Path, tensors: &StateDict, vocab_len: Option<usize>) -> Self {
        let sidecar = sidecar_path(checkpoint);
        if sidecar.exists() {
            match File::open(&sidecar)
                .map_err(CriticError::from)
                .and_then(|f| serde_json::from_reader(BufReader::new(f)).map_err(CriticError::from))
            {
                Ok(params) => {
                    debug!("Recurrent dimensions from {}", sidecar.display());
                    return params;
                }
                Err(e) => warn!("Ignoring unreadable sidecar {}: {}", sidecar.display(), e),
            }
        }
        Self::infer(tensors, vocab_len)
    }

    pub fn infer(tensors: &StateDict, vocab_len: Option<usize>) -> Self {
        let mut params = Self::defaults(vocab_len);

        if let Some(Ok((vocab, dim))) = tensors.get("embedding.weight").map(|t| t.dims2()) {
            params.vocab_size = vocab;
            params.embedding_dim = dim;
        }
        // Input-hidden weights stack the four gates: (4 * hidden, input)
        if let Some(Ok((gates, _))) = tensors.get("lstm.weight_ih_l0").map(|t| t.dims2()) {
            params.hidden_dim = gates / 4;
        }
        let top_layer = tensors
            .keys()
            .filter_map(|k| k.strip_prefix("lstm.weight_ih_l"))
            .filter_map(|rest| rest.trim_end_matches("_reverse").parse::<usize>().ok())
            .max();
        if let Some(top) = top_layer {
            params.num_layers = top + 1;
        }

        params
    }
}

fn sidecar_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension("json")
}

/// Embedding, stacked bidirectional LSTM and a single-logit head
pub struct RecurrentNetwork {
    embedding: Embedding,
    layers: Vec<(LSTM, LSTM)>,
    fc: Linear,
    device: Device,
}

impl RecurrentNetwork {
    /// Variable names follow the PyTorch state dict: `embedding.*`, `lstm.*_l{n}[_reverse]`, `fc.*`
    pub fn new(params: &RecurrentParams, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(params.vocab_size, params.embedding_dim, vb.pp("embedding"))?;

        let lstm_vb = vb.pp("lstm");
        let mut layers = Vec::with_capacity(params.num_layers);
        for layer_idx in 0..params.num_layers {
            let in_dim = if layer_idx == 0 {
                params.embedding_dim
            } else {
                2 * params.hidden_dim
            };
            let forward = candle_nn::lstm(
                in_dim,
                params.hidden_dim,
                LSTMConfig {
                    layer_idx,
                    direction: Direction::Forward,
                    ..Default::default()
                },
                lstm_vb.clone(),
            )?;
            let backward = candle_nn::lstm(
                in_dim,
                params.hidden_dim,
                LSTMConfig {
                    layer_idx,
                    direction: Direction::Backward,
                    ..Default::default()
                },
                lstm_vb.clone(),
            )?;
            layers.push((forward, backward));
        }

        let fc = candle_nn::linear(2 * params.hidden_dim, 1, vb.pp("fc"))?;

        Ok(Self {
            embedding,
            layers,
            fc,
            device: vb.device().clone(),
        })
    }

    /// Positive-class probability for one sequence of token ids
    pub fn forward(&self, ids: &[u32]) -> Result<f64> {
        if ids.is_empty() {
            return Err(CriticError::Artifact("Empty token sequence".to_string()));
        }

        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let mut layer_input = self.embedding.forward(&input)?;
        let mut last_hidden = None;

        for (forward, backward) in &self.layers {
            let seq_len = layer_input.dim(1)?;
            let step_input =
                |t: usize| -> Result<Tensor> { Ok(layer_input.i((.., t, ..))?.contiguous()?) };

            let mut state = forward.zero_state(1)?;
            let mut forward_out = Vec::with_capacity(seq_len);
            for t in 0..seq_len {
                state = forward.step(&step_input(t)?, &state)?;
                forward_out.push(state.h().clone());
            }

            let mut reverse_state = backward.zero_state(1)?;
            let mut backward_out = vec![None; seq_len];
            for t in (0..seq_len).rev() {
                reverse_state = backward.step(&step_input(t)?, &reverse_state)?;
                backward_out[t] = Some(reverse_state.h().clone());
            }

            let mut outputs = Vec::with_capacity(seq_len);
            for (f, b) in forward_out.iter().zip(backward_out.into_iter().flatten()) {
                outputs.push(Tensor::cat(&[f, &b], 1)?);
            }

            last_hidden = Some(Tensor::cat(&[state.h(), reverse_state.h()], 1)?);
            layer_input = Tensor::stack(&outputs, 1)?;
        }

        let hidden = last_hidden
            .ok_or_else(|| CriticError::Artifact("Recurrent network has no layers".to_string()))?;
        let logit = self.fc.forward(&hidden)?;
        let score = candle_nn::ops::sigmoid(&logit)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        score
            .first()
            .map(|s| *s as f64)
            .ok_or_else(|| CriticError::Artifact("Recurrent network produced no output".to_string()))
    }
}

/// Read a checkpoint as safetensors, then as a pickled training checkpoint, then as a bare state dict
pub fn load_state_dict(path: &Path) -> Result<StateDict> {
    require_real(path)?;

    let safetensors: &dyn Fn(&Path) -> Result<StateDict> =
        &|p| Ok(candle_core::safetensors::load(p, &Device::Cpu)?);
    let training_checkpoint: &dyn Fn(&Path) -> Result<StateDict> = &|p| {
        let tensors = candle_core::pickle::read_all_with_key(p, Some("model_state_dict"))?;
        Ok(tensors.into_iter().collect())
    };
    let state_dict: &dyn Fn(&Path) -> Result<StateDict> = &|p| {
        let tensors = candle_core::pickle::read_all(p)?;
        Ok(tensors.into_iter().collect())
    };

    let tensors = first_success(
        path,
        &[
            ("safetensors", safetensors),
            ("training checkpoint", training_checkpoint),
            ("state dict", state_dict),
        ],
    )?;

    Ok(tensors
        .into_iter()
        .map(|(name, tensor)| {
            let name = name.strip_prefix("module.").map(str::to_string).unwrap_or(name);
            (name, tensor)
        })
        .collect())
}

/// Copy checkpoint tensors into the network variables.
///
/// Returns the number of variables that were set. All variables matching by name
/// and shape is a strict load; anything less is a partial load and is logged.
fn apply_state_dict(varmap: &VarMap, tensors: &StateDict) -> Result<usize> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|e| CriticError::Artifact(format!("Variable map poisoned: {}", e)))?;

    let mut loaded = 0;
    let mut skipped = Vec::new();
    for (name, var) in vars.iter() {
        match tensors.get(name) {
            Some(tensor) if tensor.dims() == var.dims() => {
                var.set(&tensor.to_dtype(DType::F32)?)?;
                loaded += 1;
            }
            _ => skipped.push(name.clone()),
        }
    }

    if loaded == 0 {
        return Err(CriticError::Artifact(
            "No checkpoint tensor matches the recurrent network".to_string(),
        ));
    }
    if !skipped.is_empty() {
        skipped.sort();
        warn!(
            "Partial recurrent checkpoint load: {} of {} variables missing or mis-shaped ({})",
            skipped.len(),
            vars.len(),
            skipped.join(", ")
        );
    }

    Ok(loaded)
}

pub struct RecurrentBackend {
    network: RecurrentNetwork,
    vocabulary: Vocabulary,
    params: RecurrentParams,
    max_length: usize,
}

impl RecurrentBackend {
    pub fn load(checkpoint: &Path, vocab_path: &Path, max_length: usize) -> Result<Self> {
        let vocabulary = Vocabulary::load(vocab_path)?;
        let tensors = load_state_dict(checkpoint)?;
        let params = RecurrentParams::resolve(checkpoint, &tensors, Some(vocabulary.len()));
        debug!("Recurrent dimensions: {:?}", params);

        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network = RecurrentNetwork::new(&params, vb)?;
        apply_state_dict(&varmap, &tensors)?;

        info!("✓ Recurrent network loaded from {}", checkpoint.display());
        Ok(Self {
            network,
            vocabulary,
            params,
            max_length,
        })
    }

    pub fn params(&self) -> &RecurrentParams {
        &self.params
    }
}

impl Backend for RecurrentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Recurrent
    }

    fn predict(&self, text: &str) -> Result<RawPrediction> {
        let ids = self
            .vocabulary
            .encode(text, self.max_length, self.params.vocab_size);
        Ok(RawPrediction::Sigmoid(self.network.forward(&ids)?))
    }
}
