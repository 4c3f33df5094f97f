use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::artifact::{self, ArtifactStatus};
use crate::backend::pipeline::PipelineBackend;
use crate::backend::recurrent::RecurrentBackend;
use crate::backend::transformer::TransformerBackend;
use crate::backend::{Backend, BackendKind};
use crate::config::{Config, MemoryLimitMode, ModelsConfig, PredictorConfig};
use crate::error::Result;

/// Builds backends from their artifacts
pub trait BackendLoader: Send + Sync {
    fn load(&self, kind: BackendKind) -> Result<Arc<dyn Backend>>;

    /// What is on disk for `kind`, without loading it
    fn probe(&self, kind: BackendKind) -> ArtifactStatus;
}

/// Loads every backend from the paths in `[models]`
pub struct ArtifactLoader {
    models: ModelsConfig,
}

impl ArtifactLoader {
    pub fn new(models: ModelsConfig) -> Self {
        Self { models }
    }
}

impl BackendLoader for ArtifactLoader {
    fn load(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
        let backend: Arc<dyn Backend> = match kind {
            BackendKind::Transformer => Arc::new(TransformerBackend::load(&self.models)?),
            BackendKind::Recurrent => Arc::new(RecurrentBackend::load(
                &self.models.recurrent_checkpoint,
                &self.models.recurrent_vocab,
                self.models.recurrent_max_length,
            )?),
            BackendKind::Linear => Arc::new(PipelineBackend::load(kind, &self.models.linear_pipeline)?),
            BackendKind::Ensemble => {
                Arc::new(PipelineBackend::load(kind, &self.models.ensemble_pipeline)?)
            }
        };
        Ok(backend)
    }

    fn probe(&self, kind: BackendKind) -> ArtifactStatus {
        match kind {
            BackendKind::Transformer => transformer_status(&self.models.transformer_dir),
            BackendKind::Recurrent => combine(
                artifact::status(&self.models.recurrent_checkpoint),
                artifact::status(&self.models.recurrent_vocab),
            ),
            BackendKind::Linear => artifact::status(&self.models.linear_pipeline),
            BackendKind::Ensemble => artifact::status(&self.models.ensemble_pipeline),
        }
    }
}

fn transformer_status(dir: &Path) -> ArtifactStatus {
    if !dir.is_dir() {
        return ArtifactStatus::Missing;
    }
    ["model.safetensors", "pytorch_model.bin"]
        .iter()
        .map(|name| artifact::status(&dir.join(name)))
        .find(|status| *status != ArtifactStatus::Missing)
        .unwrap_or(ArtifactStatus::Missing)
}

/// The worse of two statuses: missing beats placeholder beats present
fn combine(a: ArtifactStatus, b: ArtifactStatus) -> ArtifactStatus {
    match (a, b) {
        (ArtifactStatus::Missing, _) | (_, ArtifactStatus::Missing) => ArtifactStatus::Missing,
        (ArtifactStatus::Placeholder, _) | (_, ArtifactStatus::Placeholder) => {
            ArtifactStatus::Placeholder
        }
        _ => ArtifactStatus::Present,
    }
}

enum Slot {
    Unloaded,
    Ready(Arc<dyn Backend>),
    Failed(String),
}

/// Observable lifecycle of one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Unloaded,
    /// Another caller holds the slot while loading
    Loading,
    Ready,
    Failed(String),
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Unloaded => "unloaded",
            BackendStatus::Loading => "loading",
            BackendStatus::Ready => "ready",
            BackendStatus::Failed(_) => "failed",
        }
    }
}

/// Owns every backend instance.
///
/// Each kind has its own slot behind its own lock, held for the whole load, so
/// concurrent requests for one kind load it once. `Ready` and `Failed` are final.
pub struct BackendRegistry {
    loader: Box<dyn BackendLoader>,
    slots: HashMap<BackendKind, Mutex<Slot>>,
    memory_limited: bool,
}

impl BackendRegistry {
    pub fn new(config: &Config) -> Self {
        let memory_limited = detect_memory_limited(&config.predictor);
        Self::with_loader(Box::new(ArtifactLoader::new(config.models.clone())), memory_limited)
    }

    pub fn with_loader(loader: Box<dyn BackendLoader>, memory_limited: bool) -> Self {
        if memory_limited {
            info!("Memory limited environment: heavy backends will be redirected");
        }
        let slots = BackendKind::ALL
            .iter()
            .map(|kind| (*kind, Mutex::new(Slot::Unloaded)))
            .collect();
        Self {
            loader,
            slots,
            memory_limited,
        }
    }

    fn lock(&self, kind: BackendKind) -> MutexGuard<'_, Slot> {
        // A panic inside a loader leaves the slot Unloaded, which is still consistent
        self.slots[&kind]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Load `kind` if needed; true when it is usable afterwards
    pub fn ensure_loaded(&self, kind: BackendKind) -> bool {
        let mut slot = self.lock(kind);
        match &*slot {
            Slot::Ready(_) => return true,
            Slot::Failed(_) => return false,
            Slot::Unloaded => {}
        }

        info!("Loading {} backend", kind);
        let start = Instant::now();
        match self.loader.load(kind) {
            Ok(backend) => {
                info!(
                    "✓ {} backend ready in {:.2}s",
                    kind,
                    start.elapsed().as_secs_f64()
                );
                *slot = Slot::Ready(backend);
                true
            }
            Err(e) => {
                error!("Failed to load {} backend: {}", kind, e);
                *slot = Slot::Failed(e.to_string());
                false
            }
        }
    }

    /// The loaded backend, without triggering a load
    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn Backend>> {
        match &*self.lock(kind) {
            Slot::Ready(backend) => Some(Arc::clone(backend)),
            _ => None,
        }
    }

    pub fn status(&self, kind: BackendKind) -> BackendStatus {
        match self.slots[&kind].try_lock() {
            Ok(slot) => slot_status(&slot),
            Err(TryLockError::Poisoned(poisoned)) => slot_status(&poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => BackendStatus::Loading,
        }
    }

    /// Kinds whose artifacts are on disk, in priority order, without loading anything
    pub fn available_models(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| self.artifact_status(*kind) == ArtifactStatus::Present)
            .collect()
    }

    pub fn artifact_status(&self, kind: BackendKind) -> ArtifactStatus {
        self.loader.probe(kind)
    }

    pub fn is_memory_limited(&self) -> bool {
        self.memory_limited
    }
}

fn slot_status(slot: &Slot) -> BackendStatus {
    match slot {
        Slot::Unloaded => BackendStatus::Unloaded,
        Slot::Ready(_) => BackendStatus::Ready,
        Slot::Failed(reason) => BackendStatus::Failed(reason.clone()),
    }
}

/// Decide whether heavy backends should be avoided on this host
pub fn detect_memory_limited(config: &PredictorConfig) -> bool {
    match config.memory_limit {
        MemoryLimitMode::Always => true,
        MemoryLimitMode::Never => false,
        MemoryLimitMode::Auto => {
            if let Some(marker) = config.memory_env_markers.iter().find(|m| env_flag(m)) {
                debug!("Memory limited: environment marker {} is set", marker);
                return true;
            }

            if let Some(host) = hostname() {
                if hostname_matches(&host, &config.memory_hostname_patterns) {
                    debug!("Memory limited: hostname {} matches", host);
                    return true;
                }
            }

            match std::fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|content| parse_mem_available_gb(&content))
            {
                Some(available) if available < config.min_available_gb => {
                    warn!(
                        "Memory limited: {:.1} GB available, {:.1} GB wanted",
                        available, config.min_available_gb
                    );
                    true
                }
                _ => false,
            }
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| {
            let value = value.trim().to_lowercase();
            value == "true" || value == "1"
        })
        .unwrap_or(false)
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

pub fn hostname_matches(hostname: &str, patterns: &[String]) -> bool {
    let hostname = hostname.to_lowercase();
    patterns
        .iter()
        .any(|pattern| hostname.contains(&pattern.to_lowercase()))
}

/// `MemAvailable` from `/proc/meminfo` content, in GB
pub fn parse_mem_available_gb(meminfo: &str) -> Option<f64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<f64>().ok())
        .map(|kb| kb / (1024.0 * 1024.0))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backend::RawPrediction;
    use crate::error::CriticError;
    use std::collections::HashSet;

    /// Backend that always returns the same raw prediction
    pub struct FixedBackend {
        pub kind: BackendKind,
        pub raw: RawPrediction,
    }

    impl Backend for FixedBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn predict(&self, _text: &str) -> Result<RawPrediction> {
            Ok(self.raw)
        }
    }

    /// Backend whose prediction always fails
    pub struct BrokenBackend(pub BackendKind);

    impl Backend for BrokenBackend {
        fn kind(&self) -> BackendKind {
            self.0
        }

        fn predict(&self, _text: &str) -> Result<RawPrediction> {
            Err(CriticError::Artifact("malformed tensor".to_string()))
        }
    }

    /// Loader over in-memory backends that counts load attempts per kind
    #[derive(Default)]
    pub struct FakeLoader {
        pub backends: HashMap<BackendKind, Arc<dyn Backend>>,
        pub placeholders: HashSet<BackendKind>,
        pub attempts: Arc<Mutex<HashMap<BackendKind, usize>>>,
    }

    impl FakeLoader {
        pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
            self.backends.insert(backend.kind(), backend);
            self
        }

        pub fn with_placeholder(mut self, kind: BackendKind) -> Self {
            self.placeholders.insert(kind);
            self
        }
    }

    /// Load attempts recorded by a `FakeLoader` for one kind
    pub fn attempts(counter: &Arc<Mutex<HashMap<BackendKind, usize>>>, kind: BackendKind) -> usize {
        counter.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    impl BackendLoader for FakeLoader {
        fn load(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
            *self.attempts.lock().unwrap().entry(kind).or_insert(0) += 1;
            if self.placeholders.contains(&kind) {
                return Err(CriticError::Placeholder(format!("{} weights", kind)));
            }
            self.backends
                .get(&kind)
                .cloned()
                .ok_or_else(|| CriticError::FileNotFound(format!("{} artifact", kind)))
        }

        fn probe(&self, kind: BackendKind) -> ArtifactStatus {
            if self.placeholders.contains(&kind) {
                ArtifactStatus::Placeholder
            } else if self.backends.contains_key(&kind) {
                ArtifactStatus::Present
            } else {
                ArtifactStatus::Missing
            }
        }
    }

    pub fn fixed(kind: BackendKind, raw: RawPrediction) -> Arc<dyn Backend> {
        Arc::new(FixedBackend { kind, raw })
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::backend::RawPrediction;
    use std::sync::mpsc;

    #[test]
    fn test_ready_slot_is_reused() {
        let loader =
            FakeLoader::default().with(fixed(BackendKind::Linear, RawPrediction::Sigmoid(0.9)));
        let counter = Arc::clone(&loader.attempts);
        let registry = BackendRegistry::with_loader(Box::new(loader), false);

        assert_eq!(registry.status(BackendKind::Linear), BackendStatus::Unloaded);
        assert!(registry.get(BackendKind::Linear).is_none());
        assert!(registry.ensure_loaded(BackendKind::Linear));
        assert!(registry.ensure_loaded(BackendKind::Linear));
        assert_eq!(registry.status(BackendKind::Linear), BackendStatus::Ready);
        assert!(registry.get(BackendKind::Linear).is_some());
        assert_eq!(attempts(&counter, BackendKind::Linear), 1);
    }

    #[test]
    fn test_failed_slot_is_never_retried() {
        let loader = FakeLoader::default();
        let counter = Arc::clone(&loader.attempts);
        let registry = BackendRegistry::with_loader(Box::new(loader), false);

        for _ in 0..3 {
            assert!(!registry.ensure_loaded(BackendKind::Recurrent));
        }
        assert_eq!(attempts(&counter, BackendKind::Recurrent), 1);
        assert!(matches!(
            registry.status(BackendKind::Recurrent),
            BackendStatus::Failed(reason) if reason.contains("recurrent")
        ));
    }

    #[test]
    fn test_concurrent_loads_are_serialized() {
        struct SlowLoader {
            started: Mutex<mpsc::Sender<()>>,
            release: Mutex<mpsc::Receiver<()>>,
        }
        impl BackendLoader for SlowLoader {
            fn load(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
                let _ = self.started.lock().unwrap().send(());
                let _ = self.release.lock().unwrap().recv();
                Ok(fixed(kind, RawPrediction::Sigmoid(0.7)))
            }
            fn probe(&self, _kind: BackendKind) -> ArtifactStatus {
                ArtifactStatus::Present
            }
        }

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let registry = Arc::new(BackendRegistry::with_loader(
            Box::new(SlowLoader {
                started: Mutex::new(started_tx),
                release: Mutex::new(release_rx),
            }),
            false,
        ));

        let first = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.ensure_loaded(BackendKind::Transformer))
        };
        started_rx.recv().unwrap();
        assert_eq!(registry.status(BackendKind::Transformer), BackendStatus::Loading);

        let second = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.ensure_loaded(BackendKind::Transformer))
        };
        release_tx.send(()).unwrap();

        assert!(first.join().unwrap());
        assert!(second.join().unwrap());
        assert_eq!(registry.status(BackendKind::Transformer), BackendStatus::Ready);
        // The second caller found the slot ready, so no second load was started
        assert!(started_rx.try_recv().is_err());
    }

    #[test]
    fn test_available_models_follow_priority_and_skip_placeholders() {
        let loader = FakeLoader::default()
            .with(fixed(BackendKind::Ensemble, RawPrediction::Sigmoid(0.1)))
            .with(fixed(BackendKind::Linear, RawPrediction::Sigmoid(0.1)))
            .with_placeholder(BackendKind::Transformer);
        let registry = BackendRegistry::with_loader(Box::new(loader), false);

        assert_eq!(
            registry.available_models(),
            vec![BackendKind::Linear, BackendKind::Ensemble]
        );
        assert_eq!(
            registry.artifact_status(BackendKind::Transformer),
            ArtifactStatus::Placeholder
        );
        // Probing never loads
        assert_eq!(registry.status(BackendKind::Linear), BackendStatus::Unloaded);
    }

    #[test]
    fn test_artifact_loader_probes_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut models = Config::default().models;
        models.transformer_dir = dir.path().join("distilbert");
        models.recurrent_checkpoint = dir.path().join("lstm.safetensors");
        models.recurrent_vocab = dir.path().join("vocab.json");
        models.linear_pipeline = dir.path().join("linear.json");
        models.ensemble_pipeline = dir.path().join("forest.json");

        std::fs::create_dir(&models.transformer_dir).unwrap();
        std::fs::write(
            models.transformer_dir.join("model.safetensors"),
            "version https://git-lfs.github.com/spec/v1\noid sha256:abc\nsize 12\n",
        )
        .unwrap();
        std::fs::write(&models.recurrent_checkpoint, vec![1u8; 4096]).unwrap();
        std::fs::write(&models.linear_pipeline, "{}").unwrap();

        let loader = ArtifactLoader::new(models);
        assert_eq!(loader.probe(BackendKind::Transformer), ArtifactStatus::Placeholder);
        assert_eq!(loader.probe(BackendKind::Recurrent), ArtifactStatus::Missing);
        assert_eq!(loader.probe(BackendKind::Linear), ArtifactStatus::Present);
        assert_eq!(loader.probe(BackendKind::Ensemble), ArtifactStatus::Missing);
    }

    #[test]
    fn test_memory_limit_modes() {
        let mut config = Config::default().predictor;
        config.memory_limit = MemoryLimitMode::Always;
        assert!(detect_memory_limited(&config));
        config.memory_limit = MemoryLimitMode::Never;
        assert!(!detect_memory_limited(&config));
    }

    #[test]
    fn test_hostname_patterns() {
        let patterns = vec!["streamlit".to_string(), "docker".to_string()];
        assert!(hostname_matches("Streamlit-App-7f9c", &patterns));
        assert!(!hostname_matches("workstation", &patterns));
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16318480 kB\nMemFree:         1023400 kB\nMemAvailable:    1048576 kB\n";
        let gb = parse_mem_available_gb(meminfo).unwrap();
        assert!((gb - 1.0).abs() < 1e-9);
        assert_eq!(parse_mem_available_gb("MemTotal: 1 kB\n"), None);
    }
}
