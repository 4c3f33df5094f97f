use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::error::{CriticError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationCacheEntry {
    pub source_text: String,
    pub model: String,
    pub translation: String,
    pub cached_at: u64,
}

/// Successful translations stored as one JSON file per (text, model)
#[derive(Debug, Clone)]
pub struct TranslationCache {
    dir: PathBuf,
}

impl TranslationCache {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("Failed to create translation cache directory: {}", e);
        }
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key(source_text: &str, model: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        source_text.hash(&mut hasher);
        model.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub async fn load(&self, source_text: &str, model: &str) -> Option<String> {
        let key = Self::key(source_text, model);
        let content = tokio::fs::read_to_string(self.entry_path(&key)).await.ok()?;

        match serde_json::from_str::<TranslationCacheEntry>(&content) {
            // Hash collisions are possible, the stored text must match
            Ok(entry) if entry.source_text == source_text && entry.model == model => {
                debug!(
                    "Translation cache hit: {} (cached {} ago)",
                    key,
                    format_duration(now_secs().saturating_sub(entry.cached_at))
                );
                Some(entry.translation)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to parse translation cache entry {}: {}", key, e);
                None
            }
        }
    }

    pub async fn save(&self, source_text: &str, model: &str, translation: &str) -> Result<()> {
        let entry = TranslationCacheEntry {
            source_text: source_text.to_string(),
            model: model.to_string(),
            translation: translation.to_string(),
            cached_at: now_secs(),
        };

        let key = Self::key(source_text, model);
        let content = serde_json::to_string_pretty(&entry)
            .map_err(|e| CriticError::Cache(format!("Failed to serialize cache entry: {}", e)))?;
        tokio::fs::write(self.entry_path(&key), content)
            .await
            .map_err(|e| CriticError::Cache(format!("Failed to write cache entry: {}", e)))?;

        debug!("Saved translation to cache: {}", key);
        Ok(())
    }

    /// Remove every entry, returning how many were deleted
    pub async fn clear(&self) -> Result<u64> {
        let mut count = 0;
        if let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().map_or(false, |ext| ext == "json")
                    && tokio::fs::remove_file(&path).await.is_ok()
                {
                    count += 1;
                }
            }
        }
        info!("Cleared {} translation cache entries", count);
        Ok(count)
    }

    /// All readable entries, newest first
    pub async fn list(&self) -> Result<Vec<TranslationCacheEntry>> {
        let mut entries = Vec::new();

        if let Ok(mut dir_entries) = tokio::fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = dir_entries.next_entry().await {
                let path = entry.path();
                if path.extension().map_or(true, |ext| ext != "json") {
                    continue;
                }
                if let Ok(content) = tokio::fs::read_to_string(&path).await {
                    match serde_json::from_str::<TranslationCacheEntry>(&content) {
                        Ok(cache_entry) => entries.push(cache_entry),
                        Err(e) => debug!("Skipping {}: {}", path.display(), e),
                    }
                }
            }
        }

        entries.sort_by(|a, b| b.cached_at.cmp(&a.cached_at));
        Ok(entries)
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Format duration in seconds to a human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / (24 * 60 * 60);
    let hours = (seconds % (24 * 60 * 60)) / (60 * 60);
    let minutes = (seconds % (60 * 60)) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
