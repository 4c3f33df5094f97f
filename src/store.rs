use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CriticError, Result};
use crate::normalize::SentimentLabel;

/// Marker set on records that only reached the local backup file
pub const LOCAL_FILE_FALLBACK: &str = "local_file";

/// A submitted review and the sentiment computed for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub review_id: Uuid,
    #[serde(default)]
    pub movie_id: Option<u64>,
    #[serde(default)]
    pub movie_title: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    pub original_text: String,
    pub original_language: String,
    #[serde(default)]
    pub translated_text: Option<String>,
    #[serde(default)]
    pub translation_model: Option<String>,
    #[serde(default)]
    pub was_translated: bool,
    pub sentiment_label: SentimentLabel,
    pub sentiment_score: f64,
    pub model_used: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_fallback: Option<String>,
}

impl ReviewRecord {
    /// Text to re-analyze: the original, or the stored translation when it is blank
    pub fn source_text(&self) -> &str {
        if self.original_text.trim().is_empty() {
            self.translated_text.as_deref().unwrap_or_default()
        } else {
            &self.original_text
        }
    }
}

/// Review records kept as one JSON object per line
#[derive(Debug, Clone)]
pub struct ReviewStore {
    path: PathBuf,
}

impl ReviewStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &ReviewRecord) -> Result<ReviewRecord> {
        let mut record = record.clone();
        if record.storage_fallback.is_none() {
            record.storage_fallback = Some(LOCAL_FILE_FALLBACK.to_string());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CriticError::Store(format!("Failed to open {}: {}", self.path.display(), e)))?;
        writeln!(file, "{}", line)?;

        debug!("Appended review {} to {}", record.review_id, self.path.display());
        Ok(record)
    }

    /// Every readable record; a missing file is an empty store
    pub fn load_all(&self) -> Result<Vec<ReviewRecord>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ReviewRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping malformed record on line {} of {}: {}",
                    index + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(records)
    }

    /// Replace the whole file with `records`
    pub fn rewrite(&self, records: &[ReviewRecord]) -> Result<()> {
        let mut content = String::new();
        for record in records {
            content.push_str(&serde_json::to_string(record)?);
            content.push('\n');
        }

        let temp_path = self.path.with_extension("jsonl.tmp");
        fs::write(&temp_path, content)
            .map_err(|e| CriticError::Store(format!("Failed to write {}: {}", temp_path.display(), e)))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|e| CriticError::Store(format!("Failed to replace {}: {}", self.path.display(), e)))?;

        info!("Rewrote {} records to {}", records.len(), self.path.display());
        Ok(())
    }
}
