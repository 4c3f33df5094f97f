use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::warn;

use crate::error::{CriticError, Result};

/// Files larger than this are never treated as placeholders
const PLACEHOLDER_MAX_BYTES: u64 = 2048;

const LFS_SPEC_MARKER: &str = "git-lfs.github.com/spec";
const LFS_OID_MARKER: &str = "oid sha256:";
const LFS_SIZE_MARKER: &str = "size ";

/// What is on disk where a model artifact should be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    Present,
    Missing,
    /// A large-file-store pointer left in place of the real weights
    Placeholder,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Present => "present",
            ArtifactStatus::Missing => "missing",
            ArtifactStatus::Placeholder => "placeholder",
        }
    }
}

/// Detect a small pointer file standing in for real weights.
///
/// Pointer files look like:
///
/// ```text
/// version https://git-lfs.github.com/spec/v1
/// oid sha256:<hash>
/// size <bytes>
/// ```
pub fn is_placeholder(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() || metadata.len() > PLACEHOLDER_MAX_BYTES {
        return false;
    }

    let mut buffer = Vec::with_capacity(metadata.len() as usize);
    match fs::File::open(path).and_then(|mut f| f.read_to_end(&mut buffer)) {
        Ok(_) => {
            let header = String::from_utf8_lossy(&buffer);
            header.contains(LFS_SPEC_MARKER)
                && header.contains(LFS_OID_MARKER)
                && header.contains(LFS_SIZE_MARKER)
        }
        Err(_) => false,
    }
}

pub fn status(path: &Path) -> ArtifactStatus {
    if !path.exists() {
        ArtifactStatus::Missing
    } else if is_placeholder(path) {
        ArtifactStatus::Placeholder
    } else {
        ArtifactStatus::Present
    }
}

/// Fail unless the artifact exists and holds real content
pub fn require_real(path: &Path) -> Result<()> {
    match status(path) {
        ArtifactStatus::Present => Ok(()),
        ArtifactStatus::Missing => Err(CriticError::FileNotFound(path.display().to_string())),
        ArtifactStatus::Placeholder => Err(CriticError::Placeholder(path.display().to_string())),
    }
}

/// Try each deserialization method in turn and return the first success.
///
/// Every failure is logged; the error of the last method is returned when all fail.
pub fn first_success<T>(
    path: &Path,
    methods: &[(&str, &dyn Fn(&Path) -> Result<T>)],
) -> Result<T> {
    let mut last_error = None;

    for (name, method) in methods {
        match method(path) {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{} failed for {}: {}", name, path.display(), e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        CriticError::Artifact(format!("No deserialization method for {}", path.display()))
    }))
}
