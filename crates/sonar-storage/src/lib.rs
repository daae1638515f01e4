//! Content-addressed store for raw portal captures (exports, failure snapshots).

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sonar-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// File the portal handed us (e.g. a CSV export).
    Export,
    /// Page source at the moment a run failed.
    FailureSnapshot,
}

impl CaptureKind {
    fn prefix(self) -> &'static str {
        match self {
            CaptureKind::Export => "export",
            CaptureKind::FailureSnapshot => "failure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredCapture {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// True when identical bytes were already on disk for this run + jurisdiction.
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<stamp>/<jurisdiction>/<kind>-<hash prefix>.<ext>`
    pub fn capture_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        jurisdiction: &str,
        kind: CaptureKind,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let short_hash = &content_hash[..content_hash.len().min(16)];
        PathBuf::from(stamp)
            .join(jurisdiction)
            .join(format!("{}-{short_hash}.{ext}", kind.prefix()))
    }

    /// Write bytes via temp file + rename so a crashed run never leaves a partial capture.
    pub async fn store(
        &self,
        captured_at: DateTime<Utc>,
        jurisdiction: &str,
        kind: CaptureKind,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredCapture> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.capture_relative_path(captured_at, jurisdiction, kind, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating capture directory {}", dir.display()))?;

        let capture = |deduplicated| StoredCapture {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking capture path {}", absolute_path.display()))?
        {
            debug!(path = %absolute_path.display(), "capture already stored");
            return Ok(capture(true));
        }

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp capture {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp capture {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp capture {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming capture {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(capture(false))
    }
}
