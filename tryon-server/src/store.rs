//! Result storage.
//!
//! Generated images are written as `<id>.png` under the results directory,
//! next to a `<id>.json` sidecar with the generation metadata. Ids embed
//! their creation time, so expiry can be decided from the id alone.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tryon_common::{Category, Variant};
use uuid::Uuid;

/// `YYYYMMDDTHHMMSSmmm`
const TIMESTAMP_LEN: usize = 18;
const MAX_COUNTER_DIGITS: usize = 20;

/// Opaque handle to a stored artifact: `<UTC timestamp with ms>-<counter>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultId {
    value: String,
    issued_at: DateTime<Utc>,
}

impl ResultId {
    fn new(issued_at: DateTime<Utc>, counter: u64) -> Self {
        // Keep only what the id can represent.
        let issued_at = Utc
            .timestamp_millis_opt(issued_at.timestamp_millis())
            .single()
            .unwrap_or(issued_at);
        Self {
            value: format!("{}-{}", issued_at.format("%Y%m%dT%H%M%S%3f"), counter),
            issued_at,
        }
    }

    /// Parse an id. Anything that could not have been issued is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let (timestamp, counter) = value.split_once('-')?;

        if timestamp.len() != TIMESTAMP_LEN
            || counter.is_empty()
            || counter.len() > MAX_COUNTER_DIGITS
            || !counter.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        let (date, rest) = timestamp.split_at(8);
        let (t, time) = rest.split_at(1);
        if t != "T" || !date.bytes().chain(time.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        counter.parse::<u64>().ok()?;

        let (seconds, millis) = timestamp.split_at(15);
        let naive = NaiveDateTime::parse_from_str(seconds, "%Y%m%dT%H%M%S").ok()?;
        let millis: i64 = millis.parse().ok()?;
        let issued_at = Utc.from_utc_datetime(&naive) + chrono::Duration::milliseconds(millis);

        Some(Self {
            value: value.to_string(),
            issued_at,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Generation metadata kept next to each image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub job_id: Uuid,
    pub variant: Variant,
    pub category: Category,
    /// Position of this image among the job's samples.
    pub sample_index: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub seed: i64,
    pub width: u32,
    pub height: u32,
    pub created_at: DateTime<Utc>,
}

/// A stored image.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub png: Bytes,
    /// Missing if the sidecar could not be read.
    pub metadata: Option<ArtifactMetadata>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed, expired and never-issued ids all end up here.
    #[error("Result not found")]
    NotFound,

    #[error("Result storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode result metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// File-backed store for generated images.
///
/// All methods do blocking file I/O; call them from a blocking context.
pub struct ResultStore {
    dir: PathBuf,
    retention: Duration,
    counter: AtomicU64,
}

impl ResultStore {
    /// Open the store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>, retention: Duration) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retention,
            counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn image_path(&self, id: &ResultId) -> PathBuf {
        self.dir.join(format!("{}.png", id))
    }

    fn metadata_path(&self, id: &ResultId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn is_expired(&self, id: &ResultId, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.retention) {
            Ok(retention) => id.issued_at + retention <= now,
            Err(_) => false,
        }
    }

    /// Persist an encoded PNG and its metadata.
    pub fn store(&self, png: &[u8], metadata: &ArtifactMetadata) -> Result<ResultId, StoreError> {
        let sidecar = serde_json::to_vec_pretty(metadata)?;

        loop {
            let id = ResultId::new(Utc::now(), self.counter.fetch_add(1, Ordering::Relaxed));

            // create_new guarantees an id is never reused, even across restarts.
            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.image_path(&id))
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };
            file.write_all(png)?;
            file.sync_all()?;
            fs::write(self.metadata_path(&id), &sidecar)?;

            tracing::debug!(result_id = %id, bytes = png.len(), "Stored result");
            return Ok(id);
        }
    }

    /// Fetch an artifact by its textual id.
    pub fn fetch(&self, id: &str) -> Result<Artifact, StoreError> {
        let id = ResultId::parse(id).ok_or(StoreError::NotFound)?;
        if self.is_expired(&id, Utc::now()) {
            return Err(StoreError::NotFound);
        }

        let png = match fs::read(self.image_path(&id)) {
            Ok(png) => png,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let metadata = fs::read(self.metadata_path(&id))
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok());

        Ok(Artifact {
            png: Bytes::from(png),
            metadata,
        })
    }

    /// Delete expired artifacts. Returns the number of files removed.
    pub fn sweep(&self) -> io::Result<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_artifact = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("png") | Some("json")
            );
            if !is_artifact {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(ResultId::parse)
            else {
                continue;
            };

            if self.is_expired(&id, now) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(path = %path.display(), "Failed to remove result: {}", e),
                }
            }
        }

        Ok(removed)
    }

    /// Run [`sweep`](Self::sweep) periodically.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.sweep()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(removed)) => tracing::info!(removed, "Swept expired results"),
                    Ok(Err(e)) => tracing::warn!("Result sweep failed: {}", e),
                    Err(e) => tracing::warn!("Result sweep task failed: {}", e),
                }
            }
        })
    }
}
