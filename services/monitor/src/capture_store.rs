//! Bounded capture retention.
//!
//! Snapshots are written as JPEG files into the capture directory. Two
//! independent bounds apply: the in-memory recent list keeps at most
//! `max_captures` records, and the directory keeps at most `max_files` image
//! files (newest by modification time).

use chrono::{DateTime, Utc};
use image::RgbImage;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::CaptureConfig;
use crate::frame_processor::{encode_jpeg, AlignmentStatus};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Errors that can occur while persisting captures.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to create capture directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot capture an empty frame")]
    EmptyFrame,
}

/// A persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureRecord {
    pub file_name: String,
    pub image_url: String,
    pub captured_at: DateTime<Utc>,
    pub status: AlignmentStatus,
    pub distance_cm: u32,
    pub is_manual: bool,
}

/// Decision on whether to persist a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureDecision {
    Store { reason: String },
    Skip { reason: String },
}

struct CaptureInner {
    records: VecDeque<CaptureRecord>,
    last_auto: Option<Instant>,
    sequence: u64,
}

/// Capture directory plus the in-memory recent list.
pub struct CaptureStore {
    directory: PathBuf,
    url_prefix: String,
    interval: Duration,
    max_captures: usize,
    max_files: usize,
    inner: Mutex<CaptureInner>,
}

impl CaptureStore {
    /// Create the store, creating the capture directory if needed.
    pub fn new(config: &CaptureConfig) -> Result<Self, CaptureError> {
        std::fs::create_dir_all(&config.directory).map_err(|source| CaptureError::CreateDir {
            path: config.directory.display().to_string(),
            source,
        })?;

        if config.max_captures > config.max_files {
            warn!(
                max_captures = config.max_captures,
                max_files = config.max_files,
                "In-memory capture list may reference files already rotated off disk"
            );
        }

        Ok(Self {
            directory: config.directory.clone(),
            url_prefix: config.url_prefix.trim_end_matches('/').to_string(),
            interval: config.interval(),
            max_captures: config.max_captures,
            max_files: config.max_files,
            inner: Mutex::new(CaptureInner {
                records: VecDeque::with_capacity(config.max_captures),
                last_auto: None,
                sequence: 0,
            }),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Persist `frame` unless it is an automatic capture inside the interval.
    ///
    /// Returns `Ok(None)` when the rate limit skipped the capture. On write
    /// failure neither the recent list nor the rate-limit clock changes.
    pub fn add_capture(
        &self,
        frame: &RgbImage,
        is_manual: bool,
        status: AlignmentStatus,
        distance_cm: u32,
        quality: u8,
    ) -> Result<Option<CaptureRecord>, CaptureError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(CaptureError::EmptyFrame);
        }

        let mut inner = self.inner.lock();
        let now = Instant::now();

        match self.should_store(is_manual, inner.last_auto, now) {
            CaptureDecision::Skip { reason } => {
                trace!(reason = %reason, "Capture skipped");
                return Ok(None);
            }
            CaptureDecision::Store { reason } => {
                debug!(reason = %reason, "Capture accepted");
            }
        }

        let captured_at = Utc::now();
        let file_name = format!(
            "{}_capture_{}_{}.jpg",
            if is_manual { "manual" } else { "auto" },
            captured_at.format("%Y%m%d_%H%M%S_%3f"),
            inner.sequence
        );
        let path = self.directory.join(&file_name);

        let bytes = encode_jpeg(frame, quality)?;
        if let Err(source) = std::fs::write(&path, &bytes) {
            let _ = std::fs::remove_file(&path);
            return Err(CaptureError::Write {
                path: path.display().to_string(),
                source,
            });
        }

        let record = CaptureRecord {
            image_url: format!("{}/{}", self.url_prefix, file_name),
            file_name,
            captured_at,
            status,
            distance_cm,
            is_manual,
        };

        inner.sequence += 1;
        if !is_manual {
            inner.last_auto = Some(now);
        }
        inner.records.push_front(record.clone());
        inner.records.truncate(self.max_captures);

        metrics::counter!("monitor.captures.saved").increment(1);
        info!(
            file = %record.file_name,
            manual = is_manual,
            status = %status,
            distance_cm,
            bytes = bytes.len(),
            "Capture saved"
        );

        self.enforce_file_retention();
        Ok(Some(record))
    }

    /// Rate-limit decision for a capture at `now`.
    pub fn should_store(
        &self,
        is_manual: bool,
        last_auto: Option<Instant>,
        now: Instant,
    ) -> CaptureDecision {
        if is_manual {
            return CaptureDecision::Store {
                reason: "Manual capture".to_string(),
            };
        }
        match last_auto {
            Some(last) if now.saturating_duration_since(last) < self.interval => {
                CaptureDecision::Skip {
                    reason: format!(
                        "Automatic capture interval not elapsed: {:?} < {:?}",
                        now.saturating_duration_since(last),
                        self.interval
                    ),
                }
            }
            _ => CaptureDecision::Store {
                reason: "Automatic capture interval elapsed".to_string(),
            },
        }
    }

    /// Delete all but the newest `max_files` image files in the directory.
    /// Returns the number of files removed.
    pub fn enforce_file_retention(&self) -> usize {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.directory.display(), error = %e, "Cannot list capture directory");
                return 0;
            }
        };

        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_image(path))
            .filter_map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .collect();

        if files.len() <= self.max_files {
            return 0;
        }

        files.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0;
        for (_, path) in files.iter().skip(self.max_files) {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    removed += 1;
                    debug!(file = %path.display(), "Old capture removed");
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove old capture"),
            }
        }
        removed
    }

    /// Recent captures, most recent first.
    pub fn recent(&self) -> Vec<CaptureRecord> {
        self.inner.lock().records.iter().cloned().collect()
    }

    /// Path of the most recent capture still on disk.
    pub fn latest_file(&self) -> Option<PathBuf> {
        self.inner
            .lock()
            .records
            .iter()
            .map(|r| self.directory.join(&r.file_name))
            .find(|p| p.is_file())
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}
