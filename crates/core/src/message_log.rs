// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-project append-only transcript, rotated by size or entry count.
//!
//! Files live under `<data_dir>/projects/<project_id>/logs/` and are named
//! `messages_<ordinal:020>.jsonl`, zero-padded so lexical and chronological
//! order coincide. `Append` is fsync-on-close best-effort, not per-line:
//! durability of the log itself is eventual (the authoritative durability
//! boundary is the Metadata Store for `session_id`).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Client,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub message: serde_json::Value,
}

struct RotationState {
    ordinal: u64,
    bytes_written: u64,
    entries_written: u64,
}

/// Rotation thresholds, mirroring spec's
/// `log_rotation.size`/`log_rotation.count`/`log_rotation.compress`.
#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub max_entries: u64,
    /// When true, a file rotated out of is gzipped in the background and
    /// the plaintext original removed. `read_since` only ever scans
    /// `.jsonl` files, so compressed files drop out of "since timestamp"
    /// replay.
    pub compress: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        RotationPolicy { max_bytes: 8 * 1024 * 1024, max_entries: 10_000, compress: false }
    }
}

/// Gzips `path` to `path.gz` and removes the original, logging (not
/// propagating) any failure — compression is best-effort housekeeping, not
/// on the critical path of any caller awaiting `append`.
fn compress_rotated_file(path: PathBuf) {
    tokio::task::spawn_blocking(move || {
        let result = (|| -> std::io::Result<()> {
            let input = std::fs::read(&path)?;
            let gz_path = path.with_extension("jsonl.gz");
            let file = std::fs::File::create(&gz_path)?;
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            use std::io::Write;
            encoder.write_all(&input)?;
            encoder.finish()?;
            std::fs::remove_file(&path)?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to compress rotated log file");
        }
    });
}

pub struct MessageLog {
    dir: PathBuf,
    policy: RotationPolicy,
    state: Mutex<RotationState>,
}

fn file_name(ordinal: u64) -> String {
    format!("messages_{ordinal:020}.jsonl")
}

impl MessageLog {
    /// Opens (creating if necessary) the log directory for a project,
    /// resuming rotation state from the highest existing ordinal.
    pub async fn open(project_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let dir = project_dir.as_ref().join("logs");
        tokio::fs::create_dir_all(&dir).await?;

        let mut highest = 0u64;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(rest) = name.strip_prefix("messages_").and_then(|s| s.strip_suffix(".jsonl")) {
                    if let Ok(n) = rest.parse::<u64>() {
                        highest = highest.max(n);
                    }
                }
            }
        }

        let current_path = dir.join(file_name(highest));
        let bytes_written = match tokio::fs::metadata(&current_path).await {
            Ok(m) => m.len(),
            Err(_) => 0,
        };

        Ok(MessageLog {
            dir,
            policy: RotationPolicy::default(),
            state: Mutex::new(RotationState { ordinal: highest, bytes_written, entries_written: 0 }),
        })
    }

    pub fn with_policy(mut self, policy: RotationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Appends one entry, serializing a single JSON line. Rotates to a new
    /// file first if the current one would exceed either threshold.
    pub async fn append(&self, direction: Direction, message: serde_json::Value) -> CoreResult<()> {
        let entry = LogEntry { timestamp: Utc::now(), direction, message };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut state = self.state.lock().await;
        if state.bytes_written > 0
            && (state.bytes_written + line.len() as u64 > self.policy.max_bytes
                || state.entries_written >= self.policy.max_entries)
        {
            if self.policy.compress {
                compress_rotated_file(self.dir.join(file_name(state.ordinal)));
            }
            state.ordinal += 1;
            state.bytes_written = 0;
            state.entries_written = 0;
        }

        let path = self.dir.join(file_name(state.ordinal));
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(&line).await?;
        file.flush().await?;

        state.bytes_written += line.len() as u64;
        state.entries_written += 1;
        Ok(())
    }

    /// Reads every entry with `timestamp >= since` across all rotation
    /// files, in filename (ordinal) order. Every file is scanned rather
    /// than assuming global sort order across a concurrent rotation
    /// boundary.
    pub async fn read_since(&self, since: DateTime<Utc>) -> CoreResult<Vec<LogEntry>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("messages_") && name.ends_with(".jsonl") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        let mut out = Vec::new();
        for name in names {
            let contents = tokio::fs::read_to_string(self.dir.join(&name)).await?;
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = serde_json::from_str(line)
                    .map_err(|e| CoreError::Internal(format!("corrupt log line in {name}: {e}")))?;
                if entry.timestamp >= since {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    /// No-op flush point; files are opened, written, and closed per append,
    /// so there is no held handle to flush here. Kept as an explicit
    /// lifecycle method so callers (e.g. project deletion, shutdown) have a
    /// single place to call regardless of future buffering changes.
    pub async fn close(&self) -> CoreResult<()> {
        Ok(())
    }
}
