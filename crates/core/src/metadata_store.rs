// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Crash-safe persistence of the Project set.
//!
//! `<data_dir>/metadata.json` is the single logical document. Writes are
//! atomic against crashes: serialize to a temp file in the same directory,
//! fsync, rename over the destination. A missing file loads as an empty
//! set; a file that fails to parse is a hard startup error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::project::ProjectRecord;

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataDocument {
    projects: Vec<ProjectRecord>,
}

/// Durable store for the full Project set. Serializes all savers behind a
/// single write lock; readers take a point-in-time copy.
pub struct MetadataStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        MetadataStore {
            path: data_dir.as_ref().join("metadata.json"),
            write_lock: Mutex::new(()),
        }
    }

    /// Loads the full project set. A missing file is an empty set; a
    /// corrupt file is a hard error so a bad on-disk state never silently
    /// reads back as "no projects".
    pub async fn load_all(&self) -> CoreResult<Vec<ProjectRecord>> {
        let path = self.path.clone();
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::FileOperation(e.to_string())),
        };
        let doc: MetadataDocument = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::FileOperation(format!("corrupt metadata.json: {e}")))?;
        Ok(doc.projects)
    }

    /// Atomically replaces the full project set. Every externally
    /// observable mutation must go through this before the triggering
    /// request is acknowledged.
    pub async fn save_all(&self, projects: Vec<ProjectRecord>) -> CoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let doc = MetadataDocument { projects };
        let json = serde_json::to_vec_pretty(&doc)?;

        let path = self.path.clone();
        let tmp_path = path.with_extension("json.tmp");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::task::spawn_blocking(move || -> CoreResult<()> {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &path)?;
            Ok(())
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))??;

        Ok(())
    }
}
