// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Project: the persisted, path-bound unit of isolation.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a Project. `Deleting` is transient bookkeeping held
/// only for the duration of `Registry::delete` and is never observed on the
/// wire or in the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Idle,
    Executing,
    Error,
    #[serde(skip)]
    Deleting,
}

impl Default for ProjectState {
    fn default() -> Self {
        ProjectState::Idle
    }
}

/// The persisted subset of a Project's fields. This is what the metadata
/// store serializes; no in-memory-only bookkeeping (locks, channels) lives
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: Uuid,
    pub path: PathBuf,
    pub session_id: Option<String>,
    pub state: ProjectState,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(id: Uuid, path: PathBuf) -> Self {
        let now = Utc::now();
        ProjectRecord {
            id,
            path,
            session_id: None,
            state: ProjectState::Idle,
            created_at: now,
            last_active: now,
        }
    }
}

/// Wire-facing view of a project, omitting fields that are server-internal.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectView {
    pub id: String,
    pub path: PathBuf,
    pub session_id: Option<String>,
    pub state: ProjectState,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl From<&ProjectRecord> for ProjectView {
    fn from(r: &ProjectRecord) -> Self {
        ProjectView {
            id: r.id.to_string(),
            path: r.path.clone(),
            session_id: r.session_id.clone(),
            state: if r.state == ProjectState::Deleting { ProjectState::Idle } else { r.state },
            created_at: r.created_at,
            last_active: r.last_active,
        }
    }
}
