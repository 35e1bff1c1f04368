// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory authoritative map of project-id → Project, backed by the
//! Metadata Store. Enforces path uniqueness and non-nesting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::broadcaster::Broadcaster;
use crate::error::{CoreError, CoreResult};
use crate::message_log::{MessageLog, RotationPolicy};
use crate::metadata_store::MetadataStore;
use crate::project::{ProjectRecord, ProjectState, ProjectView};

/// A live Project: its persisted record behind a state lock, plus the
/// Message Log and Broadcaster it exclusively owns. The Registry is the
/// only holder of `Arc<Project>`; everything else references a project by
/// id and looks it up through the Registry.
pub struct Project {
    pub id: Uuid,
    record: Mutex<ProjectRecord>,
    pub log: MessageLog,
    pub broadcaster: Broadcaster,
    /// Serializes execution: held by the Execution Manager for the
    /// lifetime of one `Execute` call, guaranteeing at most one live
    /// execution per project. `Arc`-wrapped so the supervising task can
    /// hold an owned guard across awaits after `execute()` returns.
    pub execution_lock: Arc<Mutex<()>>,
}

impl Project {
    pub async fn snapshot(&self) -> ProjectRecord {
        self.record.lock().await.clone()
    }

    pub async fn view(&self) -> ProjectView {
        ProjectView::from(&*self.record.lock().await)
    }

    pub async fn state(&self) -> ProjectState {
        self.record.lock().await.state
    }

    pub async fn set_state(&self, state: ProjectState) {
        self.record.lock().await.state = state;
    }

    pub async fn set_session_id(&self, session_id: String) {
        let mut r = self.record.lock().await;
        r.session_id = Some(session_id);
    }

    pub async fn clear_session_id(&self) {
        let mut r = self.record.lock().await;
        r.session_id = None;
    }

    pub async fn touch(&self) {
        let mut r = self.record.lock().await;
        r.last_active = chrono::Utc::now();
    }
}

/// Canonicalizes and validates a candidate project path against the
/// allow-list. Does not check for nesting against existing projects — the
/// registry does that while holding its write lock.
fn validate_path(raw: &Path, allowed_prefixes: &[PathBuf]) -> CoreResult<PathBuf> {
    let raw_display = crate::redact::tilde_home(&raw.display().to_string());
    if !raw.is_absolute() {
        return Err(CoreError::InvalidPath(format!("{raw_display} is not absolute")));
    }
    let canonical = std::fs::canonicalize(raw)
        .map_err(|_| CoreError::InvalidPath(format!("{raw_display} does not exist")))?;
    if !canonical.is_dir() {
        return Err(CoreError::InvalidPath(format!(
            "{} is not a directory",
            crate::redact::tilde_home(&canonical.display().to_string())
        )));
    }
    if !allowed_prefixes.is_empty() && !allowed_prefixes.iter().any(|p| canonical.starts_with(p)) {
        return Err(CoreError::InvalidPath(format!(
            "{} is outside the configured allow-list",
            crate::redact::tilde_home(&canonical.display().to_string())
        )));
    }
    Ok(canonical)
}

/// True if `a` and `b` are equal or one is an ancestor of the other.
/// Component-wise comparison avoids `/a/bc` falsely matching `/a/b`.
fn overlaps(a: &Path, b: &Path) -> bool {
    a == b || a.starts_with(b) || b.starts_with(a)
}

pub struct ProjectRegistry {
    projects: RwLock<HashMap<Uuid, Arc<Project>>>,
    store: MetadataStore,
    data_dir: PathBuf,
    allowed_prefixes: Vec<PathBuf>,
    log_rotation: RotationPolicy,
}

impl ProjectRegistry {
    pub fn new(data_dir: impl Into<PathBuf>, allowed_prefixes: Vec<PathBuf>) -> Self {
        Self::with_rotation_policy(data_dir, allowed_prefixes, RotationPolicy::default())
    }

    pub fn with_rotation_policy(
        data_dir: impl Into<PathBuf>,
        allowed_prefixes: Vec<PathBuf>,
        log_rotation: RotationPolicy,
    ) -> Self {
        let data_dir = data_dir.into();
        ProjectRegistry {
            projects: RwLock::new(HashMap::new()),
            store: MetadataStore::new(&data_dir),
            data_dir,
            allowed_prefixes,
            log_rotation,
        }
    }

    fn project_dir(&self, id: Uuid) -> PathBuf {
        self.data_dir.join("projects").join(id.to_string())
    }

    /// Loads persisted projects from the Metadata Store and reopens their
    /// Message Logs, reconstructing the full live project set. Called once
    /// at startup.
    pub async fn load(&self) -> CoreResult<()> {
        let records = self.store.load_all().await?;
        let mut projects = self.projects.write().await;
        for mut record in records {
            if record.state == ProjectState::Executing {
                // A crash mid-execution leaves no live child process; the
                // project comes back IDLE rather than stuck EXECUTING
                // forever.
                record.state = ProjectState::Idle;
            }
            let log = MessageLog::open(self.project_dir(record.id)).await?.with_policy(self.log_rotation);
            let project = Project {
                id: record.id,
                record: Mutex::new(record.clone()),
                log,
                broadcaster: Broadcaster::new(),
                execution_lock: Arc::new(Mutex::new(())),
            };
            projects.insert(record.id, Arc::new(project));
        }
        Ok(())
    }

    async fn persist_locked(&self, projects: &HashMap<Uuid, Arc<Project>>) -> CoreResult<()> {
        let mut records = Vec::with_capacity(projects.len());
        for p in projects.values() {
            let r = p.snapshot().await;
            if r.state != ProjectState::Deleting {
                records.push(r);
            }
        }
        self.store.save_all(records).await
    }

    /// Persists the current state of every project. Callers that mutate a
    /// single project's record (e.g. session-id assignment) call this so
    /// the mutation is durable before their request completes.
    pub async fn persist(&self) -> CoreResult<()> {
        let projects = self.projects.read().await;
        self.persist_locked(&projects).await
    }

    pub async fn create(&self, path: &Path) -> CoreResult<ProjectView> {
        let canonical = validate_path(path, &self.allowed_prefixes)?;

        let mut projects = self.projects.write().await;
        for existing in projects.values() {
            let existing_path = existing.snapshot().await.path;
            if overlaps(&canonical, &existing_path) {
                let path = crate::redact::tilde_home(&canonical.display().to_string());
                return Err(CoreError::ProjectNesting(path));
            }
        }

        let id = Uuid::new_v4();
        let log = MessageLog::open(self.project_dir(id)).await?.with_policy(self.log_rotation);
        let project = Project {
            id,
            record: Mutex::new(ProjectRecord::new(id, canonical)),
            log,
            broadcaster: Broadcaster::new(),
            execution_lock: Arc::new(Mutex::new(())),
        };
        let view = project.view().await;
        projects.insert(id, Arc::new(project));
        self.persist_locked(&projects).await?;
        Ok(view)
    }

    pub async fn delete(&self, id: Uuid) -> CoreResult<()> {
        let mut projects = self.projects.write().await;
        let project = projects.get(&id).ok_or_else(|| CoreError::ProjectNotFound(id.to_string()))?;

        if project.state().await == ProjectState::Executing {
            return Err(CoreError::ProcessActive);
        }
        project.set_state(ProjectState::Deleting).await;
        project.log.close().await?;

        projects.remove(&id);
        self.persist_locked(&projects).await
    }

    pub async fn list(&self) -> Vec<ProjectView> {
        let projects = self.projects.read().await;
        let mut out = Vec::with_capacity(projects.len());
        for p in projects.values() {
            out.push(p.view().await);
        }
        out
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Arc<Project>> {
        self.projects
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::ProjectNotFound(id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.projects.read().await.len()
    }

    /// Flushes every project's log and persists the metadata store one last
    /// time. Called during graceful shutdown, after executions have been
    /// cancelled and drained.
    pub async fn shutdown(&self) -> CoreResult<()> {
        let projects = self.projects.read().await;
        for project in projects.values() {
            project.log.close().await?;
        }
        self.persist_locked(&projects).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_list_contains_new_project() {
        let data_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::new(data_dir.path(), vec![]);

        let created = registry.create(project_dir.path()).await.unwrap();
        let listed = registry.list().await;

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, created.id);
    }

    #[tokio::test]
    async fn nested_path_is_rejected() {
        let data_dir = tempfile::tempdir().unwrap();
        let parent = tempfile::tempdir().unwrap();
        let child = parent.path().join("child");
        std::fs::create_dir(&child).unwrap();

        let registry = ProjectRegistry::new(data_dir.path(), vec![]);
        registry.create(parent.path()).await.unwrap();

        let err = registry.create(&child).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ProjectNesting);
    }

    #[tokio::test]
    async fn delete_then_list_omits_project_and_second_delete_not_found() {
        let data_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::new(data_dir.path(), vec![]);

        let created = registry.create(project_dir.path()).await.unwrap();
        let id = Uuid::parse_str(&created.id).unwrap();

        registry.delete(id).await.unwrap();
        assert!(registry.list().await.is_empty());

        let err = registry.delete(id).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ProjectNotFound);
    }

    #[tokio::test]
    async fn delete_while_executing_is_rejected() {
        let data_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::new(data_dir.path(), vec![]);

        let created = registry.create(project_dir.path()).await.unwrap();
        let id = Uuid::parse_str(&created.id).unwrap();
        let project = registry.get(id).await.unwrap();
        project.set_state(ProjectState::Executing).await;

        let err = registry.delete(id).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ProcessActive);
    }

    #[tokio::test]
    async fn restart_preserves_projects_and_session_id() {
        let data_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let id;
        {
            let registry = ProjectRegistry::new(data_dir.path(), vec![]);
            let created = registry.create(project_dir.path()).await.unwrap();
            id = Uuid::parse_str(&created.id).unwrap();
            let project = registry.get(id).await.unwrap();
            project.set_session_id("sess-123".to_string()).await;
            registry.persist().await.unwrap();
        }

        let registry2 = ProjectRegistry::new(data_dir.path(), vec![]);
        registry2.load().await.unwrap();
        let listed = registry2.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id.to_string());
        assert_eq!(listed[0].session_id.as_deref(), Some("sess-123"));
    }

    #[tokio::test]
    async fn shutdown_persists_metadata_surviving_a_fresh_load() {
        let data_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let id;
        {
            let registry = ProjectRegistry::new(data_dir.path(), vec![]);
            let created = registry.create(project_dir.path()).await.unwrap();
            id = created.id;
            registry.shutdown().await.unwrap();
        }

        let registry2 = ProjectRegistry::new(data_dir.path(), vec![]);
        registry2.load().await.unwrap();
        let listed = registry2.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
    }

    #[tokio::test]
    async fn len_tracks_create_and_delete() {
        let data_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::new(data_dir.path(), vec![]);
        assert_eq!(registry.len().await, 0);

        let created = registry.create(project_dir.path()).await.unwrap();
        assert_eq!(registry.len().await, 1);

        registry.delete(Uuid::parse_str(&created.id).unwrap()).await.unwrap();
        assert_eq!(registry.len().await, 0);
    }
}
