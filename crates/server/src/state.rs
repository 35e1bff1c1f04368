// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared application state reachable from every connection.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentbridge_core::{ExecutionConfig, ExecutionManager, ProjectRegistry, RotationPolicy};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

pub struct AppState {
    pub registry: Arc<ProjectRegistry>,
    pub execution: Arc<ExecutionManager>,
    pub config: Arc<ServerConfig>,
    pub shutdown: CancellationToken,
    pub connection_count: AtomicUsize,
    rate_window: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl AppState {
    pub async fn new(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);
        let rotation_policy = RotationPolicy {
            max_bytes: config.log_rotation_size,
            max_entries: config.log_rotation_count,
            compress: config.log_rotation_compress,
        };
        let registry = Arc::new(ProjectRegistry::with_rotation_policy(
            config.data_dir.clone(),
            config.allowed_project_path_list(),
            rotation_policy,
        ));
        registry.load().await.map_err(|e| anyhow::anyhow!("failed to load metadata store: {e}"))?;

        let execution = Arc::new(ExecutionManager::new(ExecutionConfig {
            binary: config.claude_binary.clone(),
            timeout: config.execution_timeout(),
            kill_grace: std::time::Duration::from_secs(5),
            default_model: config.claude_default_model.clone(),
            default_permission_mode: Some(config.claude_permission_mode.clone()),
        }));

        Ok(Arc::new(AppState {
            registry,
            execution,
            config,
            shutdown: CancellationToken::new(),
            connection_count: AtomicUsize::new(0),
            rate_window: Mutex::new(HashMap::new()),
        }))
    }

    /// Tries to reserve a connection slot under `limits.max_connections`.
    /// Returns false (and reserves nothing) if the server is already at
    /// capacity.
    pub fn try_acquire_connection(&self) -> bool {
        loop {
            let current = self.connection_count.load(Ordering::Acquire);
            if current >= self.config.max_connections {
                return false;
            }
            if self
                .connection_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release_connection(&self) {
        self.connection_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Records one new connection attempt from `addr` and reports whether
    /// it falls within `limits.connection_rate`. A zero-valued limit
    /// disables the check entirely.
    pub async fn check_connection_rate(&self, addr: IpAddr) -> bool {
        if self.config.connection_rate_per_minute == 0 {
            return true;
        }
        let window = Duration::from_secs(60);
        let now = Instant::now();
        let mut table = self.rate_window.lock().await;
        let entry = table.entry(addr).or_default();
        while entry.front().is_some_and(|t| now.duration_since(*t) > window) {
            entry.pop_front();
        }
        if entry.len() >= self.config.connection_rate_per_minute as usize {
            return false;
        }
        entry.push_back(now);
        true
    }
}
