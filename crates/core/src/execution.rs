// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution Manager: per-project serialized launcher/supervisor of the
//! agent subprocess.
//!
//! `Execute` enforces IDLE → EXECUTING under the project's execution lock,
//! spawns the agent binary, streams its stdout as newline-delimited JSON,
//! and drives one of the termination paths (normal exit, timeout, cancel,
//! crash, binary missing) described in the component design. Results never
//! return directly to the caller — they flow through the project's
//! Message Log and Broadcaster.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::message_log::Direction;
use crate::project::ProjectState;
use crate::registry::{Project, ProjectRegistry};

const STDERR_TAIL_CAP: usize = 64 * 1024;

/// Per-execution arguments layered over the project's default options.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub disallowed_tools: Option<Vec<String>>,
    pub append_system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub binary: PathBuf,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub default_model: Option<String>,
    pub default_permission_mode: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            binary: PathBuf::from("claude"),
            timeout: Duration::from_secs(600),
            kill_grace: Duration::from_secs(5),
            default_model: None,
            default_permission_mode: None,
        }
    }
}

fn build_args(config: &ExecutionConfig, options: &ExecutionOptions, resume: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    if let Some(model) = options.model.as_ref().or(config.default_model.as_ref()) {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(mode) = options.permission_mode.as_ref().or(config.default_permission_mode.as_ref()) {
        args.push("--permission-mode".to_string());
        args.push(mode.clone());
    }
    if let Some(tools) = &options.allowed_tools {
        if !tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }
    }
    if let Some(tools) = &options.disallowed_tools {
        if !tools.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(tools.join(","));
        }
    }
    if let Some(sys_prompt) = &options.append_system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(sys_prompt.clone());
    }
    if let Some(session_id) = resume {
        args.push("--resume".to_string());
        args.push(session_id.to_string());
    }

    args
}

fn error_envelope(code: crate::error::ErrorCode, message: impl Into<String>, details: Option<Value>) -> Value {
    json!({
        "type": "error",
        "data": {
            "code": code.as_str(),
            "message": message.into(),
            "details": details,
        }
    })
}

fn kill(pid: i32, sig: Signal) {
    let _ = signal::kill(Pid::from_raw(pid), sig);
}

/// Owns the set of currently-running executions so `agent_kill` can locate
/// a project's cancellation handle without the project itself knowing
/// about execution machinery.
pub struct ExecutionManager {
    config: ExecutionConfig,
    active: AsyncMutex<HashMap<Uuid, CancellationToken>>,
}

impl ExecutionManager {
    pub fn new(config: ExecutionConfig) -> Self {
        ExecutionManager { config, active: AsyncMutex::new(HashMap::new()) }
    }

    /// Requests cancellation of a project's running execution. A project
    /// with no live execution is a no-op success, matching the scenario
    /// where `agent_kill` arrives after the agent already finished.
    pub async fn cancel(&self, project_id: Uuid) {
        if let Some(token) = self.active.lock().await.get(&project_id) {
            token.cancel();
        }
    }

    /// Cancels every currently-running execution. Used by the Server Host's
    /// shutdown fan-in: all children are signalled before the drain deadline
    /// starts counting down.
    pub async fn cancel_all(&self) {
        for token in self.active.lock().await.values() {
            token.cancel();
        }
    }

    /// True while at least one execution is live, so shutdown can poll for
    /// the drain deadline instead of guessing a fixed sleep.
    pub async fn has_active(&self) -> bool {
        !self.active.lock().await.is_empty()
    }

    /// Launches the agent binary for `project` with `prompt`. Returns once
    /// the precondition check and spawn have succeeded (or failed); the
    /// rest of the execution runs in a detached supervising task and
    /// communicates only through the project's log and broadcaster.
    pub async fn execute(
        self: Arc<Self>,
        registry: Arc<ProjectRegistry>,
        project: Arc<Project>,
        prompt: String,
        options: ExecutionOptions,
    ) -> CoreResult<()> {
        let guard = project
            .execution_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| CoreError::ProcessActive)?;

        project.set_state(ProjectState::Executing).await;

        let snapshot = project.snapshot().await;

        // The prompt is appended and broadcast BEFORE spawning so
        // subscribers that joined first see it before any response.
        let prompt_message = json!({ "prompt": prompt });
        project.log.append(Direction::Client, prompt_message.clone()).await?;
        project
            .broadcaster
            .publish(json!({
                "type": "message",
                "project_id": project.id.to_string(),
                "data": { "direction": "client", "message": prompt_message },
            }))
            .await;

        let args = build_args(&self.config, &options, snapshot.session_id.as_deref());

        let mut cmd = Command::new(&self.config.binary);
        cmd.current_dir(&snapshot.path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                project.set_state(ProjectState::Idle).await;
                let binary = crate::redact::tilde_home(&self.config.binary.display().to_string());
                return Err(CoreError::ClaudeNotFound(binary));
            }
            Err(e) => {
                project.set_state(ProjectState::Idle).await;
                return Err(CoreError::Internal(format!("failed to spawn agent: {e}")));
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                project.set_state(ProjectState::Idle).await;
                let _ = child.start_kill();
                return Err(CoreError::Internal(format!("failed to write prompt to agent stdin: {e}")));
            }
            // Drop closes the write half so the agent observes EOF instead
            // of blocking for more input.
        }

        let cancel = CancellationToken::new();
        self.active.lock().await.insert(project.id, cancel.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            manager.supervise(registry, project.clone(), child, cancel, guard).await;
            manager.active.lock().await.remove(&project.id);
        });

        Ok(())
    }

    async fn supervise(
        &self,
        registry: Arc<ProjectRegistry>,
        project: Arc<Project>,
        mut child: Child,
        cancel: CancellationToken,
        _guard: tokio::sync::OwnedMutexGuard<()>,
    ) {
        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                project.set_state(ProjectState::Idle).await;
                return;
            }
        };
        let mut stderr = child.stderr.take();

        let stderr_tail: Arc<AsyncMutex<Vec<u8>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let stderr_task = stderr.take().map(|mut s| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match s.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut t = tail.lock().await;
                            t.extend_from_slice(&buf[..n]);
                            let len = t.len();
                            if len > STDERR_TAIL_CAP {
                                t.drain(0..len - STDERR_TAIL_CAP);
                            }
                        }
                    }
                }
            })
        });

        let mut lines = BufReader::new(stdout).lines();
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        let mut outcome = Outcome::NormalExit;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    outcome = Outcome::Timeout;
                    break;
                }
                _ = cancel.cancelled() => {
                    outcome = Outcome::Cancelled;
                    break;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(l)) => self.handle_line(&project, &registry, &l).await,
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
            }
        }

        if matches!(outcome, Outcome::Timeout | Outcome::Cancelled) {
            self.kill_sequence(&mut child).await;
            // Drain any remaining buffered output so a late line never
            // races the next execution.
            while let Ok(Some(l)) = lines.next_line().await {
                self.handle_line(&project, &registry, &l).await;
            }
        }

        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let status = child.wait().await;

        project.touch().await;

        match outcome {
            Outcome::Timeout => {
                project.set_state(ProjectState::Idle).await;
                let envelope = error_envelope(
                    crate::error::ErrorCode::ExecutionTimeout,
                    format!("execution exceeded {:?}", self.config.timeout),
                    None,
                );
                let _ = project.log.append(Direction::Agent, envelope.clone()).await;
                project.broadcaster.publish(self.wrap(&project, envelope)).await;
            }
            Outcome::Cancelled => {
                project.set_state(ProjectState::Idle).await;
                let envelope = json!({ "type": "execution_killed" });
                let _ = project.log.append(Direction::Agent, envelope.clone()).await;
                project.broadcaster.publish(self.wrap(&project, envelope)).await;
            }
            Outcome::NormalExit => {
                let exit_ok = matches!(&status, Ok(s) if s.success());
                if exit_ok {
                    project.set_state(ProjectState::Idle).await;
                    let envelope = json!({ "type": "execution_complete" });
                    let _ = project.log.append(Direction::Agent, envelope.clone()).await;
                    project.broadcaster.publish(self.wrap(&project, envelope)).await;
                } else {
                    project.set_state(ProjectState::Error).await;
                    let tail = stderr_tail.lock().await;
                    let tail_str = crate::redact::sanitize(&String::from_utf8_lossy(&tail));
                    let envelope = error_envelope(
                        crate::error::ErrorCode::InternalError,
                        "agent process exited unsuccessfully",
                        Some(json!({ "stderr_tail": tail_str, "status": format!("{status:?}") })),
                    );
                    let _ = project.log.append(Direction::Agent, envelope.clone()).await;
                    project.broadcaster.publish(self.wrap(&project, envelope)).await;
                    project.set_state(ProjectState::Idle).await;
                }
            }
        }
    }

    fn wrap(&self, project: &Project, data: Value) -> Value {
        json!({
            "type": "message",
            "project_id": project.id.to_string(),
            "data": { "direction": "agent", "message": data },
        })
    }

    async fn handle_line(&self, project: &Project, registry: &Arc<ProjectRegistry>, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let parsed: Result<Value, _> = serde_json::from_str(line);
        let message = match parsed {
            Ok(v) => v,
            Err(e) => error_envelope(
                crate::error::ErrorCode::JsonParsing,
                format!("failed to parse agent output line: {e}"),
                Some(json!({ "raw_line": line })),
            ),
        };

        let _ = project.log.append(Direction::Agent, message.clone()).await;

        if message.get("type").and_then(Value::as_str) == Some("system")
            && message.get("subtype").and_then(Value::as_str) == Some("init")
        {
            if let Some(session_id) = message.get("session_id").and_then(Value::as_str) {
                project.set_session_id(session_id.to_string()).await;
                // Persist before publish: a crash between these two steps
                // must never leave a subscriber having seen a session id
                // the server has since forgotten.
                let _ = registry.persist().await;
            }
        }

        project.broadcaster.publish(self.wrap(project, message)).await;
    }

    async fn kill_sequence(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            kill(pid as i32, Signal::SIGTERM);
            let grace = tokio::time::sleep(self.config.kill_grace);
            tokio::pin!(grace);
            tokio::select! {
                _ = &mut grace => {
                    kill(pid as i32, Signal::SIGKILL);
                }
                status = child.wait() => {
                    let _ = status;
                    return;
                }
            }
        }
        let _ = child.wait().await;
    }
}

enum Outcome {
    NormalExit,
    Timeout,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_includes_model_and_resume_token() {
        let config = ExecutionConfig::default();
        let options = ExecutionOptions { model: Some("opus".to_string()), ..Default::default() };
        let args = build_args(&config, &options, Some("sess-1"));
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"opus".to_string()));
        assert!(args.contains(&"--resume".to_string()));
        assert!(args.contains(&"sess-1".to_string()));
    }

    #[test]
    fn build_args_omits_resume_when_no_session() {
        let config = ExecutionConfig::default();
        let options = ExecutionOptions::default();
        let args = build_args(&config, &options, None);
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[tokio::test]
    async fn cancel_on_unknown_project_is_a_noop() {
        let manager = ExecutionManager::new(ExecutionConfig::default());
        manager.cancel(Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn cancel_all_cancels_every_registered_token() {
        let manager = ExecutionManager::new(ExecutionConfig::default());
        assert!(!manager.has_active().await);

        let token = CancellationToken::new();
        manager.active.lock().await.insert(Uuid::new_v4(), token.clone());
        assert!(manager.has_active().await);

        manager.cancel_all().await;
        assert!(token.is_cancelled());

        manager.active.lock().await.clear();
        assert!(!manager.has_active().await);
    }
}
