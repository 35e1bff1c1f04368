// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Message Router: dispatch table from inbound message type to handler.
//!
//! Handlers either produce a response inline or spawn an execution and
//! return nothing — later results arrive over the connection via the
//! project's Broadcaster, which every joined connection already funnels
//! into its own outbound queue.

use std::collections::HashMap;
use std::path::PathBuf;

use agentbridge_core::ExecutionOptions;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// One connection's subscription membership and outbound sender. Owned
/// exclusively by that connection's inbound-processing loop.
pub struct InboundContext {
    pub session_key: Uuid,
    pub outbound_tx: mpsc::Sender<Value>,
    pub subscriptions: HashMap<Uuid, agentbridge_core::broadcaster::SubscriberId>,
}

impl InboundContext {
    pub fn new(session_key: Uuid, outbound_tx: mpsc::Sender<Value>) -> Self {
        InboundContext { session_key, outbound_tx, subscriptions: HashMap::new() }
    }
}

/// The wire envelope every inbound frame deserializes to: `{ type,
/// project_id?, data? }`, matching the external interface exactly (no
/// internally-tagged enum, since `project_id` sits alongside `data` rather
/// than inside it).
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    pub r#type: String,
    pub project_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

fn parse_project_id(raw: Option<&str>) -> Result<Uuid, ApiError> {
    let raw = raw.ok_or_else(|| ApiError::Validation("missing project_id".to_string()))?;
    Uuid::parse_str(raw).map_err(|_| ApiError::Validation(format!("invalid project_id: {raw}")))
}

#[derive(Deserialize)]
struct ProjectCreateData {
    path: PathBuf,
}

#[derive(Deserialize, Default)]
struct ExecuteData {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    permission_mode: Option<String>,
    #[serde(default)]
    allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    disallowed_tools: Option<Vec<String>>,
    #[serde(default)]
    append_system_prompt: Option<String>,
}

#[derive(Deserialize, Default)]
struct GetMessagesData {
    since: Option<chrono::DateTime<chrono::Utc>>,
}

/// Dispatches one inbound message. Returns `Some(frame)` for a synchronous
/// response to write back on this connection, or `None` when the effect is
/// asynchronous (results arrive via broadcast).
pub async fn dispatch(
    state: &AppState,
    ctx: &mut InboundContext,
    envelope: InboundEnvelope,
) -> Result<Option<Value>, ApiError> {
    match envelope.r#type.as_str() {
        "project_create" => {
            if state.registry.len().await >= state.config.max_projects {
                return Err(ApiError::ResourceLimit(format!(
                    "global project limit of {} reached",
                    state.config.max_projects
                )));
            }
            let data: ProjectCreateData = serde_json::from_value(envelope.data)
                .map_err(|e| ApiError::Validation(format!("invalid project_create payload: {e}")))?;
            let view = state.registry.create(&data.path).await?;
            Ok(Some(json!({ "type": "project_state", "project_id": view.id, "data": view })))
        }

        "project_list" => {
            let projects = state.registry.list().await;
            Ok(Some(json!({ "type": "project_list", "data": { "projects": projects } })))
        }

        "project_delete" => {
            let id = parse_project_id(envelope.project_id.as_deref())?;
            state.registry.delete(id).await?;
            ctx.subscriptions.remove(&id);
            Ok(Some(json!({ "type": "project_deleted", "project_id": id.to_string() })))
        }

        "project_join" => {
            let id = parse_project_id(envelope.project_id.as_deref())?;
            let project = state.registry.get(id).await?;
            let (sub_id, _dropped) = project.broadcaster.subscribe(ctx.outbound_tx.clone()).await;
            ctx.subscriptions.insert(id, sub_id);
            let view = project.view().await;
            Ok(Some(json!({
                "type": "project_joined",
                "project_id": id.to_string(),
                "data": view,
            })))
        }

        "project_leave" => {
            let id = parse_project_id(envelope.project_id.as_deref())?;
            if let Some(sub_id) = ctx.subscriptions.remove(&id) {
                if let Ok(project) = state.registry.get(id).await {
                    project.broadcaster.unsubscribe(sub_id).await;
                }
            }
            Ok(Some(json!({ "type": "project_left", "project_id": id.to_string() })))
        }

        "execute" => {
            let id = parse_project_id(envelope.project_id.as_deref())?;
            let project = state.registry.get(id).await?;
            let data: ExecuteData = serde_json::from_value(envelope.data)
                .map_err(|e| ApiError::Validation(format!("invalid execute payload: {e}")))?;
            let options = ExecutionOptions {
                model: data.model,
                permission_mode: data.permission_mode,
                allowed_tools: data.allowed_tools.or_else(|| state.config.claude_allowed_tool_list()),
                disallowed_tools: data.disallowed_tools,
                append_system_prompt: data.append_system_prompt,
            };
            state.execution.clone().execute(state.registry.clone(), project, data.prompt, options).await?;
            Ok(None)
        }

        "agent_new_session" => {
            let id = parse_project_id(envelope.project_id.as_deref())?;
            let project = state.registry.get(id).await?;
            project.clear_session_id().await;
            state.registry.persist().await?;
            Ok(Some(json!({ "type": "session_reset", "project_id": id.to_string() })))
        }

        "agent_kill" => {
            let id = parse_project_id(envelope.project_id.as_deref())?;
            // Validate the project exists before treating the kill as a
            // (possible) no-op, so an unknown id still errors.
            state.registry.get(id).await?;
            state.execution.cancel(id).await;
            Ok(Some(json!({ "type": "execution_killed", "project_id": id.to_string() })))
        }

        "get_messages" => {
            let id = parse_project_id(envelope.project_id.as_deref())?;
            let project = state.registry.get(id).await?;
            let data: GetMessagesData = serde_json::from_value(envelope.data).unwrap_or_default();
            let since = data.since.unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::MIN_UTC);
            let entries = project.log.read_since(since).await?;
            Ok(Some(json!({
                "type": "message_history",
                "project_id": id.to_string(),
                "data": { "messages": entries },
            })))
        }

        other => Err(ApiError::Validation(format!("unknown message type: {other}"))),
    }
}

/// Removes every subscription this connection held, called once on
/// disconnect for any reason. The Execution Manager is intentionally not
/// touched here — executions are owned by projects, not sessions.
pub async fn cleanup(state: &AppState, ctx: &InboundContext) {
    for (project_id, sub_id) in &ctx.subscriptions {
        if let Ok(project) = state.registry.get(*project_id).await {
            project.broadcaster.unsubscribe(*sub_id).await;
        }
    }
}
