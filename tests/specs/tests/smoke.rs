// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `agentbridge-server` binary
//! and drive it over its WebSocket wire protocol.

use std::time::Duration;

use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn create_list_delete_roundtrip() -> anyhow::Result<()> {
    let server = agentbridge_specs::ServerProcess::start(None)?;
    server.wait_ready(TIMEOUT).await?;
    let mut client = server.connect().await?;

    let project_dir = tempfile::tempdir()?;
    let created = client.request(agentbridge_specs::project_create(project_dir.path()), TIMEOUT).await?;
    assert_eq!(created["type"], "project_state");
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let listed = client.request(json!({ "type": "project_list" }), TIMEOUT).await?;
    let projects = listed["data"]["projects"].as_array().unwrap();
    assert!(projects.iter().any(|p| p["id"] == id));

    let deleted =
        client.request(json!({ "type": "project_delete", "project_id": id }), TIMEOUT).await?;
    assert_eq!(deleted["type"], "project_deleted");

    let listed = client.request(json!({ "type": "project_list" }), TIMEOUT).await?;
    assert!(listed["data"]["projects"].as_array().unwrap().is_empty());

    let second_delete =
        client.request(json!({ "type": "project_delete", "project_id": id }), TIMEOUT).await?;
    assert_eq!(second_delete["type"], "error");
    assert_eq!(second_delete["data"]["code"], "PROJECT_NOT_FOUND");

    Ok(())
}

#[tokio::test]
async fn nested_project_path_is_rejected() -> anyhow::Result<()> {
    let server = agentbridge_specs::ServerProcess::start(None)?;
    server.wait_ready(TIMEOUT).await?;
    let mut client = server.connect().await?;

    let parent = tempfile::tempdir()?;
    let child = parent.path().join("child");
    std::fs::create_dir(&child)?;

    let created = client.request(agentbridge_specs::project_create(parent.path()), TIMEOUT).await?;
    assert_eq!(created["type"], "project_state");

    let rejected = client.request(agentbridge_specs::project_create(&child), TIMEOUT).await?;
    assert_eq!(rejected["type"], "error");
    assert_eq!(rejected["data"]["code"], "PROJECT_NESTING");

    Ok(())
}

#[tokio::test]
async fn unknown_message_type_yields_validation_error() -> anyhow::Result<()> {
    let server = agentbridge_specs::ServerProcess::start(None)?;
    server.wait_ready(TIMEOUT).await?;
    let mut client = server.connect().await?;

    let reply = client.request(json!({ "type": "not_a_real_message" }), TIMEOUT).await?;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["code"], "VALIDATION_FAILED");

    Ok(())
}

#[tokio::test]
async fn execute_streams_prompt_then_agent_output_then_completes() -> anyhow::Result<()> {
    let scripts_dir = tempfile::tempdir()?;
    let agent = agentbridge_specs::write_fake_agent(
        scripts_dir.path(),
        r#"
cat <<'EOF'
{"type":"system","subtype":"init","session_id":"sess-smoke"}
{"type":"assistant","text":"hi there"}
EOF
exit 0
"#,
    );

    let server = agentbridge_specs::ServerProcess::start(Some(&agent))?;
    server.wait_ready(TIMEOUT).await?;
    let mut client = server.connect().await?;

    let project_dir = tempfile::tempdir()?;
    let created = client.request(agentbridge_specs::project_create(project_dir.path()), TIMEOUT).await?;
    let id = created["data"]["id"].as_str().unwrap().to_string();

    client
        .request(json!({ "type": "project_join", "project_id": id }), TIMEOUT)
        .await?;

    client
        .send(json!({ "type": "execute", "project_id": id, "data": { "prompt": "Hi" } }))
        .await?;

    // The client-direction prompt entry must arrive before any agent output.
    let first = client.recv(TIMEOUT).await?;
    assert_eq!(first["type"], "message");
    assert_eq!(first["data"]["direction"], "client");
    assert_eq!(first["data"]["message"]["prompt"], "Hi");

    let mut saw_completion = false;
    for _ in 0..10 {
        let msg = client.recv(TIMEOUT).await?;
        if msg["type"] == "message" && msg["data"]["message"]["type"] == "execution_complete" {
            saw_completion = true;
            break;
        }
    }
    assert!(saw_completion, "never observed an execution_complete envelope");

    let history = client.request(json!({ "type": "get_messages", "project_id": id }), TIMEOUT).await?;
    let messages = history["data"]["messages"].as_array().unwrap();
    assert!(messages.iter().any(|m| m["direction"] == "client"));
    assert!(messages.iter().any(|m| m["direction"] == "agent"));

    Ok(())
}

#[tokio::test]
async fn double_execute_is_rejected_with_process_active() -> anyhow::Result<()> {
    let scripts_dir = tempfile::tempdir()?;
    let agent = agentbridge_specs::write_fake_agent(scripts_dir.path(), "sleep 5\nexit 0\n");

    let server = agentbridge_specs::ServerProcess::start(Some(&agent))?;
    server.wait_ready(TIMEOUT).await?;
    let mut client = server.connect().await?;

    let project_dir = tempfile::tempdir()?;
    let created = client.request(agentbridge_specs::project_create(project_dir.path()), TIMEOUT).await?;
    let id = created["data"]["id"].as_str().unwrap().to_string();
    client.request(json!({ "type": "project_join", "project_id": id }), TIMEOUT).await?;

    client.send(json!({ "type": "execute", "project_id": id, "data": { "prompt": "first" } })).await?;
    // Drain the prompt echo before trying a second execute, so we know the
    // first one is already past its precondition check.
    let _ = client.recv(TIMEOUT).await?;

    let second = client.request(
        json!({ "type": "execute", "project_id": id, "data": { "prompt": "second" } }),
        TIMEOUT,
    ).await?;
    assert_eq!(second["type"], "error");
    assert_eq!(second["data"]["code"], "PROCESS_ACTIVE");

    client.send(json!({ "type": "agent_kill", "project_id": id })).await?;

    Ok(())
}
