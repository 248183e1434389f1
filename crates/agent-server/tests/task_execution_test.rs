//! End-to-end task execution: POST /tasks through a forked worker and back.

mod common;

use std::time::Duration;

use serde_json::{json, Value};

use common::{start_agent, AgentOptions};

fn event_names(entry: &Value) -> Vec<String> {
    entry["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["type"] == "event")
        .map(|m| m["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_nop_task_returns_result_and_history() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let response = agent.post_task("nop", json!({})).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"ok": true}));

    let history = agent.history().await;
    assert_eq!(history.len(), 1);
    let entry = &history[0];
    assert_eq!(entry["task"], "nop");
    assert_eq!(entry["status"], "finished");
    assert_eq!(entry["error_count"], 0);
    assert!(entry["finished_at"].is_string());
    assert!(entry["pid"].as_u64().unwrap() > 0);

    agent.stop().await;
}

#[tokio::test]
async fn test_failing_task_returns_error_payload_and_ordered_messages() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let response = agent
        .post_task("fail", json!({"error": {"code": "EBAD"}}))
        .await;
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"code": "EBAD"}));

    let history = agent.history().await;
    let entry = &history[0];
    assert_eq!(entry["status"], "failed");
    assert_eq!(entry["error_count"], 1);

    // Emission order survives the relay: progress before error before finish.
    let names = event_names(entry);
    assert_eq!(names, vec!["progress", "error", "finish"]);

    agent.stop().await;
}

#[tokio::test]
async fn test_echo_params_round_trip() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let params = json!({"alpha": [1, 2, 3], "nested": {"deep": true}});
    let response = agent.post_task("echo_params", params.clone()).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, params);

    agent.stop().await;
}

#[tokio::test]
async fn test_worker_timeout_kills_and_reports() {
    let agent = start_agent(AgentOptions {
        timeout_seconds: 1,
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let response = agent.post_task("sleep", json!({"seconds": 30})).await;
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(
        body["error"].as_str().unwrap().contains("timed out after 1s"),
        "unexpected error body: {body}"
    );

    let history = agent.history().await;
    assert_eq!(history[0]["status"], "failed");

    agent.stop().await;
}

#[tokio::test]
async fn test_history_keeps_only_most_recent_entries() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    for i in 0..20 {
        let response = agent.post_task("echo_params", json!({"n": i})).await;
        assert_eq!(response.status(), 200);
    }

    let history = agent.history().await;
    assert_eq!(history.len(), 16);
    assert_eq!(history.first().unwrap()["params"]["n"], 4);
    assert_eq!(history.last().unwrap()["params"]["n"], 19);

    agent.stop().await;
}

#[tokio::test]
async fn test_unknown_task_is_404_without_history() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let response = agent.post_task("definitely_not_registered", json!({})).await;
    assert_eq!(response.status(), 404);
    assert!(agent.history().await.is_empty());

    agent.stop().await;
}

#[tokio::test]
async fn test_malformed_submissions_are_400() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let response = agent
        .http
        .post(format!("{}/tasks", agent.url))
        .json(&json!({"params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = agent
        .http
        .post(format!("{}/tasks", agent.url))
        .json(&json!({"task": "nop"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    agent.stop().await;
}

#[tokio::test]
async fn test_unknown_server_uuid_is_404() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let response = agent
        .http
        .post(format!("{}/tasks", agent.url))
        .header("x-server-uuid", "99999999-9999-9999-9999-999999999999")
        .json(&json!({"task": "nop", "params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    agent.stop().await;
}

#[tokio::test]
async fn test_pause_rejects_and_resume_recovers() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let response = agent
        .http
        .post(format!("{}/pause", agent.url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = agent.post_task("nop", json!({})).await;
    assert_eq!(response.status(), 503);
    // No worker forked while draining.
    assert!(agent.history().await.is_empty());

    let response = agent
        .http
        .post(format!("{}/resume", agent.url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = agent.post_task("nop", json!({})).await;
    assert_eq!(response.status(), 200);

    agent.stop().await;
}

#[tokio::test]
async fn test_subtask_runs_nested_task_and_relays_result() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let response = agent
        .post_task("run_subtask", json!({"task": "nop"}))
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["subtask"], "nop");
    assert_eq!(body["result"]["ok"], true);

    // Both the compound task and its child left history entries.
    let history = agent.history().await;
    let tasks: Vec<&str> = history
        .iter()
        .map(|e| e["task"].as_str().unwrap())
        .collect();
    assert!(tasks.contains(&"run_subtask"));
    assert!(tasks.contains(&"nop"));

    agent.stop().await;
}

#[tokio::test]
async fn test_subtask_failure_fails_the_parent() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let response = agent
        .post_task(
            "run_subtask",
            json!({"task": "fail", "params": {"error": {"code": "ENESTED"}}}),
        )
        .await;
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(
        body["error"].as_str().unwrap().contains("failed"),
        "unexpected error body: {body}"
    );

    agent.stop().await;
}

#[tokio::test]
async fn test_backend_driven_tasks_see_the_simulated_server() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let response = agent.post_task("server_sysinfo", json!({})).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["UUID"], common::TEST_SERVER_UUID);

    let response = agent.post_task("machine_list", json!({})).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({}));

    agent.stop().await;
}

#[tokio::test]
async fn test_worker_log_file_written() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    // sleep logs one line through the worker log channel
    let response = agent.post_task("sleep", json!({"seconds": 0})).await;
    assert_eq!(response.status(), 200);

    let history = agent.history().await;
    let entry = &history[0];
    let log = entry["log"].as_array().unwrap();
    assert!(!log.is_empty());
    assert!(log[0]["message"].as_str().unwrap().contains("sleeping"));

    agent.stop().await;
}

#[tokio::test]
async fn test_long_strings_truncated_in_history() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let long = "z".repeat(5000);
    let response = agent.post_task("echo_params", json!({"blob": long})).await;
    assert_eq!(response.status(), 200);

    let history = agent.history().await;
    let entry = &history[0];
    // Params and the recorded finish event are both capped.
    assert_eq!(entry["params"]["blob"].as_str().unwrap().len(), 1000);
    let finish = entry["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["name"] == "finish")
        .unwrap();
    assert_eq!(finish["event"]["blob"].as_str().unwrap().len(), 1000);

    agent.stop().await;
}

#[tokio::test]
async fn test_sequential_dispatches_preserve_isolation() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let first = agent.post_task("echo_params", json!({"n": 1})).await;
    let second = agent.post_task("echo_params", json!({"n": 2})).await;
    assert_eq!(first.status(), 200);
    assert_eq!(second.status(), 200);
    let first: Value = first.json().await.unwrap();
    let second: Value = second.json().await.unwrap();
    assert_eq!(first["n"], 1);
    assert_eq!(second["n"], 2);

    let history = agent.history().await;
    let pids: Vec<u64> = history
        .iter()
        .map(|e| e["pid"].as_u64().unwrap())
        .collect();
    assert_ne!(pids[0], pids[1], "each task runs in its own process");

    agent.stop().await;
}

#[tokio::test]
async fn test_concurrent_dispatches_complete() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let url = agent.url.clone();
        let http = agent.http.clone();
        handles.push(tokio::spawn(async move {
            http.post(format!("{url}/tasks"))
                .json(&json!({"task": "sleep", "params": {"seconds": 0.2, "n": i}}))
                .send()
                .await
                .unwrap()
                .status()
                .as_u16()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 200);
    }

    agent.stop().await;
}

#[tokio::test]
async fn test_response_arrives_within_task_runtime_envelope() {
    let agent = start_agent(AgentOptions {
        update_helper: true,
        ..AgentOptions::default()
    })
    .await;

    let started = std::time::Instant::now();
    let response = agent.post_task("sleep", json!({"seconds": 0.3})).await;
    assert_eq!(response.status(), 200);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(300),
        "reply cannot precede the worker's finish"
    );
    assert!(
        elapsed < Duration::from_secs(20),
        "dispatch overhead out of bounds: {elapsed:?}"
    );

    agent.stop().await;
}
