//! Integration tests for the HTTP façade
//!
//! Drives the router directly with `tower::ServiceExt::oneshot`; no network
//! listener and no real SSH transport are involved.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower::util::ServiceExt;

use sshbroker::audit::{AuditAction, SecurityAudit};
use sshbroker::config::BrokerConfig;
use sshbroker::registry::SessionRegistry;
use sshbroker::server::{build_router, ServerState};

fn make_state(dir: &tempfile::TempDir) -> ServerState {
    let config = BrokerConfig {
        ssh_key_path: dir.path().join("master_key"),
        audit_log_path: dir.path().join("security.log"),
        ..Default::default()
    };
    let audit = Arc::new(SecurityAudit::new(config.audit_log_path.clone()));
    let registry = Arc::new(SessionRegistry::new(config.clone(), audit));
    ServerState {
        registry,
        config,
        start_time: Instant::now(),
    }
}

async fn get_json(state: ServerState, uri: &str) -> (StatusCode, Value) {
    let response = build_router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn root_reports_service_status() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = get_json(make_state(&dir), "/").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "SSH Broker");
    assert_eq!(body["status"], "running");
    assert_eq!(body["key_exists"], false);
    assert_eq!(body["active_sessions"], 0);
}

#[tokio::test]
async fn sessions_listing_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = get_json(make_state(&dir), "/sessions").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"], json!([]));
}

#[tokio::test]
async fn unknown_session_paths_return_404() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir);

    let (status, body) = get_json(state.clone(), "/session/no-such-id").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "session not found");

    let response = build_router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/session/no-such-id/shell/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = build_router(state)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/session_delete/no-such-id")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn security_events_tail_is_newest_first_and_limited() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir);

    for i in 0..4 {
        state.registry.audit().record(
            "ffffeeee-0000",
            &format!("rm -rf /etc/conf{i}"),
            "system configuration removal risk",
            AuditAction::Blocked,
        );
    }

    let (status, body) = get_json(state, "/security/events?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_events"], 2);

    let events = body["events"].as_array().unwrap();
    assert!(events[0].as_str().unwrap().contains("conf3"));
    assert!(events[1].as_str().unwrap().contains("conf2"));
}

#[tokio::test]
async fn security_stats_count_blocked_lines() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir);

    state.registry.audit().record(
        "aaaa",
        "dd if=/dev/zero of=/dev/sda",
        "full disk wipe risk",
        AuditAction::Blocked,
    );
    state
        .registry
        .audit()
        .record("aaaa", "ls -la", "", AuditAction::Allowed);

    let (status, body) = get_json(state, "/security/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stats"]["total_blocks"], 1);
    assert_eq!(body["stats"]["today_blocks"], 1);
    assert_eq!(body["stats"]["log_file_exists"], true);
}

#[tokio::test]
async fn session_create_failure_is_reported_not_hidden() {
    let dir = tempfile::tempdir().unwrap();

    // An unresolvable host fails fast; the response carries the failure
    // instead of a fabricated session id.
    let body = json!({
        "host": "ssh.invalid",
        "port": 2222,
        "username": "root",
        "timeout": 1
    });
    let response = build_router(make_state(&dir))
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/session/create")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["session_id"], "");
    assert!(body["message"].as_str().unwrap().contains("failed"));
}
