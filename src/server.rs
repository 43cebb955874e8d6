//! HTTP server for the SSH broker
//!
//! Thin adapter mapping the JSON API onto registry operations:
//! - `/session/*` - session lifecycle, exec, and interactive shell
//! - `/ssh-key-setup` - one-shot password→key upgrade for a host
//! - `/security/*` - audit log tail and block statistics
//!
//! Policy blocks surface as HTTP 403 with a structured reason; unknown
//! session ids as 404. Remote non-zero exit is not an HTTP error.

use crate::audit::SecurityAudit;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::keysetup;
use crate::registry::SessionRegistry;
use axum::{
    extract::{Json, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

/// Server state shared across handlers
#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<SessionRegistry>,
    pub config: BrokerConfig,
    pub start_time: Instant,
}

fn default_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_event_limit() -> usize {
    50
}

/// Session creation request
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_true")]
    pub use_master_key: bool,
    /// Per-session idle threshold; the configured default applies when unset.
    #[serde(default)]
    pub idle_timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub host: String,
    pub username: String,
    pub success: bool,
    pub message: String,
}

/// One-shot command execution request
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub session_id: String,
    pub success: bool,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: i32,
    pub error: Option<String>,
    pub command: String,
}

/// Interactive shell command request
#[derive(Debug, Deserialize)]
pub struct ShellCommandRequest {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct KeySetupRequest {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct KeySetupResponse {
    pub success: bool,
    pub message: String,
    pub host: String,
    pub username: String,
    pub key_installed: bool,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_event_limit")]
    pub limit: usize,
}

/// 403 body for a policy refusal.
fn blocked_response(reason: String, command: String, session_id: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "message": "command blocked by security policy",
            "reason": reason,
            "command": command,
            "session_id": session_id,
            "blocked": true,
        })),
    )
        .into_response()
}

fn not_found(detail: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": detail }))).into_response()
}

fn internal_error(err: &BrokerError) -> Response {
    error!("internal error: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": "internal server error" })),
    )
        .into_response()
}

/// GET / - service status
async fn root_status(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({
        "service": "SSH Broker",
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "key_exists": state.config.ssh_key_path.exists(),
        "active_sessions": state.registry.active_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// POST /session/create
async fn create_session(
    State(state): State<ServerState>,
    Json(request): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let result = state
        .registry
        .open(
            request.host.clone(),
            request.port,
            request.username.clone(),
            request.timeout,
            request.use_master_key,
            request.idle_timeout,
        )
        .await;

    match result {
        Ok(session_id) => Json(CreateSessionResponse {
            session_id,
            host: request.host,
            username: request.username,
            success: true,
            message: "session created".to_string(),
        }),
        Err(e) => {
            warn!(host = %request.host, "session creation failed: {e}");
            Json(CreateSessionResponse {
                session_id: String::new(),
                host: request.host,
                username: request.username,
                success: false,
                message: format!("session creation failed: {e}"),
            })
        }
    }
}

/// DELETE /session_delete/{id}
async fn delete_session(
    State(state): State<ServerState>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    if state.registry.close(&session_id).await {
        Json(json!({ "message": format!("session {session_id} closed") })).into_response()
    } else {
        not_found("session not found")
    }
}

/// GET /session/{id}
async fn session_info(
    State(state): State<ServerState>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    match state.registry.info(&session_id) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(_) => not_found("session not found"),
    }
}

/// GET /sessions
async fn list_sessions(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({ "sessions": state.registry.list() }))
}

/// POST /session/{id}/execute
async fn execute_in_session(
    State(state): State<ServerState>,
    AxumPath(session_id): AxumPath<String>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let result = state
        .registry
        .exec(&session_id, request.command.clone(), request.timeout)
        .await;

    match result {
        Ok(exec) => Json(ExecuteResponse {
            session_id,
            success: exec.success,
            stdout: exec.stdout,
            stderr: exec.stderr,
            exit_code: exec.exit_code,
            error: exec.error,
            command: request.command,
        })
        .into_response(),
        Err(BrokerError::SecurityBlocked { reason, command }) => {
            blocked_response(reason, command, &session_id)
        }
        Err(BrokerError::SessionNotFound) => not_found("session not found"),
        Err(BrokerError::SessionClosed) => not_found("session is closed"),
        Err(e @ BrokerError::Internal(_)) => internal_error(&e),
        Err(e) => Json(ExecuteResponse {
            session_id,
            success: false,
            stdout: None,
            stderr: None,
            exit_code: -1,
            error: Some(e.to_string()),
            command: request.command,
        })
        .into_response(),
    }
}

/// POST /session/{id}/shell/start
async fn shell_start(
    State(state): State<ServerState>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    match state.registry.shell_start(&session_id).await {
        Ok(shell) => {
            let id_prefix: String = session_id.chars().take(8).collect();
            Json(json!({
                "success": true,
                "output": shell.output,
                "prompt": shell.prompt,
                "message": format!("interactive shell started (session: {id_prefix}...)"),
                "has_colors": shell.has_colors,
            }))
            .into_response()
        }
        Err(BrokerError::SessionNotFound) => not_found("session not found"),
        Err(BrokerError::SessionClosed) => not_found("session is closed"),
        Err(e @ BrokerError::Internal(_)) => internal_error(&e),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })).into_response(),
    }
}

/// POST /session/{id}/shell/command
async fn shell_command(
    State(state): State<ServerState>,
    AxumPath(session_id): AxumPath<String>,
    Json(request): Json<ShellCommandRequest>,
) -> Response {
    let result = state
        .registry
        .shell_send(&session_id, request.command.clone())
        .await;

    match result {
        Ok(shell) => Json(json!({
            "session_id": session_id,
            "success": true,
            "output": shell.output,
            "prompt": shell.prompt,
            "error": null,
            "command": request.command,
            "has_colors": shell.has_colors,
        }))
        .into_response(),
        Err(BrokerError::SecurityBlocked { reason, command }) => {
            blocked_response(reason, command, &session_id)
        }
        Err(BrokerError::SessionNotFound) => not_found("session not found"),
        Err(BrokerError::SessionClosed) => not_found("session is closed"),
        Err(e @ BrokerError::Internal(_)) => internal_error(&e),
        Err(e) => Json(json!({
            "session_id": session_id,
            "success": false,
            "output": "",
            "prompt": null,
            "error": e.to_string(),
            "command": request.command,
        }))
        .into_response(),
    }
}

/// POST /session/{id}/shell/stop
async fn shell_stop(
    State(state): State<ServerState>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    match state.registry.shell_stop(&session_id).await {
        Ok(stopped) => {
            let message = if stopped {
                "interactive shell stopped"
            } else {
                "interactive shell stop failed"
            };
            Json(json!({ "success": stopped, "message": message })).into_response()
        }
        Err(BrokerError::SessionNotFound) => not_found("session not found"),
        Err(e) => internal_error(&e),
    }
}

/// The public half of the master key lives next to the private key with a
/// `.pub` suffix appended to the full file name.
fn public_key_path(private_key_path: &Path) -> PathBuf {
    let mut name = private_key_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".pub");
    private_key_path.with_file_name(name)
}

/// POST /ssh-key-setup
async fn ssh_key_setup(
    State(state): State<ServerState>,
    Json(request): Json<KeySetupRequest>,
) -> Response {
    let pub_key = public_key_path(&state.config.ssh_key_path);
    let timeout = state.config.connect_timeout_secs;

    let host = request.host.clone();
    let username = request.username.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        keysetup::install_key_blocking(
            &request.host,
            request.port,
            &request.username,
            &request.password,
            &pub_key,
            timeout,
        )
    })
    .await;

    match outcome {
        Ok(outcome) => Json(KeySetupResponse {
            success: outcome.success,
            message: outcome.message,
            host,
            username,
            key_installed: outcome.key_installed,
        })
        .into_response(),
        Err(e) => {
            error!("key setup task failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "internal server error" })),
            )
                .into_response()
        }
    }
}

/// GET /security/events?limit=N
async fn security_events(
    State(state): State<ServerState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let events = state.registry.audit().tail(query.limit);
    Json(json!({
        "total_events": events.len(),
        "events": events,
    }))
}

/// GET /security/stats
async fn security_stats(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = state.registry.audit().stats();
    Json(json!({
        "stats": {
            "total_blocks": stats.total_blocks,
            "today_blocks": stats.today_blocks,
            "log_file_exists": state.registry.audit().path().exists(),
            "last_updated": chrono::Local::now().to_rfc3339(),
        }
    }))
}

/// Build the broker's router around shared state.
pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(root_status))
        .route("/session/create", post(create_session))
        .route("/session_delete/:session_id", delete(delete_session))
        .route("/session/:session_id", get(session_info))
        .route("/sessions", get(list_sessions))
        .route("/session/:session_id/execute", post(execute_in_session))
        .route("/session/:session_id/shell/start", post(shell_start))
        .route("/session/:session_id/shell/command", post(shell_command))
        .route("/session/:session_id/shell/stop", post(shell_stop))
        .route("/ssh-key-setup", post(ssh_key_setup))
        .route("/security/events", get(security_events))
        .route("/security/stats", get(security_stats))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the broker until ctrl-c / SIGTERM, then close every session.
pub async fn run_server(config: BrokerConfig) -> anyhow::Result<()> {
    config.validate()?;
    config.normalize_key_permissions();

    let audit = Arc::new(SecurityAudit::new(config.audit_log_path.clone()));
    let registry = Arc::new(SessionRegistry::new(config.clone(), audit));
    let reaper = registry.clone().spawn_reaper();

    let state = ServerState {
        registry: registry.clone(),
        config: config.clone(),
        start_time: Instant::now(),
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("SSH broker listening on http://{addr}");
    info!("→ Session API: http://{addr}/session/create");
    info!("→ Security events: http://{addr}/security/events");
    info!("Press Ctrl+C to stop");

    let result = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    reaper.abort();
    registry.shutdown().await;
    info!("server shut down gracefully");

    result?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Initiating graceful shutdown...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SshSession;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn test_state() -> (tempfile::TempDir, ServerState) {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            ssh_key_path: dir.path().join("master_key"),
            audit_log_path: dir.path().join("security.log"),
            ..Default::default()
        };
        let audit = Arc::new(SecurityAudit::new(config.audit_log_path.clone()));
        let registry = Arc::new(SessionRegistry::new(config.clone(), audit));
        let state = ServerState {
            registry,
            config,
            start_time: Instant::now(),
        };
        (dir, state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_root_status() {
        let (_dir, state) = test_state();
        let app = build_router(state);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["service"], "SSH Broker");
        assert_eq!(body["active_sessions"], 0);
        assert_eq!(body["key_exists"], false);
    }

    #[tokio::test]
    async fn test_list_sessions_empty() {
        let (_dir, state) = test_state();
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["sessions"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_returns_404() {
        let (_dir, state) = test_state();

        let app = build_router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/session/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let app = build_router(state.clone());
        let response = app
            .oneshot(json_request(
                "POST",
                "/session/does-not-exist/execute",
                json!({ "command": "ls" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/session_delete/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_blocked_command_returns_403_and_is_audited() {
        let (_dir, state) = test_state();
        let session_id = state
            .registry
            .insert_for_tests(SshSession::detached_for_tests(3600));

        let app = build_router(state.clone());
        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/session/{session_id}/execute"),
                json!({ "command": "rm -rf /" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await;
        assert_eq!(body["blocked"], true);
        assert_eq!(body["command"], "rm -rf /");
        assert!(!body["reason"].as_str().unwrap().is_empty());

        // The block landed in the audit log.
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/security/events?limit=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total_events"], 1);
        let event = body["events"][0].as_str().unwrap();
        assert!(event.contains("BLOCKED"));
        assert!(event.contains("rm -rf /"));
    }

    #[tokio::test]
    async fn test_shell_command_blocked_returns_403() {
        let (_dir, state) = test_state();
        let session_id = state
            .registry
            .insert_for_tests(SshSession::detached_for_tests(3600));

        let app = build_router(state);
        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/session/{session_id}/shell/command"),
                json!({ "command": "dd if=/dev/zero of=/dev/sda" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await;
        assert_eq!(body["blocked"], true);
        assert_eq!(body["reason"], "full disk wipe risk");
    }

    #[tokio::test]
    async fn test_shell_command_without_attach_reports_error() {
        let (_dir, state) = test_state();
        let session_id = state
            .registry
            .insert_for_tests(SshSession::detached_for_tests(3600));

        let app = build_router(state);
        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/session/{session_id}/shell/command"),
                json!({ "command": "pwd" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("interactive shell not started"));
    }

    #[tokio::test]
    async fn test_security_stats_shape() {
        let (_dir, state) = test_state();
        state.registry.audit().record(
            "abcd1234",
            "rm -rf /etc",
            "system configuration removal risk",
            crate::audit::AuditAction::Blocked,
        );

        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/security/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["stats"]["total_blocks"], 1);
        assert_eq!(body["stats"]["today_blocks"], 1);
        assert_eq!(body["stats"]["log_file_exists"], true);
    }

    #[test]
    fn test_public_key_path_appends_pub() {
        let path = public_key_path(Path::new("/keys/master_key"));
        assert_eq!(path, PathBuf::from("/keys/master_key.pub"));

        let path = public_key_path(Path::new("id_ed25519"));
        assert_eq!(path, PathBuf::from("id_ed25519.pub"));
    }
}
