//! HTTP trigger compatible with the Azure Functions custom-handler contract.
//!
//! The Functions host forwards `/api/*` requests to the port given in
//! `FUNCTIONS_CUSTOMHANDLER_PORT`. One [`SyncClient`] is shared by every
//! request so the access token cache survives across invocations.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use insightly_sync_core::{SyncClient, SyncResult, TargetStatus};
use serde_json::json;
use tracing::{error, info};

pub const PORT_ENV: &str = "FUNCTIONS_CUSTOMHANDLER_PORT";
pub const DEFAULT_PORT: u16 = 7071;

/// Either a ready client or the reason one could not be built
#[derive(Clone)]
pub struct AppState {
    client: Result<Arc<SyncClient>, Arc<str>>,
}

impl AppState {
    pub fn ready(client: SyncClient) -> Self {
        Self {
            client: Ok(Arc::new(client)),
        }
    }

    /// Keep serving, but answer every trigger with the setup error
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            client: Err(Arc::from(reason.into())),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sync", get(sync_now).post(sync_now))
        .route("/api/sync/background", get(sync_background).post(sync_background))
        .with_state(state)
}

/// Port from the Functions host, falling back to the local default
pub fn port_from_env() -> u16 {
    std::env::var(PORT_ENV)
        .ok()
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP trigger listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn sync_now(State(state): State<AppState>) -> Response {
    let client = match state.client {
        Ok(client) => client,
        Err(reason) => return setup_failed(&reason),
    };

    let result = client.sync().await;
    if result.all_failed() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "error",
                "message": failure_message(&result),
            })),
        )
            .into_response();
    }

    let message = if result.is_success() {
        "Sync completed"
    } else {
        "Sync completed with errors"
    };
    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message": message,
            "result": result,
        })),
    )
        .into_response()
}

async fn sync_background(State(state): State<AppState>) -> Response {
    let client = match state.client {
        Ok(client) => client,
        Err(reason) => return setup_failed(&reason),
    };

    tokio::spawn(async move {
        let result = client.sync().await;
        if result.all_failed() {
            error!(message = %failure_message(&result), "Background sync failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "started",
            "message": "Sync started in the background",
        })),
    )
        .into_response()
}

fn setup_failed(reason: &str) -> Response {
    error!(reason, "Trigger rejected, client setup failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "status": "error",
            "message": format!("Setup failed: {}", reason),
        })),
    )
        .into_response()
}

fn failure_message(result: &SyncResult) -> String {
    let reason = |status: &TargetStatus| match status {
        TargetStatus::Failed { error } | TargetStatus::Succeeded { detail: error } => error.clone(),
    };
    format!(
        "Both targets failed. Insightly: {}. Graph: {}",
        reason(&result.insightly),
        reason(&result.graph)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use insightly_sync_core::{Config, CredentialSet, SyncSettings};
    use tower::ServiceExt;
    use wiremock::MockServer;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Client whose every endpoint answers 404
    fn failing_client(server: &MockServer, dir: &std::path::Path) -> SyncClient {
        let config = Config {
            credentials: CredentialSet {
                client_id: "client-1".to_string(),
                tenant_id: "tenant-1".to_string(),
                refresh_token: "refresh-1".to_string(),
                api_key: "key-123".to_string(),
                client_secret: None,
            },
            settings: SyncSettings {
                authority_host: server.uri(),
                graph_base_url: server.uri(),
                insightly_base_url: server.uri(),
                output_dir: Some(dir.to_path_buf()),
                ..SyncSettings::default()
            },
        };
        SyncClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(AppState::failed("unused"));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_setup_failure_is_500() {
        let app = router(AppState::failed("Missing required configuration: CLIENT_ID"));
        let response = app
            .oneshot(Request::post("/api/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("CLIENT_ID"));
    }

    #[tokio::test]
    async fn test_both_targets_failing_is_500() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let app = router(AppState::ready(failing_client(&server, dir.path())));

        let response = app
            .oneshot(Request::get("/api/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().starts_with("Both targets failed"));
    }

    #[tokio::test]
    async fn test_background_is_accepted() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let app = router(AppState::ready(failing_client(&server, dir.path())));

        let response = app
            .oneshot(Request::post("/api/sync/background").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["status"], "started");
    }
}
