//! HTTP listener
//!
//! Uses axum to expose the command service as a small REST surface:
//! a legacy `/execute` path plus the versioned `/api/v1` set. Every
//! execute path goes through the full policy chain.

use super::traits::{Listener, ListenerControl};
use crate::command::{CommandService, ExecuteRequest};
use crate::error::AgentError;
use crate::security::ClientIdentity;
use async_trait::async_trait;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, Extensions, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use deskctl_shared::state_machine::ListenerState;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub const NAME: &str = "http";

/// Header carrying the PIN; takes precedence over the `pin` query parameter
pub const PIN_HEADER: &str = "x-pin";

/// HTTP front-end of the command service
pub struct HttpListener {
    addr: String,
    service: Arc<CommandService>,
    control: ListenerControl,
}

impl HttpListener {
    pub fn new(addr: impl Into<String>, service: Arc<CommandService>) -> Self {
        let control = ListenerControl::new(NAME, service.listeners().clone());
        Self {
            addr: addr.into(),
            service,
            control,
        }
    }

    async fn serve(&self, mut stop_rx: watch::Receiver<bool>) -> Result<(), AgentError> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .map_err(|e| self.control.failure(format!("invalid listen address {:?}: {e}", self.addr)))?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| self.control.failure(format!("failed to bind {addr}: {e}")))?;

        self.control.bound();
        info!(addr = %addr, "HTTP listener running");

        axum::serve(
            listener,
            router(self.service.clone()).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.wait_for(|&stop| stop).await;
        })
        .await
        .map_err(|e| self.control.failure(format!("HTTP server error: {e}")))?;

        info!("HTTP listener drained");
        Ok(())
    }
}

#[async_trait]
impl Listener for HttpListener {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> ListenerState {
        self.control.state()
    }

    async fn start(&self) -> Result<(), AgentError> {
        let stop_rx = self.control.begin()?;
        let result = self.serve(stop_rx).await;
        self.control.finish(result)
    }

    async fn stop(&self) {
        self.control.request_stop();
    }
}

/// Build the router over a command service
pub fn router(service: Arc<CommandService>) -> Router {
    Router::new()
        .route("/execute", get(execute_handler))
        .route("/api/v1/execute", get(execute_handler))
        .route("/api/v1/commands", get(commands_handler))
        .route("/api/v1/reload", post(reload_handler))
        .route("/api/v1/health", get(health_handler))
        .with_state(service)
}

/// Policy or fault mapped onto a status code and a JSON body
struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        Self(e)
    }
}

fn status_for(error: &AgentError) -> StatusCode {
    match error {
        AgentError::CommandNotFound(_) => StatusCode::NOT_FOUND,
        AgentError::CommandUnavailableOnPlatform { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AgentError::AccessDenied(_) | AgentError::InstructionRejected(_) => StatusCode::FORBIDDEN,
        AgentError::InvalidOrMissingPin => StatusCode::UNAUTHORIZED,
        AgentError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        AgentError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = Json(json!({
            "success": false,
            "error": self.0.to_string(),
            "code": self.0.code(),
        }));

        let mut response = (status, body).into_response();
        if let AgentError::RateLimited { retry_after } = &self.0 {
            // Whole seconds, rounded up so clients never retry early
            let secs = retry_after.as_millis().div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn client_identity(headers: &HeaderMap, extensions: &Extensions) -> ClientIdentity {
    let source = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    ClientIdentity::derive(NAME, &source, agent)
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteParams {
    id: Option<String>,
    timeout: Option<String>,
    pin: Option<String>,
}

async fn execute_handler(
    State(service): State<Arc<CommandService>>,
    headers: HeaderMap,
    extensions: Extensions,
    Query(params): Query<ExecuteParams>,
) -> Result<Response, ApiError> {
    let command_id = params
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AgentError::InvalidRequest("missing 'id' parameter".into()))?;

    let timeout = match params.timeout.as_deref().filter(|t| !t.is_empty()) {
        Some(raw) => Some(Duration::from_millis(raw.parse::<u64>().map_err(|_| {
            AgentError::InvalidRequest(format!("invalid 'timeout' parameter: {raw:?}"))
        })?)),
        None => None,
    };

    let pin = headers
        .get(PIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or(params.pin);

    let client = client_identity(&headers, &extensions);
    debug!(command = %command_id, client = %client, "HTTP execute");

    let request = ExecuteRequest::new(command_id, client)
        .with_pin(pin)
        .with_timeout(timeout);

    let result = service.execute(request).await?;
    Ok((StatusCode::OK, Json(result)).into_response())
}

async fn commands_handler(State(service): State<Arc<CommandService>>) -> impl IntoResponse {
    Json(json!({ "commands": service.list().await }))
}

async fn reload_handler(
    State(service): State<Arc<CommandService>>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Response, ApiError> {
    let client = client_identity(&headers, &extensions);
    service.policy().check_rate_limit(&client).await?;

    let commands = service.reload().await?;
    Ok(Json(json!({ "success": true, "commands": commands })).into_response())
}

async fn health_handler(State(service): State<Arc<CommandService>>) -> impl IntoResponse {
    Json(service.health().await)
}
