//! gRPC listener for the `deskctl.v1.CommandAgent` service

use super::traits::{Listener, ListenerControl};
use crate::command::{CommandService, ExecuteRequest, ExecutionResult};
use crate::error::AgentError;
use crate::security::ClientIdentity;
use async_trait::async_trait;
use deskctl_shared::state_machine::ListenerState;
use deskctl_shared::{
    CommandAgent, CommandAgentServer, CommandInfo, ExecuteCommandRequest, ExecuteCommandResponse,
    ListCommandsRequest, ListCommandsResponse,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info};

pub const NAME: &str = "grpc";

/// Metadata key carrying the PIN; takes precedence over the `pin` argument
pub const PIN_METADATA: &str = "x-pin";

/// Map a service error onto a gRPC status
pub fn status_for(error: &AgentError) -> Status {
    let code = match error {
        AgentError::CommandNotFound(_) => Code::NotFound,
        AgentError::CommandUnavailableOnPlatform { .. } => Code::FailedPrecondition,
        AgentError::AccessDenied(_) | AgentError::InstructionRejected(_) => Code::PermissionDenied,
        AgentError::InvalidOrMissingPin => Code::Unauthenticated,
        AgentError::RateLimited { .. } => Code::ResourceExhausted,
        AgentError::InvalidRequest(_) => Code::InvalidArgument,
        _ => Code::Internal,
    };
    Status::new(code, error.to_string())
}

fn into_response(result: ExecutionResult) -> ExecuteCommandResponse {
    ExecuteCommandResponse {
        success: result.success,
        output: result.output,
        error: result.error,
        exit_code: result.exit_code,
        executed_at: result.executed_at,
        duration_ms: result.duration.as_millis() as u64,
    }
}

/// Translate a gRPC request into the canonical execute request
fn execute_request(request: &Request<ExecuteCommandRequest>) -> Result<ExecuteRequest, AgentError> {
    let message = request.get_ref();
    if message.command_id.is_empty() {
        return Err(AgentError::InvalidRequest("command_id must not be empty".into()));
    }

    let timeout = match message.arg("timeout") {
        Some(raw) => Some(Duration::from_millis(raw.parse::<u64>().map_err(|_| {
            AgentError::InvalidRequest(format!("invalid 'timeout' argument: {raw:?}"))
        })?)),
        None => None,
    };

    let metadata = request.metadata();
    let pin = metadata
        .get(PIN_METADATA)
        .and_then(|v| v.to_str().ok())
        .or_else(|| message.arg("pin"))
        .map(str::to_owned);

    let source = request
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let agent = metadata
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let client = ClientIdentity::derive(NAME, &source, agent);

    Ok(ExecuteRequest::new(message.command_id.clone(), client)
        .with_pin(pin)
        .with_timeout(timeout))
}

/// tonic service implementation over the command service
pub struct GrpcService {
    service: Arc<CommandService>,
}

impl GrpcService {
    pub fn new(service: Arc<CommandService>) -> Self {
        Self { service }
    }

    pub fn into_server(self) -> CommandAgentServer<Self> {
        CommandAgentServer::new(self)
    }
}

#[tonic::async_trait]
impl CommandAgent for GrpcService {
    async fn execute_command(
        &self,
        request: Request<ExecuteCommandRequest>,
    ) -> Result<Response<ExecuteCommandResponse>, Status> {
        let canonical = execute_request(&request).map_err(|e| status_for(&e))?;
        debug!(command = %canonical.command_id, client = %canonical.client, "gRPC execute");

        let result = self
            .service
            .execute(canonical)
            .await
            .map_err(|e| status_for(&e))?;
        Ok(Response::new(into_response(result)))
    }

    async fn list_commands(
        &self,
        _request: Request<ListCommandsRequest>,
    ) -> Result<Response<ListCommandsResponse>, Status> {
        let commands = self
            .service
            .list()
            .await
            .into_iter()
            .map(|c| CommandInfo {
                id: c.id,
                name: c.name,
                description: c.description,
            })
            .collect();
        Ok(Response::new(ListCommandsResponse { commands }))
    }
}

/// gRPC front-end of the command service
pub struct GrpcListener {
    addr: String,
    service: Arc<CommandService>,
    control: ListenerControl,
}

impl GrpcListener {
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

        let incoming = TcpIncoming::new(addr, true, None)
            .map_err(|e| self.control.failure(format!("failed to bind {addr}: {e}")))?;

        self.control.bound();
        info!(addr = %addr, "gRPC listener running");

        Server::builder()
            .add_service(GrpcService::new(self.service.clone()).into_server())
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = stop_rx.wait_for(|&stop| stop).await;
            })
            .await
            .map_err(|e| self.control.failure(format!("gRPC server error: {e}")))?;

        info!("gRPC listener drained");
        Ok(())
    }
}

#[async_trait]
impl Listener for GrpcListener {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::catalog_tests::SAMPLE;
    use crate::command::test_support::{open_policy, service_with};
    use std::collections::HashMap;

    fn grpc() -> GrpcService {
        GrpcService::new(service_with(SAMPLE, "linux", open_policy()))
    }

    fn request(command_id: &str, args: &[(&str, &str)]) -> Request<ExecuteCommandRequest> {
        Request::new(ExecuteCommandRequest {
            command_id: command_id.to_string(),
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        })
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AgentError::CommandNotFound("x".into()), Code::NotFound),
            (
                AgentError::CommandUnavailableOnPlatform {
                    id: "x".into(),
                    platform: "linux".into(),
                },
                Code::FailedPrecondition,
            ),
            (AgentError::AccessDenied("no".into()), Code::PermissionDenied),
            (AgentError::InvalidOrMissingPin, Code::Unauthenticated),
            (
                AgentError::RateLimited {
                    retry_after: Duration::from_secs(1),
                },
                Code::ResourceExhausted,
            ),
            (AgentError::SpawnFailed("boom".into()), Code::Internal),
            (AgentError::CatalogReloadFailed("bad".into()), Code::Internal),
            (AgentError::InvalidRequest("bad".into()), Code::InvalidArgument),
        ];
        for (error, code) in cases {
            let status = status_for(&error);
            assert_eq!(status.code(), code, "{error}");
            assert_eq!(status.message(), error.to_string());
        }
    }

    #[test]
    fn test_request_mapping() {
        let mut req = request("sequence", &[("pin", "1111"), ("timeout", "250")]);
        let canonical = execute_request(&req).unwrap();
        assert_eq!(canonical.command_id, "sequence");
        assert_eq!(canonical.pin.as_deref(), Some("1111"));
        assert_eq!(canonical.timeout_override, Some(Duration::from_millis(250)));
        assert!(!canonical.admin);

        // Metadata wins over the argument
        req.metadata_mut().insert(PIN_METADATA, "2222".parse().unwrap());
        assert_eq!(execute_request(&req).unwrap().pin.as_deref(), Some("2222"));

        assert!(matches!(
            execute_request(&request("", &[])),
            Err(AgentError::InvalidRequest(_))
        ));
        assert!(matches!(
            execute_request(&request("echo", &[("timeout", "later")])),
            Err(AgentError::InvalidRequest(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_command() {
        let response = grpc()
            .execute_command(request("echo", &[]))
            .await
            .unwrap()
            .into_inner();
        assert!(response.success);
        assert_eq!(response.output, "hello");
        assert_eq!(response.exit_code, 0);
        assert!(response.executed_at > 0);
    }

    #[tokio::test]
    async fn test_execute_command_rejections() {
        let status = grpc().execute_command(request("nope", &[])).await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let status = grpc().execute_command(request("sequence", &[])).await.unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);

        let status = grpc().execute_command(request("lock", &[])).await.unwrap_err();
        assert_eq!(status.code(), Code::PermissionDenied);

        let status = grpc().execute_command(request("mute", &[])).await.unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_list_commands() {
        let response = grpc()
            .list_commands(Request::new(ListCommandsRequest {}))
            .await
            .unwrap()
            .into_inner();
        let ids: Vec<_> = response.commands.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["mute", "echo", "sequence", "lock"]);
        assert_eq!(response.commands[0].name, "Mute");
    }

    #[tokio::test]
    async fn test_listener_start_and_stop() {
        let service = service_with(SAMPLE, "linux", open_policy());
        let listener = Arc::new(GrpcListener::new("127.0.0.1:0", service));

        let task = tokio::spawn({
            let listener = listener.clone();
            async move { listener.start().await }
        });

        for _ in 0..100 {
            if listener.state() == ListenerState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(listener.state(), ListenerState::Running);

        listener.stop().await;
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(listener.state(), ListenerState::Stopped);
    }
}
