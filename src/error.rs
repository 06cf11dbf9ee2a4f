//! Error taxonomy shared by the catalog, policy engine, executor and listeners

use std::time::Duration;
use thiserror::Error;

/// Every way a request or the agent itself can fail.
///
/// `ExecutionFailed` and `ExecutionTimeout` are never returned from
/// [`crate::command::CommandService::execute`]; a failing command is an
/// [`crate::command::ExecutionResult`] with `success == false`. The variants
/// exist so the result's error text is classified the same way everywhere.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command '{id}' is not available on platform '{platform}'")]
    CommandUnavailableOnPlatform { id: String, platform: String },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid or missing PIN")]
    InvalidOrMissingPin,

    #[error("rate limit exceeded, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("execution timed out after {}ms", .0.as_millis())]
    ExecutionTimeout(Duration),

    #[error("command exited with status {0}")]
    ExecutionFailed(i32),

    #[error("instruction rejected by safety filter: matched '{0}'")]
    InstructionRejected(String),

    #[error("invalid instruction: {0}")]
    InvalidInstruction(String),

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("catalog reload failed: {0}")]
    CatalogReloadFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{listener} listener failed: {reason}")]
    ListenerStartFailed {
        listener: &'static str,
        reason: String,
    },

    #[error("no listeners enabled")]
    NoListenersEnabled,

    #[error("shutdown did not complete within {}s", .0.as_secs())]
    ShutdownTimeout(Duration),
}

impl AgentError {
    /// Stable machine-readable code used in HTTP bodies and MQTT error replies
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::CommandNotFound(_) => "command_not_found",
            AgentError::CommandUnavailableOnPlatform { .. } => "command_unavailable_on_platform",
            AgentError::AccessDenied(_) => "access_denied",
            AgentError::InvalidOrMissingPin => "invalid_or_missing_pin",
            AgentError::RateLimited { .. } => "rate_limited",
            AgentError::ExecutionTimeout(_) => "execution_timeout",
            AgentError::ExecutionFailed(_) => "execution_failed",
            AgentError::InstructionRejected(_) => "instruction_rejected",
            AgentError::InvalidInstruction(_) => "invalid_instruction",
            AgentError::SpawnFailed(_) => "spawn_failed",
            AgentError::CatalogReloadFailed(_) => "catalog_reload_failed",
            AgentError::InvalidRequest(_) => "invalid_request",
            AgentError::ListenerStartFailed { .. } => "listener_start_failed",
            AgentError::NoListenersEnabled => "no_listeners_enabled",
            AgentError::ShutdownTimeout(_) => "shutdown_timeout",
        }
    }

    /// True for failures rejected by policy or lookup before anything ran
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AgentError::CommandNotFound(_)
                | AgentError::CommandUnavailableOnPlatform { .. }
                | AgentError::AccessDenied(_)
                | AgentError::InvalidOrMissingPin
                | AgentError::RateLimited { .. }
                | AgentError::InstructionRejected(_)
                | AgentError::InvalidRequest(_)
        )
    }
}
