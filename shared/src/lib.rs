//! deskctl shared wire contracts
//!
//! This crate provides the types every listener of the agent agrees on:
//! the gRPC service definition, the MQTT payload codec and the lifecycle
//! state machines for listeners and the agent itself.

pub mod codec;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Include the generated protobuf and gRPC service types
pub mod proto {
    tonic::include_proto!("deskctl.v1");
}

pub use proto::command_agent_server::{CommandAgent, CommandAgentServer};
pub use proto::{
    CommandInfo, ExecuteCommandRequest, ExecuteCommandResponse, ListCommandsRequest,
    ListCommandsResponse,
};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default limits for the agent
pub mod limits {
    /// Execution deadline for commands that do not set their own timeout
    pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

    /// Upper bound on graceful shutdown before the operator is told it timed out
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

    /// Rate limit window length
    pub const RATE_LIMIT_WINDOW_MS: u64 = 60_000;

    /// Requests allowed per client within one window
    pub const RATE_LIMIT_MAX_REQUESTS: u32 = 30;

    /// Interval of the idle client sweep
    pub const RATE_LIMIT_CLEANUP_INTERVAL_MS: u64 = 60_000;

    /// Largest MQTT payload accepted or produced (256 KB)
    pub const MAX_MQTT_PAYLOAD: usize = 256 * 1024;
}

/// Platform identifiers used as keys in command platform tables
pub mod platform {
    pub const WINDOWS: &str = "windows";
    pub const LINUX: &str = "linux";
    pub const DARWIN: &str = "darwin";

    /// Platform key of the running host.
    ///
    /// Rust reports macOS as `macos`; command tables use `darwin`.
    pub fn current() -> &'static str {
        match std::env::consts::OS {
            "macos" => DARWIN,
            other => other,
        }
    }
}

impl ExecuteCommandRequest {
    /// Look up a recognised argument, ignoring empty values
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
