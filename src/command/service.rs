//! Command service - the one facade every listener talks to
//!
//! Runs a request through rate limiting, catalog lookup, access policy and
//! platform resolution before handing the instruction to the executor.

use super::catalog::{Catalog, CommandDefinition, HomepageLayout};
use super::executor::{CommandExecutor, ExecutionResult};
use crate::error::AgentError;
use crate::security::{ClientIdentity, SecurityPolicy};
use deskctl_shared::platform;
use deskctl_shared::state_machine::ListenerState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Canonical request produced by every listener
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub command_id: String,
    pub pin: Option<String>,
    /// Replaces the command's own deadline when set and non-zero
    pub timeout_override: Option<Duration>,
    pub client: ClientIdentity,
    /// External admin trust signal; remote listeners never set it
    pub admin: bool,
}

impl ExecuteRequest {
    pub fn new(command_id: impl Into<String>, client: ClientIdentity) -> Self {
        Self {
            command_id: command_id.into(),
            pin: None,
            timeout_override: None,
            client,
            admin: false,
        }
    }

    pub fn with_pin(mut self, pin: Option<String>) -> Self {
        self.pin = pin.filter(|p| !p.is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_override = timeout.filter(|t| !t.is_zero());
        self
    }
}

/// Catalog entry as shown to callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub icon: String,
    pub require_pin: bool,
    pub admin_only: bool,
    /// Platform keys; empty when the command runs everywhere
    pub platforms: Vec<String>,
    /// Resolvable on the running platform
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<HomepageLayout>,
}

impl CommandSummary {
    fn from_definition(def: &CommandDefinition, current_platform: &str) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            description: def.description.clone(),
            category: def.category.clone(),
            icon: def.icon.clone(),
            require_pin: def.security.require_pin,
            admin_only: def.security.admin_only,
            platforms: def.platforms(),
            available: def.is_available_on(current_platform),
            homepage: def.homepage.clone(),
        }
    }
}

/// Live state of every listener, written by the listeners themselves
#[derive(Debug, Default)]
pub struct ListenerBoard {
    states: RwLock<BTreeMap<&'static str, ListenerState>>,
}

impl ListenerBoard {
    pub fn set(&self, listener: &'static str, state: ListenerState) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(listener, state);
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, ListenerState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Liveness summary served by the health endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub platform: String,
    pub catalog_version: String,
    pub commands: usize,
    pub uptime_secs: u64,
    /// Clients with a live rate-limit window
    pub tracked_clients: usize,
    pub listeners: BTreeMap<&'static str, ListenerState>,
}

/// Shared catalog, policy and executor
pub struct CommandService {
    catalog: Arc<Catalog>,
    policy: Arc<SecurityPolicy>,
    executor: Arc<CommandExecutor>,
    default_timeout: Duration,
    platform: String,
    listeners: Arc<ListenerBoard>,
    started: Instant,
}

impl CommandService {
    pub fn new(
        catalog: Arc<Catalog>,
        policy: Arc<SecurityPolicy>,
        executor: Arc<CommandExecutor>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            policy,
            executor,
            default_timeout,
            platform: platform::current().to_string(),
            listeners: Arc::new(ListenerBoard::default()),
            started: Instant::now(),
        }
    }

    /// Resolve instructions for `platform` instead of the running host
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn policy(&self) -> &Arc<SecurityPolicy> {
        &self.policy
    }

    pub fn listeners(&self) -> &Arc<ListenerBoard> {
        &self.listeners
    }

    /// Run a command on behalf of a remote caller
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecutionResult, AgentError> {
        match self.run(&request).await {
            Ok(result) => {
                info!(
                    command = %request.command_id,
                    client = %request.client,
                    success = result.success,
                    timed_out = result.timed_out(),
                    exit_code = result.exit_code,
                    elapsed_ms = result.duration.as_millis() as u64,
                    "command executed"
                );
                Ok(result)
            }
            Err(e) if e.is_rejection() => {
                warn!(command = %request.command_id, client = %request.client, code = e.code(), "request rejected: {}", e);
                Err(e)
            }
            Err(e) => {
                error!(command = %request.command_id, client = %request.client, "execution fault: {}", e);
                Err(e)
            }
        }
    }

    async fn run(&self, request: &ExecuteRequest) -> Result<ExecutionResult, AgentError> {
        self.policy.check_rate_limit(&request.client).await?;

        let command = self.catalog.resolve(&request.command_id).await?;
        self.policy.validate_command_access(&command)?;

        if self.policy.requires_admin(&command) && !request.admin {
            return Err(AgentError::AccessDenied(format!(
                "command '{}' requires administrator authorization",
                command.id
            )));
        }

        if self.policy.requires_pin(&command) && !self.policy.validate_pin(request.pin.as_deref()) {
            return Err(AgentError::InvalidOrMissingPin);
        }

        let instruction = Catalog::platform_instruction(&command, &self.platform)?;
        let deadline = request
            .timeout_override
            .or(command.timeout)
            .unwrap_or(self.default_timeout);

        self.executor.execute(&instruction, deadline).await
    }

    /// The catalog in source order
    pub async fn list(&self) -> Vec<CommandSummary> {
        self.catalog
            .list_all()
            .await
            .iter()
            .map(|def| CommandSummary::from_definition(def, &self.platform))
            .collect()
    }

    /// Re-read the command source; the current catalog stays live on failure
    pub async fn reload(&self) -> Result<usize, AgentError> {
        self.catalog.reload().await
    }

    pub async fn health(&self) -> HealthReport {
        let snapshot = self.catalog.snapshot().await;
        HealthReport {
            status: "ok",
            platform: self.platform.clone(),
            catalog_version: snapshot.version().to_string(),
            commands: snapshot.len(),
            uptime_secs: self.started.elapsed().as_secs(),
            tracked_clients: self.policy.rate_limiter().tracked_clients().await,
            listeners: self.listeners.snapshot(),
        }
    }
}
