//! Access policy: allow-list, PIN and admin requirements plus rate limiting

use super::identity::ClientIdentity;
use super::rate_limit::RateLimiter;
use crate::command::CommandDefinition;
use crate::config::AgentConfig;
use crate::error::AgentError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Policy inputs, normally taken from [`AgentConfig`]
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    /// Shared PIN secret; `None` makes every PIN check fail
    pub pin: Option<String>,
    pub whitelist_enabled: bool,
    /// Empty means every command is allowed even with the whitelist on
    pub allowed_commands: HashSet<String>,
    /// `0` disables rate limiting
    pub max_requests: u32,
    pub window: Duration,
}

impl From<&AgentConfig> for PolicyConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            pin: config.pin_secret(),
            whitelist_enabled: config.whitelist_enabled,
            allowed_commands: config.allowed_set(),
            max_requests: config.rate_limit_max_requests,
            window: config.rate_limit_window(),
        }
    }
}

/// Evaluates per-command access requirements and per-client rate limits
pub struct SecurityPolicy {
    pin: Option<String>,
    whitelist_enabled: bool,
    allowed_commands: HashSet<String>,
    rate_limiter: Arc<RateLimiter>,
}

impl SecurityPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            pin: config.pin.filter(|p| !p.is_empty()),
            whitelist_enabled: config.whitelist_enabled,
            allowed_commands: config.allowed_commands,
            rate_limiter: Arc::new(RateLimiter::new(config.max_requests, config.window)),
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Admit or reject a request from `client`
    pub async fn check_rate_limit(&self, client: &ClientIdentity) -> Result<(), AgentError> {
        self.rate_limiter.check(client).await
    }

    /// Compare `supplied` against the configured secret in constant time
    pub fn validate_pin(&self, supplied: Option<&str>) -> bool {
        match (&self.pin, supplied) {
            (Some(expected), Some(supplied)) => {
                constant_time_eq(expected.as_bytes(), supplied.as_bytes())
            }
            _ => false,
        }
    }

    /// Check the allow-list for a command flagged `whitelist`.
    ///
    /// With the whitelist enabled and a non-empty allowed set, a flagged
    /// command must be listed. An empty allowed set allows everything.
    pub fn validate_command_access(&self, command: &CommandDefinition) -> Result<(), AgentError> {
        if !command.security.whitelist || !self.whitelist_enabled {
            return Ok(());
        }
        if self.allowed_commands.is_empty() || self.allowed_commands.contains(&command.id) {
            return Ok(());
        }
        Err(AgentError::AccessDenied(format!(
            "command '{}' is not in the allowed command list",
            command.id
        )))
    }

    /// Whether the caller must hold an external admin trust signal
    pub fn requires_admin(&self, command: &CommandDefinition) -> bool {
        command.security.admin_only
    }

    /// Whether the command needs a PIN
    pub fn requires_pin(&self, command: &CommandDefinition) -> bool {
        command.security.require_pin
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&x, &y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandTable;

    fn table() -> CommandTable {
        CommandTable::parse(
            r#"{"commands":[
                {"id":"listed","command":"true","security":{"whitelist":true}},
                {"id":"unlisted","command":"true","security":{"whitelist":true}},
                {"id":"open","command":"true"},
                {"id":"admin","command":"true","security":{"adminOnly":true,"requirePin":true}}
            ]}"#,
        )
        .unwrap()
    }

    fn policy(pin: Option<&str>, whitelist: bool, allowed: &[&str]) -> SecurityPolicy {
        SecurityPolicy::new(PolicyConfig {
            pin: pin.map(str::to_owned),
            whitelist_enabled: whitelist,
            allowed_commands: allowed.iter().map(|s| s.to_string()).collect(),
            max_requests: 0,
            window: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_pin_validation() {
        let p = policy(Some("1234"), false, &[]);
        assert!(p.validate_pin(Some("1234")));
        assert!(!p.validate_pin(Some("12345")));
        assert!(!p.validate_pin(Some("4321")));
        assert!(!p.validate_pin(None));
    }

    #[test]
    fn test_pin_fails_closed_without_secret() {
        let p = policy(None, false, &[]);
        assert!(!p.validate_pin(Some("")));
        assert!(!p.validate_pin(Some("1234")));

        let p = policy(Some(""), false, &[]);
        assert!(!p.validate_pin(Some("")));
    }

    #[test]
    fn test_whitelist() {
        let table = table();
        let p = policy(None, true, &["listed"]);
        assert!(p.validate_command_access(table.get("listed").unwrap()).is_ok());
        assert!(matches!(
            p.validate_command_access(table.get("unlisted").unwrap()),
            Err(AgentError::AccessDenied(_))
        ));
        // Commands without the whitelist flag are not subject to the list
        assert!(p.validate_command_access(table.get("open").unwrap()).is_ok());
    }

    #[test]
    fn test_whitelist_permissive_defaults() {
        let table = table();
        let unlisted = table.get("unlisted").unwrap();

        // Globally disabled
        assert!(policy(None, false, &["listed"]).validate_command_access(unlisted).is_ok());
        // Enabled with an empty set allows all
        assert!(policy(None, true, &[]).validate_command_access(unlisted).is_ok());
    }

    #[test]
    fn test_requirement_flags() {
        let table = table();
        let p = policy(None, false, &[]);
        assert!(p.requires_admin(table.get("admin").unwrap()));
        assert!(p.requires_pin(table.get("admin").unwrap()));
        assert!(!p.requires_admin(table.get("open").unwrap()));
    }
}
