//! Client identity used to bucket rate-limit state

use sha2::{Digest, Sha256};
use std::fmt;

/// Derived, non-authenticated key for a caller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Hash `transport | source | agent` into a stable hex key.
    ///
    /// The transport name is part of the key so one host is limited per protocol.
    pub fn derive(transport: &str, source: &str, agent: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(transport.as_bytes());
        hasher.update(b"|");
        hasher.update(source.as_bytes());
        hasher.update(b"|");
        hasher.update(agent.as_bytes());
        let digest = hasher.finalize();
        Self(format!("{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}
