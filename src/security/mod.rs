//! Security Module
//!
//! Enforces access policy before anything executes:
//! - allow-list membership for commands flagged `whitelist`
//! - constant-time PIN checks
//! - admin-only flag exposure
//! - per-client sliding-window rate limiting with a periodic idle sweep

mod identity;
mod policy;
mod rate_limit;

pub use identity::ClientIdentity;
pub use policy::{PolicyConfig, SecurityPolicy};
