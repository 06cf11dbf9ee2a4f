//! Lifecycle management for the agent
//!
//! This module handles:
//! - Building the shared catalog, policy and executor
//! - Running every enabled listener plus the rate-limit sweep concurrently
//! - First-error-wins shutdown with a bounded drain

mod manager;

pub use manager::Agent;
