//! Command execution infrastructure for the agent
//!
//! This module handles:
//! - Loading and atomically reloading the command catalog
//! - Resolving a command id to an instruction for the running platform
//! - Running instructions as deadline-bound subprocesses
//! - The service facade shared by every listener

mod catalog;
mod executor;
mod service;

pub use catalog::{Catalog, CommandDefinition};
pub use executor::{CommandExecutor, ExecutionResult};
pub use service::{CommandService, ExecuteRequest, ListenerBoard};

#[cfg(test)]
pub(crate) use catalog::CommandTable;
#[cfg(test)]
pub(crate) use catalog::tests as catalog_tests;
#[cfg(test)]
pub(crate) use service::tests as test_support;
