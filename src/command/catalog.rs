//! Command catalog - the resolvable table of command definitions
//!
//! The table is parsed and validated once per load into tagged
//! [`CommandBody`] values. Reloads build a complete new table off to the
//! side and swap it in with a single pointer store, so a concurrent reader
//! holds either the old table or the new one, never a mix.

use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One step of a multi-step command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Shell instruction routed through the platform shell host
    Shell(String),
    /// Suspend the sequence
    Delay(Duration),
    /// Script body run by the platform script host
    Script(String),
}

/// A resolved, platform-specific executable directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Shell(String),
    /// Never empty
    Steps(Vec<Step>),
}

/// What a command runs, resolved at load time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    /// Same instruction on every platform
    Portable(Instruction),
    /// Exact platform-key lookup, no implicit fallback
    PlatformTable(BTreeMap<String, Instruction>),
}

/// Access requirements of a command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityFlags {
    pub require_pin: bool,
    /// Subject to the global allow-list when one is configured
    pub whitelist: bool,
    pub admin_only: bool,
}

/// Presentation-only layout hints for dashboards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomepageLayout {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// A registered command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub icon: String,
    pub body: CommandBody,
    pub security: SecurityFlags,
    /// Per-command deadline; `None` uses the agent default
    pub timeout: Option<Duration>,
    pub homepage: Option<HomepageLayout>,
}

impl CommandDefinition {
    /// Select the instruction for `platform` by exact key match
    pub fn platform_instruction(&self, platform: &str) -> Result<Instruction, AgentError> {
        match &self.body {
            CommandBody::Portable(instruction) => Ok(instruction.clone()),
            CommandBody::PlatformTable(table) => {
                table
                    .get(platform)
                    .cloned()
                    .ok_or_else(|| AgentError::CommandUnavailableOnPlatform {
                        id: self.id.clone(),
                        platform: platform.to_string(),
                    })
            }
        }
    }

    /// Platform keys of the table; empty for portable commands
    pub fn platforms(&self) -> Vec<String> {
        match &self.body {
            CommandBody::Portable(_) => Vec::new(),
            CommandBody::PlatformTable(table) => table.keys().cloned().collect(),
        }
    }

    pub fn is_available_on(&self, platform: &str) -> bool {
        self.platform_instruction(platform).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Source document
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    version: String,
    #[serde(default)]
    commands: Vec<RawDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDefinition {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    icon: String,
    command: RawBody,
    #[serde(default)]
    security: SecurityFlags,
    /// Milliseconds
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    homepage: Option<HomepageLayout>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBody {
    Shell(String),
    Steps(Vec<RawStep>),
    Table(BTreeMap<String, RawInstruction>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInstruction {
    Shell(String),
    Steps(Vec<RawStep>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawStepKind {
    Shell,
    Delay,
    Script,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(rename = "type")]
    kind: RawStepKind,
    payload: serde_json::Value,
}

fn shell_text(id: &str, text: String) -> Result<String, String> {
    if text.trim().is_empty() {
        return Err(format!("command '{id}' has an empty instruction"));
    }
    Ok(text)
}

impl RawStep {
    fn resolve(self, id: &str) -> Result<Step, String> {
        match self.kind {
            RawStepKind::Delay => {
                let ms = match &self.payload {
                    serde_json::Value::Number(n) => n.as_u64(),
                    serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
                    _ => None,
                };
                ms.map(|ms| Step::Delay(Duration::from_millis(ms)))
                    .ok_or_else(|| format!("command '{id}' has an invalid delay: {}", self.payload))
            }
            RawStepKind::Shell | RawStepKind::Script => {
                let text = match self.payload {
                    serde_json::Value::String(s) => shell_text(id, s)?,
                    other => return Err(format!("command '{id}' has a non-string step payload: {other}")),
                };
                Ok(match self.kind {
                    RawStepKind::Script => Step::Script(text),
                    _ => Step::Shell(text),
                })
            }
        }
    }
}

fn resolve_steps(id: &str, steps: Vec<RawStep>) -> Result<Instruction, String> {
    if steps.is_empty() {
        return Err(format!("command '{id}' has an empty step sequence"));
    }
    let steps = steps
        .into_iter()
        .map(|s| s.resolve(id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Instruction::Steps(steps))
}

impl RawInstruction {
    fn resolve(self, id: &str) -> Result<Instruction, String> {
        match self {
            RawInstruction::Shell(text) => Ok(Instruction::Shell(shell_text(id, text)?)),
            RawInstruction::Steps(steps) => resolve_steps(id, steps),
        }
    }
}

impl RawDefinition {
    fn resolve(self) -> Result<CommandDefinition, String> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err("command with an empty id".into());
        }

        let body = match self.command {
            RawBody::Shell(text) => CommandBody::Portable(Instruction::Shell(shell_text(&id, text)?)),
            RawBody::Steps(steps) => CommandBody::Portable(resolve_steps(&id, steps)?),
            RawBody::Table(table) => {
                if table.is_empty() {
                    return Err(format!("command '{id}' has an empty platform table"));
                }
                let table = table
                    .into_iter()
                    .map(|(platform, raw)| Ok((platform, raw.resolve(&id)?)))
                    .collect::<Result<BTreeMap<_, _>, String>>()?;
                CommandBody::PlatformTable(table)
            }
        };

        Ok(CommandDefinition {
            name: if self.name.is_empty() { id.clone() } else { self.name },
            id,
            description: self.description,
            category: self.category,
            icon: self.icon,
            body,
            security: self.security,
            timeout: self.timeout.filter(|&ms| ms > 0).map(Duration::from_millis),
            homepage: self.homepage,
        })
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// An immutable, fully validated snapshot of the catalog
#[derive(Debug, Default)]
pub struct CommandTable {
    version: String,
    commands: Vec<Arc<CommandDefinition>>,
    index: HashMap<String, usize>,
}

impl CommandTable {
    /// Parse and validate a catalog document
    pub fn parse(document: &str) -> Result<Self, String> {
        let raw: RawDocument =
            serde_json::from_str(document).map_err(|e| format!("malformed catalog: {e}"))?;

        let mut commands = Vec::with_capacity(raw.commands.len());
        let mut index = HashMap::with_capacity(raw.commands.len());

        for raw_def in raw.commands {
            let def = raw_def.resolve()?;
            if index.insert(def.id.clone(), commands.len()).is_some() {
                return Err(format!("duplicate command id '{}'", def.id));
            }
            commands.push(Arc::new(def));
        }

        Ok(Self {
            version: raw.version,
            commands,
            index,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<CommandDefinition>> {
        self.index.get(id).map(|&i| &self.commands[i])
    }

    /// Definitions in source order
    pub fn commands(&self) -> &[Arc<CommandDefinition>] {
        &self.commands
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// The live catalog with atomic reload
pub struct Catalog {
    source: PathBuf,
    table: RwLock<Arc<CommandTable>>,
}

impl Catalog {
    /// Load the catalog from `source`.
    ///
    /// A missing file yields an empty catalog; a malformed one is an error.
    pub async fn load(source: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let source = source.into();
        let table = match tokio::fs::read_to_string(&source).await {
            Ok(document) => {
                let table = CommandTable::parse(&document).map_err(AgentError::CatalogReloadFailed)?;
                if table.is_empty() {
                    warn!(path = %source.display(), "command file defines no commands");
                }
                table
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %source.display(), "command file not found, starting with an empty catalog");
                CommandTable::default()
            }
            Err(e) => {
                return Err(AgentError::CatalogReloadFailed(format!(
                    "failed to read {}: {e}",
                    source.display()
                )))
            }
        };

        info!(
            path = %source.display(),
            version = %table.version(),
            commands = table.len(),
            "command catalog loaded"
        );

        Ok(Self::from_table(source, table))
    }

    /// Build a catalog around an already parsed table
    pub fn from_table(source: impl Into<PathBuf>, table: CommandTable) -> Self {
        Self {
            source: source.into(),
            table: RwLock::new(Arc::new(table)),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Current table; stays valid even if a reload swaps in a new one
    pub async fn snapshot(&self) -> Arc<CommandTable> {
        self.table.read().await.clone()
    }

    /// Look up a command by id
    pub async fn resolve(&self, id: &str) -> Result<Arc<CommandDefinition>, AgentError> {
        self.snapshot()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::CommandNotFound(id.to_string()))
    }

    /// Select the executable instruction of `def` for `platform`
    pub fn platform_instruction(
        def: &CommandDefinition,
        platform: &str,
    ) -> Result<Instruction, AgentError> {
        def.platform_instruction(platform)
    }

    /// All definitions in source order
    pub async fn list_all(&self) -> Vec<Arc<CommandDefinition>> {
        self.snapshot().await.commands().to_vec()
    }

    /// Re-read the source and swap the whole table.
    ///
    /// On any failure the current table stays live.
    pub async fn reload(&self) -> Result<usize, AgentError> {
        let document = tokio::fs::read_to_string(&self.source).await.map_err(|e| {
            AgentError::CatalogReloadFailed(format!("failed to read {}: {e}", self.source.display()))
        })?;

        let table = match CommandTable::parse(&document) {
            Ok(table) => table,
            Err(reason) => {
                warn!(path = %self.source.display(), %reason, "catalog reload rejected, keeping current catalog");
                return Err(AgentError::CatalogReloadFailed(reason));
            }
        };

        let count = table.len();
        *self.table.write().await = Arc::new(table);
        info!(path = %self.source.display(), commands = count, "command catalog reloaded");
        Ok(count)
    }
}
