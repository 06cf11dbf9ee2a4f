//! JSON payload codec for the MQTT listener
//!
//! MQTT has no per-request reply channel, so every message carries a
//! caller-supplied correlation id:
//! ```text
//! {base}/execute   <- { "correlationId", "commandId", "pin"?, "timeout"?, "clientId"? }
//! {base}/commands  <- { "correlationId", "clientId"? }
//! {base}/response  -> { "correlationId", "type", "success", "result"?, "commands"?, "error"? }
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limits::MAX_MQTT_PAYLOAD;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MQTT_PAYLOAD})")]
    MessageTooLarge(usize),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// Stable machine-readable code used in error replies
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::MessageTooLarge(_) => "payload_too_large",
            CodecError::MissingField(_) => "missing_field",
            CodecError::Json(_) => "malformed_payload",
        }
    }
}

/// Request published on `{base}/execute`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteMessage {
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub command_id: String,
    #[serde(default)]
    pub pin: Option<String>,
    /// Deadline override in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Request published on `{base}/commands`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandsMessage {
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Discriminator of a reply on `{base}/response`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    ExecuteResult,
    Commands,
    Error,
}

/// Outcome of one execution as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub executed_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// One catalog entry in a `commands` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEntry {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
}

/// Error detail of an `error` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Reply published on `{base}/response`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub correlation_id: String,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<CommandEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ResponseMessage {
    /// Reply carrying an execution result
    pub fn execute_result(correlation_id: impl Into<String>, result: ResultPayload) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind: ResponseKind::ExecuteResult,
            success: result.success,
            result: Some(result),
            commands: None,
            error: None,
        }
    }

    /// Reply carrying the catalog listing
    pub fn commands(correlation_id: impl Into<String>, commands: Vec<CommandEntry>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind: ResponseKind::Commands,
            success: true,
            result: None,
            commands: Some(commands),
            error: None,
        }
    }

    /// Reply reporting a rejected or undecodable request
    pub fn error(
        correlation_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind: ResponseKind::Error,
            success: false,
            result: None,
            commands: None,
            error: Some(ErrorPayload {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

fn check_size(len: usize) -> Result<(), CodecError> {
    if len > MAX_MQTT_PAYLOAD {
        return Err(CodecError::MessageTooLarge(len));
    }
    Ok(())
}

/// Decode an execute request
pub fn decode_execute(payload: &[u8]) -> Result<ExecuteMessage, CodecError> {
    check_size(payload.len())?;
    let msg: ExecuteMessage = serde_json::from_slice(payload)?;
    if msg.correlation_id.is_empty() {
        return Err(CodecError::MissingField("correlationId"));
    }
    if msg.command_id.is_empty() {
        return Err(CodecError::MissingField("commandId"));
    }
    Ok(msg)
}

/// Decode a catalog listing request
pub fn decode_commands(payload: &[u8]) -> Result<CommandsMessage, CodecError> {
    check_size(payload.len())?;
    let msg: CommandsMessage = serde_json::from_slice(payload)?;
    if msg.correlation_id.is_empty() {
        return Err(CodecError::MissingField("correlationId"));
    }
    Ok(msg)
}

/// Best-effort extraction of the correlation id from a payload that failed to decode
///
/// Returns an empty string when nothing usable is present.
pub fn recover_correlation_id(payload: &[u8]) -> String {
    if payload.len() > MAX_MQTT_PAYLOAD {
        return String::new();
    }
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| {
            v.get("correlationId")
                .and_then(|id| id.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_default()
}

/// Encode a reply into a publishable payload
pub fn encode(response: &ResponseMessage) -> Result<Bytes, CodecError> {
    let buf = serde_json::to_vec(response)?;
    check_size(buf.len())?;
    Ok(Bytes::from(buf))
}
