//! Protocol message definitions
//!
//! Payloads are JSON so both ends can be inspected with ordinary tools:
//! a start request is an object, a PTY announcement is the string `"pty"`, an
//! exit status is a bare integer. The session handoff is a single space byte;
//! its only content is the descriptor that travels with it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Current protocol version
/// Increment when making breaking changes to the start request
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Payload of a PTY announcement
pub const PTY_READY_MARKER: &str = "pty";

/// Payload of a session handoff
pub const HANDOFF_PAYLOAD: &[u8] = b" ";

/// Command name resolved by the worker to the user's editor
pub const EDITOR_COMMAND: &str = "_EDITOR";

/// Command name resolved by the worker to the user's pager
pub const PAGER_COMMAND: &str = "_PAGER";

/// Descriptor slot where a spawned agent worker finds its control channel
pub const AGENT_CHANNEL_SLOT: i32 = 3;

/// First slot for auxiliary descriptors handed to a started command
pub const FIRST_AUX_SLOT: i32 = 3;

/// Maximum path length
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum number of arguments in a start request
pub const MAX_ARGS: usize = 256;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol version {0} not supported (min: {MIN_PROTOCOL_VERSION}, current: {PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Unrecognized message: {0}")]
    UnknownMessage(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Start Request
// ============================================================================

/// Request to run a command (or a login shell) on a fresh PTY
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartRequest {
    /// Command and arguments; empty means "start a login shell"
    pub args: Vec<String>,
    /// Working directory for the command
    pub cwd: Option<String>,
    /// Environment overrides for the command
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Protocol version of the sender
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl StartRequest {
    /// Create a request for the given command line
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            cwd: None,
            env: BTreeMap::new(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Create a request for a login shell
    pub fn shell() -> Self {
        Self::new(Vec::new())
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: Option<String>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Replace the environment overrides
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// True when this asks for a login shell
    pub fn is_shell(&self) -> bool {
        self.args.is_empty()
    }

    /// Validate version and contents
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.version < MIN_PROTOCOL_VERSION || self.version > PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }

        if self.args.len() > MAX_ARGS {
            return Err(ProtocolError::ValidationError(format!(
                "args exceeds maximum of {} entries",
                MAX_ARGS
            )));
        }
        if let Some(first) = self.args.first() {
            if first.is_empty() {
                return Err(ProtocolError::ValidationError(
                    "command name cannot be empty".to_string(),
                ));
            }
        }
        if self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(ProtocolError::ValidationError(
                "args cannot contain NUL bytes".to_string(),
            ));
        }

        if let Some(cwd) = &self.cwd {
            if cwd.is_empty() {
                return Err(ProtocolError::ValidationError(
                    "cwd cannot be empty when specified".to_string(),
                ));
            }
            if cwd.len() > MAX_PATH_LENGTH {
                return Err(ProtocolError::ValidationError(format!(
                    "cwd exceeds maximum length of {} characters",
                    MAX_PATH_LENGTH
                )));
            }
            if cwd.contains('\0') {
                return Err(ProtocolError::ValidationError(
                    "cwd cannot contain NUL bytes".to_string(),
                ));
            }
        }

        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ProtocolError::ValidationError(format!(
                    "invalid environment variable name {:?}",
                    key
                )));
            }
            if value.contains('\0') {
                return Err(ProtocolError::ValidationError(format!(
                    "environment variable {} contains a NUL byte",
                    key
                )));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Control Messages
// ============================================================================

/// Every message that travels over a control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Client to worker: run a command; may carry auxiliary descriptors
    StartRequest(StartRequest),
    /// Worker to client: the PTY master travels with this message
    PtyReady,
    /// Worker to client: the process finished with this status
    ProcessExited(i32),
    /// Client to agent: the fresh session endpoint travels with this message
    SessionHandoff,
}

/// How many descriptors a message must carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptors {
    /// No descriptors allowed
    None,
    /// Exactly one descriptor
    One,
    /// Any number, chosen by the sender
    Any,
}

impl Descriptors {
    /// Check a descriptor count against this rule
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Descriptors::None => count == 0,
            Descriptors::One => count == 1,
            Descriptors::Any => true,
        }
    }
}

impl ControlMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::StartRequest(_) => "start_request",
            ControlMessage::PtyReady => "pty_ready",
            ControlMessage::ProcessExited(_) => "process_exited",
            ControlMessage::SessionHandoff => "session_handoff",
        }
    }

    /// Descriptor rule for this message
    pub fn descriptors(&self) -> Descriptors {
        match self {
            ControlMessage::StartRequest(_) => Descriptors::Any,
            ControlMessage::PtyReady | ControlMessage::SessionHandoff => Descriptors::One,
            ControlMessage::ProcessExited(_) => Descriptors::None,
        }
    }

    /// Encode the payload bytes for this message
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        match self {
            ControlMessage::StartRequest(request) => Ok(serde_json::to_vec(request)?),
            ControlMessage::PtyReady => Ok(serde_json::to_vec(PTY_READY_MARKER)?),
            ControlMessage::ProcessExited(status) => Ok(serde_json::to_vec(status)?),
            ControlMessage::SessionHandoff => Ok(HANDOFF_PAYLOAD.to_vec()),
        }
    }

    /// Decode a payload, rejecting anything that is not one of the known shapes
    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        if payload == HANDOFF_PAYLOAD {
            return Ok(ControlMessage::SessionHandoff);
        }

        let value: Value = serde_json::from_slice(payload)?;
        match value {
            Value::String(marker) if marker == PTY_READY_MARKER => Ok(ControlMessage::PtyReady),
            Value::Number(number) => number
                .as_i64()
                .and_then(|status| i32::try_from(status).ok())
                .map(ControlMessage::ProcessExited)
                .ok_or_else(|| {
                    ProtocolError::UnknownMessage(format!("exit status {} out of range", number))
                }),
            object @ Value::Object(_) => {
                Ok(ControlMessage::StartRequest(serde_json::from_value(object)?))
            }
            other => Err(ProtocolError::UnknownMessage(describe(&other))),
        }
    }

    /// Create a StartRequest message
    pub fn start(request: StartRequest) -> Self {
        ControlMessage::StartRequest(request)
    }

    /// Create a ProcessExited message
    pub fn exited(status: i32) -> Self {
        ControlMessage::ProcessExited(status)
    }
}

fn describe(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 64 {
        format!("{}...", text.chars().take(64).collect::<String>())
    } else {
        text
    }
}

// ============================================================================
// Exit Status
// ============================================================================

/// Reason for process exit, derived from a raw status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Process exited normally with this code
    Normal(u8),
    /// Process was killed by this signal
    Signal(i32),
    /// Status outside any known encoding
    Unknown,
}

impl ExitReason {
    /// Interpret a raw status as sent by the worker
    pub fn from_status(status: i32) -> Self {
        match status {
            0..=255 => ExitReason::Normal(status as u8),
            -127..=-1 => ExitReason::Signal(-status),
            _ => ExitReason::Unknown,
        }
    }

    /// Exit code a shell would report for this status
    pub fn shell_exit_code(self) -> u8 {
        match self {
            ExitReason::Normal(code) => code,
            ExitReason::Signal(signal) => (128 + signal).min(255) as u8,
            ExitReason::Unknown => 1,
        }
    }
}

/// Exit code a shell would report for a raw status
pub fn shell_exit_code(status: i32) -> u8 {
    ExitReason::from_status(status).shell_exit_code()
}
