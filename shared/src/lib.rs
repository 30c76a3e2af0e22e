//! eAPI Shared Wire Types
//!
//! This crate provides the command and result types plus the JSON-RPC codec
//! used to talk to a network device's command API. Nothing in here performs
//! I/O; the async client lives in the `eapi-client` crate.

pub mod codec;
pub mod state_machine;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Protocol defaults for the command API
pub mod defaults {
    /// JSON-RPC protocol version placed in every request
    pub const JSONRPC_VERSION: &str = "2.0";

    /// The only RPC method the device exposes for command execution
    pub const METHOD_RUN_CMDS: &str = "runCmds";

    /// Default `params.version`
    pub const API_VERSION: u32 = 1;

    pub const HTTP_PORT: u16 = 80;
    pub const HTTPS_PORT: u16 = 443;
    pub const HTTP_LOCAL_PORT: u16 = 8080;
    pub const HTTPS_LOCAL_PORT: u16 = 8443;

    /// URL path of the command API
    pub const COMMAND_API_PATH: &str = "/command-api";

    /// Session login path, next to the command API
    pub const LOGIN_PATH: &str = "/login";

    /// Local socket the device listens on for on-box clients
    pub const UNIX_SOCKET_PATH: &str = "/var/run/command-api.sock";

    /// Per-request transport timeout in milliseconds
    pub const TRANSPORT_TIMEOUT_MS: u64 = 60_000;

    /// Marker splitting a multiline command from its input text
    pub const MULTILINE_MARKER: &str = "MULTILINE:";

    /// Command that raises the session to privileged mode
    pub const ENABLE_COMMAND: &str = "enable";
}

/// Output encoding requested from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Structured JSON output
    #[default]
    Json,
    /// Raw CLI text output
    Text,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Json => write!(f, "json"),
            Encoding::Text => write!(f, "text"),
        }
    }
}

impl std::str::FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "text" => Ok(Encoding::Text),
            other => Err(format!("encoding must be one of [json, text], got '{}'", other)),
        }
    }
}

/// A single CLI instruction sent to the device
///
/// Commands are opaque to this crate: the text is sent exactly as given. An
/// optional `input` is fed to the command's prompt (multiline banners, the
/// enable secret).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encoding: Option<Encoding>,
}

impl Command {
    /// Create a plain command
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            input: None,
            encoding: None,
        }
    }

    /// Create a command that answers its prompt with `input`
    pub fn with_input(cmd: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            input: Some(input.into()),
            encoding: None,
        }
    }

    /// Request a specific output encoding for this command
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Parse a command line, honouring the `MULTILINE:` convention
    ///
    /// `"banner login MULTILINE: Hello\nWorld"` becomes the command
    /// `"banner login "` with input `"Hello\nWorld\n"`.
    pub fn parse(line: &str) -> Self {
        match line.split_once(defaults::MULTILINE_MARKER) {
            Some((cmd, input)) => Self::with_input(cmd, format!("{}\n", input.trim())),
            None => Self::new(line),
        }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn input(&self) -> Option<&str> {
        self.input.as_deref()
    }

    /// Encoding requested for this command, if it differs from the batch default
    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    /// Whether this is the privileged-mode `enable` command
    pub fn is_enable(&self) -> bool {
        self.cmd.trim() == defaults::ENABLE_COMMAND
    }
}

impl From<&str> for Command {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for Command {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cmd)
    }
}

/// Output of one successfully executed command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandOutput {
    /// Structured result (json encoding)
    Json(Value),
    /// CLI text (text encoding)
    Text(String),
}

impl CommandOutput {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            CommandOutput::Json(value) => Some(value),
            CommandOutput::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CommandOutput::Text(text) => Some(text),
            CommandOutput::Json(_) => None,
        }
    }
}

/// Device-reported failure of one command within a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDescriptor {
    /// Position of the failing command in the submitted batch
    pub index: usize,
    /// Device error code, passed through verbatim
    pub code: i64,
    /// Device error message
    pub message: String,
    /// Per-command error lines reported for the failing command
    pub errors: Vec<String>,
    /// Raw output entry the device returned for the failing command
    pub output: Option<Value>,
}

/// Codes whose message already says everything; the per-command errors are noise
const SELF_DESCRIBING_CODES: [i64; 4] = [1000, 1001, 1002, 1004];

impl fmt::Display for FailureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if SELF_DESCRIBING_CODES.contains(&self.code) || self.errors.is_empty() {
            write!(f, "Error [{}]: {}", self.code, self.message)
        } else {
            write!(
                f,
                "Error [{}]: {} [{}]",
                self.code,
                self.message,
                self.errors.join(", ")
            )
        }
    }
}

/// Per-command result, positionally matched to the submitted command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Success(CommandOutput),
    Failure(FailureDescriptor),
}

/// Aggregate result of one batch
///
/// The device executes a batch in order and stops at the first failing
/// command, so a failed batch carries the outputs of every command before the
/// failure and nothing after it.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Every command succeeded; one output per command, in submission order
    Completed { results: Vec<CommandOutput> },
    /// Execution stopped at `failure.index`; `executed` covers `0..failure.index`
    Failed {
        executed: Vec<CommandOutput>,
        failure: FailureDescriptor,
    },
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Completed { .. })
    }

    /// Outputs of the commands that executed successfully
    pub fn outputs(&self) -> &[CommandOutput] {
        match self {
            BatchOutcome::Completed { results } => results,
            BatchOutcome::Failed { executed, .. } => executed,
        }
    }

    pub fn failure(&self) -> Option<&FailureDescriptor> {
        match self {
            BatchOutcome::Completed { .. } => None,
            BatchOutcome::Failed { failure, .. } => Some(failure),
        }
    }

    /// Positional results: one per executed command, ending with the failure if any
    pub fn results(&self) -> Vec<CommandResult> {
        let mut results: Vec<CommandResult> = self
            .outputs()
            .iter()
            .cloned()
            .map(CommandResult::Success)
            .collect();
        if let Some(failure) = self.failure() {
            results.push(CommandResult::Failure(failure.clone()));
        }
        results
    }
}
