//! JSON-RPC codec for `runCmds`
//!
//! Requests are framed as:
//! ```text
//! {"jsonrpc": "2.0", "method": "runCmds",
//!  "params": {"version": 1, "cmds": [...], "format": "json"},
//!  "id": "<correlation id>", "streaming": false}
//! ```
//!
//! Responses carry either `result` (one entry per command) or `error`, whose
//! `data` array holds the outputs of the commands that ran followed by the
//! entry of the command that failed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::{defaults, BatchOutcome, Command, CommandOutput, Encoding, FailureDescriptor};

/// Maximum response body size (32 MB); full running configs can be large
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Batch must contain at least one command")]
    EmptyBatch,

    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Malformed response envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unexpected response shape: {0}")]
    UnexpectedShape(String),

    #[error("Correlation id mismatch: sent {expected}, received {actual}")]
    CorrelationMismatch { expected: String, actual: String },
}

/// One `runCmds` call ready for encoding
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub commands: Vec<Command>,
    pub encoding: Encoding,
    pub api_version: u32,
    pub auto_complete: Option<bool>,
    pub expand_aliases: Option<bool>,
    pub streaming: bool,
    pub correlation_id: String,
}

impl BatchRequest {
    /// Create a request with default params
    pub fn new(commands: Vec<Command>, correlation_id: impl Into<String>) -> Self {
        Self {
            commands,
            encoding: Encoding::Json,
            api_version: defaults::API_VERSION,
            auto_complete: None,
            expand_aliases: None,
            streaming: false,
            correlation_id: correlation_id.into(),
        }
    }
}

/// What the decoder needs to know about the request it is matching
#[derive(Debug, Clone, PartialEq)]
pub struct Expected {
    pub correlation_id: String,
    pub command_count: usize,
    pub encoding: Encoding,
}

impl From<&BatchRequest> for Expected {
    fn from(request: &BatchRequest) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            command_count: request.commands.len(),
            encoding: request.encoding,
        }
    }
}

/// Response irregularities that do not invalidate the outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// A successful response carried more entries than commands were sent
    TrailingResults { expected: usize, received: usize },
    /// A failed response carried entries after the failing command
    EntriesAfterFailure { index: usize, ignored: usize },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::TrailingResults { expected, received } => write!(
                f,
                "device returned {} results for {} commands; extra entries ignored",
                received, expected
            ),
            Anomaly::EntriesAfterFailure { index, ignored } => write!(
                f,
                "device returned {} entries after failing command {}; ignored",
                ignored, index
            ),
        }
    }
}

/// The device's answer to one request
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Positional per-command outcome
    Batch(BatchOutcome),
    /// The request itself was refused before any command ran
    Rejected { code: i64, message: String },
}

/// Result of decoding one response body
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub reply: Reply,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: WireParams<'a>,
    id: &'a str,
    streaming: bool,
}

#[derive(Serialize)]
struct WireParams<'a> {
    version: u32,
    cmds: Vec<WireCommand<'a>>,
    format: Encoding,
    #[serde(rename = "autoComplete", skip_serializing_if = "Option::is_none")]
    auto_complete: Option<bool>,
    #[serde(rename = "expandAliases", skip_serializing_if = "Option::is_none")]
    expand_aliases: Option<bool>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireCommand<'a> {
    Plain(&'a str),
    WithInput { cmd: &'a str, input: &'a str },
}

impl<'a> From<&'a Command> for WireCommand<'a> {
    fn from(command: &'a Command) -> Self {
        match command.input() {
            Some(input) => WireCommand::WithInput {
                cmd: command.cmd(),
                input,
            },
            None => WireCommand::Plain(command.cmd()),
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Vec<Value>>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Encode a batch into a request body
pub fn encode(request: &BatchRequest) -> Result<Bytes, CodecError> {
    if request.commands.is_empty() {
        return Err(CodecError::EmptyBatch);
    }

    let wire = WireRequest {
        jsonrpc: defaults::JSONRPC_VERSION,
        method: defaults::METHOD_RUN_CMDS,
        params: WireParams {
            version: request.api_version,
            cmds: request.commands.iter().map(WireCommand::from).collect(),
            format: request.encoding,
            auto_complete: request.auto_complete,
            expand_aliases: request.expand_aliases,
        },
        id: &request.correlation_id,
        streaming: request.streaming,
    };

    serde_json::to_vec(&wire)
        .map(Bytes::from)
        .map_err(CodecError::Encode)
}

/// Decode a response body against the request it answers
///
/// Walks the entries positionally. Only the first error entry counts: the
/// device stops there, so anything after it is reported as an [`Anomaly`].
pub fn decode(body: &[u8], expected: &Expected) -> Result<Decoded, CodecError> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(body.len()));
    }

    let response: WireResponse = serde_json::from_slice(body).map_err(CodecError::Malformed)?;

    let actual = match &response.id {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    if actual != expected.correlation_id {
        return Err(CodecError::CorrelationMismatch {
            expected: expected.correlation_id.clone(),
            actual,
        });
    }

    let mut anomalies = Vec::new();

    if let Some(error) = response.error {
        let message = annotate_unsupported_param(error.message);
        let data = match error.data {
            None | Some(Value::Null) => {
                return Ok(Decoded {
                    reply: Reply::Rejected {
                        code: error.code,
                        message,
                    },
                    anomalies,
                });
            }
            Some(data) => failure_entries(data)?,
        };

        let index = data
            .iter()
            .position(|entry| entry.get("errors").is_some())
            .unwrap_or(data.len());
        if index >= expected.command_count {
            return Err(CodecError::UnexpectedShape(format!(
                "error response places the failure at index {} of a {}-command batch",
                index, expected.command_count
            )));
        }

        let ignored = data.len().saturating_sub(index + 1);
        if ignored > 0 {
            anomalies.push(Anomaly::EntriesAfterFailure { index, ignored });
        }

        let mut entries = data.into_iter();
        let executed = entries
            .by_ref()
            .take(index)
            .map(|entry| decode_output(entry, expected.encoding))
            .collect::<Result<Vec<_>, _>>()?;
        let failing = entries.next();

        let failure = FailureDescriptor {
            index,
            code: error.code,
            message,
            errors: failing.as_ref().map(error_lines).unwrap_or_default(),
            output: failing,
        };

        return Ok(Decoded {
            reply: Reply::Batch(BatchOutcome::Failed { executed, failure }),
            anomalies,
        });
    }

    let Some(mut results) = response.result else {
        return Err(CodecError::UnexpectedShape(
            "response carries neither result nor error".into(),
        ));
    };

    if results.len() < expected.command_count {
        return Err(CodecError::UnexpectedShape(format!(
            "expected {} results, received {}",
            expected.command_count,
            results.len()
        )));
    }
    if results.len() > expected.command_count {
        anomalies.push(Anomaly::TrailingResults {
            expected: expected.command_count,
            received: results.len(),
        });
        results.truncate(expected.command_count);
    }

    let results = results
        .into_iter()
        .map(|entry| decode_output(entry, expected.encoding))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Decoded {
        reply: Reply::Batch(BatchOutcome::Completed { results }),
        anomalies,
    })
}

/// Render a request body for logs with the enable secret removed
pub fn sanitize(body: &[u8]) -> String {
    let Ok(mut request) = serde_json::from_slice::<Value>(body) else {
        return String::from_utf8_lossy(body).into_owned();
    };

    if let Some(cmds) = request
        .get_mut("params")
        .and_then(|params| params.get_mut("cmds"))
        .and_then(Value::as_array_mut)
    {
        for cmd in cmds.iter_mut() {
            let is_enable = cmd
                .get("cmd")
                .and_then(Value::as_str)
                .is_some_and(|name| name.trim() == defaults::ENABLE_COMMAND);
            if let (true, Some(input)) = (is_enable, cmd.get_mut("input")) {
                *input = Value::String("<removed>".into());
            }
        }
    }

    request.to_string()
}

/// Normalise `error.data` to the positional array form
///
/// Besides the array, a compact `{"errors": [...], "index": N, "results": [...]}`
/// object is accepted, where `results` holds the outputs of commands `0..N`.
fn failure_entries(data: Value) -> Result<Vec<Value>, CodecError> {
    match data {
        Value::Array(entries) => Ok(entries),
        Value::Object(mut map) => {
            let index = map
                .get("index")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    CodecError::UnexpectedShape("error data object is missing 'index'".into())
                })? as usize;
            let mut entries = match map.remove("results") {
                Some(Value::Array(results)) => results,
                None | Some(Value::Null) => Vec::new(),
                Some(other) => {
                    return Err(CodecError::UnexpectedShape(format!(
                        "error data 'results' must be an array, got {}",
                        other
                    )))
                }
            };
            if entries.len() != index {
                return Err(CodecError::UnexpectedShape(format!(
                    "error data reports failure at index {} but carries {} prior results",
                    index,
                    entries.len()
                )));
            }
            let errors = map.remove("errors").unwrap_or_else(|| Value::Array(Vec::new()));
            let mut failing = serde_json::Map::new();
            failing.insert("errors".into(), errors);
            entries.push(Value::Object(failing));
            Ok(entries)
        }
        other => Err(CodecError::UnexpectedShape(format!(
            "error data must be an array or object, got {}",
            other
        ))),
    }
}

fn decode_output(entry: Value, encoding: Encoding) -> Result<CommandOutput, CodecError> {
    match encoding {
        Encoding::Json => Ok(CommandOutput::Json(entry)),
        Encoding::Text => match entry {
            Value::Object(mut map) => match map.remove("output") {
                Some(Value::String(text)) => Ok(CommandOutput::Text(text)),
                _ => Err(CodecError::UnexpectedShape(
                    "text result is missing its 'output' string".into(),
                )),
            },
            Value::String(text) => Ok(CommandOutput::Text(text)),
            other => Err(CodecError::UnexpectedShape(format!(
                "text result must be an object, got {}",
                other
            ))),
        },
    }
}

fn error_lines(entry: &Value) -> Vec<String> {
    match entry.get("errors") {
        Some(Value::Array(lines)) => lines
            .iter()
            .map(|line| match line {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(line)) => vec![line.clone()],
        _ => Vec::new(),
    }
}

/// Older firmware refuses params it does not know with "unexpected keyword argument"
fn annotate_unsupported_param(message: String) -> String {
    const MARKER: &str = "unexpected keyword argument '";

    let param = message.find(MARKER).and_then(|start| {
        let rest = &message[start + MARKER.len()..];
        rest.find('\'').map(|end| rest[..end].to_string())
    });

    match param {
        Some(param) => format!(
            "{}. {} parameter is not supported in this version of EOS.",
            message, param
        ),
        None => message,
    }
}
