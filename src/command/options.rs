//! Per-call execution options

use eapi_shared::{defaults, Command, Encoding};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::{EapiError, Result};

/// What to do with a command whose own encoding differs from the batch's
///
/// The device applies one `format` to the whole request, so the batch
/// encoding always wins on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixedEncoding {
    /// Fail validation with `InvalidInput`
    #[default]
    Reject,
    /// Send anyway with the batch encoding
    UseBatchEncoding,
}

/// Options for one `execute` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecuteOptions {
    pub encoding: Encoding,
    /// `params.version`
    pub api_version: u32,
    pub auto_complete: Option<bool>,
    pub expand_aliases: Option<bool>,
    pub streaming: bool,
    /// Overall deadline for the call, retries and backoff included
    pub timeout_ms: Option<u64>,
    /// Prefix the batch with `enable` and strip its result
    pub send_enable: bool,
    pub mixed_encoding: MixedEncoding,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::Json,
            api_version: defaults::API_VERSION,
            auto_complete: None,
            expand_aliases: None,
            streaming: false,
            timeout_ms: None,
            send_enable: false,
            mixed_encoding: MixedEncoding::Reject,
        }
    }
}

impl ExecuteOptions {
    pub fn text() -> Self {
        Self {
            encoding: Encoding::Text,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        // Round up so sub-millisecond budgets stay non-zero
        let millis = timeout.as_nanos().div_ceil(1_000_000);
        self.timeout_ms = Some(u64::try_from(millis).unwrap_or(u64::MAX));
        self
    }

    pub fn with_enable(mut self) -> Self {
        self.send_enable = true;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Range-check numeric fields
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == Some(0) {
            return Err(EapiError::InvalidInput(
                "timeout_ms must be greater than 0".into(),
            ));
        }
        if self.api_version == 0 {
            return Err(EapiError::InvalidInput(
                "api_version must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Apply the mixed-encoding policy to a batch
    pub fn check_encodings(&self, commands: &[Command]) -> Result<()> {
        for (index, command) in commands.iter().enumerate() {
            let Some(encoding) = command.encoding() else {
                continue;
            };
            if encoding == self.encoding {
                continue;
            }
            match self.mixed_encoding {
                MixedEncoding::Reject => {
                    return Err(EapiError::InvalidInput(format!(
                        "command {} '{}' requests {} output in a {} batch",
                        index, command, encoding, self.encoding
                    )));
                }
                MixedEncoding::UseBatchEncoding => {
                    warn!(
                        index,
                        command = %command,
                        requested = %encoding,
                        using = %self.encoding,
                        "Overriding per-command encoding"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ExecuteOptions::default();
        assert_eq!(options.encoding, Encoding::Json);
        assert_eq!(options.api_version, 1);
        assert!(!options.streaming);
        assert!(options.timeout().is_none());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_unknown_options_rejected() {
        let result: std::result::Result<ExecuteOptions, _> =
            serde_json::from_str(r#"{"encoding": "text", "retries": 5}"#);
        assert!(result.is_err());

        let options: ExecuteOptions =
            serde_json::from_str(r#"{"encoding": "text", "timeout_ms": 500}"#).unwrap();
        assert_eq!(options.encoding, Encoding::Text);
        assert_eq!(options.timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_range_checks() {
        let options = ExecuteOptions {
            timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(EapiError::InvalidInput(_))));

        let options = ExecuteOptions {
            api_version: 0,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(EapiError::InvalidInput(_))));
    }

    #[test]
    fn test_with_timeout_rounds_up() {
        let options = ExecuteOptions::default().with_timeout(Duration::from_micros(300));
        assert_eq!(options.timeout_ms, Some(1));
        assert!(options.validate().is_ok());

        let options = ExecuteOptions::default().with_timeout(Duration::from_millis(1500));
        assert_eq!(options.timeout_ms, Some(1500));
    }

    #[test]
    fn test_mixed_encoding_policy() {
        let commands = vec![
            Command::new("show version"),
            Command::new("show running-config").with_encoding(Encoding::Text),
        ];

        let options = ExecuteOptions::default();
        assert!(matches!(
            options.check_encodings(&commands),
            Err(EapiError::InvalidInput(_))
        ));

        let options = ExecuteOptions {
            mixed_encoding: MixedEncoding::UseBatchEncoding,
            ..Default::default()
        };
        assert!(options.check_encodings(&commands).is_ok());

        // Matching per-command encodings are fine either way
        assert!(ExecuteOptions::text().check_encodings(&commands[1..]).is_ok());
    }
}
