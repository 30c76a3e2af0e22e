//! Command pipeline: one `runCmds` call from commands to batch outcome

use bytes::Bytes;
use eapi_shared::codec::{self, BatchRequest, Decoded, Expected, Reply};
use eapi_shared::{defaults, BatchOutcome, Command};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::debug;
use uuid::Uuid;

use super::{CallEvent, CancelSignal, EventSink, ExecuteOptions, RetryPolicy, TracingSink};
use crate::connection::ConnectionManager;
use crate::error::{EapiError, Result};
use crate::transport::Endpoint;

/// Overall budget for one call
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn exceeded(&self, endpoint: &Endpoint) -> EapiError {
        EapiError::Timeout {
            endpoint: endpoint.to_string(),
            after: self.budget,
        }
    }
}

/// Resolves at the deadline, or never without one
async fn until(deadline: Option<Deadline>) -> Deadline {
    match deadline {
        Some(deadline) => {
            sleep_until(deadline.at).await;
            deadline
        }
        None => futures::future::pending().await,
    }
}

/// Executes command batches against devices
///
/// Safe to share between tasks; calls only contend on the connection pool.
pub struct CommandPipeline {
    manager: Arc<ConnectionManager>,
    retry: RetryPolicy,
    sink: Arc<dyn EventSink>,
    enable_secret: Option<String>,
}

impl CommandPipeline {
    pub fn new(manager: Arc<ConnectionManager>, retry: RetryPolicy) -> Self {
        Self {
            manager,
            retry,
            sink: Arc::new(TracingSink),
            enable_secret: None,
        }
    }

    /// Replace the default tracing sink
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Secret sent as input to the prepended `enable`
    pub fn with_enable_secret(mut self, secret: impl Into<String>) -> Self {
        self.enable_secret = Some(secret.into());
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Run `commands` on `endpoint` as one batch
    ///
    /// A command rejected by the device is reported inside
    /// [`BatchOutcome::Failed`]; `Err` means no outcome is known.
    pub async fn execute(
        &self,
        endpoint: &Endpoint,
        commands: Vec<Command>,
        options: &ExecuteOptions,
    ) -> Result<BatchOutcome> {
        self.execute_with_cancel(endpoint, commands, options, &CancelSignal::new())
            .await
    }

    /// Like [`execute`](Self::execute), stopping early once `cancel` fires
    pub async fn execute_with_cancel(
        &self,
        endpoint: &Endpoint,
        commands: Vec<Command>,
        options: &ExecuteOptions,
        cancel: &CancelSignal,
    ) -> Result<BatchOutcome> {
        options.validate()?;
        if commands.is_empty() {
            return Err(EapiError::InvalidInput(
                "at least one command is required".into(),
            ));
        }
        options.check_encodings(&commands)?;

        let mut batch = Vec::with_capacity(commands.len() + 1);
        if options.send_enable {
            batch.push(match &self.enable_secret {
                Some(secret) => Command::with_input(defaults::ENABLE_COMMAND, secret.as_str()),
                None => Command::new(defaults::ENABLE_COMMAND),
            });
        }
        batch.extend(commands);

        let correlation_id = Uuid::new_v4().to_string();
        let request = BatchRequest {
            commands: batch,
            encoding: options.encoding,
            api_version: options.api_version,
            auto_complete: options.auto_complete,
            expand_aliases: options.expand_aliases,
            streaming: options.streaming,
            correlation_id: correlation_id.clone(),
        };
        let body = codec::encode(&request)?;
        let expected = Expected::from(&request);
        debug!(
            %correlation_id,
            request = %codec::sanitize(&body),
            "Encoded request"
        );

        self.sink.record(&CallEvent::Started {
            correlation_id: correlation_id.clone(),
            endpoint: endpoint.to_string(),
            commands: request.commands.len(),
        });

        let deadline = options.timeout().map(|budget| Deadline {
            at: Instant::now() + budget,
            budget,
        });

        let (dispatched, attempts) = self
            .dispatch(endpoint, &body, &expected, &correlation_id, deadline, cancel)
            .await;
        let result = dispatched.and_then(|decoded| {
            self.interpret(decoded, options.send_enable, &correlation_id)
        });

        let event = match &result {
            Ok(outcome) => CallEvent::Completed {
                correlation_id,
                attempts,
                failed_at: outcome.failure().map(|failure| failure.index),
            },
            Err(EapiError::Cancelled) => CallEvent::Cancelled {
                correlation_id,
                attempts,
            },
            Err(e) => CallEvent::Failed {
                correlation_id,
                attempts,
                error: e.to_string(),
            },
        };
        self.sink.record(&event);

        result
    }

    /// Attempt the exchange until it succeeds, fails for good, or runs out of attempts
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        body: &Bytes,
        expected: &Expected,
        correlation_id: &str,
        deadline: Option<Deadline>,
        cancel: &CancelSignal,
    ) -> (Result<Decoded>, u32) {
        let max_attempts = self.retry.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.attempt(endpoint, body, expected, deadline, cancel).await {
                Ok(decoded) => return (Ok(decoded), attempt),
                Err(e) => e,
            };

            let expired = deadline.map_or(false, |d| Instant::now() >= d.at);
            let retry_in = (err.is_retryable() && attempt < max_attempts && !expired)
                .then(|| self.retry.backoff_for(attempt));
            self.sink.record(&CallEvent::AttemptFailed {
                correlation_id: correlation_id.to_string(),
                attempt,
                error: err.to_string(),
                retry_in,
            });

            let Some(delay) = retry_in else {
                return (Err(err), attempt);
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return (Err(EapiError::Cancelled), attempt),
                expired = until(deadline) => return (Err(expired.exceeded(endpoint)), attempt),
                _ = sleep(delay) => {}
            }
        }
    }

    /// One acquire, send, decode, release cycle
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        body: &Bytes,
        expected: &Expected,
        deadline: Option<Deadline>,
        cancel: &CancelSignal,
    ) -> Result<Decoded> {
        let mut handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EapiError::Cancelled),
            expired = until(deadline) => return Err(expired.exceeded(endpoint)),
            acquired = self.manager.acquire(endpoint) => acquired?,
        };

        let exchanged = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EapiError::Cancelled),
            expired = until(deadline) => Err(expired.exceeded(endpoint)),
            sent = handle.send(body) => sent.map_err(|e| EapiError::transport(endpoint, e)),
        };

        // Decoding is pure, so it happens before the handle goes back
        let decoded = exchanged
            .and_then(|response| codec::decode(&response, expected).map_err(EapiError::from));

        if let Err(e) = &decoded {
            if e.breaks_connection() {
                self.manager.mark_broken(&mut handle, &e.to_string());
            }
        }
        self.manager.release(handle).await;

        decoded
    }

    fn interpret(
        &self,
        decoded: Decoded,
        enable_prefixed: bool,
        correlation_id: &str,
    ) -> Result<BatchOutcome> {
        for anomaly in decoded.anomalies {
            self.sink.record(&CallEvent::Anomaly {
                correlation_id: correlation_id.to_string(),
                anomaly,
            });
        }

        let outcome = match decoded.reply {
            Reply::Batch(outcome) => outcome,
            Reply::Rejected { code, message } => return Err(EapiError::Rpc { code, message }),
        };

        if enable_prefixed {
            strip_enable(outcome)
        } else {
            Ok(outcome)
        }
    }
}

/// Remove the prepended `enable` so indices line up with the caller's commands
fn strip_enable(outcome: BatchOutcome) -> Result<BatchOutcome> {
    match outcome {
        BatchOutcome::Completed { mut results } => {
            if !results.is_empty() {
                results.remove(0);
            }
            Ok(BatchOutcome::Completed { results })
        }
        BatchOutcome::Failed { failure, .. } if failure.index == 0 => {
            Err(EapiError::EnableRejected {
                code: failure.code,
                message: failure.message,
            })
        }
        BatchOutcome::Failed {
            mut executed,
            mut failure,
        } => {
            executed.remove(0);
            failure.index -= 1;
            Ok(BatchOutcome::Failed { executed, failure })
        }
    }
}
