use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Transport verb of a transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    /// Only POST submissions are treated as non-idempotent
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Method::Post)
    }
}

/// A failed transfer attempt
#[derive(Debug, Error)]
#[error("{error}")]
pub struct TransferFailure {
    #[source]
    pub error: io::Error,
    /// Whether the request had been fully written before the failure
    pub request_sent: bool,
}

impl TransferFailure {
    pub fn before_send(error: io::Error) -> Self {
        Self {
            error,
            request_sent: false,
        }
    }

    pub fn after_send(error: io::Error) -> Self {
        Self {
            error,
            request_sent: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Dropped connections, network switches, timeouts
    Always,
    /// Interruptions and handshake/data failures
    Never,
    /// Anything else: retry only if the request never fully went out
    IfUnsent,
}

impl RetryClass {
    pub fn of(error: &io::Error) -> Self {
        use io::ErrorKind::*;
        match error.kind() {
            ConnectionReset | ConnectionAborted | UnexpectedEof | NotConnected
            | HostUnreachable | NetworkUnreachable | TimedOut => RetryClass::Always,
            Interrupted | InvalidData => RetryClass::Never,
            _ => RetryClass::IfUnsent,
        }
    }
}

/// Exponential-backoff retry for upload/download transports
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide whether attempt number `attempt` (1-based) should be followed
    /// by another one.
    pub fn should_retry(&self, failure: &TransferFailure, attempt: u32, method: Method) -> bool {
        let retry = if attempt > self.max_retries {
            false
        } else {
            match RetryClass::of(&failure.error) {
                RetryClass::Always => true,
                RetryClass::Never => false,
                RetryClass::IfUnsent => !failure.request_sent,
            }
        };

        retry && method.is_idempotent()
    }

    /// Delay before the attempt following `attempt`: 2^attempt seconds
    pub fn backoff(attempt: u32) -> Duration {
        Duration::from_secs(1u64 << attempt.min(16))
    }

    /// Run `op` until it succeeds or the policy gives up. `op` receives the
    /// 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, method: Method, mut op: F) -> Result<T, TransferFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransferFailure>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    if !self.should_retry(&failure, attempt, method) {
                        tracing::warn!(
                            "Giving up on {:?} after {} attempt(s): {}",
                            method,
                            attempt,
                            failure
                        );
                        return Err(failure);
                    }

                    let delay = Self::backoff(attempt);
                    tracing::warn!(
                        "Attempt {} of {:?} failed ({}), retrying in {:?}",
                        attempt,
                        method,
                        failure,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
