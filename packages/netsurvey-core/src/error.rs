//! Probe error taxonomy.
//!
//! Per-target failures never leave a step. They are rendered through
//! [`ProbeError::describe`] into the `Error: ...` diagnostics stored in service
//! descriptions and step logs, which later steps use to decide what to re-probe.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while probing a single target.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The operation did not finish within its deadline
    #[error("Timeout {operation} after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The remote end actively refused the connection
    #[error("Connection refused")]
    ConnectionRefused,

    /// The remote end accepted the request but sent nothing back
    #[error("No response")]
    NoResponse,

    /// TLS handshake or session failure
    #[error("TLS failure: {0}")]
    Tls(String),

    /// The response did not match the expected wire format
    #[error("Malformed response: {0}")]
    Protocol(String),

    /// An external system command could not be run
    #[error("Command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        ProbeError::Timeout { operation, after }
    }

    /// Map a connect error, keeping refusals distinct from other I/O failures.
    pub fn from_connect(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::ConnectionRefused {
            ProbeError::ConnectionRefused
        } else {
            ProbeError::Io(err)
        }
    }

    /// Render the diagnostic stored in descriptions and logs.
    pub fn describe(&self, context: &str) -> String {
        format!("Error: {}: {}", context, self)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout { .. })
    }
}

/// True when a description is a diagnostic left by a failed probe.
pub fn is_error_text(text: &str) -> bool {
    text.trim_start()
        .get(..5)
        .is_some_and(|head| head.eq_ignore_ascii_case("error"))
}
