//! 💀 Error taxonomy for the write path.
//!
//! Three flavors of bad news:
//! - [`WriteError`]: what `write(chunk)` hands back to the host. The host's
//!   retry/backoff machinery reads `is_retryable()` and acts accordingly.
//! - [`RoutingError`]: a single record could not be turned into a bulk action.
//!   Always local. Goes to the error-event sink, the chunk keeps going.
//! - [`TransportErrorKind`]: the closed classification of a failed HTTP
//!   exchange. Computed once per failure, matched against `ignore_exceptions`.
//!
//! Startup, config and file plumbing use `anyhow` with context. The typed
//! errors live here because the host needs to branch on them. 🦆

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::output::config::WriteOperation;

/// 🚨 The typed failure of one `write(chunk)` call.
#[derive(Debug, Error)]
pub enum WriteError {
    /// 🔄 Transport failure, timeout, malformed response. Retry the whole chunk later.
    #[error("could not push logs to the cluster ({hosts}): {message}")]
    Recoverable { hosts: String, message: String },

    /// 🛑 Do not retry. A per-item error type was configured unrecoverable, or an
    /// ignorable exception was escalated after (optional) backup.
    #[error("unrecoverable request failure: {0}")]
    Unrecoverable(String),

    /// 🪣 The host buffer had no room for the reconstructed retry stream.
    #[error("failed to emit retry stream: buffer is full")]
    RetryStreamOverflow,

    /// 📡 A bounded retry (template install, version detection) ran out of attempts
    /// and was configured to be fatal.
    #[error("could not communicate with the cluster after {attempts} retries: {message}")]
    ConnectionFailure { attempts: u32, message: String },
}

impl WriteError {
    /// 🔄 Whether the host should schedule this chunk for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteError::Recoverable { .. } | WriteError::ConnectionFailure { .. })
    }
}

/// 🧭 A record refused to be routed. One bad record never aborts the chunk.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("missing '_id' field, write operation is {0}")]
    MissingId(WriteOperation),

    #[error("failed to serialize bulk action: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to parse time value '{value}': {reason}")]
    TimeParse { value: String, reason: String },

    #[error("invalid date format '{0}' for the index name")]
    DateFormat(String),
}

/// 📡 Closed classification of a failed exchange with the cluster.
///
/// The snake_case names are also the registry accepted by `ignore_exceptions`,
/// validated once at config time. Unknown names never reach runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// 🔌 TCP connect refused, DNS failure, TLS handshake gone sideways.
    Connect,
    /// ⏱️ The request timed out. Surfaced as recoverable, per contract.
    Timeout,
    /// 🔥 5xx and 429 from the cluster.
    ServerError,
    /// 🙅 4xx other than 429.
    ClientError,
    /// 🧩 The response body was not the JSON shape we expected.
    Decode,
    /// 🤷 Anything else reqwest had to say.
    Request,
}

impl TransportErrorKind {
    pub const ALL: [TransportErrorKind; 6] = [
        TransportErrorKind::Connect,
        TransportErrorKind::Timeout,
        TransportErrorKind::ServerError,
        TransportErrorKind::ClientError,
        TransportErrorKind::Decode,
        TransportErrorKind::Request,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::ServerError => "server_error",
            TransportErrorKind::ClientError => "client_error",
            TransportErrorKind::Decode => "decode",
            TransportErrorKind::Request => "request",
        }
    }

    /// 🔍 Registry lookup by configured name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// 🏷️ Classify a reqwest failure. Evaluated once, never re-dispatched.
    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_decode() {
            TransportErrorKind::Decode
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16())
        } else {
            TransportErrorKind::Request
        }
    }

    pub fn from_status(status: u16) -> Self {
        if status == 429 || status >= 500 {
            TransportErrorKind::ServerError
        } else {
            TransportErrorKind::ClientError
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 📡 A failed exchange: its kind plus a human-readable story for the logs.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportFailure {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportFailure {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = TransportErrorKind::classify(&err);
        Self::new(kind, err.to_string())
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        Self::new(TransportErrorKind::from_status(status), format!("HTTP {status}: {body}"))
    }
}
