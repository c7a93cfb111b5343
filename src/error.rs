//! Caller-visible error kinds.

use thiserror::Error;

/// One `(exception class, message)` pair from a server error response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorEntry {
    pub class: String,
    pub message: String,
}

/// Errors surfaced to callers of a [`crate::Client`].
///
/// Wire-format errors are per-call and leave the session running;
/// `Transport` (and a failed schema fetch) tear the session down.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DriverError {
    #[error("session is closed")]
    Closed,

    #[error("call deadline elapsed")]
    Timeout,

    #[error("operation {op} is not valid on a {scope} session")]
    WrongScope { op: &'static str, scope: &'static str },

    #[error("server protocol {server} is below the supported minimum {minimum}")]
    UnsupportedProtocol { server: i16, minimum: i16 },

    #[error("authentication rejected: {class}: {message}")]
    AuthFailed { class: String, message: String },

    #[error("server error: {}", format_entries(.0))]
    ServerError(Vec<ErrorEntry>),

    #[error("record references unknown global property id {0}")]
    UnknownPropertyId(u32),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("transport: {0}")]
    Transport(String),
}

impl DriverError {
    pub(crate) fn transport(err: &std::io::Error) -> Self {
        DriverError::Transport(err.to_string())
    }
}

fn format_entries(entries: &[ErrorEntry]) -> String {
    if entries.is_empty() {
        return "(no detail)".to_string();
    }
    entries
        .iter()
        .map(|e| format!("{}: {}", e.class, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}
