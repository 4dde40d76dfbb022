//! Sentinel error vocabulary used by every wayline transport crate.
//!
//! The spec requires that closure, size, unreachable-port and
//! unsupported-operation failures stay identifiable by a stable sentinel
//! even after they have been wrapped with call-site context. We get that
//! by keeping a small `Copy` [`ErrorKind`] alongside a `thiserror`-derived
//! [`WaylineError`] rather than relying on downcasting a `Box<dyn Error>`.

use std::fmt;
use std::io;

/// The portable error sentinels named in the spec (§3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// I/O attempted after the owning object was closed.
    Closed,
    /// A payload exceeded a hard size limit (e.g. device MTU).
    MsgSize,
    /// A destination the active proxy cannot reach (e.g. non-DNS UDP port
    /// sent to the DNS-truncation fallback).
    PortUnreachable,
    /// An operation the active proxy declines to perform.
    Unsupported,
    /// Anything else — wraps an underlying I/O or protocol failure.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Closed => "closed",
            ErrorKind::MsgSize => "message too large",
            ErrorKind::PortUnreachable => "port unreachable",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// A context-carrying error that remains identifiable by [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {context}")]
pub struct WaylineError {
    kind: ErrorKind,
    context: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl WaylineError {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The stable sentinel this error carries. Callers should branch on
    /// this rather than attempting to downcast `source()`.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.kind == ErrorKind::Closed
    }

    pub fn closed(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Closed, context)
    }

    pub fn msg_size(len: usize, limit: usize) -> Self {
        Self::new(
            ErrorKind::MsgSize,
            format!("payload of {len} bytes exceeds limit of {limit} bytes"),
        )
    }

    pub fn port_unreachable(port: u16) -> Self {
        Self::new(
            ErrorKind::PortUnreachable,
            format!("destination port {port} is not reachable by the active proxy"),
        )
    }

    pub fn unsupported(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, context)
    }

    pub fn invalid_message(len: usize) -> Self {
        Self::new(
            ErrorKind::Other,
            format!("invalid DNS message of length {len}, need at least 12 bytes"),
        )
    }
}

impl From<io::Error> for WaylineError {
    fn from(err: io::Error) -> Self {
        let kind = if err.kind() == io::ErrorKind::NotConnected
            || err.kind() == io::ErrorKind::BrokenPipe
        {
            ErrorKind::Closed
        } else {
            ErrorKind::Other
        };
        let context = err.to_string();
        Self::with_source(kind, context, err)
    }
}

pub type Result<T> = std::result::Result<T, WaylineError>;
