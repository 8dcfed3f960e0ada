//! Error types and result handling for edgefront.

use std::fmt;

/// Main error type for edgefront operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// A peer was registered with a blank identifier
    InvalidPeer { reason: String },
    /// Configuration carries no usable backend address
    NoProxy,
    /// TLS mode is active but no domain is configured
    NoDomains,
    /// No route prefix matches the request path
    NoRoute { path: String },
    /// The matched route currently has no live backends
    NoLiveBackends { prefix: String },
    /// A probe or forward failed at the network layer
    Transport {
        message: String,
        kind: TransportErrorKind,
    },
    /// Close was called on an already-closed confirmation
    AlreadyClosed,
    /// Configuration related errors
    Config { message: String },
    /// Listener setup or accept-loop errors
    Listener { message: String },
    /// Internal system errors
    Internal { message: String },
}

/// The failure classes a probe or upstream forward can produce.
///
/// Any of these on a probe takes the backend out of rotation until a
/// later cycle reaches it again; an HTTP status, however unfriendly,
/// never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The endpoint could not be reached at all: refused, reset, or
    /// the host never resolved.
    Unreachable,
    /// The per-request deadline elapsed before a response arrived.
    Timeout,
    /// The endpoint accepted the connection but the HTTP exchange
    /// broke down mid-flight.
    Protocol,
}

impl Error {
    /// Create an invalid-peer error
    pub fn invalid_peer<S: Into<String>>(reason: S) -> Self {
        Self::InvalidPeer {
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S, kind: TransportErrorKind) -> Self {
        Self::Transport {
            message: message.into(),
            kind,
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a listener error
    pub fn listener<S: Into<String>>(message: S) -> Self {
        Self::Listener {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this is a transport error
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Check if this is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::NoProxy | Self::NoDomains)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPeer { reason } => {
                write!(f, "invalid peer: {}", reason)
            }
            Self::NoProxy => {
                write!(f, "expecting at least one non-empty proxy server address")
            }
            Self::NoDomains => {
                write!(f, "expecting at least one non-empty domain")
            }
            Self::NoRoute { path } => {
                write!(f, "no route matches path {:?}", path)
            }
            Self::NoLiveBackends { prefix } => {
                write!(f, "no live backends for route {:?}", prefix)
            }
            Self::Transport { message, kind } => {
                write!(f, "transport failure, {}: {}", kind, message)
            }
            Self::AlreadyClosed => {
                write!(f, "already closed")
            }
            Self::Config { message } => {
                write!(f, "configuration error: {}", message)
            }
            Self::Listener { message } => {
                write!(f, "listener error: {}", message)
            }
            Self::Internal { message } => {
                write!(f, "internal error: {}", message)
            }
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unreachable => "backend unreachable",
            Self::Timeout => "deadline elapsed",
            Self::Protocol => "exchange broke down",
        };
        f.write_str(label)
    }
}

impl std::error::Error for Error {}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        // Everything the hyper client reports falls into one of the
        // three classes: the connect phase failed (which also covers
        // resolution), a timeout fired, or the wire exchange itself
        // went wrong.
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Unreachable
        } else {
            TransportErrorKind::Protocol
        };
        Self::transport(err.to_string(), kind)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON encoding failed: {}", err))
    }
}

impl From<hyper::http::Error> for Error {
    fn from(err: hyper::http::Error) -> Self {
        Self::internal(format!("request construction failed: {}", err))
    }
}

/// Result type alias for edgefront operations.
pub type Result<T> = std::result::Result<T, Error>;
