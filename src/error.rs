//! Error types for the DAN client
//!
//! Lifecycle operations (`register`, `deregister`, `push`) only ever surface
//! [`RegistrationError`]. The remaining types stay inside the crate's seams:
//! pool lookups, the transport adapter, the control-channel parser and the
//! configuration loader.

use thiserror::Error;

/// Failures of the registration lifecycle
///
/// Every variant is either a caller-fixable precondition or a rejection by
/// the remote side. None of them are swallowed by the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// `register` was called while a transport connection is still held
    #[error("already registered")]
    AlreadyRegistered,

    /// `deregister` or `push` was called without a live session
    #[error("not registered")]
    NotRegistered,

    /// The server URL is empty
    #[error("invalid url")]
    InvalidUrl,

    /// The caller supplied a device id that is not a UUID
    #[error("invalid id: {0:?}")]
    InvalidId(String),

    /// The server answered with a non-200 status
    ///
    /// Carries the `reason` field of the response body.
    #[error("{0}")]
    Rejected(String),

    /// The HTTP request never reached the server (DNS, refused, timeout)
    #[error("connection error")]
    Connection,

    /// The pub/sub transport could not be opened or failed before the
    /// device became ready
    #[error("transport error: {0}")]
    Transport(String),

    /// A device feature was built with an empty name
    #[error("invalid device feature: {0}")]
    InvalidFeature(String),

    /// A handler or producer slot was assigned nothing
    #[error("<{0}>: function not found")]
    MissingHandler(String),
}

/// Channel pool lookup failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("feature not found: {0}")]
    NotFound(String),
}

/// Errors reported by a [`crate::transport::Transport`] implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection could not be established
    #[error("connect failed: {0}")]
    Connect(String),

    /// A request could not be handed to the transport
    #[error("request failed: {0}")]
    Request(String),

    /// The transport went away before confirming a request
    #[error("delivery confirmation dropped")]
    Dropped,
}

/// Protocol violations on the control channel
///
/// These never leave the delivery task; they are turned into error replies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("malformed command: {0}")]
    Malformed(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("command carries neither idf nor odf")]
    MissingFeature,

    #[error("command carries both idf and odf")]
    AmbiguousFeature,

    #[error("CONNECT without topic")]
    MissingTopic,

    #[error("{0}")]
    Pool(#[from] PoolError),

    #[error("{0}")]
    Transport(#[from] TransportError),
}

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

impl From<TransportError> for RegistrationError {
    fn from(err: TransportError) -> Self {
        RegistrationError::Transport(err.to_string())
    }
}
