//! Error types for connections, dispatch and command automatons.
//!
//! Every fallible operation in this crate returns [`ConnectError`]. Failures
//! classified by a command automaton while it parses remote output are carried
//! as a [`CommandFailure`] and surfaced to the caller when the result is read.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Coarse taxonomy used to reason about a failure without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The library was used incorrectly (e.g. no transport installed).
    Usage,
    /// An unregistered type/variant or an unknown named connection was requested.
    Lookup,
    /// Credentials were rejected or host-key verification was refused.
    Authentication,
    /// The remote tool reported a classified error banner.
    RemoteOperation,
    /// A terminal state was not reached before the caller's deadline.
    Timeout,
    /// Output matched no classifier where one was required.
    ProtocolViolation,
    /// The underlying byte channel failed.
    Transport,
    /// Configuration could not be read or was malformed.
    Config,
    /// Unexpected internal state.
    Internal,
}

/// Classification assigned by an automaton when it records a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Authentication,
    RemoteOperation,
    ProtocolViolation,
    Usage,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Authentication => "authentication",
            FailureKind::RemoteOperation => "remote operation",
            FailureKind::ProtocolViolation => "protocol violation",
            FailureKind::Usage => "usage",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// A failure recorded by a command automaton.
///
/// `command` identifies the originating automaton by the command line it
/// issued, which is what a caller needs to correlate the failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("command '{command}' failed ({kind}) with {message}")]
pub struct CommandFailure {
    pub kind: FailureKind,
    pub command: String,
    pub message: String,
}

/// Errors that can occur while building connections, sending data or running commands.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The connection or automaton was used in a way the library does not support.
    ///
    /// The most common cause is sending on a connection that never had an
    /// outgoing transport callback installed.
    #[error("wrong usage: {0}")]
    WrongUsage(String),

    /// No constructor is registered for the requested type/variant pair.
    #[error("no constructor registered for [({io_type}, {variant})] connection")]
    NoConstructorRegistered { io_type: String, variant: String },

    /// The named connection is absent from the loaded configuration.
    #[error("connection named '{0}' was not defined inside configuration")]
    UnknownNamedConnection(String),

    /// Neither the request nor the configuration selected a variant.
    #[error("no variant selected (directly or via configuration) for '{0}' connection")]
    NoVariantSelected(String),

    /// The selected variant has no registered constructor for the io type.
    #[error("'{variant}' variant of '{io_type}' connection is not registered inside connection factory")]
    VariantNotRegistered { io_type: String, variant: String },

    /// A command automaton recorded a classified failure.
    #[error(transparent)]
    CommandFailure(#[from] CommandFailure),

    /// The command did not reach a terminal state before the deadline.
    ///
    /// Contains the result lines accumulated before the timeout.
    #[error("command '{command}' timeout after {timeout:?}, partial result: {partial:?}")]
    CommandTimeout {
        command: String,
        timeout: Duration,
        partial: Vec<String>,
    },

    /// The command result was requested before a terminal state was reached.
    #[error("result not available yet for '{0}'")]
    ResultNotAvailableYet(String),

    /// The transport channel was disconnected.
    #[error("channel disconnected")]
    ChannelDisconnectError,

    /// The transport is closed or was never opened.
    #[error("connect closed")]
    ConnectClosedError,

    /// Configuration could not be parsed or is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A recorded transcript could not be replayed.
    #[error("replay mismatch: {0}")]
    ReplayMismatchError(String),

    /// Internal invariant violation (lock poisoning, encode failures).
    #[error("internal error: {0}")]
    InternalServerError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),
}

impl ConnectError {
    /// Maps the error onto the coarse [`ErrorKind`] taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::WrongUsage(_) | ConnectError::ResultNotAvailableYet(_) => ErrorKind::Usage,
            ConnectError::NoConstructorRegistered { .. }
            | ConnectError::UnknownNamedConnection(_)
            | ConnectError::NoVariantSelected(_)
            | ConnectError::VariantNotRegistered { .. } => ErrorKind::Lookup,
            ConnectError::CommandFailure(failure) => match failure.kind {
                FailureKind::Authentication => ErrorKind::Authentication,
                FailureKind::RemoteOperation => ErrorKind::RemoteOperation,
                FailureKind::ProtocolViolation => ErrorKind::ProtocolViolation,
                FailureKind::Usage | FailureKind::Cancelled => ErrorKind::Usage,
            },
            ConnectError::CommandTimeout { .. } => ErrorKind::Timeout,
            ConnectError::ChannelDisconnectError
            | ConnectError::ConnectClosedError
            | ConnectError::Io(_)
            | ConnectError::Ssh2Error(_)
            | ConnectError::RusshError(_) => ErrorKind::Transport,
            ConnectError::InvalidConfig(_) | ConnectError::Json(_) => ErrorKind::Config,
            ConnectError::ReplayMismatchError(_) | ConnectError::InternalServerError(_) => {
                ErrorKind::Internal
            }
        }
    }
}
