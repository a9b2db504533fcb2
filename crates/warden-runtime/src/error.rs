//! Envelope error taxonomy.

use warden_core::version::VersionError;

use crate::child::ChildStatus;

/// Errors surfaced by the envelope and its control link.
///
/// The first error that trips the stop gate is what
/// [`Envelope::serve`](crate::Envelope::serve) returns; later errors are
/// dropped.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Malformed node arguments or application config. Fatal before start.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The node process could not be launched.
    #[error("node start: {0}")]
    StartFailed(String),

    /// The node reported an incompatible deployer API version at init.
    #[error(transparent)]
    VersionMismatch(#[from] VersionError),

    /// Socket accept/connect/read/write failure. Recovered by connection
    /// retry during init only; fatal during steady state.
    #[error("transport: {0}")]
    Transport(String),

    /// The surrounding context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// An upcall handler reported an error. Transmitted to the node as the
    /// RPC error payload; never terminates the envelope.
    #[error("handler: {0}")]
    Handler(String),

    /// The node exited before `serve` returned.
    #[error("node exited: {0}")]
    ChildExited(ChildStatus),

    /// Operation attempted on an envelope that has already shut down.
    #[error("envelope is closed")]
    Closed,
}

impl EnvelopeError {
    /// Build a [`EnvelopeError::Transport`] from any error-like value.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}
