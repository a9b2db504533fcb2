//! Protocol error types.

/// Maximum frame size accepted on a control-link connection (16 MiB).
///
/// The limit bounds allocation on both endpoints: a length prefix larger
/// than this is rejected before any buffer is reserved.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced by the control-link transport and codec.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A frame exceeded the maximum allowed size.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Size declared or observed for the offending frame.
        size: usize,
        /// Maximum size the codec accepts.
        max: usize,
    },

    /// Underlying socket I/O failed.
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A frame payload did not decode as the expected message.
    #[error("malformed message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The peer closed the connection mid-exchange.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Build a [`ProtocolError::FrameTooLarge`] for a declared frame length.
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }
}
