//! Control-link wire protocol.
//!
//! Both control endpoints (node-control and deployer-control) share one
//! transport stack:
//!
//! ```text
//! +------------------------------------------+
//! |          Control messages                |  prost (messages)
//! +------------------------------------------+
//! |          Call envelope                   |  CallRequest / CallResponse
//! +------------------------------------------+
//! |          Framing                         |  length-prefixed
//! +------------------------------------------+
//! |          UDS transport                   |  Unix socket
//! +------------------------------------------+
//! ```
//!
//! Frames are connection-oriented and ordered per connection. Multiple calls
//! may be in flight at once, correlated by a monotonically increasing request
//! id carried in the call envelope.

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{MAX_FRAME_SIZE, ProtocolError, ProtocolResult};
pub use framing::FrameCodec;
