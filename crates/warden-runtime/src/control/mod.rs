//! The control link.
//!
//! Two logical endpoints share the wire stack from
//! [`warden_core::protocol`]:
//!
//! - the **node-control stub** ([`client::ControlClient`]): calls the
//!   envelope issues toward the node, over a client connection to the
//!   node's control socket;
//! - the **deployer-control server** (`server`, crate-internal): calls the
//!   node issues back, served on the envelope's own socket and dispatched
//!   to the deployer's [`EnvelopeHandler`](crate::EnvelopeHandler).

pub mod client;
pub(crate) mod server;
