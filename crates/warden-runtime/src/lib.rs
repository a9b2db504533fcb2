//! # warden-runtime
//!
//! The envelope: a sidecar-style supervisor that launches a single
//! application node as a child process, keeps a bidirectional control link
//! with it over Unix-domain sockets, and mediates every interaction between
//! the node and its deployment environment.
//!
//! A deployer constructs an [`Envelope`] per node, implements
//! [`EnvelopeHandler`] for the upcalls the node may issue, and drives the
//! envelope with [`Envelope::serve`]:
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use tokio_util::sync::CancellationToken;
//! # use warden_core::protocol::messages::{AppConfig, NodeArgs};
//! # use warden_runtime::{Envelope, EnvelopeHandler, Options};
//! # async fn run(args: NodeArgs, config: AppConfig, handler: Arc<dyn EnvelopeHandler>)
//! # -> anyhow::Result<()> {
//! let cancel = CancellationToken::new();
//! let envelope = Envelope::new(&cancel, args, config, Options::default()).await?;
//! envelope.serve(handler).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod child;
pub mod control;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod workdir;

pub use child::{Child, ChildStatus, InProcessChild, ProcessChild};
pub use control::client::ControlClient;
pub use envelope::{Envelope, Options};
pub use error::EnvelopeError;
pub use handler::{CallContext, EnvelopeHandler, HandlerError};
