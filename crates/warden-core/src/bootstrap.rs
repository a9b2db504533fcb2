//! Node bootstrap: the environment-variable handoff.
//!
//! A subprocess node receives its [`NodeArgs`] through the `NODE_ARGS`
//! environment variable as a length-prefixed, base64-encoded message. The
//! node must reject a malformed value with a fatal error before serving any
//! RPC.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use prost::Message;

use crate::protocol::messages::NodeArgs;

/// Environment variable that carries the encoded [`NodeArgs`] into a node
/// started by an envelope.
pub const NODE_ARGS_ENV: &str = "NODE_ARGS";

/// Errors produced while decoding or validating bootstrap information.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The environment value was not valid base64.
    #[error("node args: invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The decoded bytes were shorter than the length prefix requires.
    #[error("node args: truncated message: have {have} bytes, need {need}")]
    Truncated {
        /// Bytes available after the prefix.
        have: usize,
        /// Bytes the prefix declared.
        need: usize,
    },

    /// Bytes were left over after the declared message.
    #[error("node args: {0} trailing bytes after message")]
    TrailingBytes(usize),

    /// The message bytes did not decode as [`NodeArgs`].
    #[error("node args: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The decoded [`NodeArgs`] failed validation.
    #[error("node args: missing {0}")]
    MissingField(&'static str),
}

/// Encode node arguments for the `NODE_ARGS` environment variable.
#[must_use]
pub fn to_env(args: &NodeArgs) -> String {
    let body = args.encode_to_vec();
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&u32::try_from(body.len()).expect("node args exceed u32").to_be_bytes());
    framed.extend_from_slice(&body);
    STANDARD.encode(framed)
}

/// Decode node arguments from a `NODE_ARGS` environment value.
///
/// The decode is strict: bad base64, a truncated body, and trailing bytes
/// are all rejected, and the result is validated with [`check_node_args`].
///
/// # Errors
///
/// Returns [`BootstrapError`] describing the first defect found.
pub fn from_env(value: &str) -> Result<NodeArgs, BootstrapError> {
    let framed = STANDARD.decode(value)?;
    if framed.len() < 4 {
        return Err(BootstrapError::Truncated {
            have: framed.len(),
            need: 4,
        });
    }
    let declared = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
    let body = &framed[4..];
    if body.len() < declared {
        return Err(BootstrapError::Truncated {
            have: body.len(),
            need: declared,
        });
    }
    if body.len() > declared {
        return Err(BootstrapError::TrailingBytes(body.len() - declared));
    }
    let args = NodeArgs::decode(body)?;
    check_node_args(&args)?;
    Ok(args)
}

/// Check that [`NodeArgs`] satisfies its field invariants: every string
/// field except redirect entries must be non-empty.
///
/// # Errors
///
/// Returns [`BootstrapError::MissingField`] naming the first empty field.
pub fn check_node_args(args: &NodeArgs) -> Result<(), BootstrapError> {
    if args.app.is_empty() {
        return Err(BootstrapError::MissingField("app name"));
    }
    if args.deployment_id.is_empty() {
        return Err(BootstrapError::MissingField("deployment id"));
    }
    if args.node_id.is_empty() {
        return Err(BootstrapError::MissingField("node id"));
    }
    if args.control_socket.is_empty() {
        return Err(BootstrapError::MissingField("control socket"));
    }
    Ok(())
}

/// Bootstrap information for a starting node process.
#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    /// Arguments supplied by the supervising envelope, if any.
    pub args: Option<NodeArgs>,
}

impl Bootstrap {
    /// Read bootstrap information from the process environment.
    ///
    /// An absent `NODE_ARGS` variable is not an error; it means the process
    /// was not started by an envelope (single-process execution).
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if the variable is present but malformed.
    pub fn from_process_env() -> Result<Self, BootstrapError> {
        match std::env::var(NODE_ARGS_ENV) {
            Ok(value) if !value.is_empty() => Ok(Self {
                args: Some(from_env(&value)?),
            }),
            _ => Ok(Self::default()),
        }
    }

    /// Returns true if the process was started by an envelope.
    #[must_use]
    pub const fn exists(&self) -> bool {
        self.args.is_some()
    }
}
