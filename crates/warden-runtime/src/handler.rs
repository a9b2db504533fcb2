//! The deployer's handler contract.
//!
//! An [`EnvelopeHandler`] receives every upcall a node issues over its
//! deployer-control handle. The envelope invokes the handler re-entrantly
//! from multiple tasks, so implementations must be internally thread-safe.
//! Values passed to a handler are only valid for the duration of the call.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use warden_core::protocol::messages::{
    ActivateComponentReply, ActivateComponentRequest, ExportListenerReply, ExportListenerRequest,
    GetListenerAddressReply, GetListenerAddressRequest, GetSelfCertificateReply,
    GetSelfCertificateRequest, LogBatch, TraceSpans, VerifyClientCertificateReply,
    VerifyClientCertificateRequest, VerifyServerCertificateReply, VerifyServerCertificateRequest,
};

/// Per-call context handed to handler methods.
///
/// The context fires when the call's deadline expires or when the envelope
/// drains; long-running handler work should watch it and bail out.
#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: CancellationToken,
}

impl CallContext {
    /// Build a context over the given cancellation scope.
    #[must_use]
    pub const fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// The cancellation scope of this call.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Completes when the call is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Returns true if the call has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Error returned from a handler upcall.
///
/// Handler errors travel back to the node as the RPC error payload; they
/// never terminate the envelope.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// The named entity is unknown to the deployer.
    #[error("not found: {0}")]
    NotFound(String),

    /// The deployer's policy does not permit the request.
    #[error("permission denied: {0}")]
    Denied(String),

    /// The deployer could not satisfy the request right now.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The caller's identity could not be verified.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Any other handler failure.
    #[error("{0}")]
    Other(String),
}

/// Upcalls a node may issue toward its deployer.
///
/// The three certificate methods are only invoked when the node was
/// launched with mTLS enabled; a node that honors its side of the contract
/// never issues them otherwise.
///
/// Telemetry ingestion (`log_batch`, `handle_trace_spans`) must not be
/// load-bearing: a deployer should drop records it cannot store rather
/// than fail the call, because telemetry must not crash the node's
/// supervisor. Captured stdio records carry `time_micros == 0`; the
/// deployer stamps arrival time.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Ensure the requested component is running somewhere, and note the
    /// caller's interest in routing updates for it.
    async fn activate_component(
        &self,
        cx: &CallContext,
        req: ActivateComponentRequest,
    ) -> Result<ActivateComponentReply, HandlerError>;

    /// Return the address the node should bind for a named listener.
    async fn get_listener_address(
        &self,
        cx: &CallContext,
        req: GetListenerAddressRequest,
    ) -> Result<GetListenerAddressReply, HandlerError>;

    /// Register the address the node bound for a listener, optionally
    /// starting a proxy that forwards traffic to it.
    async fn export_listener(
        &self,
        cx: &CallContext,
        req: ExportListenerRequest,
    ) -> Result<ExportListenerReply, HandlerError>;

    /// Return the certificate chain and private key the node should use
    /// for connection establishment.
    async fn get_self_certificate(
        &self,
        cx: &CallContext,
        req: GetSelfCertificateRequest,
    ) -> Result<GetSelfCertificateReply, HandlerError>;

    /// Validate a connecting client's certificate chain and return the
    /// component paths it may invoke.
    async fn verify_client_certificate(
        &self,
        cx: &CallContext,
        req: VerifyClientCertificateRequest,
    ) -> Result<VerifyClientCertificateReply, HandlerError>;

    /// Validate that a server's certificate chain matches the component
    /// identity the node meant to dial.
    async fn verify_server_certificate(
        &self,
        cx: &CallContext,
        req: VerifyServerCertificateRequest,
    ) -> Result<VerifyServerCertificateReply, HandlerError>;

    /// Accept a batch of log records.
    async fn log_batch(&self, cx: &CallContext, batch: LogBatch) -> Result<(), HandlerError>;

    /// Accept a batch of trace spans.
    async fn handle_trace_spans(
        &self,
        cx: &CallContext,
        spans: TraceSpans,
    ) -> Result<(), HandlerError>;
}
