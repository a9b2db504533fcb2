//! Deployer-control server.
//!
//! Accepts connections from the node on the envelope's own socket and
//! dispatches every inbound call to the deployer's handler. Requests on one
//! connection are handled serially in the order they are received, so the
//! handler observes FIFO dispatch per connection and responses go out in
//! request-id order. The node may reconnect at any time; a disconnect is a
//! normal transport event, not a reason to stop serving.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warden_core::control::{DEPLOYER_PATH, deployer};
use warden_core::protocol::FrameCodec;
use warden_core::protocol::messages::{
    ActivateComponentRequest, CallRequest, CallResponse, ExportListenerRequest,
    GetListenerAddressRequest, GetSelfCertificateRequest, LogBatch, TraceSpans,
    VerifyClientCertificateRequest, VerifyServerCertificateRequest, call_response,
};

use crate::error::EnvelopeError;
use crate::handler::{CallContext, EnvelopeHandler, HandlerError};

/// Serve deployer-control calls until the scope cancels.
///
/// Returns `Ok(())` on cancellation and `Err` only for a fatal accept
/// failure on the listening socket.
pub(crate) async fn serve_deployer_control(
    listener: UnixListener,
    cancel: CancellationToken,
    handler: Arc<dyn EnvelopeHandler>,
) -> Result<(), EnvelopeError> {
    let mut connections = JoinSet::new();
    let result = loop {
        tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        debug!("deployer-control connection accepted");
                        connections.spawn(handle_connection(
                            stream,
                            cancel.child_token(),
                            handler.clone(),
                        ));
                    }
                    Err(e) => break Err(EnvelopeError::transport(e)),
                }
            }
        }
    };
    // Connection tasks watch the same scope; let them drain.
    while connections.join_next().await.is_some() {}
    result
}

/// Handle one node connection: read calls, dispatch serially, respond.
async fn handle_connection(
    stream: UnixStream,
    cancel: CancellationToken,
    handler: Arc<dyn EnvelopeHandler>,
) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return,
            frame = framed.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                warn!(error = %e, "deployer-control connection failed");
                return;
            }
            // Normal disconnect; the node may reconnect later.
            None => return,
        };
        let request = match CallRequest::decode(&bytes[..]) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping connection with undecodable call");
                return;
            }
        };

        let id = request.id;
        let outcome = dispatch_call(&cancel, handler.as_ref(), request).await;
        let response = CallResponse {
            id,
            outcome: Some(outcome),
        };
        if framed
            .send(Bytes::from(response.encode_to_vec()))
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Dispatch one call, honoring its deadline and the connection scope.
async fn dispatch_call(
    cancel: &CancellationToken,
    handler: &dyn EnvelopeHandler,
    request: CallRequest,
) -> call_response::Outcome {
    if request.component != DEPLOYER_PATH {
        return call_response::Outcome::Error(format!(
            "unknown component '{}'",
            request.component
        ));
    }

    let cx = CallContext::new(cancel.child_token());
    let work = dispatch_method(handler, &cx, &request.method, &request.payload);

    let result = match remaining(request.deadline_micros) {
        Some(Ok(timeout)) => tokio::select! {
            () = cancel.cancelled() => Err(DispatchError::Cancelled),
            outcome = tokio::time::timeout(timeout, work) => {
                outcome.unwrap_or(Err(DispatchError::Cancelled))
            }
        },
        Some(Err(())) => Err(DispatchError::Cancelled), // Deadline already passed.
        None => tokio::select! {
            () = cancel.cancelled() => Err(DispatchError::Cancelled),
            outcome = work => outcome,
        },
    };

    match result {
        Ok(payload) => call_response::Outcome::Payload(payload),
        Err(e) => call_response::Outcome::Error(e.to_string()),
    }
}

/// Time left until an absolute epoch-microsecond deadline.
///
/// `None` means no deadline; `Some(Err(()))` means it already expired.
fn remaining(deadline_micros: i64) -> Option<Result<Duration, ()>> {
    if deadline_micros <= 0 {
        return None;
    }
    let deadline = UNIX_EPOCH + Duration::from_micros(deadline_micros.unsigned_abs());
    match deadline.duration_since(SystemTime::now()) {
        Ok(left) => Some(Ok(left)),
        Err(_) => Some(Err(())),
    }
}

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Handler(#[from] HandlerError),
    #[error("malformed {method} request: {source}")]
    Decode {
        method: &'static str,
        source: prost::DecodeError,
    },
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
}

fn decode<M: Message + Default>(
    method: &'static str,
    payload: &[u8],
) -> Result<M, DispatchError> {
    M::decode(payload).map_err(|source| DispatchError::Decode { method, source })
}

async fn dispatch_method(
    handler: &dyn EnvelopeHandler,
    cx: &CallContext,
    method: &str,
    payload: &[u8],
) -> Result<Vec<u8>, DispatchError> {
    match method {
        deployer::ACTIVATE_COMPONENT => {
            let req: ActivateComponentRequest = decode(deployer::ACTIVATE_COMPONENT, payload)?;
            let reply = handler.activate_component(cx, req).await?;
            Ok(reply.encode_to_vec())
        }
        deployer::GET_LISTENER_ADDRESS => {
            let req: GetListenerAddressRequest = decode(deployer::GET_LISTENER_ADDRESS, payload)?;
            let reply = handler.get_listener_address(cx, req).await?;
            Ok(reply.encode_to_vec())
        }
        deployer::EXPORT_LISTENER => {
            let req: ExportListenerRequest = decode(deployer::EXPORT_LISTENER, payload)?;
            let reply = handler.export_listener(cx, req).await?;
            Ok(reply.encode_to_vec())
        }
        deployer::GET_SELF_CERTIFICATE => {
            let req: GetSelfCertificateRequest = decode(deployer::GET_SELF_CERTIFICATE, payload)?;
            let reply = handler.get_self_certificate(cx, req).await?;
            Ok(reply.encode_to_vec())
        }
        deployer::VERIFY_CLIENT_CERTIFICATE => {
            let req: VerifyClientCertificateRequest =
                decode(deployer::VERIFY_CLIENT_CERTIFICATE, payload)?;
            let reply = handler.verify_client_certificate(cx, req).await?;
            Ok(reply.encode_to_vec())
        }
        deployer::VERIFY_SERVER_CERTIFICATE => {
            let req: VerifyServerCertificateRequest =
                decode(deployer::VERIFY_SERVER_CERTIFICATE, payload)?;
            let reply = handler.verify_server_certificate(cx, req).await?;
            Ok(reply.encode_to_vec())
        }
        deployer::LOG_BATCH => {
            let batch: LogBatch = decode(deployer::LOG_BATCH, payload)?;
            handler.log_batch(cx, batch).await?;
            Ok(Vec::new())
        }
        deployer::HANDLE_TRACE_SPANS => {
            let spans: TraceSpans = decode(deployer::HANDLE_TRACE_SPANS, payload)?;
            handler.handle_trace_spans(cx, spans).await?;
            Ok(Vec::new())
        }
        other => Err(DispatchError::UnknownMethod(other.to_string())),
    }
}
