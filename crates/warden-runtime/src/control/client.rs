//! Node-control client stub.
//!
//! The envelope opens one client connection to the node's control socket
//! and issues every envelope→node call through it. A dedicated connection
//! task serializes frame writes, retries the initial connect until the node
//! is listening (or the scope cancels), and correlates responses to pending
//! calls by request id. Multiple calls may be in flight at once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use warden_core::control::{NODE_PATH, node};
use warden_core::protocol::FrameCodec;
use warden_core::protocol::messages::{
    CallRequest, CallResponse, GetHealthReply, GetHealthRequest, GetLoadReply, GetLoadRequest,
    GetMetricsReply, GetMetricsRequest, GetProfileReply, GetProfileRequest, InitNodeReply,
    InitNodeRequest, UpdateComponentsReply, UpdateComponentsRequest, UpdateRoutingReply,
    UpdateRoutingRequest, call_response,
};

use crate::error::EnvelopeError;

/// Delay between connect attempts while the node socket is not up yet.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Depth of the call queue between stub handles and the connection task.
const CALL_QUEUE_DEPTH: usize = 64;

struct Call {
    method: &'static str,
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<Bytes, EnvelopeError>>,
}

/// Client stub for the node-control endpoint.
///
/// Cheap to clone; all clones share one connection. Once the underlying
/// connection fails, every pending and subsequent call fails with
/// [`EnvelopeError::Transport`] (or [`EnvelopeError::Cancelled`] if the
/// scope was cancelled): transport failures are only retried before the
/// connection is first established.
#[derive(Clone)]
pub struct ControlClient {
    tx: mpsc::Sender<Call>,
    cancel: CancellationToken,
}

impl ControlClient {
    /// Open a stub for the node listening (or about to listen) on
    /// `socket`.
    ///
    /// Returns immediately; the connection is established in the
    /// background and calls queue until it is up.
    #[must_use]
    pub fn open(cancel: CancellationToken, socket: &Path) -> Self {
        let (tx, rx) = mpsc::channel(CALL_QUEUE_DEPTH);
        tokio::spawn(run_connection(socket.to_path_buf(), cancel.clone(), rx));
        Self { tx, cancel }
    }

    /// Issue one raw call and await the reply payload.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Handler`] for an error reported by the
    /// node, [`EnvelopeError::Cancelled`] if the scope cancels, or
    /// [`EnvelopeError::Transport`] for connection failures.
    pub async fn call(&self, method: &'static str, payload: Vec<u8>) -> Result<Bytes, EnvelopeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let call = Call {
            method,
            payload,
            reply: reply_tx,
        };
        self.tx
            .send(call)
            .await
            .map_err(|_| self.link_down_error())?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.link_down_error()),
        }
    }

    fn link_down_error(&self) -> EnvelopeError {
        if self.cancel.is_cancelled() {
            EnvelopeError::Cancelled
        } else {
            EnvelopeError::transport("node-control connection is down")
        }
    }

    async fn unary<Req, Reply>(
        &self,
        method: &'static str,
        req: &Req,
    ) -> Result<Reply, EnvelopeError>
    where
        Req: Message,
        Reply: Message + Default,
    {
        let payload = self.call(method, req.encode_to_vec()).await?;
        Reply::decode(payload).map_err(EnvelopeError::transport)
    }

    /// Initialize the node. Must be the first call on a fresh link.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::call`].
    pub async fn init_node(&self, req: &InitNodeRequest) -> Result<InitNodeReply, EnvelopeError> {
        self.unary(node::INIT_NODE, req).await
    }

    /// Update the set of components the node should host.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::call`].
    pub async fn update_components(
        &self,
        req: &UpdateComponentsRequest,
    ) -> Result<UpdateComponentsReply, EnvelopeError> {
        self.unary(node::UPDATE_COMPONENTS, req).await
    }

    /// Deliver fresh routing info for one component.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::call`].
    pub async fn update_routing_info(
        &self,
        req: &UpdateRoutingRequest,
    ) -> Result<UpdateRoutingReply, EnvelopeError> {
        self.unary(node::UPDATE_ROUTING_INFO, req).await
    }

    /// Fetch node health.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::call`].
    pub async fn get_health(&self) -> Result<GetHealthReply, EnvelopeError> {
        self.unary(node::GET_HEALTH, &GetHealthRequest {}).await
    }

    /// Fetch a load report.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::call`].
    pub async fn get_load(&self) -> Result<GetLoadReply, EnvelopeError> {
        self.unary(node::GET_LOAD, &GetLoadRequest {}).await
    }

    /// Fetch a metric delta.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::call`].
    pub async fn get_metrics(&self) -> Result<GetMetricsReply, EnvelopeError> {
        self.unary(node::GET_METRICS, &GetMetricsRequest {}).await
    }

    /// Collect a profile from the node.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::call`].
    pub async fn get_profile(
        &self,
        req: &GetProfileRequest,
    ) -> Result<GetProfileReply, EnvelopeError> {
        self.unary(node::GET_PROFILE, req).await
    }
}

/// Connect, then shuttle calls and responses until the link dies.
async fn run_connection(socket: PathBuf, cancel: CancellationToken, mut rx: mpsc::Receiver<Call>) {
    let stream = match connect_with_retry(&socket, &cancel).await {
        Some(stream) => stream,
        None => return, // Cancelled; senders observe a dropped channel.
    };
    debug!(socket = %socket.display(), "node-control connected");

    let mut framed = Framed::new(stream, FrameCodec::new());
    let mut pending: HashMap<u64, oneshot::Sender<Result<Bytes, EnvelopeError>>> = HashMap::new();
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                fail_pending(&mut pending, &EnvelopeError::Cancelled);
                return;
            }
            call = rx.recv() => {
                let Some(call) = call else { return };
                next_id += 1;
                let frame = CallRequest {
                    id: next_id,
                    component: NODE_PATH.to_string(),
                    method: call.method.to_string(),
                    deadline_micros: 0,
                    payload: call.payload,
                }
                .encode_to_vec();
                if let Err(e) = framed.send(Bytes::from(frame)).await {
                    let _ = call.reply.send(Err(EnvelopeError::transport(&e)));
                    fail_pending(&mut pending, &EnvelopeError::transport(e));
                    return;
                }
                pending.insert(next_id, call.reply);
            }
            frame = framed.next() => {
                match frame {
                    Some(Ok(bytes)) => {
                        if let Err(e) = route_response(&bytes, &mut pending) {
                            fail_pending(&mut pending, &e);
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        fail_pending(&mut pending, &EnvelopeError::transport(e));
                        return;
                    }
                    None => {
                        fail_pending(
                            &mut pending,
                            &EnvelopeError::transport("node closed the control socket"),
                        );
                        return;
                    }
                }
            }
        }
    }
}

async fn connect_with_retry(socket: &Path, cancel: &CancellationToken) -> Option<UnixStream> {
    loop {
        match UnixStream::connect(socket).await {
            Ok(stream) => return Some(stream),
            // The node may not have bound its socket yet; keep trying
            // until the scope cancels.
            Err(_) => {
                tokio::select! {
                    () = cancel.cancelled() => return None,
                    () = tokio::time::sleep(CONNECT_RETRY_DELAY) => {}
                }
            }
        }
    }
}

fn route_response(
    bytes: &Bytes,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Bytes, EnvelopeError>>>,
) -> Result<(), EnvelopeError> {
    let response = CallResponse::decode(&bytes[..]).map_err(EnvelopeError::transport)?;
    let Some(reply) = pending.remove(&response.id) else {
        return Err(EnvelopeError::transport(format!(
            "response for unknown request id {}",
            response.id
        )));
    };
    let result = match response.outcome {
        Some(call_response::Outcome::Payload(payload)) => Ok(Bytes::from(payload)),
        Some(call_response::Outcome::Error(message)) => Err(EnvelopeError::Handler(message)),
        None => Ok(Bytes::new()),
    };
    let _ = reply.send(result);
    Ok(())
}

fn fail_pending(
    pending: &mut HashMap<u64, oneshot::Sender<Result<Bytes, EnvelopeError>>>,
    error: &EnvelopeError,
) {
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(clone_error(error)));
    }
}

// EnvelopeError is not Clone (it carries source errors); pending calls all
// get the same description.
fn clone_error(error: &EnvelopeError) -> EnvelopeError {
    match error {
        EnvelopeError::Cancelled => EnvelopeError::Cancelled,
        other => EnvelopeError::Transport(other.to_string()),
    }
}
