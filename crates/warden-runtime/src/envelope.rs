//! Envelope orchestration.
//!
//! An [`Envelope`] starts and manages one node in a child process. It owns
//! the temporary directory holding both control sockets, enforces the
//! deployer API version gate at init, captures node stdio as log records,
//! serves the node's deployer-control calls, and folds metric deltas into
//! absolute readings.
//!
//! Lifecycle: [`Envelope::new`] takes the node through launch and init;
//! exactly one [`Envelope::serve`] call then drives it until cancellation,
//! a fatal task error, or node exit. `serve` guarantees release of every
//! resource, including the temporary directory when the envelope created
//! it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warden_core::bootstrap::check_node_args;
use warden_core::control::DEPLOYER_PATH;
use warden_core::metrics::{Importer, MetricSnapshot};
use warden_core::protocol::messages::{
    AppConfig, GetProfileRequest, HealthStatus, InitNodeReply, InitNodeRequest, LoadReport,
    LogBatch, LogEntry, NodeArgs, Redirect, RoutingInfo, UpdateComponentsRequest,
    UpdateRoutingRequest,
};
use warden_core::version::check_version;

use crate::child::{Child, OutputStream, ProcessChild};
use crate::control::client::ControlClient;
use crate::control::server::serve_deployer_control;
use crate::error::EnvelopeError;
use crate::handler::{CallContext, EnvelopeHandler};
use crate::workdir;

/// Optional arguments for [`Envelope::new`].
#[derive(Default)]
pub struct Options {
    /// Directory to place control sockets in. When unset the envelope
    /// creates (and later removes) its own owner-only directory.
    pub tmp_dir: Option<PathBuf>,

    /// The node to run. When unset a [`ProcessChild`] subprocess is
    /// created from the app config's binary.
    pub child: Option<Box<dyn Child>>,
}

/// Where the envelope is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// `new` succeeded; `serve` has not been called.
    Initialized,
    /// `serve` is running.
    Serving,
    /// A stop was requested; tasks are unwinding.
    Draining,
    /// Terminal: tasks joined, node reaped, sockets removed.
    Closed,
}

/// Supervises a single node in a child process.
///
/// The envelope exclusively owns the child handle, the socket directory,
/// and the control stubs. Handlers are shared: the envelope borrows one
/// for the duration of [`Envelope::serve`].
pub struct Envelope {
    cancel: CancellationToken,
    tmp_dir: PathBuf,
    tmp_dir_owned: bool,
    own_socket: PathBuf,
    args: NodeArgs,
    config: AppConfig,
    node_addr: String,
    pid: Option<u32>,
    child: tokio::sync::Mutex<Box<dyn Child>>,
    controller: ControlClient,
    metrics: Mutex<Importer>,
    state: Arc<Mutex<State>>,
}

impl Envelope {
    /// Create a new envelope: start the node and complete the init
    /// handshake over the control link.
    ///
    /// The node can be stopped at any time by cancelling `cancel`. RPCs
    /// *to* the node can be issued through the returned envelope right
    /// away; to start receiving calls *from* the node, call
    /// [`Envelope::serve`].
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::ConfigInvalid`] for malformed node args
    /// - [`EnvelopeError::StartFailed`] if the node cannot be launched
    /// - [`EnvelopeError::VersionMismatch`] if the node was built against
    ///   a different deployer API version
    /// - [`EnvelopeError::Cancelled`] / [`EnvelopeError::Transport`] for
    ///   init-time link failures
    ///
    /// Any failure after the socket directory was created removes it
    /// again and reaps the node if it was already running.
    pub async fn new(
        cancel: &CancellationToken,
        args: NodeArgs,
        config: AppConfig,
        options: Options,
    ) -> Result<Self, EnvelopeError> {
        check_node_args(&args).map_err(|e| EnvelopeError::ConfigInvalid(e.to_string()))?;
        let cancel = cancel.child_token();

        let (tmp_dir, tmp_dir_owned) = match options.tmp_dir {
            Some(dir) => (dir, false),
            None => {
                let dir = workdir::new_tmp_dir()?;
                workdir::remove_on_exit_signal(&dir);
                (dir, true)
            }
        };
        // Removed on early-error drop; disarmed once serve owns cleanup.
        let mut dir_guard = TmpDirGuard {
            path: tmp_dir.clone(),
            armed: tmp_dir_owned,
        };

        let own_socket = workdir::socket_path(&tmp_dir);
        let control_socket = workdir::socket_path(&tmp_dir);

        let mut args = args;
        args.control_socket = control_socket.to_string_lossy().into_owned();
        args.redirects.insert(
            0,
            // Point the node's deployer-control handle at this envelope.
            Redirect {
                component: DEPLOYER_PATH.to_string(),
                target: DEPLOYER_PATH.to_string(),
                address: format!("unix://{}", own_socket.display()),
            },
        );

        // The stub connects lazily, retrying until the node listens.
        let controller = ControlClient::open(cancel.clone(), &control_socket);

        let mut child = options
            .child
            .unwrap_or_else(|| Box::new(ProcessChild::new()) as Box<dyn Child>);
        if let Err(e) = child.start(&cancel, &config, &args).await {
            cancel.cancel();
            return Err(e);
        }
        let pid = child.pid();

        let init = InitNodeRequest {
            sections: config.sections.clone(),
        };
        let reply = match controller.init_node(&init).await {
            Ok(reply) => reply,
            Err(e) => return Err(abort_init(child, &cancel, e).await),
        };
        if let Err(e) = verify_init_reply(&reply) {
            return Err(abort_init(child, &cancel, e).await);
        }
        debug!(node = %args.node_id, addr = %reply.dial_addr, "node initialized");

        dir_guard.armed = false;
        Ok(Self {
            cancel,
            tmp_dir,
            tmp_dir_owned,
            own_socket,
            args,
            config,
            node_addr: reply.dial_addr,
            pid,
            child: tokio::sync::Mutex::new(child),
            controller,
            metrics: Mutex::new(Importer::new()),
            state: Arc::new(Mutex::new(State::Initialized)),
        })
    }

    /// Accept and handle calls from the node until the envelope stops.
    ///
    /// Runs four cooperating tasks: stdout capture, stderr capture, a
    /// cancellation watcher, and the deployer-control server. Requests on
    /// one connection are handled serially in arrival order. The first
    /// task error trips a once-only stop gate, the whole group drains,
    /// the node is reaped, and the captured error is returned.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::Cancelled`] when the context given to
    ///   [`Envelope::new`] was cancelled
    /// - [`EnvelopeError::ChildExited`] when the node exited non-zero and
    ///   no earlier error was captured
    /// - [`EnvelopeError::Transport`] / [`EnvelopeError::Handler`] for
    ///   task failures
    /// - [`EnvelopeError::Closed`] if the envelope already served
    ///
    /// A clean node exit yields `Ok(())`.
    pub async fn serve(&self, handler: Arc<dyn EnvelopeHandler>) -> Result<(), EnvelopeError> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state != State::Initialized {
                return Err(EnvelopeError::Closed);
            }
            *state = State::Serving;
        }

        let result = self.serve_inner(handler).await;

        // Final teardown, no matter how serving ended.
        self.cancel.cancel();
        {
            let mut child = self.child.lock().await;
            if let Err(e) = child.wait().await {
                debug!(error = %e, "node reap after serve");
            }
        }
        *self.state.lock().expect("state lock poisoned") = State::Closed;
        if self.tmp_dir_owned {
            if let Err(e) = std::fs::remove_dir_all(&self.tmp_dir) {
                warn!(dir = %self.tmp_dir.display(), error = %e, "tmp dir removal failed");
            }
        }
        result
    }

    async fn serve_inner(&self, handler: Arc<dyn EnvelopeHandler>) -> Result<(), EnvelopeError> {
        let listener = UnixListener::bind(&self.own_socket).map_err(|e| {
            EnvelopeError::Transport(format!("bind {}: {e}", self.own_socket.display()))
        })?;

        let gate = StopGate::new(self.cancel.clone(), Arc::clone(&self.state));

        let (stdout, stderr) = {
            let mut child = self.child.lock().await;
            (child.stdout(), child.stderr())
        };
        let meta = LogMeta {
            app: self.args.app.clone(),
            deployment: self.args.deployment_id.clone(),
            node: self.args.node_id.clone(),
        };

        let mut tasks: JoinSet<()> = JoinSet::new();

        if let Some(stream) = stdout {
            tasks.spawn(capture_output(
                stream,
                "stdout",
                meta.clone(),
                Arc::clone(&handler),
                gate.clone(),
            ));
        }
        if let Some(stream) = stderr {
            tasks.spawn(capture_output(
                stream,
                "stderr",
                meta.clone(),
                Arc::clone(&handler),
                gate.clone(),
            ));
        }

        // Watcher: an external cancellation, observed before anything else
        // tripped the gate, is what `serve` reports.
        {
            let gate = gate.clone();
            tasks.spawn(async move {
                gate.scope().cancelled().await;
                if !gate.fired() {
                    gate.stop(Some(EnvelopeError::Cancelled));
                }
            });
        }

        // Deployer-control server; exits quietly on cancellation.
        {
            let gate = gate.clone();
            let scope = gate.scope().child_token();
            let handler = Arc::clone(&handler);
            tasks.spawn(async move {
                if let Err(e) = serve_deployer_control(listener, scope, handler).await {
                    gate.stop(Some(e));
                }
            });
        }

        while tasks.join_next().await.is_some() {}

        // All pipes are at EOF; reap the node. Its status joins the gate
        // unless an earlier error was captured.
        let status = { self.child.lock().await.wait().await };
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => gate.finish_child(EnvelopeError::ChildExited(status)),
            Err(e) => gate.finish_child(e),
        }

        match gate.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The address other nodes should dial to reach this node.
    #[must_use]
    pub fn node_address(&self) -> &str {
        &self.node_addr
    }

    /// OS process id of the node, for subprocess children.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The directory holding this envelope's control sockets.
    #[must_use]
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// The application config this envelope was created with.
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Direct access to the node-control stub.
    #[must_use]
    pub fn controller(&self) -> &ControlClient {
        &self.controller
    }

    /// Fetch the node's health.
    ///
    /// Never fails: any transport error, and an envelope past its life,
    /// read as [`HealthStatus::Unknown`].
    pub async fn get_health(&self) -> HealthStatus {
        if self.ensure_open().is_err() {
            return HealthStatus::Unknown;
        }
        match self.controller.get_health().await {
            Ok(reply) => reply.status(),
            Err(_) => HealthStatus::Unknown,
        }
    }

    /// Collect a profile from the node.
    ///
    /// # Errors
    ///
    /// Propagates control-link errors; fails with
    /// [`EnvelopeError::Closed`] after `serve` returned.
    pub async fn get_profile(&self, req: &GetProfileRequest) -> Result<Vec<u8>, EnvelopeError> {
        self.ensure_open()?;
        Ok(self.controller.get_profile(req).await?.data)
    }

    /// Fetch the node's current load report.
    ///
    /// # Errors
    ///
    /// Propagates control-link errors; fails with
    /// [`EnvelopeError::Closed`] after `serve` returned.
    pub async fn get_load(&self) -> Result<Option<LoadReport>, EnvelopeError> {
        self.ensure_open()?;
        Ok(self.controller.get_load().await?.load)
    }

    /// Fetch a metric delta from the node and fold it into absolute
    /// readings.
    ///
    /// Concurrent callers are serialized on the importer; the returned
    /// snapshots are the metrics named by this delta, in wire order.
    ///
    /// # Errors
    ///
    /// Propagates control-link errors; a delta inconsistent with the
    /// link's metric definitions is a transport error.
    pub async fn get_metrics(&self) -> Result<Vec<MetricSnapshot>, EnvelopeError> {
        self.ensure_open()?;
        let reply = self.controller.get_metrics().await?;
        let update = reply.update.unwrap_or_default();
        let mut importer = self.metrics.lock().expect("metrics lock poisoned");
        importer.import(&update).map_err(EnvelopeError::transport)
    }

    /// Update the node with the latest set of components it should run.
    ///
    /// # Errors
    ///
    /// Propagates control-link errors; fails with
    /// [`EnvelopeError::Closed`] after `serve` returned.
    pub async fn update_components(&self, components: Vec<String>) -> Result<(), EnvelopeError> {
        self.ensure_open()?;
        self.controller
            .update_components(&UpdateComponentsRequest { components })
            .await?;
        Ok(())
    }

    /// Update the node with a component's most recent routing info.
    ///
    /// # Errors
    ///
    /// Propagates control-link errors; fails with
    /// [`EnvelopeError::Closed`] after `serve` returned.
    pub async fn update_routing_info(&self, routing: RoutingInfo) -> Result<(), EnvelopeError> {
        self.ensure_open()?;
        self.controller
            .update_routing_info(&UpdateRoutingRequest {
                routing_info: Some(routing),
            })
            .await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), EnvelopeError> {
        if *self.state.lock().expect("state lock poisoned") == State::Closed {
            return Err(EnvelopeError::Closed);
        }
        Ok(())
    }
}

/// Reap a node whose init failed, then hand the error back.
async fn abort_init(
    mut child: Box<dyn Child>,
    cancel: &CancellationToken,
    err: EnvelopeError,
) -> EnvelopeError {
    cancel.cancel();
    if let Err(reap) = child.wait().await {
        debug!(error = %reap, "reaping node after failed init");
    }
    err
}

/// Validate the node's init reply: a dial address must be present and the
/// deployer API version must match exactly.
fn verify_init_reply(reply: &InitNodeReply) -> Result<(), EnvelopeError> {
    if reply.dial_addr.is_empty() {
        return Err(EnvelopeError::transport(
            "node reported an empty dial address",
        ));
    }
    check_version(reply.version.as_ref())?;
    Ok(())
}

/// Identity stamped onto captured stdio log records.
#[derive(Clone)]
struct LogMeta {
    app: String,
    deployment: String,
    node: String,
}

/// Once-only stop gate shared by the serve tasks.
///
/// The first `stop` wins: it records the offered error (if any), flips the
/// envelope to draining, and cancels the scope so every task unwinds.
/// Later stops are ignored. The node's exit status fills the slot after
/// the fact only if no error was captured.
#[derive(Clone)]
struct StopGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    cancel: CancellationToken,
    state: Arc<Mutex<State>>,
    fired: AtomicBool,
    slot: Mutex<Option<EnvelopeError>>,
}

impl StopGate {
    fn new(cancel: CancellationToken, state: Arc<Mutex<State>>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                cancel,
                state,
                fired: AtomicBool::new(false),
                slot: Mutex::new(None),
            }),
        }
    }

    fn scope(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    fn fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    fn stop(&self, err: Option<EnvelopeError>) {
        if !self.inner.fired.swap(true, Ordering::SeqCst) {
            if let Some(err) = err {
                *self.inner.slot.lock().expect("stop gate poisoned") = Some(err);
            }
            *self.inner.state.lock().expect("state lock poisoned") = State::Draining;
        }
        self.inner.cancel.cancel();
    }

    fn finish_child(&self, err: EnvelopeError) {
        let mut slot = self.inner.slot.lock().expect("stop gate poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take(&self) -> Option<EnvelopeError> {
        self.inner.slot.lock().expect("stop gate poisoned").take()
    }
}

/// Drain one stdio stream into log records until EOF.
async fn capture_output(
    stream: OutputStream,
    channel: &'static str,
    meta: LogMeta,
    handler: Arc<dyn EnvelopeHandler>,
    gate: StopGate,
) {
    let cx = CallContext::new(gate.scope().child_token());
    match log_lines(stream, channel, &meta, handler.as_ref(), &cx).await {
        // EOF: the node ended on its own. Trip the gate so the group
        // unwinds, unless a shutdown is already in progress and owns the
        // verdict.
        Ok(()) => {
            if !gate.scope().is_cancelled() {
                gate.stop(None);
            }
        }
        Err(e) => gate.stop(Some(e)),
    }
}

/// Forward each line of `stream` to the handler as one log record.
///
/// The trailing newline is stripped; per-stream order is preserved. A
/// final unterminated line is still delivered.
async fn log_lines(
    stream: OutputStream,
    channel: &'static str,
    meta: &LogMeta,
    handler: &dyn EnvelopeHandler,
    cx: &CallContext,
) -> Result<(), EnvelopeError> {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| EnvelopeError::Transport(format!("capture {channel}: {e}")))?;
        if n == 0 {
            return Ok(());
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        let entry = LogEntry {
            app: meta.app.clone(),
            deployment: meta.deployment.clone(),
            component: channel.to_string(),
            node: meta.node.clone(),
            time_micros: 0, // Stamped by the deployer on arrival.
            level: channel.to_string(),
            file: String::new(),
            line: -1,
            msg: String::from_utf8_lossy(&line).into_owned(),
        };
        let batch = LogBatch {
            entries: vec![entry],
        };
        handler
            .log_batch(cx, batch)
            .await
            .map_err(|e| EnvelopeError::Handler(e.to_string()))?;
    }
}

/// Removes an owned socket directory if construction fails partway.
struct TmpDirGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for TmpDirGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}
