//! End-to-end envelope tests over real Unix-domain sockets.
//!
//! Each test runs an in-process fake node that speaks the real wire
//! protocol: it listens on the control socket from its `NodeArgs`, answers
//! the init handshake, and (depending on the scenario) dials the
//! deployer-control socket from its redirect, writes stdio output, or
//! exits with a chosen status.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use warden_core::control::{DEPLOYER_PATH, NODE_PATH, deployer, node};
use warden_core::protocol::FrameCodec;
use warden_core::protocol::messages::{
    ActivateComponentReply, ActivateComponentRequest, AppConfig, CallRequest, CallResponse,
    ExportListenerReply, ExportListenerRequest, GetListenerAddressReply,
    GetListenerAddressRequest, GetMetricsReply, GetSelfCertificateReply,
    GetSelfCertificateRequest, HealthStatus, InitNodeReply, LogBatch, LogEntry, MetricDef,
    MetricType, MetricUpdate, MetricValue, NodeArgs, SemVer, TraceSpans,
    VerifyClientCertificateReply, VerifyClientCertificateRequest, VerifyServerCertificateReply,
    VerifyServerCertificateRequest, call_response,
};
use warden_core::version::DEPLOYER_VERSION;
use warden_runtime::{
    CallContext, ChildStatus, Envelope, EnvelopeError, EnvelopeHandler, HandlerError,
    InProcessChild, Options,
};

/// Timeout for individual test operations.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Helpers
// =============================================================================

type NodeFramed = Framed<UnixStream, FrameCodec>;

fn node_args() -> NodeArgs {
    NodeArgs {
        app: "shop".to_string(),
        deployment_id: "dep-1".to_string(),
        node_id: "node-1".to_string(),
        mtls: false,
        run_main: true,
        internal_address: "127.0.0.1:0".to_string(),
        control_socket: String::new(), // Stamped by the envelope.
        redirects: Vec::new(),
    }
}

fn app_config() -> AppConfig {
    AppConfig {
        name: "shop".to_string(),
        binary: String::new(), // Unused with an in-process node.
        args: Vec::new(),
        sections: std::collections::HashMap::new(),
    }
}

fn wire_version() -> SemVer {
    SemVer::from(DEPLOYER_VERSION)
}

fn ok_reply(id: u64, msg: &impl Message) -> Bytes {
    Bytes::from(
        CallResponse {
            id,
            outcome: Some(call_response::Outcome::Payload(msg.encode_to_vec())),
        }
        .encode_to_vec(),
    )
}

async fn read_request(framed: &mut NodeFramed) -> Option<CallRequest> {
    let bytes = framed.next().await?.ok()?;
    CallRequest::decode(&bytes[..]).ok()
}

/// Bind the node-control socket, accept the envelope's connection, and
/// answer the init handshake. Returns the established link.
async fn serve_init(args: &NodeArgs, dial_addr: &str, version: SemVer) -> NodeFramed {
    let listener = UnixListener::bind(&args.control_socket).expect("bind node control socket");
    let (stream, _) = listener.accept().await.expect("accept node control");
    let mut framed = Framed::new(stream, FrameCodec::new());

    let req = read_request(&mut framed).await.expect("read init request");
    assert_eq!(req.component, NODE_PATH);
    assert_eq!(req.method, node::INIT_NODE, "first call must be InitNode");
    let reply = InitNodeReply {
        dial_addr: dial_addr.to_string(),
        version: Some(version),
    };
    framed
        .send(ok_reply(req.id, &reply))
        .await
        .expect("send init reply");
    framed
}

/// The deployer-control socket path from the redirect the envelope
/// prepends.
fn deployer_socket(args: &NodeArgs) -> PathBuf {
    let redirect = args
        .redirects
        .iter()
        .find(|r| r.component == DEPLOYER_PATH)
        .expect("deployer redirect present");
    let address = redirect
        .address
        .strip_prefix("unix://")
        .expect("unix scheme");
    PathBuf::from(address)
}

/// Dial the deployer-control socket, retrying until the envelope serves.
async fn dial_deployer(args: &NodeArgs) -> NodeFramed {
    let path = deployer_socket(args);
    loop {
        match UnixStream::connect(&path).await {
            Ok(stream) => return Framed::new(stream, FrameCodec::new()),
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
}

/// Issue one deployer-control call and wait for its response.
async fn call_deployer(
    framed: &mut NodeFramed,
    id: u64,
    method: &str,
    msg: &impl Message,
) -> CallResponse {
    send_deployer(framed, id, method, msg).await;
    recv_response(framed).await
}

async fn send_deployer(framed: &mut NodeFramed, id: u64, method: &str, msg: &impl Message) {
    let frame = CallRequest {
        id,
        component: DEPLOYER_PATH.to_string(),
        method: method.to_string(),
        deadline_micros: 0,
        payload: msg.encode_to_vec(),
    }
    .encode_to_vec();
    framed
        .send(Bytes::from(frame))
        .await
        .expect("send deployer call");
}

async fn recv_response(framed: &mut NodeFramed) -> CallResponse {
    let bytes = framed
        .next()
        .await
        .expect("response frame")
        .expect("clean frame");
    CallResponse::decode(&bytes[..]).expect("decode response")
}

fn response_payload(response: &CallResponse) -> &[u8] {
    match response.outcome.as_ref().expect("response outcome") {
        call_response::Outcome::Payload(payload) => payload,
        call_response::Outcome::Error(e) => panic!("call failed: {e}"),
    }
}

/// Poll until `cond` holds, failing the test after [`TEST_TIMEOUT`].
async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Records the node to be dropped (killed) so a test can observe the reap.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Test handler
// =============================================================================

/// A deployer handler that records everything it observes.
#[derive(Default)]
struct TestHandler {
    /// Captured log records, in delivery order.
    logs: Mutex<Vec<LogEntry>>,
    /// Activated component paths.
    activations: Mutex<Vec<String>>,
    /// Ordered trace of interesting handler events.
    events: Mutex<Vec<String>>,
    /// Set if any mTLS certificate method was ever invoked.
    cert_called: AtomicBool,
    /// Hold every `activate_component` call for this long before
    /// returning; lets tests observe dispatch interleaving.
    activate_delay: Duration,
    /// When set, `log_batch` parks until its call context cancels.
    block_log_batch: bool,
    /// Set once a blocked `log_batch` observed cancellation.
    log_cx_cancelled: AtomicBool,
}

impl TestHandler {
    fn push_event(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn log_messages(&self) -> Vec<String> {
        self.logs.lock().unwrap().iter().map(|e| e.msg.clone()).collect()
    }
}

#[async_trait]
impl EnvelopeHandler for TestHandler {
    async fn activate_component(
        &self,
        _cx: &CallContext,
        req: ActivateComponentRequest,
    ) -> Result<ActivateComponentReply, HandlerError> {
        self.push_event(format!("enter:activate:{}", req.component));
        if !self.activate_delay.is_zero() {
            tokio::time::sleep(self.activate_delay).await;
        }
        self.activations.lock().unwrap().push(req.component.clone());
        self.push_event(format!("exit:activate:{}", req.component));
        Ok(ActivateComponentReply {})
    }

    async fn get_listener_address(
        &self,
        _cx: &CallContext,
        req: GetListenerAddressRequest,
    ) -> Result<GetListenerAddressReply, HandlerError> {
        self.push_event(format!("get-listener:{}", req.name));
        Ok(GetListenerAddressReply {
            address: "localhost:0".to_string(),
        })
    }

    async fn export_listener(
        &self,
        _cx: &CallContext,
        req: ExportListenerRequest,
    ) -> Result<ExportListenerReply, HandlerError> {
        self.push_event(format!("export:{}:{}", req.listener, req.address));
        Ok(ExportListenerReply::default())
    }

    async fn get_self_certificate(
        &self,
        _cx: &CallContext,
        _req: GetSelfCertificateRequest,
    ) -> Result<GetSelfCertificateReply, HandlerError> {
        self.cert_called.store(true, Ordering::SeqCst);
        Ok(GetSelfCertificateReply::default())
    }

    async fn verify_client_certificate(
        &self,
        _cx: &CallContext,
        _req: VerifyClientCertificateRequest,
    ) -> Result<VerifyClientCertificateReply, HandlerError> {
        self.cert_called.store(true, Ordering::SeqCst);
        Ok(VerifyClientCertificateReply::default())
    }

    async fn verify_server_certificate(
        &self,
        _cx: &CallContext,
        _req: VerifyServerCertificateRequest,
    ) -> Result<VerifyServerCertificateReply, HandlerError> {
        self.cert_called.store(true, Ordering::SeqCst);
        Ok(VerifyServerCertificateReply {})
    }

    async fn log_batch(&self, cx: &CallContext, batch: LogBatch) -> Result<(), HandlerError> {
        if self.block_log_batch {
            cx.cancelled().await;
            self.log_cx_cancelled.store(true, Ordering::SeqCst);
            return Ok(());
        }
        self.logs.lock().unwrap().extend(batch.entries);
        Ok(())
    }

    async fn handle_trace_spans(
        &self,
        _cx: &CallContext,
        _spans: TraceSpans,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

// =============================================================================
// Scenarios
// =============================================================================

/// Happy path: one log line, one activation, cancel-driven shutdown,
/// tmp dir removed.
#[tokio::test]
async fn test_happy_path_activation_and_cancel() {
    use tokio::io::AsyncWriteExt;

    let child = InProcessChild::new(|_config, args, mut stdio| async move {
        let _link = serve_init(&args, "tcp://127.0.0.1:7001", wire_version()).await;

        stdio.stdout.write_all(b"ready\n").await.unwrap();

        let mut dep = dial_deployer(&args).await;
        let response = call_deployer(
            &mut dep,
            1,
            deployer::ACTIVATE_COMPONENT,
            &ActivateComponentRequest {
                component: "X".to_string(),
                routed: false,
            },
        )
        .await;
        let _: &[u8] = response_payload(&response);

        // Park until the envelope kills the node.
        std::future::pending::<()>().await;
        0
    });

    let cancel = CancellationToken::new();
    let handler = Arc::new(TestHandler::default());
    let envelope = Arc::new(
        Envelope::new(&cancel, node_args(), app_config(), Options {
            child: Some(Box::new(child)),
            ..Options::default()
        })
        .await
        .expect("envelope init"),
    );
    assert_eq!(envelope.node_address(), "tcp://127.0.0.1:7001");
    assert_eq!(envelope.pid(), None);
    let tmp_dir = envelope.tmp_dir().to_path_buf();
    assert!(tmp_dir.exists());

    let serve = tokio::spawn({
        let envelope = Arc::clone(&envelope);
        let handler = Arc::clone(&handler);
        async move { envelope.serve(handler).await }
    });

    {
        let handler = Arc::clone(&handler);
        wait_until("activation and log line", move || {
            !handler.activations.lock().unwrap().is_empty()
                && !handler.logs.lock().unwrap().is_empty()
        })
        .await;
    }

    cancel.cancel();
    let result = tokio::time::timeout(TEST_TIMEOUT, serve)
        .await
        .expect("serve must return after cancel")
        .expect("serve task");
    assert!(matches!(result, Err(EnvelopeError::Cancelled)));

    assert_eq!(*handler.activations.lock().unwrap(), vec!["X".to_string()]);
    let logs = handler.logs.lock().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].msg, "ready");
    assert_eq!(logs[0].level, "stdout");
    assert_eq!(logs[0].component, "stdout");
    assert_eq!(logs[0].app, "shop");
    assert_eq!(logs[0].deployment, "dep-1");
    assert_eq!(logs[0].node, "node-1");

    assert!(!tmp_dir.exists(), "owned tmp dir must be removed");
}

/// A node reporting the wrong deployer API version is fatal at init: the
/// node is reaped, the socket dir removed, and `serve` never starts.
#[tokio::test]
async fn test_version_mismatch_fails_init() {
    let (dir_tx, dir_rx) = tokio::sync::oneshot::channel::<PathBuf>();
    let killed = Arc::new(AtomicBool::new(false));

    let child = InProcessChild::new({
        let killed = Arc::clone(&killed);
        move |_config, args, _stdio| async move {
            let _flag = DropFlag(killed);
            let dir = Path::new(&args.control_socket).parent().unwrap().to_path_buf();
            let _ = dir_tx.send(dir);

            let _link = serve_init(
                &args,
                "tcp://127.0.0.1:7002",
                SemVer {
                    major: 9,
                    minor: 9,
                    patch: 9,
                },
            )
            .await;
            std::future::pending::<()>().await;
            0
        }
    });

    let cancel = CancellationToken::new();
    let result = Envelope::new(&cancel, node_args(), app_config(), Options {
        child: Some(Box::new(child)),
        ..Options::default()
    })
    .await;

    assert!(matches!(result, Err(EnvelopeError::VersionMismatch(_))));

    let tmp_dir = dir_rx.await.expect("node reported its socket dir");
    {
        let killed = Arc::clone(&killed);
        wait_until("node reaped", move || killed.load(Ordering::SeqCst)).await;
    }
    assert!(!tmp_dir.exists(), "tmp dir must be removed on failed init");
}

/// A node that dies right after init surfaces as `ChildExited` with its
/// status, and the handler never hears from it.
#[tokio::test]
async fn test_child_crash_after_init() {
    let child = InProcessChild::new(|_config, args, _stdio| async move {
        let _link = serve_init(&args, "tcp://127.0.0.1:7003", wire_version()).await;
        137
    });

    let cancel = CancellationToken::new();
    let handler = Arc::new(TestHandler::default());
    let envelope = Envelope::new(&cancel, node_args(), app_config(), Options {
        child: Some(Box::new(child)),
        ..Options::default()
    })
    .await
    .expect("envelope init");

    let result = tokio::time::timeout(TEST_TIMEOUT, envelope.serve(Arc::clone(&handler) as Arc<dyn EnvelopeHandler>))
        .await
        .expect("serve must return after node exit");

    match result {
        Err(EnvelopeError::ChildExited(status)) => {
            assert_eq!(status, ChildStatus::Exited(137));
            assert_eq!(status.code(), Some(137));
        }
        other => panic!("expected ChildExited, got {other:?}"),
    }
    assert!(handler.activations.lock().unwrap().is_empty());
    assert!(handler.logs.lock().unwrap().is_empty());

    // Past `Closed`, envelope operations are rejected.
    assert!(matches!(
        envelope.update_components(vec!["X".to_string()]).await,
        Err(EnvelopeError::Closed)
    ));
    assert_eq!(envelope.get_health().await, HealthStatus::Unknown);
}

/// Listener negotiation: address request and export observed in order,
/// with no proxy address in the export reply.
#[tokio::test]
async fn test_listener_negotiation_in_order() {
    let child = InProcessChild::new(|_config, args, stdio| async move {
        // Keep the stdio pipes open until the node is done.
        let _stdio = stdio;
        let _link = serve_init(&args, "tcp://127.0.0.1:7004", wire_version()).await;

        let mut dep = dial_deployer(&args).await;
        let response = call_deployer(
            &mut dep,
            1,
            deployer::GET_LISTENER_ADDRESS,
            &GetListenerAddressRequest {
                name: "api".to_string(),
            },
        )
        .await;
        let reply =
            GetListenerAddressReply::decode(response_payload(&response)).expect("decode reply");
        if reply.address != "localhost:0" {
            return 1;
        }

        let response = call_deployer(
            &mut dep,
            2,
            deployer::EXPORT_LISTENER,
            &ExportListenerRequest {
                listener: "api".to_string(),
                address: "127.0.0.1:34567".to_string(),
            },
        )
        .await;
        let reply = ExportListenerReply::decode(response_payload(&response)).expect("decode reply");
        if !reply.proxy_address.is_empty() {
            return 1;
        }
        0
    });

    let cancel = CancellationToken::new();
    let handler = Arc::new(TestHandler::default());
    let envelope = Envelope::new(&cancel, node_args(), app_config(), Options {
        child: Some(Box::new(child)),
        ..Options::default()
    })
    .await
    .expect("envelope init");

    let result = tokio::time::timeout(TEST_TIMEOUT, envelope.serve(Arc::clone(&handler) as Arc<dyn EnvelopeHandler>))
        .await
        .expect("serve must return");
    assert!(result.is_ok(), "clean node exit: {result:?}");

    let events = handler.events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            "get-listener:api".to_string(),
            "export:api:127.0.0.1:34567".to_string(),
        ]
    );
}

/// With mTLS off, a contract-honoring node issues no certificate calls,
/// and the handler's certificate methods are never invoked.
#[tokio::test]
async fn test_mtls_off_no_certificate_calls() {
    let mtls_seen = Arc::new(AtomicBool::new(false));

    let child = InProcessChild::new({
        let mtls_seen = Arc::clone(&mtls_seen);
        move |_config, args, stdio| async move {
            let _stdio = stdio;
            mtls_seen.store(args.mtls, Ordering::SeqCst);
            let _link = serve_init(&args, "tcp://127.0.0.1:7005", wire_version()).await;

            let mut dep = dial_deployer(&args).await;
            let response = call_deployer(
                &mut dep,
                1,
                deployer::ACTIVATE_COMPONENT,
                &ActivateComponentRequest {
                    component: "Y".to_string(),
                    routed: false,
                },
            )
            .await;
            let _: &[u8] = response_payload(&response);
            0
        }
    });

    let cancel = CancellationToken::new();
    let handler = Arc::new(TestHandler::default());
    let envelope = Envelope::new(&cancel, node_args(), app_config(), Options {
        child: Some(Box::new(child)),
        ..Options::default()
    })
    .await
    .expect("envelope init");

    tokio::time::timeout(TEST_TIMEOUT, envelope.serve(Arc::clone(&handler) as Arc<dyn EnvelopeHandler>))
        .await
        .expect("serve must return")
        .expect("clean exit");

    assert!(!mtls_seen.load(Ordering::SeqCst), "mtls flag must be off");
    assert!(
        !handler.cert_called.load(Ordering::SeqCst),
        "no certificate upcalls with mTLS off"
    );
}

/// Log flood: every line arrives exactly once, in order, and a clean node
/// exit yields Ok.
#[tokio::test]
async fn test_log_flood_preserves_order() {
    use tokio::io::AsyncWriteExt;

    const LINES: usize = 100_000;
    const CHUNK: usize = 1_000;

    let child = InProcessChild::new(|_config, args, mut stdio| async move {
        let _link = serve_init(&args, "tcp://127.0.0.1:7006", wire_version()).await;

        let mut n = 0;
        while n < LINES {
            let mut chunk = String::with_capacity(CHUNK * 12);
            for i in n..(n + CHUNK).min(LINES) {
                chunk.push_str(&format!("line-{i}\n"));
            }
            stdio.stdout.write_all(chunk.as_bytes()).await.unwrap();
            n += CHUNK;
        }
        drop(stdio);
        0
    });

    let cancel = CancellationToken::new();
    let handler = Arc::new(TestHandler::default());
    let envelope = Envelope::new(&cancel, node_args(), app_config(), Options {
        child: Some(Box::new(child)),
        ..Options::default()
    })
    .await
    .expect("envelope init");

    let result = tokio::time::timeout(Duration::from_secs(60), envelope.serve(Arc::clone(&handler) as Arc<dyn EnvelopeHandler>))
        .await
        .expect("serve must return");
    assert!(result.is_ok(), "clean node exit: {result:?}");

    let messages = handler.log_messages();
    assert_eq!(messages.len(), LINES);
    for (i, msg) in messages.iter().enumerate() {
        assert_eq!(msg, &format!("line-{i}"), "line {i} out of order");
    }
}

// =============================================================================
// Properties
// =============================================================================

/// The deployer-control socket only accepts connections once `serve`
/// runs; before that the node's dial attempts fail.
#[tokio::test]
async fn test_deployer_socket_deferred_until_serve() {
    let pre_serve_connect_failed = Arc::new(AtomicBool::new(false));

    let child = InProcessChild::new({
        let flag = Arc::clone(&pre_serve_connect_failed);
        move |_config, args, stdio| async move {
            let _stdio = stdio;
            // Before init completes, `serve` cannot have started: the
            // deployer socket must refuse us.
            let path = deployer_socket(&args);
            if UnixStream::connect(&path).await.is_err() {
                flag.store(true, Ordering::SeqCst);
            }

            let _link = serve_init(&args, "tcp://127.0.0.1:7007", wire_version()).await;

            // Once serving, the same socket accepts.
            let mut dep = dial_deployer(&args).await;
            let response = call_deployer(
                &mut dep,
                1,
                deployer::ACTIVATE_COMPONENT,
                &ActivateComponentRequest {
                    component: "Z".to_string(),
                    routed: false,
                },
            )
            .await;
            let _: &[u8] = response_payload(&response);
            0
        }
    });

    let cancel = CancellationToken::new();
    let handler = Arc::new(TestHandler::default());
    let envelope = Envelope::new(&cancel, node_args(), app_config(), Options {
        child: Some(Box::new(child)),
        ..Options::default()
    })
    .await
    .expect("envelope init");

    tokio::time::timeout(TEST_TIMEOUT, envelope.serve(Arc::clone(&handler) as Arc<dyn EnvelopeHandler>))
        .await
        .expect("serve must return")
        .expect("clean exit");

    assert!(pre_serve_connect_failed.load(Ordering::SeqCst));
    assert_eq!(*handler.activations.lock().unwrap(), vec!["Z".to_string()]);
}

/// Two calls on one connection: the second is dispatched only after the
/// first completed, and responses come back in request-id order.
#[tokio::test]
async fn test_dispatch_serialized_per_connection() {
    let child = InProcessChild::new(|_config, args, stdio| async move {
        let _stdio = stdio;
        let _link = serve_init(&args, "tcp://127.0.0.1:7008", wire_version()).await;

        let mut dep = dial_deployer(&args).await;
        // Send both before reading either response.
        send_deployer(
            &mut dep,
            1,
            deployer::ACTIVATE_COMPONENT,
            &ActivateComponentRequest {
                component: "first".to_string(),
                routed: false,
            },
        )
        .await;
        send_deployer(
            &mut dep,
            2,
            deployer::ACTIVATE_COMPONENT,
            &ActivateComponentRequest {
                component: "second".to_string(),
                routed: false,
            },
        )
        .await;

        let first = recv_response(&mut dep).await;
        let second = recv_response(&mut dep).await;
        if first.id != 1 || second.id != 2 {
            return 1;
        }
        0
    });

    let cancel = CancellationToken::new();
    let handler = Arc::new(TestHandler {
        activate_delay: Duration::from_millis(100),
        ..TestHandler::default()
    });
    let envelope = Envelope::new(&cancel, node_args(), app_config(), Options {
        child: Some(Box::new(child)),
        ..Options::default()
    })
    .await
    .expect("envelope init");

    let result = tokio::time::timeout(TEST_TIMEOUT, envelope.serve(Arc::clone(&handler) as Arc<dyn EnvelopeHandler>))
        .await
        .expect("serve must return");
    assert!(result.is_ok(), "responses must arrive in id order: {result:?}");

    let events = handler.events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            "enter:activate:first".to_string(),
            "exit:activate:first".to_string(),
            "enter:activate:second".to_string(),
            "exit:activate:second".to_string(),
        ],
        "second call must enter only after the first finished"
    );
}

/// Cancelling the outer context unwinds `serve` within bounded time, and
/// an in-flight handler call observes cancellation on its own context.
#[tokio::test]
async fn test_cancellation_reaches_in_flight_handler_calls() {
    use tokio::io::AsyncWriteExt;

    let child = InProcessChild::new(|_config, args, mut stdio| async move {
        let _link = serve_init(&args, "tcp://127.0.0.1:7009", wire_version()).await;
        stdio.stdout.write_all(b"stuck\n").await.unwrap();
        std::future::pending::<()>().await;
        0
    });

    let cancel = CancellationToken::new();
    let handler = Arc::new(TestHandler {
        block_log_batch: true,
        ..TestHandler::default()
    });
    let envelope = Arc::new(
        Envelope::new(&cancel, node_args(), app_config(), Options {
            child: Some(Box::new(child)),
            ..Options::default()
        })
        .await
        .expect("envelope init"),
    );

    let serve = tokio::spawn({
        let envelope = Arc::clone(&envelope);
        let handler = Arc::clone(&handler);
        async move { envelope.serve(handler).await }
    });

    // The capture task is parked inside the blocked log_batch call now.
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = tokio::time::timeout(TEST_TIMEOUT, serve)
        .await
        .expect("serve must return within bounded time after cancel")
        .expect("serve task");
    assert!(matches!(result, Err(EnvelopeError::Cancelled)));
    assert!(
        handler.log_cx_cancelled.load(Ordering::SeqCst),
        "blocked handler call must observe cancellation on its context"
    );
}

/// Metric deltas fold into the same absolute values as an offline sum,
/// applied in wire order.
#[tokio::test]
async fn test_metrics_deltas_accumulate() {
    const DELTAS: [f64; 4] = [3.0, 4.5, 0.25, 10.0];

    let child = InProcessChild::new(|_config, args, stdio| async move {
        let _stdio = stdio;
        let mut link = serve_init(&args, "tcp://127.0.0.1:7010", wire_version()).await;

        let mut sent = 0usize;
        while let Some(req) = read_request(&mut link).await {
            assert_eq!(req.method, node::GET_METRICS);
            let update = MetricUpdate {
                defs: if sent == 0 {
                    vec![MetricDef {
                        id: 1,
                        name: "requests".to_string(),
                        typ: MetricType::Counter as i32,
                        help: String::new(),
                        labels: std::collections::HashMap::new(),
                        bounds: Vec::new(),
                    }]
                } else {
                    Vec::new()
                },
                values: vec![MetricValue {
                    id: 1,
                    value: DELTAS[sent],
                    counts: Vec::new(),
                }],
            };
            let reply = GetMetricsReply {
                update: Some(update),
            };
            link.send(ok_reply(req.id, &reply)).await.unwrap();
            sent += 1;
            if sent == DELTAS.len() {
                break;
            }
        }
        0
    });

    let cancel = CancellationToken::new();
    let handler = Arc::new(TestHandler::default());
    let envelope = Arc::new(
        Envelope::new(&cancel, node_args(), app_config(), Options {
            child: Some(Box::new(child)),
            ..Options::default()
        })
        .await
        .expect("envelope init"),
    );

    let serve = tokio::spawn({
        let envelope = Arc::clone(&envelope);
        let handler = Arc::clone(&handler);
        async move { envelope.serve(handler).await }
    });

    let mut expected = 0.0;
    for delta in DELTAS {
        expected += delta;
        let snapshots = envelope.get_metrics().await.expect("get metrics");
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "requests");
        assert_eq!(snapshots[0].value, expected, "running absolute value");
    }

    let result = tokio::time::timeout(TEST_TIMEOUT, serve)
        .await
        .expect("serve must return after node exit")
        .expect("serve task");
    assert!(result.is_ok(), "clean node exit: {result:?}");
}

/// A caller-provided socket directory is used as-is and survives the
/// envelope; only envelope-created directories are removed.
#[tokio::test]
async fn test_caller_owned_tmp_dir_is_kept() {
    let dir = tempfile::tempdir().expect("tempdir");

    let child = InProcessChild::new(|_config, args, _stdio| async move {
        let _link = serve_init(&args, "tcp://127.0.0.1:7011", wire_version()).await;
        0
    });

    let cancel = CancellationToken::new();
    let handler = Arc::new(TestHandler::default());
    let envelope = Envelope::new(&cancel, node_args(), app_config(), Options {
        tmp_dir: Some(dir.path().to_path_buf()),
        child: Some(Box::new(child)),
    })
    .await
    .expect("envelope init");
    assert_eq!(envelope.tmp_dir(), dir.path());

    tokio::time::timeout(TEST_TIMEOUT, envelope.serve(Arc::clone(&handler) as Arc<dyn EnvelopeHandler>))
        .await
        .expect("serve must return")
        .expect("clean exit");

    assert!(dir.path().exists(), "caller-owned dir must not be removed");
}
