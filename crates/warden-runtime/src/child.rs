//! Node child abstraction.
//!
//! The envelope runs its node through the [`Child`] trait so the same
//! orchestration works for a real subprocess ([`ProcessChild`]) and for an
//! in-process node ([`InProcessChild`], used by tests and single-process
//! deployers).

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, DuplexStream};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use warden_core::bootstrap;
use warden_core::protocol::messages::{AppConfig, NodeArgs};

use crate::error::EnvelopeError;

/// A take-once readable byte stream carrying captured node output.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// How a node ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// The node exited with the given code.
    Exited(i32),
    /// The node was killed by the given signal.
    Killed(i32),
}

impl ChildStatus {
    /// True for a clean zero exit.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// The exit code, if the node exited rather than being killed.
    #[must_use]
    pub const fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::Killed(_) => None,
        }
    }
}

impl std::fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Killed(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

impl From<std::process::ExitStatus> for ChildStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status.code() {
            Some(code) => Self::Exited(code),
            // A status with neither code nor signal cannot happen on Unix;
            // report SIGKILL if it somehow does.
            None => Self::Killed(status.signal().unwrap_or(9)),
        }
    }
}

/// A running node, as seen by the envelope.
///
/// `stdout` and `stderr` are take-once: the envelope drains them to EOF
/// before consulting [`Child::wait`], matching standard subprocess
/// semantics. Stream EOF is normal termination, not an error; a crash shows
/// up as a non-success status from `wait`.
#[async_trait]
pub trait Child: Send {
    /// Launch the node.
    ///
    /// The node must be torn down when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::StartFailed`] if the node cannot be
    /// launched.
    async fn start(
        &mut self,
        cancel: &CancellationToken,
        config: &AppConfig,
        args: &NodeArgs,
    ) -> Result<(), EnvelopeError>;

    /// Block until the node ends and return how it ended.
    ///
    /// Idempotent: subsequent calls return the cached status.
    ///
    /// # Errors
    ///
    /// Returns an error if the node was never started or the status could
    /// not be collected.
    async fn wait(&mut self) -> Result<ChildStatus, EnvelopeError>;

    /// OS process id, for subprocess variants.
    fn pid(&self) -> Option<u32>;

    /// Take the node's stdout stream. Returns `None` after the first call.
    fn stdout(&mut self) -> Option<OutputStream>;

    /// Take the node's stderr stream. Returns `None` after the first call.
    fn stderr(&mut self) -> Option<OutputStream>;
}

// Reaper outcome: the status, or a description of why it was lost.
type StatusResult = Result<ChildStatus, String>;

async fn await_status(
    rx: Option<&mut watch::Receiver<Option<StatusResult>>>,
    cached: &mut Option<ChildStatus>,
) -> Result<ChildStatus, EnvelopeError> {
    if let Some(status) = *cached {
        return Ok(status);
    }
    let Some(rx) = rx else {
        return Err(EnvelopeError::StartFailed("node was never started".to_string()));
    };
    let value = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| EnvelopeError::transport("node reaper vanished"))?
        .clone();
    match value.unwrap_or(Err("missing status".to_string())) {
        Ok(status) => {
            *cached = Some(status);
            Ok(status)
        }
        Err(msg) => Err(EnvelopeError::Transport(msg)),
    }
}

/// Runs the node as an OS subprocess.
///
/// Node arguments travel through the `NODE_ARGS` environment variable; see
/// [`warden_core::bootstrap`]. A reaper task owns the OS child: it kills the
/// process when the cancellation scope fires and publishes the exit status
/// for [`Child::wait`].
#[derive(Default)]
pub struct ProcessChild {
    pid: Option<u32>,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    status_rx: Option<watch::Receiver<Option<StatusResult>>>,
    cached: Option<ChildStatus>,
}

impl ProcessChild {
    /// Create a not-yet-started subprocess child.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Child for ProcessChild {
    async fn start(
        &mut self,
        cancel: &CancellationToken,
        config: &AppConfig,
        args: &NodeArgs,
    ) -> Result<(), EnvelopeError> {
        if config.binary.is_empty() {
            return Err(EnvelopeError::ConfigInvalid(
                "app config has no binary path".to_string(),
            ));
        }

        let mut child = Command::new(&config.binary)
            .args(&config.args)
            .env(bootstrap::NODE_ARGS_ENV, bootstrap::to_env(args))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EnvelopeError::StartFailed(format!("spawn {}: {e}", config.binary)))?;

        self.pid = child.id();
        self.stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as OutputStream);
        self.stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as OutputStream);

        let (tx, rx) = watch::channel(None);
        self.status_rx = Some(rx);

        let cancel = cancel.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                biased;
                status = child.wait() => status,
                () = cancel.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let result = status
                .map(ChildStatus::from)
                .map_err(|e| format!("collect node status: {e}"));
            let _ = tx.send(Some(result));
        });

        Ok(())
    }

    async fn wait(&mut self) -> Result<ChildStatus, EnvelopeError> {
        await_status(self.status_rx.as_mut(), &mut self.cached).await
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    fn stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take()
    }
}

/// Write ends of the stdio pipes handed to an in-process node body.
pub struct NodeStdio {
    /// The node's stdout; whatever is written here is captured by the
    /// envelope line by line.
    pub stdout: DuplexStream,
    /// The node's stderr.
    pub stderr: DuplexStream,
}

type NodeBody = Box<
    dyn FnOnce(AppConfig, NodeArgs, NodeStdio) -> futures::future::BoxFuture<'static, i32>
        + Send,
>;

/// Runs the node as a future inside the envelope's own process.
///
/// The body receives the final [`NodeArgs`] (control socket and redirects
/// stamped in) plus pipe write-ends standing in for stdio, and returns an
/// exit code. Cancellation drops the body, which the envelope observes as a
/// kill.
pub struct InProcessChild {
    body: Option<NodeBody>,
    status_rx: Option<watch::Receiver<Option<StatusResult>>>,
    cached: Option<ChildStatus>,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
}

impl InProcessChild {
    /// Pipe capacity for each stdio stream.
    const PIPE_CAPACITY: usize = 64 * 1024;

    /// Create an in-process child from a node body.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(AppConfig, NodeArgs, NodeStdio) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = i32> + Send + 'static,
    {
        Self {
            body: Some(Box::new(move |config, args, stdio| {
                Box::pin(body(config, args, stdio))
            })),
            status_rx: None,
            cached: None,
            stdout: None,
            stderr: None,
        }
    }
}

#[async_trait]
impl Child for InProcessChild {
    async fn start(
        &mut self,
        cancel: &CancellationToken,
        config: &AppConfig,
        args: &NodeArgs,
    ) -> Result<(), EnvelopeError> {
        let body = self
            .body
            .take()
            .ok_or_else(|| EnvelopeError::StartFailed("node already started".to_string()))?;

        let (stdout_rd, stdout_wr) = tokio::io::duplex(Self::PIPE_CAPACITY);
        let (stderr_rd, stderr_wr) = tokio::io::duplex(Self::PIPE_CAPACITY);
        self.stdout = Some(Box::new(stdout_rd));
        self.stderr = Some(Box::new(stderr_rd));

        let (tx, rx) = watch::channel(None);
        self.status_rx = Some(rx);

        let stdio = NodeStdio {
            stdout: stdout_wr,
            stderr: stderr_wr,
        };
        let fut = body(config.clone(), args.clone(), stdio);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                biased;
                code = fut => ChildStatus::Exited(code),
                () = cancel.cancelled() => ChildStatus::Killed(9),
            };
            let _ = tx.send(Some(Ok(status)));
        });

        Ok(())
    }

    async fn wait(&mut self) -> Result<ChildStatus, EnvelopeError> {
        await_status(self.status_rx.as_mut(), &mut self.cached).await
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    fn stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn shell(script: &str) -> AppConfig {
        AppConfig {
            name: "test".to_string(),
            binary: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            sections: std::collections::HashMap::new(),
        }
    }

    fn args() -> NodeArgs {
        NodeArgs {
            app: "test".to_string(),
            deployment_id: "d".to_string(),
            node_id: "n".to_string(),
            mtls: false,
            run_main: true,
            internal_address: String::new(),
            control_socket: "/tmp/unused.sock".to_string(),
            redirects: Vec::new(),
        }
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_process_child_captures_stdout_and_status() {
        let cancel = CancellationToken::new();
        let mut child = ProcessChild::new();
        child
            .start(&cancel, &shell("echo hello; exit 3"), &args())
            .await
            .unwrap();

        assert!(child.pid().is_some());

        let mut stdout = child.stdout().unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello\n");

        let status = child.wait().await.unwrap();
        assert_eq!(status, ChildStatus::Exited(3));
        assert_eq!(status.code(), Some(3));
        assert!(!status.success());

        // Idempotent.
        assert_eq!(child.wait().await.unwrap(), status);
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_process_child_killed_on_cancel() {
        let cancel = CancellationToken::new();
        let mut child = ProcessChild::new();
        child
            .start(&cancel, &shell("sleep 60"), &args())
            .await
            .unwrap();

        cancel.cancel();
        let status = child.wait().await.unwrap();
        assert_eq!(status, ChildStatus::Killed(9));
        assert_eq!(status.code(), None);
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_process_child_spawn_failure() {
        let cancel = CancellationToken::new();
        let mut child = ProcessChild::new();
        let mut config = shell("true");
        config.binary = "/nonexistent/binary/xyz".to_string();

        let result = child.start(&cancel, &config, &args()).await;
        assert!(matches!(result, Err(EnvelopeError::StartFailed(_))));
    }

    #[tokio::test]
    async fn test_in_process_child_runs_body() {
        let cancel = CancellationToken::new();
        let mut child = InProcessChild::new(|_config, node_args, mut stdio| async move {
            stdio
                .stdout
                .write_all(format!("node {}\n", node_args.node_id).as_bytes())
                .await
                .unwrap();
            7
        });

        child.start(&cancel, &shell("unused"), &args()).await.unwrap();
        assert_eq!(child.pid(), None);

        let mut stdout = child.stdout().unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "node n\n");

        assert_eq!(child.wait().await.unwrap(), ChildStatus::Exited(7));
    }

    #[tokio::test]
    async fn test_in_process_child_cancel_reads_as_kill() {
        let cancel = CancellationToken::new();
        let mut child = InProcessChild::new(|_, _, _stdio| async move {
            std::future::pending::<()>().await;
            0
        });

        child.start(&cancel, &shell("unused"), &args()).await.unwrap();
        cancel.cancel();
        assert_eq!(child.wait().await.unwrap(), ChildStatus::Killed(9));
    }

    #[tokio::test]
    async fn test_wait_before_start_fails() {
        let mut child = ProcessChild::new();
        assert!(matches!(
            child.wait().await,
            Err(EnvelopeError::StartFailed(_))
        ));
    }
}
