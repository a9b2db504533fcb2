//! Well-known control component paths and method names.
//!
//! Both sides of the control link bake these strings in; renaming any of
//! them is a breaking protocol change.

/// Component path of the deployer-control endpoint, served by the envelope.
///
/// The envelope emits a redirect that resolves this path to its own Unix
/// socket, so the node's deployer-control handle dials back to its
/// supervisor.
pub const DEPLOYER_PATH: &str = "warden/deployer-control";

/// Component path of the node-control endpoint, served by the node.
pub const NODE_PATH: &str = "warden/node-control";

/// Method names on the node-control endpoint (envelope → node).
pub mod node {
    /// Initialize the node. Must be the first call on the link.
    pub const INIT_NODE: &str = "InitNode";
    /// Update the set of components the node should host.
    pub const UPDATE_COMPONENTS: &str = "UpdateComponents";
    /// Deliver fresh routing info for one component.
    pub const UPDATE_ROUTING_INFO: &str = "UpdateRoutingInfo";
    /// Fetch node health.
    pub const GET_HEALTH: &str = "GetHealth";
    /// Fetch a load report.
    pub const GET_LOAD: &str = "GetLoad";
    /// Fetch a metric delta.
    pub const GET_METRICS: &str = "GetMetrics";
    /// Collect a profile.
    pub const GET_PROFILE: &str = "GetProfile";
}

/// Method names on the deployer-control endpoint (node → envelope).
pub mod deployer {
    /// Ensure a component is running somewhere.
    pub const ACTIVATE_COMPONENT: &str = "ActivateComponent";
    /// Ask where a named listener should bind.
    pub const GET_LISTENER_ADDRESS: &str = "GetListenerAddress";
    /// Register a listener's bound address.
    pub const EXPORT_LISTENER: &str = "ExportListener";
    /// Fetch the node's own certificate and key (mTLS only).
    pub const GET_SELF_CERTIFICATE: &str = "GetSelfCertificate";
    /// Validate a client certificate chain (mTLS only).
    pub const VERIFY_CLIENT_CERTIFICATE: &str = "VerifyClientCertificate";
    /// Validate a server certificate chain (mTLS only).
    pub const VERIFY_SERVER_CERTIFICATE: &str = "VerifyServerCertificate";
    /// Ingest a batch of log records.
    pub const LOG_BATCH: &str = "LogBatch";
    /// Ingest a batch of trace spans.
    pub const HANDLE_TRACE_SPANS: &str = "HandleTraceSpans";
}
