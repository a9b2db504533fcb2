//! Wire messages exchanged over the control link.
//!
//! Every payload that crosses the envelope/node boundary is a prost message
//! encoded into the body of a [`CallRequest`] or [`CallResponse`] envelope.
//! Arguments and results are wire messages (rather than shared in-memory
//! types) so deployers can evolve independently of application binaries.
//!
//! Field sets are append-only: tags are never reused and removed fields are
//! reserved by convention.

use std::collections::HashMap;

// ============================================================================
// Call envelope
// ============================================================================

/// One control-link call, sent by either endpoint's client half.
///
/// `id` is monotonically increasing per connection and correlates the
/// response. A `deadline_micros` of zero means no deadline.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallRequest {
    /// Request id, unique and increasing per connection.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Target component path (a well-known control path).
    #[prost(string, tag = "2")]
    pub component: String,
    /// Method name within the target component.
    #[prost(string, tag = "3")]
    pub method: String,
    /// Absolute deadline in microseconds since the Unix epoch, or 0.
    #[prost(int64, tag = "4")]
    pub deadline_micros: i64,
    /// Encoded request message.
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
}

/// The response to a [`CallRequest`], matched by `id`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallResponse {
    /// Id of the request this responds to.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Either the encoded reply message or an error description.
    #[prost(oneof = "call_response::Outcome", tags = "2, 3")]
    pub outcome: Option<call_response::Outcome>,
}

/// Nested types for [`CallResponse`].
pub mod call_response {
    /// Success or failure body of a call response.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        /// Encoded reply message.
        #[prost(bytes, tag = "2")]
        Payload(Vec<u8>),
        /// Error reported by the remote handler or dispatcher.
        #[prost(string, tag = "3")]
        Error(String),
    }
}

// ============================================================================
// Node arguments and application configuration
// ============================================================================

/// Arguments handed to a node at launch, via the `NODE_ARGS` environment
/// variable for subprocess nodes.
///
/// All string fields except entries in `redirects` must be non-empty; see
/// [`crate::bootstrap::check_node_args`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeArgs {
    /// Application name.
    #[prost(string, tag = "1")]
    pub app: String,
    /// Deployment id, unique per rollout of the application.
    #[prost(string, tag = "2")]
    pub deployment_id: String,
    /// Node id, unique per node within a deployment.
    #[prost(string, tag = "3")]
    pub node_id: String,
    /// Whether the node should establish mTLS connections to its peers.
    #[prost(bool, tag = "4")]
    pub mtls: bool,
    /// Whether this node runs the application main component.
    #[prost(bool, tag = "5")]
    pub run_main: bool,
    /// Address hint the node uses when choosing its dial address.
    #[prost(string, tag = "6")]
    pub internal_address: String,
    /// Filesystem path of the Unix socket the node must listen on for
    /// node-control calls.
    #[prost(string, tag = "7")]
    pub control_socket: String,
    /// Component resolution overrides. The envelope always prepends one
    /// redirect aiming the deployer-control path at its own socket.
    #[prost(message, repeated, tag = "8")]
    pub redirects: Vec<Redirect>,
}

/// Forces a logical component path to resolve to an alternate implementation
/// at a specific dial address.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Redirect {
    /// Component path being redirected.
    #[prost(string, tag = "1")]
    pub component: String,
    /// Component path of the implementation to use instead.
    #[prost(string, tag = "2")]
    pub target: String,
    /// Dial address of the target, e.g. `unix:///tmp/…/sock`.
    #[prost(string, tag = "3")]
    pub address: String,
}

/// Application configuration as seen by the deployer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppConfig {
    /// Application name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Path to the application binary.
    #[prost(string, tag = "2")]
    pub binary: String,
    /// Arguments passed to the binary.
    #[prost(string, repeated, tag = "3")]
    pub args: Vec<String>,
    /// Opaque per-subsystem configuration sections, forwarded to the node
    /// at init.
    #[prost(map = "string, bytes", tag = "4")]
    pub sections: HashMap<String, Vec<u8>>,
}

// ============================================================================
// Node-control messages (envelope -> node)
// ============================================================================

/// Initializes a freshly started node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitNodeRequest {
    /// Configuration sections from [`AppConfig::sections`].
    #[prost(map = "string, bytes", tag = "1")]
    pub sections: HashMap<String, Vec<u8>>,
}

/// The node's half of the init handshake.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitNodeReply {
    /// Address other nodes should dial to reach this node.
    #[prost(string, tag = "1")]
    pub dial_addr: String,
    /// Deployer API version the node was built against.
    #[prost(message, optional, tag = "2")]
    pub version: Option<SemVer>,
}

/// A semantic version triple.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SemVer {
    /// Major version.
    #[prost(int32, tag = "1")]
    pub major: i32,
    /// Minor version.
    #[prost(int32, tag = "2")]
    pub minor: i32,
    /// Patch version.
    #[prost(int32, tag = "3")]
    pub patch: i32,
}

/// Updates the set of components the node should be running.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateComponentsRequest {
    /// Full set of component paths the node should host.
    #[prost(string, repeated, tag = "1")]
    pub components: Vec<String>,
}

/// Reply to [`UpdateComponentsRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateComponentsReply {}

/// Delivers a component's most recent routing info to the node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateRoutingRequest {
    /// The routing info to install.
    #[prost(message, optional, tag = "1")]
    pub routing_info: Option<RoutingInfo>,
}

/// Reply to [`UpdateRoutingRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateRoutingReply {}

/// Where a component currently runs, forwarded unmodified to the node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoutingInfo {
    /// Component path this routing info describes.
    #[prost(string, tag = "1")]
    pub component: String,
    /// True if the component should be invoked locally rather than dialed.
    #[prost(bool, tag = "2")]
    pub local: bool,
    /// Dial addresses of the nodes hosting the component.
    #[prost(string, repeated, tag = "3")]
    pub replicas: Vec<String>,
    /// Shard assignment for routed components, if any.
    #[prost(message, optional, tag = "4")]
    pub assignment: Option<Assignment>,
}

/// A sharded key-range assignment across replicas.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Assignment {
    /// Slices of the key space, sorted by `start`.
    #[prost(message, repeated, tag = "1")]
    pub slices: Vec<AssignmentSlice>,
    /// Assignment version; newer versions replace older ones.
    #[prost(uint64, tag = "2")]
    pub version: u64,
}

/// One slice of an [`Assignment`]: the key range starting at `start`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AssignmentSlice {
    /// Inclusive start of the key range.
    #[prost(uint64, tag = "1")]
    pub start: u64,
    /// Replicas serving this slice.
    #[prost(string, repeated, tag = "2")]
    pub replicas: Vec<String>,
}

/// Fetches node health.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHealthRequest {}

/// Reply to [`GetHealthRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHealthReply {
    /// Reported health status.
    #[prost(enumeration = "HealthStatus", tag = "1")]
    pub status: i32,
}

/// Health of a node as observed over the control link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HealthStatus {
    /// Health could not be determined.
    Unknown = 0,
    /// The node is serving.
    Healthy = 1,
    /// The node is running but failing its own checks.
    Unhealthy = 2,
    /// The node has terminated.
    Terminated = 3,
}

/// Fetches a load report from the node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLoadRequest {}

/// Reply to [`GetLoadRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLoadReply {
    /// The node's current load report.
    #[prost(message, optional, tag = "1")]
    pub load: Option<LoadReport>,
}

/// Load observed by a node, keyed by hosted component path.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadReport {
    /// Load per component, in deployer-defined units.
    #[prost(map = "string, double", tag = "1")]
    pub loads: HashMap<String, f64>,
    /// Version of the report; newer versions replace older ones.
    #[prost(string, tag = "2")]
    pub version: String,
}

/// Fetches a metric delta from the node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetMetricsRequest {}

/// Reply to [`GetMetricsRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetMetricsReply {
    /// Metric definitions and value deltas since the previous reply.
    #[prost(message, optional, tag = "1")]
    pub update: Option<MetricUpdate>,
}

/// A delta update for a set of metrics.
///
/// `defs` introduces metrics the receiver has not seen on this link;
/// `values` carries additive deltas for already-defined metric ids.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricUpdate {
    /// Newly defined metrics.
    #[prost(message, repeated, tag = "1")]
    pub defs: Vec<MetricDef>,
    /// Value deltas, in the order they were recorded.
    #[prost(message, repeated, tag = "2")]
    pub values: Vec<MetricValue>,
}

/// Definition of one metric, sent once per link.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricDef {
    /// Link-scoped metric id.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Metric name.
    #[prost(string, tag = "2")]
    pub name: String,
    /// Metric type.
    #[prost(enumeration = "MetricType", tag = "3")]
    pub typ: i32,
    /// Human-readable description.
    #[prost(string, tag = "4")]
    pub help: String,
    /// Metric labels.
    #[prost(map = "string, string", tag = "5")]
    pub labels: HashMap<String, String>,
    /// Histogram bucket boundaries; empty for counters and gauges.
    #[prost(double, repeated, tag = "6")]
    pub bounds: Vec<f64>,
}

/// An additive delta for one metric.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricValue {
    /// Id of a previously defined metric.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Delta to add to the metric value.
    #[prost(double, tag = "2")]
    pub value: f64,
    /// Per-bucket count deltas for histograms; empty otherwise.
    #[prost(uint64, repeated, tag = "3")]
    pub counts: Vec<u64>,
}

/// The kind of a metric.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, serde::Serialize,
)]
#[repr(i32)]
pub enum MetricType {
    /// Unset.
    Invalid = 0,
    /// Monotonically increasing counter.
    Counter = 1,
    /// Instantaneous gauge.
    Gauge = 2,
    /// Bucketed histogram.
    Histogram = 3,
}

/// Requests a profile from the node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetProfileRequest {
    /// Kind of profile to collect.
    #[prost(enumeration = "ProfileType", tag = "1")]
    pub typ: i32,
    /// Sampling duration for CPU profiles, in microseconds.
    #[prost(int64, tag = "2")]
    pub cpu_duration_micros: i64,
}

/// Reply to [`GetProfileRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetProfileReply {
    /// Serialized profile data.
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

/// Kind of profile a node can collect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProfileType {
    /// Unset.
    Unspecified = 0,
    /// Heap allocation profile.
    Heap = 1,
    /// CPU profile sampled over `cpu_duration_micros`.
    Cpu = 2,
}

// ============================================================================
// Deployer-control messages (node -> envelope)
// ============================================================================

/// Asks the deployer to ensure a component is running somewhere.
///
/// Also signals that the caller wants routing info updates for the
/// component.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateComponentRequest {
    /// Path of the component to activate.
    #[prost(string, tag = "1")]
    pub component: String,
    /// True if invocations of the component are routed.
    #[prost(bool, tag = "2")]
    pub routed: bool,
}

/// Reply to [`ActivateComponentRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateComponentReply {}

/// Asks the deployer which address a named listener should bind to.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetListenerAddressRequest {
    /// Listener name.
    #[prost(string, tag = "1")]
    pub name: String,
}

/// Reply to [`GetListenerAddressRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetListenerAddressReply {
    /// Address the node should bind, e.g. `localhost:0`.
    #[prost(string, tag = "1")]
    pub address: String,
}

/// Registers the address a node actually bound for a listener.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExportListenerRequest {
    /// Listener name.
    #[prost(string, tag = "1")]
    pub listener: String,
    /// Address the node bound.
    #[prost(string, tag = "2")]
    pub address: String,
}

/// Reply to [`ExportListenerRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExportListenerReply {
    /// Address of a proxy forwarding to the listener, if one was started.
    #[prost(string, tag = "1")]
    pub proxy_address: String,
}

/// Fetches the certificate and key the node should present to peers.
///
/// Issued each time the node establishes a connection; only sent when the
/// node was launched with [`NodeArgs::mtls`] set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetSelfCertificateRequest {}

/// Reply to [`GetSelfCertificateRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetSelfCertificateReply {
    /// DER-encoded certificate chain, leaf first.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub cert_chain: Vec<Vec<u8>>,
    /// DER-encoded private key for the leaf certificate.
    #[prost(bytes = "vec", tag = "2")]
    pub private_key: Vec<u8>,
}

/// Asks the deployer to validate a connecting client's certificate chain.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerifyClientCertificateRequest {
    /// DER-encoded certificate chain presented by the client.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub cert_chain: Vec<Vec<u8>>,
}

/// Reply to [`VerifyClientCertificateRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerifyClientCertificateReply {
    /// Component paths the client is authorized to invoke.
    #[prost(string, repeated, tag = "1")]
    pub components: Vec<String>,
}

/// Asks the deployer to validate a server's certificate chain against the
/// identity of the component being dialed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerifyServerCertificateRequest {
    /// DER-encoded certificate chain presented by the server.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub cert_chain: Vec<Vec<u8>>,
    /// Component the caller intended to reach.
    #[prost(string, tag = "2")]
    pub target_component: String,
}

/// Reply to [`VerifyServerCertificateRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerifyServerCertificateReply {}

// ============================================================================
// Telemetry
// ============================================================================

/// One log record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntry {
    /// Application name.
    #[prost(string, tag = "1")]
    pub app: String,
    /// Deployment id.
    #[prost(string, tag = "2")]
    pub deployment: String,
    /// Component that produced the record, or `"stdout"`/`"stderr"` for
    /// captured node output.
    #[prost(string, tag = "3")]
    pub component: String,
    /// Node id.
    #[prost(string, tag = "4")]
    pub node: String,
    /// Time the record was produced, microseconds since the Unix epoch;
    /// 0 if unknown.
    #[prost(int64, tag = "5")]
    pub time_micros: i64,
    /// Severity, or `"stdout"`/`"stderr"` for captured output.
    #[prost(string, tag = "6")]
    pub level: String,
    /// Source file, if known.
    #[prost(string, tag = "7")]
    pub file: String,
    /// Source line, or -1 if unknown.
    #[prost(int32, tag = "8")]
    pub line: i32,
    /// Log message.
    #[prost(string, tag = "9")]
    pub msg: String,
}

/// A batch of log records.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogBatch {
    /// The records, oldest first.
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<LogEntry>,
}

/// A batch of trace spans.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TraceSpans {
    /// The spans.
    #[prost(message, repeated, tag = "1")]
    pub spans: Vec<Span>,
}

/// One trace span, shaped after the OpenTelemetry span data model.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Span {
    /// Span name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// 16-byte trace id.
    #[prost(bytes = "vec", tag = "2")]
    pub trace_id: Vec<u8>,
    /// 8-byte span id.
    #[prost(bytes = "vec", tag = "3")]
    pub span_id: Vec<u8>,
    /// 8-byte parent span id; empty for root spans.
    #[prost(bytes = "vec", tag = "4")]
    pub parent_span_id: Vec<u8>,
    /// Span kind.
    #[prost(enumeration = "SpanKind", tag = "5")]
    pub kind: i32,
    /// Start time, microseconds since the Unix epoch.
    #[prost(int64, tag = "6")]
    pub start_micros: i64,
    /// End time, microseconds since the Unix epoch.
    #[prost(int64, tag = "7")]
    pub end_micros: i64,
    /// Span attributes.
    #[prost(map = "string, string", tag = "8")]
    pub attributes: HashMap<String, String>,
    /// Final status of the span.
    #[prost(enumeration = "SpanStatus", tag = "9")]
    pub status: i32,
    /// Description accompanying an error status.
    #[prost(string, tag = "10")]
    pub status_message: String,
}

/// The kind of operation a span describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SpanKind {
    /// Unset.
    Unspecified = 0,
    /// Internal operation.
    Internal = 1,
    /// Server-side handling of a call.
    Server = 2,
    /// Client-side issuance of a call.
    Client = 3,
    /// Message producer.
    Producer = 4,
    /// Message consumer.
    Consumer = 5,
}

/// The final status of a span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SpanStatus {
    /// No status recorded.
    Unset = 0,
    /// The operation succeeded.
    Ok = 1,
    /// The operation failed.
    Error = 2,
}
