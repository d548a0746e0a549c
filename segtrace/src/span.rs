//! The span entity and its cross-segment reference.
//!
//! A span is one timed unit of work. Its role in the segment is a plain
//! `kind` discriminant, not a type hierarchy: Entry spans mark the inbound
//! boundary, Exit spans an outbound call with a `peer`, Local spans internal
//! work. References tie an Entry span (or a continued span) back to the
//! upstream segment that caused it.

use std::borrow::Cow;
use std::time::{Duration, SystemTime};

use crate::ids::{SegmentId, SpanId, TraceId};

/// The operational role of a span within its segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// Inbound boundary: a request entered this process here.
    Entry,
    /// Outbound boundary: a call left this process here.
    Exit,
    /// Work that stays inside the process.
    Local,
}

/// Coarse classification of what a span instruments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SpanLayer {
    /// Not classified.
    #[default]
    Unknown,
    /// Database access.
    Database,
    /// RPC framework call.
    Rpc,
    /// HTTP traffic.
    Http,
    /// Message queue produce or consume.
    Mq,
    /// Cache access.
    Cache,
}

/// One timestamped set of key/value fields recorded on a span.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEvent {
    timestamp: SystemTime,
    fields: Vec<(Cow<'static, str>, String)>,
}

impl LogEvent {
    pub(crate) fn now(fields: Vec<(Cow<'static, str>, String)>) -> Self {
        LogEvent {
            timestamp: crate::time::now(),
            fields,
        }
    }

    /// When the event was recorded.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// The recorded fields, in the order they were given.
    pub fn fields(&self) -> &[(Cow<'static, str>, String)] {
        &self.fields
    }
}

/// How a [`SegmentReference`] was established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefType {
    /// The upstream segment lives in another process; the link arrived in a
    /// propagation carrier.
    CrossProcess,
    /// The upstream segment lives in another execution unit of this
    /// process; the link arrived in a context snapshot.
    CrossThread,
}

/// Causal link from a span back to the upstream segment that triggered it.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentReference {
    /// Whether the link crossed a process or only an execution unit.
    pub ref_type: RefType,
    /// Trace the upstream segment belongs to.
    pub trace_id: TraceId,
    /// The upstream segment.
    pub parent_segment_id: SegmentId,
    /// The span inside the upstream segment that made the call.
    pub parent_span_id: SpanId,
    /// Service name of the upstream process.
    pub parent_service: String,
    /// Service instance identity of the upstream process.
    pub parent_service_instance: String,
    /// Operation name of the upstream segment's entry span.
    pub parent_endpoint: String,
    /// Address this process was reached at, as the upstream saw it. Empty
    /// for cross-thread links.
    pub network_address: String,
    /// Sampling decision inherited from the upstream segment.
    pub sampled: bool,
}

/// One timed, named unit of work within a segment.
#[derive(Clone, Debug)]
pub struct Span {
    span_id: SpanId,
    parent_span_id: SpanId,
    operation_name: String,
    kind: SpanKind,
    layer: SpanLayer,
    component_id: u32,
    start_time: SystemTime,
    end_time: Option<SystemTime>,
    tags: Vec<(Cow<'static, str>, String)>,
    logs: Vec<LogEvent>,
    is_error: bool,
    peer: Option<String>,
    refs: Vec<SegmentReference>,
}

impl Span {
    pub(crate) fn begin(
        span_id: SpanId,
        parent_span_id: SpanId,
        operation_name: impl Into<String>,
        kind: SpanKind,
    ) -> Self {
        Span {
            span_id,
            parent_span_id,
            operation_name: operation_name.into(),
            kind,
            layer: SpanLayer::Unknown,
            component_id: 0,
            start_time: crate::time::now(),
            end_time: None,
            tags: Vec::new(),
            logs: Vec::new(),
            is_error: false,
            peer: None,
            refs: Vec::new(),
        }
    }

    /// Sequence number of this span within its segment.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// Id of the span that was on top of the stack when this one was
    /// created; [`SpanId::NONE`] for a segment's first span.
    pub fn parent_span_id(&self) -> SpanId {
        self.parent_span_id
    }

    /// The operation this span measures.
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Role of this span within the segment.
    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    /// Classification of the instrumented library.
    pub fn layer(&self) -> SpanLayer {
        self.layer
    }

    /// Numeric id of the instrumented component, 0 when unset.
    pub fn component_id(&self) -> u32 {
        self.component_id
    }

    /// When this span was created.
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// When this span was stopped; `None` while it is still open.
    pub fn end_time(&self) -> Option<SystemTime> {
        self.end_time
    }

    /// Elapsed time between start and stop, once stopped.
    pub fn duration(&self) -> Option<Duration> {
        self.end_time
            .and_then(|end| end.duration_since(self.start_time).ok())
    }

    /// Recorded tags, later writes to the same key having replaced earlier
    /// ones.
    pub fn tags(&self) -> &[(Cow<'static, str>, String)] {
        &self.tags
    }

    /// Recorded log events, in order.
    pub fn logs(&self) -> &[LogEvent] {
        &self.logs
    }

    /// Whether the traced operation failed.
    pub fn is_error(&self) -> bool {
        self.is_error
    }

    /// Remote address of an Exit span's callee.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Upstream links attached to this span.
    pub fn refs(&self) -> &[SegmentReference] {
        &self.refs
    }

    /// Replace the operation name.
    pub fn set_operation_name(&mut self, operation_name: impl Into<String>) -> &mut Self {
        self.operation_name = operation_name.into();
        self
    }

    /// Record a tag, overwriting any earlier value for the same key.
    pub fn tag(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.tags.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.tags.push((key, value)),
        }
        self
    }

    /// Append a timestamped log event with the given fields.
    pub fn log<K, V>(&mut self, fields: impl IntoIterator<Item = (K, V)>) -> &mut Self
    where
        K: Into<Cow<'static, str>>,
        V: Into<String>,
    {
        self.logs.push(LogEvent::now(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ));
        self
    }

    /// Mark the traced operation as failed. Does not stop the span; the
    /// caller still owns its lifecycle.
    pub fn error_occurred(&mut self) -> &mut Self {
        self.is_error = true;
        self
    }

    /// Mark the span failed and append a log event describing the error.
    pub fn log_error(&mut self, error: &dyn std::error::Error) -> &mut Self {
        self.is_error = true;
        self.log([("event", "error".to_owned()), ("message", error.to_string())])
    }

    /// Classify the instrumented library.
    pub fn set_layer(&mut self, layer: SpanLayer) -> &mut Self {
        self.layer = layer;
        self
    }

    /// Record the numeric id of the instrumented component.
    pub fn set_component_id(&mut self, component_id: u32) -> &mut Self {
        self.component_id = component_id;
        self
    }

    /// Record the remote address of the callee, or for an Entry span the
    /// address the caller used.
    pub fn set_peer(&mut self, peer: impl Into<String>) -> &mut Self {
        self.peer = Some(peer.into());
        self
    }

    pub(crate) fn add_ref(&mut self, segment_ref: SegmentReference) {
        self.refs.push(segment_ref);
    }

    pub(crate) fn end(&mut self) {
        // A stopped clock must not produce a negative duration.
        let now = crate::time::now();
        self.end_time = Some(now.max(self.start_time));
    }

    pub(crate) fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}
