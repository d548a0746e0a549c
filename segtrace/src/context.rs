//! Per-execution-unit tracing engine.
//!
//! A [`TracingContext`] owns the segment a single execution unit (thread,
//! task, request handler) is currently building. Spans open and close in
//! strict LIFO order; when the last span closes the segment seals into an
//! immutable [`TraceSegment`](crate::segment::TraceSegment) and is handed to
//! the tracer's reporter exactly once. The context itself is reusable: after
//! a segment seals, the next span starts a fresh one.

use crate::carrier::{CarrierReference, ContextCarrier, CorrelationContext};
use crate::error::{TraceError, TraceResult};
use crate::ids::{SegmentId, SpanId, TraceId};
use crate::segment::TraceSegment;
use crate::span::{RefType, SegmentReference, Span, SpanKind};
use crate::tracer::Tracer;
use crate::{seg_debug, seg_error, seg_warn};

/// Ticket for one open span, returned by the `create_*_span` methods and
/// consumed by [`TracingContext::stop_span`].
///
/// The handle pins both the span id and the segment it was opened in, so a
/// handle that outlives its segment is rejected instead of closing an
/// unrelated span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanHandle {
    segment_id: SegmentId,
    span_id: SpanId,
}

impl SpanHandle {
    /// Id of the span this handle refers to.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// Segment the span was opened in.
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }
}

/// Immutable capture of a live context, for continuing a trace in another
/// execution unit inside the same process.
///
/// A snapshot carries ids and the correlation baggage by value and holds no
/// reference to the captured segment, so it can cross thread and task
/// boundaries freely. See [`TracingContext::capture`] and
/// [`TracingContext::continued`].
#[derive(Clone, Debug)]
pub struct ContextSnapshot {
    trace_id: TraceId,
    segment_id: SegmentId,
    span_id: SpanId,
    sampled: bool,
    service: String,
    service_instance: String,
    parent_endpoint: String,
    correlation: CorrelationContext,
}

impl ContextSnapshot {
    /// Trace the captured segment belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Captured segment id.
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Id of the span that was active at capture time.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// Sampling flag of the captured segment.
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Service the captured segment was produced by.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Service instance the captured segment was produced by.
    pub fn service_instance(&self) -> &str {
        &self.service_instance
    }

    /// Entry operation of the captured segment, empty if it had none.
    pub fn parent_endpoint(&self) -> &str {
        &self.parent_endpoint
    }

    /// Correlation baggage copied out of the captured context.
    pub fn correlation(&self) -> &CorrelationContext {
        &self.correlation
    }
}

#[derive(Debug)]
struct StackFrame {
    span_index: usize,
    span_id: SpanId,
    /// Extra depth recorded by re-entrant `create_entry_span` calls on this
    /// frame; each one must be matched by a stop before the span closes.
    reentries: u32,
}

/// Mutable state of the segment currently being built. Exists only between
/// the first span of a segment and its seal.
#[derive(Debug)]
struct SegmentState {
    trace_id: TraceId,
    segment_id: SegmentId,
    sampled: bool,
    /// Set once an upstream reference decided the trace id; later carriers
    /// append references but no longer move the segment to their trace.
    has_upstream: bool,
    next_span_id: i32,
    spans: Vec<Span>,
    stack: Vec<StackFrame>,
    correlation: CorrelationContext,
}

/// Tracing engine for one execution unit.
///
/// Not `Clone` and not shareable: each unit owns exactly one context, which
/// is what makes the span stack single-writer without locking. Cross-unit
/// handoff goes through [`capture`](Self::capture) /
/// [`continued`](Self::continued) instead.
///
/// ```
/// use segtrace::reporter::InMemoryReporter;
/// use segtrace::{ContextCarrier, Tracer};
///
/// let reporter = InMemoryReporter::new();
/// let tracer = Tracer::builder("order").with_reporter(reporter.clone()).build();
///
/// let mut context = tracer.create_context();
/// let entry = context.create_entry_span("GET /orders", &ContextCarrier::new());
/// let exit = context.create_exit_span("SELECT orders", "db:5432");
/// context.stop_span(exit).unwrap();
/// assert!(context.stop_span(entry).unwrap());
///
/// let segment = &reporter.finished_segments().unwrap()[0];
/// assert_eq!(segment.spans.len(), 2);
/// ```
#[derive(Debug)]
pub struct TracingContext {
    tracer: Tracer,
    state: Option<SegmentState>,
}

impl TracingContext {
    pub(crate) fn new(tracer: Tracer) -> Self {
        TracingContext {
            tracer,
            state: None,
        }
    }

    /// Whether a segment with open spans is active on this context.
    pub fn is_tracing(&self) -> bool {
        self.state.is_some()
    }

    /// Trace id of the active segment.
    pub fn trace_id(&self) -> Option<TraceId> {
        self.state.as_ref().map(|state| state.trace_id)
    }

    /// Id of the active segment.
    pub fn segment_id(&self) -> Option<SegmentId> {
        self.state.as_ref().map(|state| state.segment_id)
    }

    /// Sampling flag of the active segment; `false` when no segment is
    /// active.
    pub fn is_sampled(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.sampled)
    }

    /// Open a span for a request entering this service.
    ///
    /// With no active segment this starts one: a valid `carrier` donates the
    /// trace id and sampling flag and becomes a cross-process reference on
    /// the new span; an empty or malformed carrier yields a fresh trace id
    /// with the tracer's sampler deciding the flag.
    ///
    /// When the active span already is an Entry span the call is re-entrant:
    /// the same span absorbs the inner transport layer. Its operation name
    /// is overwritten, recorded tags and logs stay, a valid carrier is
    /// appended as an additional reference, and the returned handle closes
    /// the span only after a matching number of stops.
    pub fn create_entry_span(&mut self, operation_name: &str, carrier: &ContextCarrier) -> SpanHandle {
        if let Some(state) = self.state.as_mut() {
            if let Some(frame) = state.stack.last_mut() {
                let span_index = frame.span_index;
                if state.spans[span_index].kind() == SpanKind::Entry {
                    frame.reentries += 1;
                    let span_id = frame.span_id;
                    state.spans[span_index].set_operation_name(operation_name);
                    Self::apply_carrier(state, carrier);
                    return SpanHandle {
                        segment_id: state.segment_id,
                        span_id,
                    };
                }
            }
        }

        let upstream = carrier
            .reference()
            .map(|reference| (reference.trace_id, reference.sampled));
        let state = self.ensure_segment(upstream, operation_name);
        let handle = Self::push_span(state, operation_name, SpanKind::Entry, None);
        Self::apply_carrier(state, carrier);
        handle
    }

    /// Open a span for a call leaving this service towards `peer`.
    ///
    /// Works without an active segment too: instrumentation that fires
    /// outside any entry point (startup hooks, timers) gets an implicit
    /// fresh segment instead of an error.
    pub fn create_exit_span(&mut self, operation_name: &str, peer: &str) -> SpanHandle {
        let state = self.ensure_segment(None, operation_name);
        Self::push_span(state, operation_name, SpanKind::Exit, Some(peer))
    }

    /// Open a span for an operation local to this service.
    pub fn create_local_span(&mut self, operation_name: &str) -> SpanHandle {
        let state = self.ensure_segment(None, operation_name);
        Self::push_span(state, operation_name, SpanKind::Local, None)
    }

    /// The innermost open span, if any.
    pub fn active_span(&self) -> Option<&Span> {
        let state = self.state.as_ref()?;
        let frame = state.stack.last()?;
        state.spans.get(frame.span_index)
    }

    /// Mutable access to the innermost open span, for tagging, logging and
    /// error marking.
    pub fn active_span_mut(&mut self) -> Option<&mut Span> {
        let state = self.state.as_mut()?;
        let frame = state.stack.last()?;
        state.spans.get_mut(frame.span_index)
    }

    /// Close the span behind `handle`.
    ///
    /// Returns `Ok(true)` when this stop sealed the segment and handed it to
    /// the reporter. `handle` must belong to the active segment
    /// ([`TraceError::WrongSegment`]) and must be the innermost open span.
    /// A stop out of stack order is a broken instrumentation contract: it is
    /// logged, the whole segment is discarded, the unit resets to empty and
    /// [`TraceError::OutOfOrder`] comes back.
    pub fn stop_span(&mut self, handle: SpanHandle) -> TraceResult<bool> {
        let state = self.state.as_mut().ok_or(TraceError::NoActiveContext)?;
        if handle.segment_id != state.segment_id {
            seg_warn!(name: "stop_span_wrong_segment",
                handle_segment_id = handle.segment_id.to_string(),
                active_segment_id = state.segment_id.to_string());
            return Err(TraceError::WrongSegment);
        }
        let Some(frame) = state.stack.last_mut() else {
            return Err(TraceError::NoActiveContext);
        };
        if frame.span_id != handle.span_id {
            let expected = frame.span_id;
            let found = handle.span_id;
            seg_error!(name: "stop_span_out_of_order",
                message = "span stopped out of stack order, discarding the active segment",
                expected_span_id = expected.to_string(),
                found_span_id = found.to_string(),
                trace_id = state.trace_id.to_string(),
                segment_id = state.segment_id.to_string());
            self.state = None;
            return Err(TraceError::OutOfOrder { expected, found });
        }
        if frame.reentries > 0 {
            frame.reentries -= 1;
            return Ok(false);
        }

        let Some(frame) = state.stack.pop() else {
            return Err(TraceError::NoActiveContext);
        };
        state.spans[frame.span_index].end();
        if !state.stack.is_empty() {
            return Ok(false);
        }
        let Some(state) = self.state.take() else {
            return Err(TraceError::NoActiveContext);
        };
        self.finish_segment(state);
        Ok(true)
    }

    /// Close whatever span is currently innermost.
    pub fn stop_active_span(&mut self) -> TraceResult<bool> {
        let handle = self.active_handle().ok_or(TraceError::NoActiveContext)?;
        self.stop_span(handle)
    }

    /// Fill `carrier` with the active context for an outbound call.
    ///
    /// The reference points at the active span; the endpoint group carries
    /// the segment's first Entry operation and the address group the active
    /// span's peer when it is an Exit span.
    pub fn inject(&self, carrier: &mut ContextCarrier) -> TraceResult<()> {
        let state = self.state.as_ref().ok_or(TraceError::NoActiveContext)?;
        let frame = state.stack.last().ok_or(TraceError::NoActiveContext)?;
        let active = &state.spans[frame.span_index];
        let network_address = match active.kind() {
            SpanKind::Exit => active.peer().unwrap_or_default().to_owned(),
            _ => String::new(),
        };
        carrier.set_reference(CarrierReference {
            sampled: state.sampled,
            trace_id: state.trace_id,
            parent_segment_id: state.segment_id,
            parent_span_id: frame.span_id,
            parent_service: self.tracer.service().to_owned(),
            parent_service_instance: self.tracer.instance().to_owned(),
            parent_endpoint: first_entry_endpoint(state),
            network_address,
        });
        carrier.set_correlation(state.correlation.clone());
        Ok(())
    }

    /// Attach an extracted `carrier` to the active span.
    ///
    /// This is the consumer-side pattern for transports where upstream
    /// headers surface only after the entry span opened (message pulls,
    /// batched inputs); each valid carrier appends one more cross-process
    /// reference. The segment moves onto the carrier's trace id only if no
    /// earlier carrier claimed it. An invalid carrier is a no-op.
    pub fn extract(&mut self, carrier: &ContextCarrier) -> TraceResult<()> {
        if !carrier.is_valid() {
            return Ok(());
        }
        let state = self.state.as_mut().ok_or(TraceError::NoActiveContext)?;
        if state.stack.is_empty() {
            return Err(TraceError::NoActiveContext);
        }
        Self::apply_carrier(state, carrier);
        Ok(())
    }

    /// Capture the active context for continuation in another unit.
    pub fn capture(&self) -> TraceResult<ContextSnapshot> {
        let state = self.state.as_ref().ok_or(TraceError::NoActiveContext)?;
        let frame = state.stack.last().ok_or(TraceError::NoActiveContext)?;
        Ok(ContextSnapshot {
            trace_id: state.trace_id,
            segment_id: state.segment_id,
            span_id: frame.span_id,
            sampled: state.sampled,
            service: self.tracer.service().to_owned(),
            service_instance: self.tracer.instance().to_owned(),
            parent_endpoint: first_entry_endpoint(state),
            correlation: state.correlation.clone(),
        })
    }

    /// Link the active span to a context captured in another unit.
    ///
    /// Attaches a cross-thread reference built from `snapshot` and merges
    /// its correlation baggage. The current segment keeps its own ids,
    /// stack and sampling decision; reconstruction joins the two segments
    /// on the referenced ids.
    pub fn continued(&mut self, snapshot: &ContextSnapshot) -> TraceResult<()> {
        let state = self.state.as_mut().ok_or(TraceError::NoActiveContext)?;
        let frame = state.stack.last().ok_or(TraceError::NoActiveContext)?;
        state.spans[frame.span_index].add_ref(SegmentReference {
            ref_type: RefType::CrossThread,
            trace_id: snapshot.trace_id,
            parent_segment_id: snapshot.segment_id,
            parent_span_id: snapshot.span_id,
            parent_service: snapshot.service.clone(),
            parent_service_instance: snapshot.service_instance.clone(),
            parent_endpoint: snapshot.parent_endpoint.clone(),
            network_address: String::new(),
            sampled: snapshot.sampled,
        });
        state.correlation.merge(&snapshot.correlation);
        Ok(())
    }

    /// Record a correlation entry on the active segment. Returns whether the
    /// entry was accepted (see [`CorrelationContext::put`]).
    pub fn put_correlation(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> TraceResult<bool> {
        let state = self.state.as_mut().ok_or(TraceError::NoActiveContext)?;
        Ok(state.correlation.put(key, value))
    }

    /// Read a correlation entry from the active segment.
    pub fn get_correlation(&self, key: &str) -> Option<String> {
        self.state
            .as_ref()
            .and_then(|state| state.correlation.get(key).map(str::to_owned))
    }

    fn active_handle(&self) -> Option<SpanHandle> {
        let state = self.state.as_ref()?;
        let frame = state.stack.last()?;
        Some(SpanHandle {
            segment_id: state.segment_id,
            span_id: frame.span_id,
        })
    }

    fn ensure_segment(
        &mut self,
        upstream: Option<(TraceId, bool)>,
        operation_name: &str,
    ) -> &mut SegmentState {
        let tracer = &self.tracer;
        self.state.get_or_insert_with(|| {
            let segment_id = tracer.new_segment_id();
            let (trace_id, sampled, has_upstream) = match upstream {
                Some((trace_id, sampled)) => (trace_id, sampled, true),
                None => {
                    let trace_id = tracer.new_trace_id();
                    let sampled = tracer.sample(trace_id, operation_name);
                    (trace_id, sampled, false)
                }
            };
            SegmentState {
                trace_id,
                segment_id,
                sampled,
                has_upstream,
                next_span_id: 0,
                spans: Vec::new(),
                stack: Vec::new(),
                correlation: CorrelationContext::new(),
            }
        })
    }

    fn push_span(
        state: &mut SegmentState,
        operation_name: &str,
        kind: SpanKind,
        peer: Option<&str>,
    ) -> SpanHandle {
        let parent_span_id = state.stack.last().map_or(SpanId::NONE, |frame| frame.span_id);
        let span_id = SpanId(state.next_span_id);
        state.next_span_id += 1;
        let mut span = Span::begin(span_id, parent_span_id, operation_name, kind);
        if let Some(peer) = peer {
            span.set_peer(peer);
        }
        let span_index = state.spans.len();
        state.spans.push(span);
        state.stack.push(StackFrame {
            span_index,
            span_id,
            reentries: 0,
        });
        SpanHandle {
            segment_id: state.segment_id,
            span_id,
        }
    }

    fn apply_carrier(state: &mut SegmentState, carrier: &ContextCarrier) {
        let Some(reference) = carrier.reference() else {
            return;
        };
        if !state.has_upstream {
            state.trace_id = reference.trace_id;
            state.has_upstream = true;
        }
        if let Some(frame) = state.stack.last() {
            state.spans[frame.span_index].add_ref(SegmentReference::from(reference));
        }
        state.correlation.merge(carrier.correlation());
    }

    fn finish_segment(&self, state: SegmentState) {
        debug_assert!(state.spans.iter().all(|span| !span.is_open()));
        if !state.sampled {
            self.tracer.record_unsampled_drop();
            seg_debug!(name: "segment_dropped_unsampled",
                trace_id = state.trace_id.to_string(),
                segment_id = state.segment_id.to_string());
            return;
        }
        self.tracer.report(TraceSegment {
            trace_id: state.trace_id,
            segment_id: state.segment_id,
            service: self.tracer.service().to_owned(),
            service_instance: self.tracer.instance().to_owned(),
            spans: state.spans,
        });
    }
}

impl Drop for TracingContext {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            seg_warn!(name: "context_dropped_with_open_spans",
                message = "tracing context dropped before its spans were stopped, segment discarded",
                open_spans = state.stack.len(),
                trace_id = state.trace_id.to_string(),
                segment_id = state.segment_id.to_string());
        }
    }
}

fn first_entry_endpoint(state: &SegmentState) -> String {
    state
        .spans
        .iter()
        .find(|span| span.kind() == SpanKind::Entry)
        .map(|span| span.operation_name().to_owned())
        .unwrap_or_default()
}
