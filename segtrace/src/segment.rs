//! The finished-segment hand-off value.

use crate::ids::{SegmentId, TraceId};
use crate::span::Span;

/// An immutable, finished collection of spans produced by one execution
/// unit.
///
/// Built by the context engine when the last open span of a segment stops,
/// and handed to the [`SegmentReporter`] exactly once. Every span in it is
/// stopped; the list is in creation order, so `spans[i].span_id() == i`.
///
/// [`SegmentReporter`]: crate::reporter::SegmentReporter
#[derive(Clone, Debug)]
pub struct TraceSegment {
    /// Trace this segment belongs to.
    pub trace_id: TraceId,
    /// Globally unique id of this segment.
    pub segment_id: SegmentId,
    /// Service that produced the segment.
    pub service: String,
    /// Service instance that produced the segment.
    pub service_instance: String,
    /// All spans of the segment, in creation order.
    pub spans: Vec<Span>,
}
