use core::fmt;
use std::sync::atomic;

use chrono::{DateTime, Utc};
use segtrace::reporter::SegmentReporter;
use segtrace::span::Span;
use segtrace::{TraceError, TraceResult, TraceSegment};

/// A reporter that writes finished segments to stdout.
///
/// Segments are printed on the thread that seals them. Wrap the reporter in
/// [`QueuedReporter`] to move printing off the traced path.
///
/// [`QueuedReporter`]: segtrace::reporter::QueuedReporter
pub struct StdoutReporter {
    is_shutdown: atomic::AtomicBool,
}

impl fmt::Debug for StdoutReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StdoutReporter")
    }
}

impl Default for StdoutReporter {
    fn default() -> Self {
        StdoutReporter {
            is_shutdown: atomic::AtomicBool::new(false),
        }
    }
}

impl SegmentReporter for StdoutReporter {
    /// Write a segment to stdout.
    fn report(&self, segment: TraceSegment) {
        if self.is_shutdown.load(atomic::Ordering::SeqCst) {
            return;
        }
        print_segment(&segment);
    }

    fn flush(&self) -> TraceResult<()> {
        if self.is_shutdown.load(atomic::Ordering::SeqCst) {
            return Err(TraceError::from("reporter is shut down"));
        }
        Ok(())
    }

    fn shutdown(&self) -> TraceResult<()> {
        if self.is_shutdown.swap(true, atomic::Ordering::SeqCst) {
            return Err(TraceError::from("reporter is already shut down"));
        }
        Ok(())
    }
}

fn print_segment(segment: &TraceSegment) {
    println!("Segment");
    println!("\t TraceId: {}", segment.trace_id);
    println!("\t SegmentId: {}", segment.segment_id);
    println!("\t Service: {:?}", segment.service);
    println!("\t ServiceInstance: {:?}", segment.service_instance);
    for (i, span) in segment.spans.iter().enumerate() {
        print_span(i, span);
    }
}

fn print_span(index: usize, span: &Span) {
    println!("Span #{}", index);
    println!("\t Name: {:?}", span.operation_name());
    println!("\t SpanId: {}", span.span_id());
    println!("\t ParentSpanId: {}", span.parent_span_id());
    println!("\t Kind: {:?}", span.kind());
    println!("\t Layer: {:?}", span.layer());
    if span.component_id() != 0 {
        println!("\t ComponentId: {}", span.component_id());
    }
    if let Some(peer) = span.peer() {
        println!("\t Peer: {:?}", peer);
    }

    let datetime: DateTime<Utc> = span.start_time().into();
    println!(
        "\t Start time: {}",
        datetime.format("%Y-%m-%d %H:%M:%S%.6f")
    );
    if let Some(end_time) = span.end_time() {
        let datetime: DateTime<Utc> = end_time.into();
        println!("\t End time: {}", datetime.format("%Y-%m-%d %H:%M:%S%.6f"));
    }
    println!("\t Error: {}", span.is_error());

    let mut print_header = true;
    for (key, value) in span.tags() {
        if print_header {
            println!("\t Tags:");
            print_header = false;
        }
        println!("\t\t {}: {:?}", key, value);
    }

    let mut print_header = true;
    for event in span.logs() {
        if print_header {
            println!("\t Logs:");
            print_header = false;
        }
        let datetime: DateTime<Utc> = event.timestamp().into();
        println!(
            "\t\t Timestamp: {}",
            datetime.format("%Y-%m-%d %H:%M:%S%.6f")
        );
        for (key, value) in event.fields() {
            println!("\t\t\t {}: {:?}", key, value);
        }
    }

    let mut print_header = true;
    for reference in span.refs() {
        if print_header {
            println!("\t References:");
            print_header = false;
        }
        println!("\t\t Type: {:?}", reference.ref_type);
        println!("\t\t TraceId: {}", reference.trace_id);
        println!("\t\t ParentSegmentId: {}", reference.parent_segment_id);
        println!("\t\t ParentSpanId: {}", reference.parent_span_id);
        println!("\t\t ParentService: {:?}", reference.parent_service);
        println!("\t\t ParentEndpoint: {:?}", reference.parent_endpoint);
        if !reference.network_address.is_empty() {
            println!("\t\t NetworkAddress: {:?}", reference.network_address);
        }
    }
}
