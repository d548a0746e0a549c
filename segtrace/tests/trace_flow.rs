//! End-to-end trace flows across process and thread boundaries, using only
//! the public API.

use std::collections::HashMap;
use std::thread;

use segtrace::carrier::CONTEXT_HEADER;
use segtrace::reporter::{InMemoryReporter, QueuedReporter};
use segtrace::span::RefType;
use segtrace::{ContextCarrier, Sampler, SpanId, TraceSegment, Tracer};

fn tracer(service: &str, reporter: InMemoryReporter) -> Tracer {
    Tracer::builder(service)
        .with_reporter(reporter)
        .build()
}

fn segment_with_operation<'a>(
    segments: &'a [TraceSegment],
    operation_name: &str,
) -> &'a TraceSegment {
    segments
        .iter()
        .find(|segment| {
            segment
                .spans
                .iter()
                .any(|span| span.operation_name() == operation_name)
        })
        .unwrap_or_else(|| panic!("no segment contains {operation_name}"))
}

#[test]
fn two_services_share_one_trace() {
    let gateway_reporter = InMemoryReporter::new();
    let gateway = tracer("gateway", gateway_reporter.clone());
    let inventory_reporter = InMemoryReporter::new();
    let inventory = tracer("inventory", inventory_reporter.clone());

    // Service A handles a request and calls service B over plain headers.
    let mut upstream = gateway.create_context();
    let entry = upstream.create_entry_span("GET /checkout", &ContextCarrier::new());
    let exit = upstream.create_exit_span("GET /inventory", "inventory:8080");
    upstream
        .put_correlation("tenant", "acme")
        .expect("correlation on a live context");

    let mut carrier = ContextCarrier::new();
    upstream.inject(&mut carrier).expect("inject with spans open");
    let mut headers: HashMap<String, String> = HashMap::new();
    carrier.inject_into(&mut headers);
    assert!(headers.contains_key(CONTEXT_HEADER));

    // Service B joins the trace from the received headers.
    let mut incoming = ContextCarrier::new();
    incoming.extract_from(&headers);
    assert!(incoming.is_valid());

    let mut downstream = inventory.create_context();
    let served = downstream.create_entry_span("GET /inventory", &incoming);
    assert_eq!(downstream.trace_id(), upstream.trace_id());
    assert_eq!(downstream.get_correlation("tenant").as_deref(), Some("acme"));
    downstream.stop_span(served).unwrap();

    upstream.stop_span(exit).unwrap();
    upstream.stop_span(entry).unwrap();

    let upstream_segments = gateway_reporter.finished_segments().unwrap();
    let downstream_segments = inventory_reporter.finished_segments().unwrap();
    assert_eq!(upstream_segments.len(), 1);
    assert_eq!(downstream_segments.len(), 1);

    let produced = &upstream_segments[0];
    assert_eq!(produced.spans.len(), 2);
    assert_eq!(produced.spans[0].span_id(), SpanId(0));
    assert_eq!(produced.spans[0].parent_span_id(), SpanId::NONE);
    assert_eq!(produced.spans[1].span_id(), SpanId(1));
    assert_eq!(produced.spans[1].parent_span_id(), SpanId(0));

    let consumed = &downstream_segments[0];
    assert_eq!(consumed.trace_id, produced.trace_id);
    let refs = consumed.spans[0].refs();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].ref_type, RefType::CrossProcess);
    assert_eq!(refs[0].trace_id, produced.trace_id);
    assert_eq!(refs[0].parent_segment_id, produced.segment_id);
    assert_eq!(refs[0].parent_span_id, SpanId(1));
    assert_eq!(refs[0].parent_service, "gateway");
    assert_eq!(refs[0].parent_endpoint, "GET /checkout");
    assert_eq!(refs[0].network_address, "inventory:8080");
    assert!(refs[0].sampled);
}

#[test]
fn carrier_items_cross_a_byte_only_transport() {
    let reporter = InMemoryReporter::new();
    let producer = tracer("producer", reporter.clone());
    let consumer = tracer("consumer", reporter.clone());

    let mut upstream = producer.create_context();
    let entry = upstream.create_entry_span("POST /publish", &ContextCarrier::new());
    let exit = upstream.create_exit_span("queue send", "broker:5672");

    let mut outgoing = ContextCarrier::new();
    upstream.inject(&mut outgoing).unwrap();

    // A transport that only moves name/value pairs, without implementing
    // the Injector and Extractor traits.
    let mut message_properties: Vec<(String, String)> = Vec::new();
    for item in outgoing.items() {
        message_properties.push((item.key.to_owned(), item.value));
    }

    let mut incoming = ContextCarrier::new();
    for (key, value) in &message_properties {
        assert!(incoming.try_set(key, value));
    }
    assert!(!incoming.try_set("x-unrelated", "ignored"));
    assert!(incoming.is_valid());

    let mut downstream = consumer.create_context();
    let received = downstream.create_entry_span("queue receive", &incoming);
    assert_eq!(downstream.trace_id(), upstream.trace_id());
    downstream.stop_span(received).unwrap();

    upstream.stop_span(exit).unwrap();
    upstream.stop_span(entry).unwrap();
    assert_eq!(reporter.finished_segments().unwrap().len(), 2);
}

#[test]
fn sampling_decision_travels_downstream() {
    let upstream_reporter = InMemoryReporter::new();
    let upstream_tracer = Tracer::builder("edge")
        .with_sampler(Sampler::AlwaysOff)
        .with_reporter(upstream_reporter.clone())
        .build();
    let downstream_reporter = InMemoryReporter::new();
    let downstream_tracer = Tracer::builder("worker")
        .with_sampler(Sampler::AlwaysOn)
        .with_reporter(downstream_reporter.clone())
        .build();

    let mut upstream = upstream_tracer.create_context();
    let entry = upstream.create_entry_span("GET /health", &ContextCarrier::new());
    let exit = upstream.create_exit_span("GET /detail", "worker:9000");

    let mut headers: HashMap<String, String> = HashMap::new();
    let mut carrier = ContextCarrier::new();
    upstream.inject(&mut carrier).unwrap();
    carrier.inject_into(&mut headers);

    upstream.stop_span(exit).unwrap();
    upstream.stop_span(entry).unwrap();
    assert!(upstream_reporter.finished_segments().unwrap().is_empty());

    // The downstream sampler would keep everything, but the inherited
    // decision wins so the linked segment is dropped as well.
    let mut incoming = ContextCarrier::new();
    incoming.extract_from(&headers);
    assert_eq!(incoming.sampled(), Some(false));

    let mut downstream = downstream_tracer.create_context();
    let served = downstream.create_entry_span("GET /detail", &incoming);
    assert!(!downstream.is_sampled());
    downstream.stop_span(served).unwrap();
    assert!(downstream_reporter.finished_segments().unwrap().is_empty());
}

#[test]
fn garbage_headers_start_a_fresh_trace() {
    let reporter = InMemoryReporter::new();
    let consumer = tracer("consumer", reporter.clone());

    let mut headers: HashMap<String, String> = HashMap::new();
    headers.insert(CONTEXT_HEADER.to_owned(), "1-not-a-carrier".to_owned());

    let mut incoming = ContextCarrier::new();
    incoming.extract_from(&headers);
    assert!(!incoming.is_valid());

    let mut context = consumer.create_context();
    let entry = context.create_entry_span("GET /orders", &incoming);
    context.stop_span(entry).unwrap();

    let segments = reporter.finished_segments().unwrap();
    assert_eq!(segments.len(), 1);
    assert!(segments[0].spans[0].refs().is_empty());
}

#[test]
fn snapshot_continues_across_threads() {
    let reporter = InMemoryReporter::new();
    let tracer = tracer("checkout", reporter.clone());

    let mut producer = tracer.create_context();
    let entry = producer.create_entry_span("GET /orders", &ContextCarrier::new());
    let enqueue = producer.create_local_span("enqueue refresh");
    producer
        .put_correlation("tenant", "acme")
        .expect("correlation on a live context");
    let snapshot = producer.capture().expect("active context to capture");

    let worker_tracer = tracer.clone();
    let worker = thread::spawn(move || {
        let mut context = worker_tracer.create_context();
        let job = context.create_local_span("refresh cache");
        context.continued(&snapshot).expect("a span to attach to");
        assert_eq!(context.get_correlation("tenant").as_deref(), Some("acme"));
        context.stop_span(job).unwrap();
    });
    worker.join().unwrap();

    producer.stop_span(enqueue).unwrap();
    producer.stop_span(entry).unwrap();

    let segments = reporter.finished_segments().unwrap();
    assert_eq!(segments.len(), 2);
    let produced = segment_with_operation(&segments, "GET /orders");
    let continued = segment_with_operation(&segments, "refresh cache");

    // The worker keeps its own segment and trace; the causal link lives in
    // the stored reference.
    assert_ne!(continued.trace_id, produced.trace_id);
    let refs = continued.spans[0].refs();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].ref_type, RefType::CrossThread);
    assert_eq!(refs[0].trace_id, produced.trace_id);
    assert_eq!(refs[0].parent_segment_id, produced.segment_id);
    assert_eq!(refs[0].parent_span_id, SpanId(1));
    assert_eq!(refs[0].parent_service, "checkout");
    assert_eq!(refs[0].network_address, "");
    assert!(refs[0].sampled);
}

#[test]
fn queued_reporter_delivers_sealed_segments() {
    let sink = InMemoryReporter::new();
    let tracer = Tracer::builder("checkout")
        .with_reporter(QueuedReporter::new(sink.clone()))
        .build();

    for _ in 0..4 {
        let mut context = tracer.create_context();
        let entry = context.create_entry_span("GET /checkout", &ContextCarrier::new());
        context.stop_span(entry).unwrap();
    }

    tracer.flush().unwrap();
    assert_eq!(sink.finished_segments().unwrap().len(), 4);
    tracer.shutdown().unwrap();
}

#[test]
fn correlation_caps_hold_across_the_wire() {
    let producer = tracer("producer", InMemoryReporter::new());
    let consumer = tracer("consumer", InMemoryReporter::new());

    let mut upstream = producer.create_context();
    let entry = upstream.create_entry_span("GET /profile", &ContextCarrier::new());

    for n in 0..8 {
        assert!(upstream.put_correlation(format!("key-{n}"), "v").unwrap());
    }
    // A ninth key and an oversized value are both refused, while updating
    // an existing key still works at capacity.
    assert!(!upstream.put_correlation("key-8", "v").unwrap());
    assert!(!upstream.put_correlation("key-0", "x".repeat(129)).unwrap());
    assert!(upstream.put_correlation("key-0", "updated").unwrap());

    let mut headers: HashMap<String, String> = HashMap::new();
    let mut carrier = ContextCarrier::new();
    upstream.inject(&mut carrier).unwrap();
    carrier.inject_into(&mut headers);
    upstream.stop_span(entry).unwrap();

    let mut incoming = ContextCarrier::new();
    incoming.extract_from(&headers);
    let mut downstream = consumer.create_context();
    let served = downstream.create_entry_span("GET /profile", &incoming);
    assert_eq!(downstream.get_correlation("key-0").as_deref(), Some("updated"));
    assert_eq!(downstream.get_correlation("key-7").as_deref(), Some("v"));
    assert_eq!(downstream.get_correlation("key-8"), None);
    downstream.stop_span(served).unwrap();
}
