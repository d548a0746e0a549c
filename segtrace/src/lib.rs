//! Segment-oriented distributed tracing core.
//!
//! This crate implements the tracing engine of an application-level
//! instrumentation agent. It tracks the work of one execution unit as a
//! *segment*, a stack-ordered collection of spans belonging to a single
//! trace, and gives instrumentation three things:
//!
//! - **Span lifecycle**: [`TracingContext`] opens Entry, Exit and Local
//!   spans, enforces strict LIFO stop order, and seals the finished segment
//!   into an immutable [`TraceSegment`] that is handed to a
//!   [`SegmentReporter`](reporter::SegmentReporter) exactly once.
//! - **Cross-process propagation**: [`ContextCarrier`] encodes the active
//!   context (trace id, parent segment and span, service identity, sampling
//!   flag, correlation baggage) into two text headers and decodes them back
//!   leniently, so one malformed hop degrades the trace instead of failing
//!   the request.
//! - **Cross-unit continuation**: [`ContextSnapshot`] captures a live
//!   context by value for another thread or task, and
//!   [`FutureExt::with_tracing_context`](futures::FutureExt) lets a context
//!   travel with a future across `.await` points.
//!
//! Storage, analysis and UI are backend concerns; this crate ends at the
//! reporter seam. The companion `segtrace-stdout` crate prints finished
//! segments for debugging.
//!
//! # Getting started
//!
//! Explicit contexts suit frameworks that can pass a value through the
//! request path:
//!
//! ```
//! use segtrace::reporter::InMemoryReporter;
//! use segtrace::{ContextCarrier, Tracer};
//!
//! let reporter = InMemoryReporter::new();
//! let tracer = Tracer::builder("checkout")
//!     .with_reporter(reporter.clone())
//!     .build();
//!
//! let mut context = tracer.create_context();
//! let entry = context.create_entry_span("GET /checkout", &ContextCarrier::new());
//! let exit = context.create_exit_span("SELECT carts", "db:5432");
//! context.stop_span(exit).unwrap();
//! context.stop_span(entry).unwrap();
//!
//! assert_eq!(reporter.finished_segments().unwrap().len(), 1);
//! ```
//!
//! Instrumentation that cannot thread a value through uses the
//! thread-local [`manager`] facade, backed by a process-wide tracer:
//!
//! ```
//! use std::collections::HashMap;
//!
//! use segtrace::{manager, ContextCarrier, Tracer};
//!
//! manager::set_global_tracer(Tracer::builder("checkout").build());
//!
//! let entry = manager::create_entry_span("GET /checkout", &ContextCarrier::new()).unwrap();
//! let exit = manager::create_exit_span("GET /inventory", "inventory:8080").unwrap();
//!
//! // Hand the context to the outbound transport as plain headers.
//! let mut carrier = ContextCarrier::new();
//! manager::inject(&mut carrier).unwrap();
//! let mut headers: HashMap<String, String> = HashMap::new();
//! carrier.inject_into(&mut headers);
//! assert!(headers.contains_key("segtrace-context"));
//!
//! manager::stop_span(exit).unwrap();
//! manager::stop_span(entry).unwrap();
//! ```
//!
//! On the receiving side, [`ContextCarrier::extract_from`] decodes the
//! headers and `create_entry_span` joins the upstream trace, inheriting its
//! sampling decision.
//!
//! # Feature flags
//!
//! * `internal-logs` (default): routes the crate's own diagnostics through
//!   `tracing`. The traced application's logging is never touched.
//! * `testing`: exposes deterministic test helpers such as
//!   [`ids::SequentialIdGenerator`].
//!
//! # Supported Rust versions
//!
//! This crate is built against the latest stable release; the minimum
//! supported version is 1.75. It is not guaranteed to build on earlier
//! versions.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![allow(clippy::needless_doctest_main)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]
#![cfg_attr(test, deny(warnings))]

pub mod carrier;
pub mod context;
pub mod error;
pub mod futures;
pub mod ids;
mod internal_logging;
pub mod manager;
pub mod reporter;
pub mod segment;
pub mod span;
pub mod tracer;

pub use carrier::{ContextCarrier, CorrelationContext, Extractor, Injector};
pub use context::{ContextSnapshot, SpanHandle, TracingContext};
pub use error::{TraceError, TraceResult};
pub use futures::FutureExt;
pub use ids::{SegmentId, SpanId, TraceId};
pub use segment::TraceSegment;
pub use span::{Span, SpanKind, SpanLayer};
pub use tracer::{Sampler, ShouldSample, Tracer, TracerBuilder};

#[doc(hidden)]
pub mod time {
    use std::time::SystemTime;

    #[doc(hidden)]
    pub fn now() -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
