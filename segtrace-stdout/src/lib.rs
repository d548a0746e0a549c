//! Print finished trace segments to stdout.
//!
//! This crate is for quick debugging of instrumentation. The output format
//! is human oriented and not stable; anything that parses it will break.
//!
//! # Examples
//!
//! ```no_run
//! use segtrace::{ContextCarrier, Tracer};
//! use segtrace_stdout::StdoutReporter;
//!
//! let tracer = Tracer::builder("checkout")
//!     .with_reporter(StdoutReporter::default())
//!     .build();
//!
//! let mut context = tracer.create_context();
//! let entry = context.create_entry_span("GET /checkout", &ContextCarrier::new());
//! context.stop_span(entry).unwrap();
//!
//! // Finished segments now appear on stdout:
//! //
//! // Segment
//! //     TraceId: 5f34ac6fcdf74910b27f0ee972c1c853
//! //     SegmentId: 5f34ac6fcdf749100000000000000007
//! //     ...
//! ```
#![warn(missing_debug_implementations, missing_docs)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]

mod reporter;
pub use reporter::StdoutReporter;
