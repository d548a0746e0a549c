//! Thread-local tracing facade.
//!
//! Instrumentation that cannot thread a [`TracingContext`] through its call
//! stack uses these free functions instead. Each thread owns one implicit
//! context, built lazily from the process-wide tracer installed with
//! [`set_global_tracer`], and cleared again when its segment finishes.
//!
//! ```
//! use segtrace::reporter::InMemoryReporter;
//! use segtrace::{manager, ContextCarrier, Tracer};
//!
//! let reporter = InMemoryReporter::new();
//! manager::set_global_tracer(
//!     Tracer::builder("billing").with_reporter(reporter.clone()).build(),
//! );
//!
//! let entry = manager::create_entry_span("POST /invoices", &ContextCarrier::new()).unwrap();
//! manager::active_span(|span| {
//!     span.tag("invoice.kind", "b2b");
//! })
//! .unwrap();
//! manager::stop_span(entry).unwrap();
//! assert_eq!(reporter.finished_segments().unwrap().len(), 1);
//! ```

use std::cell::RefCell;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::carrier::ContextCarrier;
use crate::context::{ContextSnapshot, SpanHandle, TracingContext};
use crate::error::{TraceError, TraceResult};
use crate::seg_warn;
use crate::span::Span;
use crate::tracer::Tracer;

static GLOBAL_TRACER: Lazy<RwLock<Option<Tracer>>> = Lazy::new(|| RwLock::new(None));

static UNINITIALIZED_WARNED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<TracingContext>> = RefCell::new(None);
}

/// Install `tracer` as the process-wide tracer behind this facade, returning
/// the previously installed one.
///
/// Threads that are mid-segment keep the tracer they started with; the new
/// one takes effect when their next segment begins.
pub fn set_global_tracer(tracer: Tracer) -> Option<Tracer> {
    GLOBAL_TRACER
        .write()
        .map(|mut slot| mem::replace(&mut *slot, Some(tracer)))
        .unwrap_or(None)
}

/// The currently installed process-wide tracer, if any.
pub fn global_tracer() -> Option<Tracer> {
    GLOBAL_TRACER.read().map(|slot| slot.clone()).unwrap_or(None)
}

/// Open an entry span on this thread's context. See
/// [`TracingContext::create_entry_span`].
pub fn create_entry_span(operation_name: &str, carrier: &ContextCarrier) -> TraceResult<SpanHandle> {
    with_unit(|context| context.create_entry_span(operation_name, carrier))
}

/// Open an exit span on this thread's context. See
/// [`TracingContext::create_exit_span`].
pub fn create_exit_span(operation_name: &str, peer: &str) -> TraceResult<SpanHandle> {
    with_unit(|context| context.create_exit_span(operation_name, peer))
}

/// Open a local span on this thread's context. See
/// [`TracingContext::create_local_span`].
pub fn create_local_span(operation_name: &str) -> TraceResult<SpanHandle> {
    with_unit(|context| context.create_local_span(operation_name))
}

/// Run `f` against the innermost open span of this thread.
pub fn active_span<T>(f: impl FnOnce(&mut Span) -> T) -> TraceResult<T> {
    with_current(|context| {
        context
            .active_span_mut()
            .map(f)
            .ok_or(TraceError::NoActiveContext)
    })
}

/// Close the span behind `handle` on this thread's context. When this stop
/// seals the segment the thread's slot is released, so the next span starts
/// from the then-current global tracer.
pub fn stop_span(handle: SpanHandle) -> TraceResult<bool> {
    CURRENT_CONTEXT.with(|slot| {
        let mut borrow = slot.borrow_mut();
        let context = borrow.as_mut().ok_or(TraceError::NoActiveContext)?;
        let result = context.stop_span(handle);
        if !context.is_tracing() {
            *borrow = None;
        }
        result
    })
}

/// Close whatever span is innermost on this thread.
pub fn stop_active_span() -> TraceResult<bool> {
    CURRENT_CONTEXT.with(|slot| {
        let mut borrow = slot.borrow_mut();
        let context = borrow.as_mut().ok_or(TraceError::NoActiveContext)?;
        let result = context.stop_active_span();
        if !context.is_tracing() {
            *borrow = None;
        }
        result
    })
}

/// Fill `carrier` from this thread's active context. See
/// [`TracingContext::inject`].
pub fn inject(carrier: &mut ContextCarrier) -> TraceResult<()> {
    with_current(|context| context.inject(carrier))
}

/// Attach an extracted `carrier` to this thread's active span. See
/// [`TracingContext::extract`].
pub fn extract(carrier: &ContextCarrier) -> TraceResult<()> {
    with_current(|context| context.extract(carrier))
}

/// Capture this thread's active context for continuation elsewhere.
pub fn capture() -> TraceResult<ContextSnapshot> {
    with_current(|context| context.capture())
}

/// Link this thread's active span to a context captured elsewhere.
pub fn continued(snapshot: &ContextSnapshot) -> TraceResult<()> {
    with_current(|context| context.continued(snapshot))
}

/// Record a correlation entry on this thread's active segment.
pub fn put_correlation(key: impl Into<String>, value: impl Into<String>) -> TraceResult<bool> {
    with_current(|context| context.put_correlation(key, value))
}

/// Read a correlation entry from this thread's active segment.
pub fn get_correlation(key: &str) -> Option<String> {
    CURRENT_CONTEXT.with(|slot| {
        slot.borrow()
            .as_ref()
            .and_then(|context| context.get_correlation(key))
    })
}

/// Whether this thread currently has open spans.
pub fn is_tracing() -> bool {
    CURRENT_CONTEXT.with(|slot| {
        slot.borrow()
            .as_ref()
            .is_some_and(TracingContext::is_tracing)
    })
}

/// Replace this thread's context slot, returning the previous occupant.
/// Underpins the async wrapper, which parks its context here for the
/// duration of each poll.
pub(crate) fn swap_context(replacement: Option<TracingContext>) -> Option<TracingContext> {
    CURRENT_CONTEXT.with(|slot| slot.replace(replacement))
}

/// Run `f` on this thread's context, creating one from the global tracer if
/// the slot is empty.
fn with_unit<T>(f: impl FnOnce(&mut TracingContext) -> T) -> TraceResult<T> {
    CURRENT_CONTEXT.with(|slot| {
        let mut borrow = slot.borrow_mut();
        if borrow.is_none() {
            match global_tracer() {
                Some(tracer) => *borrow = Some(tracer.create_context()),
                None => {
                    if !UNINITIALIZED_WARNED.swap(true, Ordering::Relaxed) {
                        seg_warn!(name: "tracer_uninitialized",
                            message = "span creation attempted before set_global_tracer, tracing stays off until a tracer is installed");
                    }
                    return Err(TraceError::TracerUninitialized);
                }
            }
        }
        match borrow.as_mut() {
            Some(context) => Ok(f(context)),
            None => Err(TraceError::TracerUninitialized),
        }
    })
}

/// Run `f` on this thread's context without ever creating one.
fn with_current<T>(f: impl FnOnce(&mut TracingContext) -> TraceResult<T>) -> TraceResult<T> {
    CURRENT_CONTEXT.with(|slot| match slot.borrow_mut().as_mut() {
        Some(context) => f(context),
        None => Err(TraceError::NoActiveContext),
    })
}
