//! Errors surfaced by the tracing core.
//!
//! Only contract violations and lifecycle problems become errors. Malformed
//! propagation headers never do; the carrier degrades to "no upstream
//! reference" instead, so a bad peer can not break the traced application.

use thiserror::Error;

use crate::ids::SpanId;

/// Describe the result of operations in the tracing core.
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors returned by the span-stack engine and its collaborators.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// An operation that needs an active span was called while the current
    /// execution unit has none.
    #[error("no active tracing context in the current execution unit")]
    NoActiveContext,

    /// A span was stopped out of creation order. Spans must close in the
    /// reverse order of creation; anything else poisons the stack, so the
    /// segment is discarded and the unit reset.
    #[error("span {found} stopped while span {expected} is on top of the stack")]
    OutOfOrder {
        /// Span currently on top of the stack.
        expected: SpanId,
        /// Span the caller tried to stop.
        found: SpanId,
    },

    /// A span handle from an already-finished or foreign segment was
    /// presented to the current segment.
    #[error("span handle does not belong to the active segment")]
    WrongSegment,

    /// The thread-local facade was used before a global tracer was
    /// configured.
    #[error("global tracer is not configured")]
    TracerUninitialized,

    /// Other errors propagated from the tracing core that weren't covered
    /// above.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<String> for TraceError {
    fn from(err_msg: String) -> Self {
        TraceError::Other(Box::new(Custom(err_msg)))
    }
}

impl From<&'static str> for TraceError {
    fn from(err_msg: &'static str) -> Self {
        TraceError::Other(Box::new(Custom(err_msg.into())))
    }
}

/// Wrap type for string
#[derive(Error, Debug)]
#[error("{0}")]
struct Custom(String);
