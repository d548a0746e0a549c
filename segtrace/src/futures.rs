//! Async support: let a tracing context follow a future, stream, or sink
//! across `.await` points instead of staying pinned to an executor thread.

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use futures_core::Stream;
use futures_sink::Sink;
use pin_project_lite::pin_project;

use crate::context::TracingContext;
use crate::manager;

pin_project! {
    /// A future, stream, or sink that owns the tracing context of its task.
    ///
    /// While the inner value is polled the context occupies the polling
    /// thread's slot, so facade calls made by the task land on it. Between
    /// polls it travels inside this wrapper, which is what keeps two tasks
    /// interleaved on one executor thread from bleeding spans into each
    /// other's segments.
    #[derive(Debug)]
    pub struct WithTracingContext<T> {
        #[pin]
        inner: T,
        tracing_cx: Option<TracingContext>,
    }
}

impl<T: Sized> FutureExt for T {}

impl<T: std::future::Future> std::future::Future for WithTracingContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = install(this.tracing_cx);
        this.inner.poll(task_cx)
    }
}

impl<T: Stream> Stream for WithTracingContext<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _guard = install(this.tracing_cx);
        T::poll_next(this.inner, task_cx)
    }
}

impl<I, T> Sink<I> for WithTracingContext<T>
where
    T: Sink<I>,
{
    type Error = T::Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _guard = install(this.tracing_cx);
        T::poll_ready(this.inner, task_cx)
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        let this = self.project();
        let _guard = install(this.tracing_cx);
        T::start_send(this.inner, item)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _guard = install(this.tracing_cx);
        T::poll_flush(this.inner, task_cx)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _guard = install(this.tracing_cx);
        T::poll_close(this.inner, task_cx)
    }
}

/// Extension trait allowing futures, streams, and sinks to carry a tracing
/// context.
pub trait FutureExt: Sized {
    /// Hand `tracing_cx` to this value, returning a [`WithTracingContext`]
    /// wrapper that installs it for the duration of every poll.
    ///
    /// The wrapped task becomes its own execution unit: give it a context of
    /// its own and link it to the spawning unit with
    /// [`capture`](crate::context::TracingContext::capture) /
    /// [`continued`](crate::context::TracingContext::continued) rather than
    /// moving a context that still has spans to stop elsewhere.
    fn with_tracing_context(self, tracing_cx: TracingContext) -> WithTracingContext<Self> {
        WithTracingContext {
            inner: self,
            tracing_cx: Some(tracing_cx),
        }
    }
}

/// Puts the parked context into the thread slot; the previous occupant and
/// the slot are restored when the guard drops, even on unwind.
struct SlotGuard<'a> {
    parked: &'a mut Option<TracingContext>,
    previous: Option<TracingContext>,
}

fn install(parked: &mut Option<TracingContext>) -> SlotGuard<'_> {
    let previous = manager::swap_context(parked.take());
    SlotGuard { parked, previous }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.parked = manager::swap_context(self.previous.take());
    }
}
