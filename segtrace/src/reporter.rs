//! Hand-off of finished segments to their consumer.
//!
//! The context engine calls [`SegmentReporter::report`] from the
//! instrumented unit's own thread, so implementations must return quickly
//! and never block. Reporters that do real work belong behind
//! [`QueuedReporter`], which decouples them on a bounded queue and drops on
//! overflow instead of exerting backpressure on business logic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{TraceError, TraceResult};
use crate::segment::TraceSegment;

/// Consumer of finished, immutable trace segments.
///
/// Each segment is delivered exactly once, after its last span stopped.
pub trait SegmentReporter: Send + Sync + fmt::Debug {
    /// Accept one finished segment. Must not block the calling unit.
    fn report(&self, segment: TraceSegment);

    /// Deliver anything buffered.
    fn flush(&self) -> TraceResult<()> {
        Ok(())
    }

    /// Flush and release resources. The reporter is unusable afterwards.
    fn shutdown(&self) -> TraceResult<()> {
        Ok(())
    }
}

/// Reporter that discards every segment.
#[derive(Clone, Debug, Default)]
pub struct NoopReporter {
    _private: (),
}

impl NoopReporter {
    /// Create a new no-op reporter.
    pub fn new() -> Self {
        NoopReporter::default()
    }
}

impl SegmentReporter for NoopReporter {
    fn report(&self, _segment: TraceSegment) {}
}

/// Reporter that stores segments in memory for inspection.
///
/// ```
/// use segtrace::reporter::{InMemoryReporter, SegmentReporter};
/// use segtrace::Tracer;
///
/// let reporter = InMemoryReporter::new();
/// let tracer = Tracer::builder("checkout")
///     .with_reporter(reporter.clone())
///     .build();
/// let mut context = tracer.create_context();
/// let span = context.create_local_span("work");
/// context.stop_span(span).unwrap();
///
/// assert_eq!(reporter.finished_segments().unwrap().len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryReporter {
    segments: Arc<Mutex<Vec<TraceSegment>>>,
}

impl InMemoryReporter {
    /// Create a new in-memory reporter.
    pub fn new() -> Self {
        InMemoryReporter::default()
    }

    /// Copies of every segment reported so far, in arrival order.
    pub fn finished_segments(&self) -> TraceResult<Vec<TraceSegment>> {
        self.segments
            .lock()
            .map(|segments| segments.clone())
            .map_err(|err| TraceError::from(err.to_string()))
    }

    /// Discard every stored segment.
    pub fn reset(&self) {
        if let Ok(mut segments) = self.segments.lock() {
            segments.clear();
        }
    }
}

impl SegmentReporter for InMemoryReporter {
    fn report(&self, segment: TraceSegment) {
        if let Ok(mut segments) = self.segments.lock() {
            segments.push(segment);
        }
    }
}

/// Messages exchanged between submitting units and the worker thread.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
enum QueueMessage {
    Report(TraceSegment),
    Flush(SyncSender<TraceResult<()>>),
    Shutdown(SyncSender<TraceResult<()>>),
}

/// Bounded, non-blocking decorator around any [`SegmentReporter`].
///
/// Submissions go through a bounded channel to a dedicated worker thread.
/// When the queue is full the segment is dropped and counted; the first drop
/// emits a warning and the total is logged again at shutdown. Tracing must
/// never slow the traced application down, so nothing here ever waits on the
/// submitting side.
#[derive(Debug)]
pub struct QueuedReporter {
    message_sender: SyncSender<QueueMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    is_shutdown: AtomicBool,
    dropped_count: AtomicUsize,
    drain_timeout: Duration,
}

impl QueuedReporter {
    /// Queue capacity used by [`QueuedReporter::new`].
    pub const DEFAULT_QUEUE_SIZE: usize = 2048;

    /// Wrap `inner` with the default queue capacity.
    pub fn new<R>(inner: R) -> Self
    where
        R: SegmentReporter + 'static,
    {
        Self::with_capacity(inner, Self::DEFAULT_QUEUE_SIZE)
    }

    /// Wrap `inner` with an explicit queue capacity.
    pub fn with_capacity<R>(inner: R, capacity: usize) -> Self
    where
        R: SegmentReporter + 'static,
    {
        let (message_sender, message_receiver) = sync_channel(capacity);

        let handle = thread::Builder::new()
            .name("segtrace-reporter".to_string())
            .spawn(move || Self::run_worker(message_receiver, inner))
            .expect("Failed to spawn thread");

        QueuedReporter {
            message_sender,
            handle: Mutex::new(Some(handle)),
            is_shutdown: AtomicBool::new(false),
            dropped_count: AtomicUsize::new(0),
            drain_timeout: Duration::from_secs(5),
        }
    }

    fn run_worker<R: SegmentReporter>(message_receiver: Receiver<QueueMessage>, inner: R) {
        loop {
            match message_receiver.recv() {
                Ok(QueueMessage::Report(segment)) => inner.report(segment),
                Ok(QueueMessage::Flush(sender)) => {
                    let _ = sender.send(inner.flush());
                }
                Ok(QueueMessage::Shutdown(sender)) => {
                    let _ = sender.send(inner.shutdown());
                    break;
                }
                // All senders gone; nothing more can arrive.
                Err(_) => break,
            }
        }
    }

    /// Number of segments dropped because the queue was full.
    pub fn dropped_count(&self) -> usize {
        self.dropped_count.load(Ordering::Relaxed)
    }
}

impl SegmentReporter for QueuedReporter {
    fn report(&self, segment: TraceSegment) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let result = self.message_sender.try_send(QueueMessage::Report(segment));

        if result.is_err() {
            // The first drop emits a warning; after that only the counter
            // moves until shutdown reports the total.
            if self.dropped_count.fetch_add(1, Ordering::Relaxed) == 0 {
                crate::seg_warn!(name: "queued_reporter_dropping_started",
                    message = "segment queue full; segments are being dropped and counted until shutdown");
            }
        }
    }

    fn flush(&self) -> TraceResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(TraceError::Other("reporter already shutdown".into()));
        }
        // Control messages are off the traced hot path, so they may wait for
        // queue space; only `Report` drops on a full queue.
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .send(QueueMessage::Flush(sender))
            .map_err(|_| TraceError::Other("failed to send flush message".into()))?;

        receiver
            .recv_timeout(self.drain_timeout)
            .map_err(|_| TraceError::from("flush timed out"))?
    }

    fn shutdown(&self) -> TraceResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TraceError::Other("reporter already shutdown".into()));
        }
        let dropped = self.dropped_count.load(Ordering::Relaxed);
        if dropped > 0 {
            crate::seg_warn!(name: "queued_reporter_dropped_total", dropped_count = dropped);
        }
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .send(QueueMessage::Shutdown(sender))
            .map_err(|_| TraceError::Other("failed to send shutdown message".into()))?;

        let result = receiver
            .recv_timeout(self.drain_timeout)
            .map_err(|_| TraceError::from("shutdown timed out"))?;
        if let Some(handle) = self.handle.lock().expect("lock poisoned").take() {
            handle.join().expect("Failed to join thread");
        }
        result
    }
}

impl Drop for QueuedReporter {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Relaxed) {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::RecvTimeoutError;

    use super::*;
    use crate::ids::{SegmentId, TraceId};

    fn segment(n: u64) -> TraceSegment {
        TraceSegment {
            trace_id: TraceId::new(0, n),
            segment_id: SegmentId::new(0, n),
            service: "svc".to_owned(),
            service_instance: "svc-1".to_owned(),
            spans: Vec::new(),
        }
    }

    #[test]
    fn in_memory_reporter_stores_and_resets() {
        let reporter = InMemoryReporter::new();
        reporter.report(segment(1));
        reporter.report(segment(2));

        let stored = reporter.finished_segments().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].trace_id, TraceId::new(0, 1));

        reporter.reset();
        assert!(reporter.finished_segments().unwrap().is_empty());
    }

    #[test]
    fn queued_reporter_delivers_in_order() {
        let inner = InMemoryReporter::new();
        let queued = QueuedReporter::new(inner.clone());
        for n in 0..16 {
            queued.report(segment(n));
        }
        queued.flush().unwrap();

        let stored = inner.finished_segments().unwrap();
        assert_eq!(stored.len(), 16);
        assert!(stored
            .windows(2)
            .all(|pair| pair[0].segment_id.unique() < pair[1].segment_id.unique()));
        assert_eq!(queued.dropped_count(), 0);
        queued.shutdown().unwrap();
    }

    /// Reporter whose `report` blocks until released, to wedge the worker.
    #[derive(Debug)]
    struct GatedReporter {
        gate: Mutex<Receiver<()>>,
    }

    impl SegmentReporter for GatedReporter {
        fn report(&self, _segment: TraceSegment) {
            let gate = self.gate.lock().expect("lock poisoned");
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (release, gate) = sync_channel(64);
        let queued = QueuedReporter::with_capacity(
            GatedReporter {
                gate: Mutex::new(gate),
            },
            2,
        );

        // One segment wedges the worker, two fill the queue, the rest drop.
        for n in 0..8 {
            queued.report(segment(n));
        }
        assert!(queued.dropped_count() >= 5);

        for _ in 0..8 {
            let _ = release.send(());
        }
        queued.shutdown().unwrap();
    }

    #[test]
    fn shutdown_is_terminal() {
        let queued = QueuedReporter::new(NoopReporter::new());
        queued.shutdown().unwrap();
        assert!(queued.shutdown().is_err());
        assert!(queued.flush().is_err());

        let before = queued.dropped_count();
        queued.report(segment(1));
        assert_eq!(queued.dropped_count(), before + 1);
    }

    #[test]
    fn gated_reporter_gate_times_out() {
        // Guards the 5s bound the wedge test relies on.
        let (_release, gate) = sync_channel::<()>(1);
        let start = std::time::Instant::now();
        drop(_release);
        assert_eq!(
            gate.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        );
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
