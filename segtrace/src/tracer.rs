//! Tracer configuration: service identity, sampling, id generation and the
//! reporter every finished segment is handed to.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::error::TraceResult;
use crate::ids::{IdGenerator, ProcessIdGenerator, SegmentId, TraceId};
use crate::reporter::{NoopReporter, SegmentReporter};
use crate::segment::TraceSegment;

/// The [`ShouldSample`] interface allows implementations to decide, when a
/// fresh trace starts, whether its segments are recorded and reported.
///
/// The decision is made once per trace, at root-segment creation. Segments
/// that join an existing trace (through an extracted carrier) inherit the
/// upstream flag instead of consulting the sampler, so a trace is either
/// reported from every process it touches or from none.
pub trait ShouldSample: CloneShouldSample + Send + Sync + fmt::Debug {
    /// Returns whether a new root segment with this `trace_id`, opened for
    /// `operation_name`, should be recorded.
    fn should_sample(&self, trace_id: TraceId, operation_name: &str) -> bool;
}

/// This trait should not be used directly; instead users should use
/// [`ShouldSample`].
pub trait CloneShouldSample {
    /// Clone the sampler behind a trait object.
    fn box_clone(&self) -> Box<dyn ShouldSample>;
}

impl<T> CloneShouldSample for T
where
    T: ShouldSample + Clone + 'static,
{
    fn box_clone(&self) -> Box<dyn ShouldSample> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn ShouldSample> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Built-in sampling options.
///
/// For more elaborate policies implement [`ShouldSample`] directly.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Sampler {
    /// Always sample the trace
    AlwaysOn,
    /// Never sample the trace
    AlwaysOff,
    /// Sample a given fraction of fresh traces. Fractions >= 1 always
    /// sample, fractions <= 0 never do. The decision hashes off the trace
    /// id, so every segment of one trace lands on the same side.
    TraceIdRatioBased(f64),
}

impl ShouldSample for Sampler {
    fn should_sample(&self, trace_id: TraceId, _operation_name: &str) -> bool {
        match self {
            Sampler::AlwaysOn => true,
            Sampler::AlwaysOff => false,
            Sampler::TraceIdRatioBased(prob) => sample_based_on_probability(prob, trace_id),
        }
    }
}

fn sample_based_on_probability(prob: &f64, trace_id: TraceId) -> bool {
    if *prob >= 1.0 {
        true
    } else {
        let prob_upper_bound = (prob.max(0.0) * (1u64 << 63) as f64) as u64;
        // The unique half carries the per-trace randomness in its high bits.
        let rnd_from_trace_id = trace_id.unique() >> 1;
        rnd_from_trace_id < prob_upper_bound
    }
}

/// Shared configuration of one traced service process.
///
/// A `Tracer` bundles the service identity stamped on every segment, the id
/// generator, the sampling policy for fresh traces, and the reporter that
/// receives finished segments. It is immutable once built and cheap to
/// clone; all clones share the same reporter.
///
/// ```
/// use segtrace::reporter::InMemoryReporter;
/// use segtrace::{Sampler, Tracer};
///
/// let reporter = InMemoryReporter::new();
/// let tracer = Tracer::builder("inventory")
///     .with_instance("inventory-1")
///     .with_sampler(Sampler::AlwaysOn)
///     .with_reporter(reporter.clone())
///     .build();
/// assert_eq!(tracer.service(), "inventory");
/// ```
#[derive(Clone, Debug)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

#[derive(Debug)]
struct TracerInner {
    service: String,
    instance: String,
    sampler: Box<dyn ShouldSample>,
    id_generator: Box<dyn IdGenerator>,
    reporter: Box<dyn SegmentReporter>,
    unsampled_dropped: AtomicUsize,
}

impl Tracer {
    /// Start building a tracer for the named service.
    pub fn builder<S: Into<String>>(service: S) -> TracerBuilder {
        TracerBuilder {
            service: service.into(),
            instance: None,
            sampler: Box::new(Sampler::AlwaysOn),
            id_generator: Box::new(ProcessIdGenerator::new()),
            reporter: Box::new(NoopReporter::new()),
        }
    }

    /// New, empty tracing context bound to this tracer.
    pub fn create_context(&self) -> crate::context::TracingContext {
        crate::context::TracingContext::new(self.clone())
    }

    /// Name of the traced service.
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Identity of this service instance.
    pub fn instance(&self) -> &str {
        &self.inner.instance
    }

    /// Deliver anything the reporter has buffered.
    pub fn flush(&self) -> TraceResult<()> {
        self.inner.reporter.flush()
    }

    /// Flush and shut the reporter down.
    pub fn shutdown(&self) -> TraceResult<()> {
        self.inner.reporter.shutdown()
    }

    /// Number of finished segments discarded because their trace was not
    /// sampled.
    pub fn unsampled_dropped_count(&self) -> usize {
        self.inner.unsampled_dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn record_unsampled_drop(&self) {
        self.inner.unsampled_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sample(&self, trace_id: TraceId, operation_name: &str) -> bool {
        self.inner.sampler.should_sample(trace_id, operation_name)
    }

    pub(crate) fn new_trace_id(&self) -> TraceId {
        self.inner.id_generator.new_trace_id()
    }

    pub(crate) fn new_segment_id(&self) -> SegmentId {
        self.inner.id_generator.new_segment_id()
    }

    pub(crate) fn report(&self, segment: TraceSegment) {
        self.inner.reporter.report(segment);
    }
}

/// Configures and constructs a [`Tracer`].
#[derive(Debug)]
pub struct TracerBuilder {
    service: String,
    instance: Option<String>,
    sampler: Box<dyn ShouldSample>,
    id_generator: Box<dyn IdGenerator>,
    reporter: Box<dyn SegmentReporter>,
}

impl TracerBuilder {
    /// Name this service instance. Defaults to `{pid}@{8 hex digits}`.
    pub fn with_instance<S: Into<String>>(mut self, instance: S) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Sampling policy for fresh traces. Defaults to [`Sampler::AlwaysOn`].
    pub fn with_sampler<S: ShouldSample + 'static>(mut self, sampler: S) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    /// Source of trace and segment ids. Defaults to
    /// [`ProcessIdGenerator`](crate::ids::ProcessIdGenerator).
    pub fn with_id_generator<G: IdGenerator + 'static>(mut self, id_generator: G) -> Self {
        self.id_generator = Box::new(id_generator);
        self
    }

    /// Destination for finished segments. Defaults to
    /// [`NoopReporter`](crate::reporter::NoopReporter).
    pub fn with_reporter<R: SegmentReporter + 'static>(mut self, reporter: R) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    /// Build the immutable tracer handle.
    pub fn build(self) -> Tracer {
        let instance = self
            .instance
            .unwrap_or_else(|| format!("{}@{:08x}", std::process::id(), rand::rng().random::<u32>()));
        Tracer {
            inner: Arc::new(TracerInner {
                service: self.service,
                instance,
                sampler: self.sampler,
                id_generator: self.id_generator,
                reporter: self.reporter,
                unsampled_dropped: AtomicUsize::new(0),
            }),
        }
    }
}
