//! Trace, segment and span identifiers, and their generators.
//!
//! Trace and segment ids must be unique across all processes of a deployment
//! without any coordination. They combine a process-unique prefix (derived
//! once from host identity, process id and startup time) with a per-call
//! random component and an atomic counter, so no two calls in one process
//! can collide and cross-process collisions are astronomically unlikely.
//! Span ids are plain per-segment sequence numbers starting at zero.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::SystemTime;

use rand::{rngs, Rng, SeedableRng};

/// Globally unique identifier of one distributed trace.
///
/// Rendered as 32 lowercase hex characters: the process prefix followed by
/// the per-id unique part.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId {
    prefix: u64,
    unique: u64,
}

impl TraceId {
    /// Construct a trace id from its two halves.
    pub const fn new(prefix: u64, unique: u64) -> Self {
        TraceId { prefix, unique }
    }

    /// Parse a trace id from exactly 32 hex characters.
    ///
    /// Returns `None` for any other input; propagation decoding treats that
    /// as "no upstream reference".
    pub fn from_hex(hex: &str) -> Option<Self> {
        let (prefix, unique) = parse_hex_pair(hex)?;
        Some(TraceId { prefix, unique })
    }

    /// Process-unique half of this id.
    pub const fn prefix(&self) -> u64 {
        self.prefix
    }

    /// Per-id half of this id.
    pub const fn unique(&self) -> u64 {
        self.unique
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.prefix, self.unique)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({:016x}{:016x})", self.prefix, self.unique)
    }
}

/// Globally unique identifier of one trace segment.
///
/// Same shape and rendering as [`TraceId`]; a separate type keeps the two
/// from being mixed up in references and carriers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId {
    prefix: u64,
    unique: u64,
}

impl SegmentId {
    /// Construct a segment id from its two halves.
    pub const fn new(prefix: u64, unique: u64) -> Self {
        SegmentId { prefix, unique }
    }

    /// Parse a segment id from exactly 32 hex characters.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let (prefix, unique) = parse_hex_pair(hex)?;
        Some(SegmentId { prefix, unique })
    }

    /// Process-unique half of this id.
    pub const fn prefix(&self) -> u64 {
        self.prefix
    }

    /// Per-id half of this id.
    pub const fn unique(&self) -> u64 {
        self.unique
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.prefix, self.unique)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({:016x}{:016x})", self.prefix, self.unique)
    }
}

fn parse_hex_pair(hex: &str) -> Option<(u64, u64)> {
    // from_str_radix tolerates a leading `+`, so digits are checked first.
    if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let prefix = u64::from_str_radix(&hex[..16], 16).ok()?;
    let unique = u64::from_str_radix(&hex[16..], 16).ok()?;
    Some((prefix, unique))
}

/// Identifier of one span within its segment.
///
/// Assigned at creation, counting up from 0 in creation order. The parent of
/// a segment's first span is [`SpanId::NONE`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(pub i32);

impl SpanId {
    /// The "no parent" marker, rendered as `-1`.
    pub const NONE: SpanId = SpanId(-1);
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interface for generating trace and segment ids.
///
/// Generation must never fail and never block.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TraceId`.
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new `SegmentId`.
    fn new_segment_id(&self) -> SegmentId;
}

/// Default [`IdGenerator`] implementation.
///
/// The prefix is fixed at construction from the hosting process identity;
/// the unique half of every id is a fresh 32-bit random value over a 32-bit
/// counter.
#[derive(Debug)]
pub struct ProcessIdGenerator {
    prefix: u64,
    counter: AtomicU32,
}

impl ProcessIdGenerator {
    /// Build a generator seeded from the current process: `HOSTNAME`
    /// environment, process id and the time of this call.
    pub fn new() -> Self {
        ProcessIdGenerator {
            prefix: identity_prefix(std::process::id(), SystemTime::now()),
            counter: AtomicU32::new(0),
        }
    }

    /// Build a generator from identity inputs supplied by the hosting
    /// process instead of ambient ones.
    pub fn with_identity(pid: u32, startup: SystemTime) -> Self {
        ProcessIdGenerator {
            prefix: identity_prefix(pid, startup),
            counter: AtomicU32::new(0),
        }
    }

    fn next_unique(&self) -> u64 {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let random = CURRENT_RNG.with(|rng| rng.borrow_mut().random::<u32>());
        (u64::from(random) << 32) | u64::from(seq)
    }
}

impl Default for ProcessIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for ProcessIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        TraceId::new(self.prefix, self.next_unique())
    }

    fn new_segment_id(&self) -> SegmentId {
        SegmentId::new(self.prefix, self.next_unique())
    }
}

fn identity_prefix(pid: u32, startup: SystemTime) -> u64 {
    let mut hasher = DefaultHasher::new();
    if let Some(host) = std::env::var_os("HOSTNAME") {
        host.hash(&mut hasher);
    }
    pid.hash(&mut hasher);
    if let Ok(elapsed) = startup.duration_since(SystemTime::UNIX_EPOCH) {
        elapsed.as_nanos().hash(&mut hasher);
    }
    hasher.finish()
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_os_rng());
}

#[cfg(any(test, feature = "testing"))]
pub use sequential::SequentialIdGenerator;

#[cfg(any(test, feature = "testing"))]
mod sequential {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::{IdGenerator, SegmentId, TraceId};

    /// [`IdGenerator`] implementation that increments a counter for each new
    /// id. This helps produce predictable ids for testing.
    #[derive(Clone, Debug)]
    pub struct SequentialIdGenerator(Arc<AtomicU64>);

    impl SequentialIdGenerator {
        /// Create a new [`SequentialIdGenerator`].
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Default for SequentialIdGenerator {
        fn default() -> Self {
            Self(Arc::new(AtomicU64::new(1)))
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn new_trace_id(&self) -> TraceId {
            TraceId::new(0, self.0.fetch_add(1, Ordering::SeqCst))
        }

        fn new_segment_id(&self) -> SegmentId {
            SegmentId::new(0, self.0.fetch_add(1, Ordering::SeqCst))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = TraceId::new(0x00ab_cdef_0123_4567, 0x89ab_cdef_0102_0304);
        let hex = id.to_string();
        assert_eq!(hex.len(), 32);
        assert_eq!(TraceId::from_hex(&hex), Some(id));

        let seg = SegmentId::new(1, 2);
        assert_eq!(SegmentId::from_hex(&seg.to_string()), Some(seg));
    }

    #[test]
    fn from_hex_rejects_malformed_input() {
        assert_eq!(TraceId::from_hex(""), None);
        assert_eq!(TraceId::from_hex("abc"), None);
        assert_eq!(TraceId::from_hex(&"f".repeat(33)), None);
        assert_eq!(TraceId::from_hex("+fffffffffffffffffffffffffffffff"), None);
        assert_eq!(TraceId::from_hex("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"), None);
        assert!(TraceId::from_hex(&"A".repeat(32)).is_some());
    }

    #[test]
    fn span_id_display() {
        assert_eq!(SpanId::NONE.to_string(), "-1");
        assert_eq!(SpanId(7).to_string(), "7");
    }

    #[test]
    fn process_generator_never_repeats_in_process() {
        let generator = ProcessIdGenerator::new();
        let mut seen = HashSet::new();
        for _ in 0..4096 {
            assert!(seen.insert(generator.new_trace_id().to_string()));
            assert!(seen.insert(generator.new_segment_id().to_string()));
        }
    }

    #[test]
    fn ids_share_the_process_prefix() {
        let generator = ProcessIdGenerator::new();
        let first = generator.new_trace_id();
        let second = generator.new_segment_id();
        assert_eq!(first.prefix(), second.prefix());
    }

    #[test]
    fn identity_prefix_is_stable_for_fixed_inputs() {
        let startup = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        temp_env::with_var("HOSTNAME", Some("trace-host-1"), || {
            assert_eq!(identity_prefix(42, startup), identity_prefix(42, startup));
        });
    }

    #[test]
    fn identity_prefix_differs_across_hosts() {
        let startup = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let first = temp_env::with_var("HOSTNAME", Some("trace-host-1"), || {
            identity_prefix(42, startup)
        });
        let second = temp_env::with_var("HOSTNAME", Some("trace-host-2"), || {
            identity_prefix(42, startup)
        });
        assert_ne!(first, second);
    }

    #[test]
    fn sequential_generator_counts_up() {
        let generator = SequentialIdGenerator::new();
        assert_eq!(generator.new_trace_id(), TraceId::new(0, 1));
        assert_eq!(generator.new_segment_id(), SegmentId::new(0, 2));
        assert_eq!(generator.new_segment_id(), SegmentId::new(0, 3));
    }
}
