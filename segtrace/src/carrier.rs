//! Cross-process propagation: the context carrier and its wire codec.
//!
//! A [`ContextCarrier`] is built fresh per call. Outbound, the active
//! context fills it and the caller copies its items into transport metadata
//! (HTTP headers, message properties, RPC attachments). Inbound, the caller
//! feeds transport values back in and the carrier either reconstructs the
//! upstream reference or, on anything malformed, degrades to "no upstream
//! reference" so that a broken peer can never fail the instrumented call.
//!
//! Two header fields are used, always traversed in the same order:
//!
//! * `segtrace-context` holds the versioned, dash-joined context groups:
//!   `1-{sampled}-{trace id}-{segment id}-{span id}-{service}-{instance}-{endpoint}-{address}`,
//!   with free-text groups base64 encoded. Groups after the ninth are
//!   ignored so later versions can append without breaking older readers.
//! * `segtrace-correlation` holds comma-joined `key:value` pairs, both
//!   halves base64 encoded.

use std::borrow::Cow;
use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::ids::{SegmentId, SpanId, TraceId};
use crate::span::{RefType, SegmentReference};

/// Header field carrying the primary trace-context value.
pub const CONTEXT_HEADER: &str = "segtrace-context";

/// Header field carrying correlation key/value pairs.
pub const CORRELATION_HEADER: &str = "segtrace-correlation";

const FORMAT_VERSION: &str = "1";
const CONTEXT_GROUPS: usize = 9;

const MAX_CORRELATION_ENTRIES: usize = 8;
const MAX_CORRELATION_VALUE_LEN: usize = 128;

/// Injector provides an interface for adding fields to an underlying struct
/// like `HashMap`.
pub trait Injector {
    /// Add a key and value to the underlying data.
    fn set(&mut self, key: &str, value: String);

    #[allow(unused_variables)]
    /// Hint to reserve capacity for at least `additional` more entries to be inserted.
    fn reserve(&mut self, additional: usize) {}
}

/// Extractor provides an interface for reading fields from an underlying
/// struct like `HashMap`.
pub trait Extractor {
    /// Get a value from a key from the underlying data.
    fn get(&self, key: &str) -> Option<Cow<'_, str>>;

    /// Collect all the keys from the underlying data.
    fn keys(&self) -> Vec<Cow<'_, str>>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    /// Set a key and value in the HashMap.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }

    /// Reserves capacity for at least `additional` more entries to be inserted.
    fn reserve(&mut self, additional: usize) {
        self.reserve(additional);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    /// Get a value for a key from the HashMap.
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(&key.to_lowercase())
            .map(|v| Cow::Borrowed(v.as_str()))
    }

    /// Collect all the keys from the HashMap.
    fn keys(&self) -> Vec<Cow<'_, str>> {
        self.keys()
            .map(|k| Cow::Borrowed(k.as_str()))
            .collect::<Vec<_>>()
    }
}

/// The decoded (or to-be-encoded) primary context value.
///
/// Field names take the receiver's point of view: on inject the sending
/// process describes itself as the receiver's parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CarrierReference {
    /// Sampling decision of the sending segment.
    pub sampled: bool,
    /// Trace the sending segment belongs to.
    pub trace_id: TraceId,
    /// Id of the sending segment.
    pub parent_segment_id: SegmentId,
    /// Id of the span that made the outbound call.
    pub parent_span_id: SpanId,
    /// Service name of the sending process.
    pub parent_service: String,
    /// Service instance identity of the sending process.
    pub parent_service_instance: String,
    /// Operation name of the sending segment's entry span.
    pub parent_endpoint: String,
    /// Address the outbound call was made to. Empty when unknown.
    pub network_address: String,
}

impl From<&CarrierReference> for SegmentReference {
    fn from(reference: &CarrierReference) -> Self {
        SegmentReference {
            ref_type: RefType::CrossProcess,
            trace_id: reference.trace_id,
            parent_segment_id: reference.parent_segment_id,
            parent_span_id: reference.parent_span_id,
            parent_service: reference.parent_service.clone(),
            parent_service_instance: reference.parent_service_instance.clone(),
            parent_endpoint: reference.parent_endpoint.clone(),
            network_address: reference.network_address.clone(),
            sampled: reference.sampled,
        }
    }
}

/// One named propagation field rendered for transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CarrierItem {
    /// The header name, exactly as it must appear on the transport.
    pub key: &'static str,
    /// The rendered value. Empty when the carrier has nothing to send for
    /// this field.
    pub value: String,
}

/// The serializable subset of a tracing context, as sent between processes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextCarrier {
    reference: Option<CarrierReference>,
    correlation: CorrelationContext,
}

impl ContextCarrier {
    /// An empty carrier, ready for [`extract_from`](Self::extract_from) or
    /// for the context engine to fill on inject.
    pub fn new() -> Self {
        ContextCarrier::default()
    }

    /// The fixed set of header names this carrier reads and writes, in
    /// traversal order.
    pub fn keys() -> [&'static str; 2] {
        [CONTEXT_HEADER, CORRELATION_HEADER]
    }

    /// Render the carrier's fields for transport, in traversal order.
    ///
    /// Items with an empty value carry nothing and may be skipped by the
    /// transport.
    pub fn items(&self) -> [CarrierItem; 2] {
        [
            CarrierItem {
                key: CONTEXT_HEADER,
                value: self
                    .reference
                    .as_ref()
                    .map(encode_reference)
                    .unwrap_or_default(),
            },
            CarrierItem {
                key: CORRELATION_HEADER,
                value: self.correlation.encode(),
            },
        ]
    }

    /// Feed one inbound transport value into the carrier.
    ///
    /// Returns whether the key is one of [`ContextCarrier::keys`]. Malformed
    /// values are absorbed: the affected field just stays empty.
    pub fn try_set(&mut self, key: &str, value: &str) -> bool {
        if key.eq_ignore_ascii_case(CONTEXT_HEADER) {
            self.reference = decode_reference(value);
            true
        } else if key.eq_ignore_ascii_case(CORRELATION_HEADER) {
            self.correlation = CorrelationContext::decode(value);
            true
        } else {
            false
        }
    }

    /// Write all non-empty fields into an [`Injector`].
    pub fn inject_into(&self, injector: &mut dyn Injector) {
        injector.reserve(2);
        for item in self.items() {
            if !item.value.is_empty() {
                injector.set(item.key, item.value);
            }
        }
    }

    /// Fill the carrier from an [`Extractor`] over inbound transport
    /// metadata.
    pub fn extract_from(&mut self, extractor: &dyn Extractor) -> &mut Self {
        for key in Self::keys() {
            if let Some(value) = extractor.get(key) {
                self.try_set(key, &value);
            }
        }
        self
    }

    /// Whether a well-formed upstream reference was decoded.
    pub fn is_valid(&self) -> bool {
        self.reference.is_some()
    }

    /// The decoded upstream reference, if any.
    pub fn reference(&self) -> Option<&CarrierReference> {
        self.reference.as_ref()
    }

    /// Trace id of the upstream reference, if any.
    pub fn trace_id(&self) -> Option<TraceId> {
        self.reference.as_ref().map(|r| r.trace_id)
    }

    /// Sampling flag of the upstream reference; `None` without one.
    pub fn sampled(&self) -> Option<bool> {
        self.reference.as_ref().map(|r| r.sampled)
    }

    /// Correlation entries carried alongside the context.
    pub fn correlation(&self) -> &CorrelationContext {
        &self.correlation
    }

    /// Mutable access to the carried correlation entries.
    pub fn correlation_mut(&mut self) -> &mut CorrelationContext {
        &mut self.correlation
    }

    pub(crate) fn set_reference(&mut self, reference: CarrierReference) {
        self.reference = Some(reference);
    }

    pub(crate) fn set_correlation(&mut self, correlation: CorrelationContext) {
        self.correlation = correlation;
    }
}

fn encode_reference(reference: &CarrierReference) -> String {
    format!(
        "{}-{}-{}-{}-{}-{}-{}-{}-{}",
        FORMAT_VERSION,
        if reference.sampled { "1" } else { "0" },
        BASE64_STANDARD.encode(reference.trace_id.to_string()),
        BASE64_STANDARD.encode(reference.parent_segment_id.to_string()),
        reference.parent_span_id,
        BASE64_STANDARD.encode(&reference.parent_service),
        BASE64_STANDARD.encode(&reference.parent_service_instance),
        BASE64_STANDARD.encode(&reference.parent_endpoint),
        BASE64_STANDARD.encode(&reference.network_address),
    )
}

fn decode_reference(value: &str) -> Option<CarrierReference> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let parts: Vec<&str> = value.split('-').collect();
    // Extra trailing groups are fine, an unknown version is not.
    if parts.len() < CONTEXT_GROUPS || parts[0] != FORMAT_VERSION {
        return None;
    }
    let sampled = match parts[1] {
        "0" => false,
        "1" => true,
        _ => return None,
    };
    let trace_id = TraceId::from_hex(&decode_text(parts[2])?)?;
    let parent_segment_id = SegmentId::from_hex(&decode_text(parts[3])?)?;
    let parent_span_id: i32 = parts[4].parse().ok()?;
    if parent_span_id < 0 {
        return None;
    }

    Some(CarrierReference {
        sampled,
        trace_id,
        parent_segment_id,
        parent_span_id: SpanId(parent_span_id),
        parent_service: decode_text(parts[5])?,
        parent_service_instance: decode_text(parts[6])?,
        parent_endpoint: decode_text(parts[7])?,
        network_address: decode_text(parts[8])?,
    })
}

fn decode_text(part: &str) -> Option<String> {
    let bytes = BASE64_STANDARD.decode(part).ok()?;
    String::from_utf8(bytes).ok()
}

/// Small key/value baggage that travels with the trace context.
///
/// Capped at 8 entries with values of at most 128 bytes; writes beyond the
/// caps are ignored rather than erroring, like everything else on the
/// propagation path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CorrelationContext {
    entries: Vec<(String, String)>,
}

impl CorrelationContext {
    /// An empty correlation context.
    pub fn new() -> Self {
        CorrelationContext::default()
    }

    /// Look up the value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Record `key = value`, overwriting an existing entry.
    ///
    /// An empty value removes the entry. Returns whether the write was
    /// applied; it is not when it would exceed the entry or value-size caps.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let value = value.into();
        if value.is_empty() {
            self.entries.retain(|(k, _)| *k != key);
            return true;
        }
        if value.len() > MAX_CORRELATION_VALUE_LEN {
            return false;
        }
        if let Some((_, slot)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            *slot = value;
            return true;
        }
        if self.entries.len() < MAX_CORRELATION_ENTRIES {
            self.entries.push((key, value));
            return true;
        }
        false
    }

    /// Whether any entry is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate the recorded entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy every entry of `other` into this context, within the caps.
    pub(crate) fn merge(&mut self, other: &CorrelationContext) {
        for (key, value) in other.iter() {
            self.put(key, value);
        }
    }

    fn encode(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.iter() {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(&BASE64_STANDARD.encode(key));
            out.push(':');
            out.push_str(&BASE64_STANDARD.encode(value));
        }
        out
    }

    fn decode(value: &str) -> Self {
        let mut correlation = CorrelationContext::new();
        for pair in value.split(',') {
            let Some((key, value)) = pair.split_once(':') else {
                continue;
            };
            let (Some(key), Some(value)) = (decode_text(key.trim()), decode_text(value.trim()))
            else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            correlation.put(key, value);
        }
        correlation
    }
}
