//! # W3C `traceparent` header
//!
//! The `traceparent` header identifies the incoming request in a tracing system.
//! It has four fields:
//!
//!    - version
//!    - trace-id
//!    - parent-id
//!    - trace-flags
//!
//! `traceparent: 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
//!
//! See the [w3c trace-context docs] for more details.
//!
//! [w3c trace-context docs]: https://www.w3.org/TR/trace-context/#traceparent-header
use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
use std::fmt;
use std::str::FromStr;

/// The only version this crate emits.
pub const SUPPORTED_VERSION: u8 = 0;
const FORBIDDEN_VERSION: u8 = 0xff;
// Sampled bit plus the level 2 "random" bit.
const MAX_VERSION_ZERO_FLAGS: u8 = 0x02;

/// Reasons a `traceparent` value was rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TraceParentError {
    /// The header was empty or whitespace.
    #[error("traceparent is empty")]
    Empty,
    /// Wrong number of `-` separated fields.
    #[error("traceparent has {0} fields")]
    FieldCount(usize),
    /// Version is not two lowercase hex digits.
    #[error("traceparent version is not two lowercase hex digits")]
    Version,
    /// Version `ff` is reserved as invalid.
    #[error("traceparent version ff is forbidden")]
    ForbiddenVersion,
    /// Trace ID is not 32 lowercase hex digits, or is all zeros.
    #[error("traceparent trace-id is invalid")]
    TraceId,
    /// Parent ID is not 16 lowercase hex digits, or is all zeros.
    #[error("traceparent parent-id is invalid")]
    ParentId,
    /// Flags are not two lowercase hex digits, or set bits unknown to version 00.
    #[error("traceparent trace-flags are invalid")]
    TraceFlags,
}

/// A parsed `traceparent` value.
///
/// Only the sampled bit of the flags is retained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceParent {
    trace_id: TraceId,
    parent_id: SpanId,
    trace_flags: TraceFlags,
}

impl TraceParent {
    /// Create a `TraceParent` from its parts.
    pub fn new(trace_id: TraceId, parent_id: SpanId, trace_flags: TraceFlags) -> Self {
        TraceParent {
            trace_id,
            parent_id,
            trace_flags: trace_flags & TraceFlags::SAMPLED,
        }
    }

    /// The `traceparent` describing a span, or `None` when the span context is
    /// not valid (no active span, or a no-op span).
    pub fn from_span_context(span_context: &SpanContext) -> Option<Self> {
        span_context.is_valid().then(|| {
            TraceParent::new(
                span_context.trace_id(),
                span_context.span_id(),
                span_context.trace_flags(),
            )
        })
    }

    /// ID of the whole trace.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// ID of the upstream span this request continues.
    pub fn parent_id(&self) -> SpanId {
        self.parent_id
    }

    /// Trace flags, reduced to the sampled bit.
    pub fn trace_flags(&self) -> TraceFlags {
        self.trace_flags
    }

    /// Whether the upstream sampled this trace.
    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }

    /// Turn this header into a remote span context that new spans can use as
    /// their parent.
    pub fn into_span_context(self, trace_state: TraceState) -> SpanContext {
        SpanContext::new(
            self.trace_id,
            self.parent_id,
            self.trace_flags,
            true,
            trace_state,
        )
    }
}

fn is_lower_hex(field: &str, len: usize) -> bool {
    field.len() == len && field.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn parse_byte(field: &str) -> Option<u8> {
    if is_lower_hex(field, 2) {
        u8::from_str_radix(field, 16).ok()
    } else {
        None
    }
}

impl FromStr for TraceParent {
    type Err = TraceParentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err(TraceParentError::Empty);
        }

        let parts = value.split('-').collect::<Vec<&str>>();
        if parts.len() < 4 {
            return Err(TraceParentError::FieldCount(parts.len()));
        }

        let version = parse_byte(parts[0]).ok_or(TraceParentError::Version)?;
        if version == FORBIDDEN_VERSION {
            return Err(TraceParentError::ForbiddenVersion);
        }
        // Future versions may append fields, version 00 may not.
        if version == SUPPORTED_VERSION && parts.len() != 4 {
            return Err(TraceParentError::FieldCount(parts.len()));
        }

        if !is_lower_hex(parts[1], 32) {
            return Err(TraceParentError::TraceId);
        }
        let trace_id = TraceId::from_hex(parts[1]).map_err(|_| TraceParentError::TraceId)?;
        if trace_id == TraceId::INVALID {
            return Err(TraceParentError::TraceId);
        }

        if !is_lower_hex(parts[2], 16) {
            return Err(TraceParentError::ParentId);
        }
        let parent_id = SpanId::from_hex(parts[2]).map_err(|_| TraceParentError::ParentId)?;
        if parent_id == SpanId::INVALID {
            return Err(TraceParentError::ParentId);
        }

        let flags = parse_byte(parts[3]).ok_or(TraceParentError::TraceFlags)?;
        if version == SUPPORTED_VERSION && flags > MAX_VERSION_ZERO_FLAGS {
            return Err(TraceParentError::TraceFlags);
        }

        Ok(TraceParent::new(trace_id, parent_id, TraceFlags::new(flags)))
    }
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}-{}-{}-{:02x}",
            SUPPORTED_VERSION, self.trace_id, self.parent_id, self.trace_flags
        )
    }
}
