//! # Request correlation
//!
//! A correlation ID is an opaque string assigned once to an inbound request and
//! forwarded unchanged to every downstream call and queue message that request
//! triggers. It travels next to the trace context but is independent of it, so
//! log lines can be joined even when the caller does not speak W3C Trace
//! Context.
//!
//! The ID is stored in the request-scoped [`Context`], never in process-wide
//! state:
//!
//! ```
//! use opentelemetry::Context;
//! use telemetry::correlation::{CorrelationContextExt, CorrelationId};
//!
//! let id = CorrelationId::resolve(Some("req-42"));
//! let cx = Context::new().with_correlation_id(id);
//!
//! assert_eq!(cx.correlation_id().map(|id| id.as_str()), Some("req-42"));
//! ```
use opentelemetry::Context;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Header used to carry the correlation ID when none is configured.
pub const DEFAULT_CORRELATION_HEADER: &str = "x-request-id";

/// Span attribute key the correlation ID is recorded under.
pub const CORRELATION_ID_ATTRIBUTE: &str = "correlation.id";

/// An immutable, non-empty correlation identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a new globally unique ID (a hyphenated UUID v4).
    pub fn generate() -> Self {
        CorrelationId(Arc::from(Uuid::new_v4().to_string()))
    }

    /// Wrap an existing value. Returns `None` when the value is empty or only
    /// whitespace.
    pub fn parse(value: &str) -> Option<Self> {
        if value.trim().is_empty() {
            None
        } else {
            Some(CorrelationId(Arc::from(value)))
        }
    }

    /// Reuse an inbound value verbatim when present and non-blank, otherwise
    /// generate a new one.
    ///
    /// This never fails: absence and malformed input both fall through to
    /// generation.
    pub fn resolve(inbound: Option<&str>) -> Self {
        inbound
            .and_then(CorrelationId::parse)
            .unwrap_or_else(CorrelationId::generate)
    }

    /// The ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CorrelationId> for opentelemetry::Value {
    fn from(id: CorrelationId) -> Self {
        opentelemetry::Value::from(id.0.to_string())
    }
}

/// Methods for storing and retrieving a [`CorrelationId`] in a [`Context`].
pub trait CorrelationContextExt {
    /// Returns a clone of this context carrying the given correlation ID.
    fn with_correlation_id(&self, id: CorrelationId) -> Self;

    /// Returns a clone of the current context carrying the given correlation ID.
    fn current_with_correlation_id(id: CorrelationId) -> Self;

    /// The correlation ID carried by this context, if any.
    fn correlation_id(&self) -> Option<&CorrelationId>;

    /// Returns this context unchanged if it already carries a correlation ID,
    /// otherwise a clone carrying a newly generated one. The resolved ID is
    /// returned alongside.
    fn ensure_correlation_id(&self) -> (Self, CorrelationId)
    where
        Self: Sized;
}

impl CorrelationContextExt for Context {
    fn with_correlation_id(&self, id: CorrelationId) -> Self {
        self.with_value(id)
    }

    fn current_with_correlation_id(id: CorrelationId) -> Self {
        Context::map_current(|cx| cx.with_correlation_id(id))
    }

    fn correlation_id(&self) -> Option<&CorrelationId> {
        self.get::<CorrelationId>()
    }

    fn ensure_correlation_id(&self) -> (Self, CorrelationId) {
        match self.correlation_id() {
            Some(id) => (self.clone(), id.clone()),
            None => {
                let id = CorrelationId::generate();
                (self.with_correlation_id(id.clone()), id)
            }
        }
    }
}

/// The correlation ID of the currently attached context, if any.
pub fn current_correlation_id() -> Option<CorrelationId> {
    Context::map_current(|cx| cx.correlation_id().cloned())
}
