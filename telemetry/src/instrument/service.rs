use super::SpanTemplate;
use crate::trace::TracerSource;
use opentelemetry::{trace::SpanKind, KeyValue};
use std::borrow::Cow;

/// Attribute naming the service an operation belongs to.
pub const CODE_NAMESPACE: &str = "code.namespace";

/// Produces one span template per operation of a service.
///
/// Operations are registered explicitly when the service is built:
///
/// ```
/// use telemetry::instrument::ServiceTracer;
///
/// let tracer = ServiceTracer::new("UserService");
/// let find = tracer
///     .operation("find")
///     .wrap(|id: u32| -> Result<String, std::fmt::Error> { Ok(format!("user {id}")) });
///
/// assert_eq!(find.call(1).unwrap(), "user 1");
/// ```
#[derive(Clone, Debug)]
pub struct ServiceTracer {
    service: Cow<'static, str>,
    kind: SpanKind,
    tracer: TracerSource,
}

impl ServiceTracer {
    /// Create a tracer for the service called `service`.
    pub fn new(service: impl Into<Cow<'static, str>>) -> Self {
        ServiceTracer {
            service: service.into(),
            kind: SpanKind::Internal,
            tracer: TracerSource::default(),
        }
    }

    /// Kind of every operation span, `Internal` by default.
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    /// Start spans with `tracer`.
    pub fn with_tracer(mut self, tracer: TracerSource) -> Self {
        self.tracer = tracer;
        self
    }

    /// The service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Template for `operation`, named `"{service}.{operation}"`.
    pub fn operation<A: ?Sized>(&self, operation: &str) -> SpanTemplate<A> {
        SpanTemplate::new(format!("{}.{}", self.service, operation))
            .with_kind(self.kind.clone())
            .with_attribute(KeyValue::new(CODE_NAMESPACE, self.service.to_string()))
            .with_tracer(self.tracer.clone())
    }
}
