//! # Context propagation
//!
//! Moves the trace context and the correlation ID across process boundaries.
//! [`ContextPropagator`] implements
//! [`TextMapPropagator`](opentelemetry::propagation::TextMapPropagator) and is what
//! [`crate::setup::init`] installs globally.
//!
//! HTTP carriers live in the `telemetry-http` crate. Queue messages carry the
//! same fields as plain string attributes, see [`inject_message`] and
//! [`extract_message`].
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use std::collections::HashMap;

mod propagator;
mod traceparent;

pub use propagator::{ContextPropagator, TRACEPARENT_HEADER, TRACESTATE_HEADER};
pub use traceparent::{TraceParent, TraceParentError, SUPPORTED_VERSION};

/// String attributes attached to a queue message.
pub type MessageAttributes = HashMap<String, String>;

/// Inject `cx` into an owned carrier using the global propagator and return it.
pub fn inject<C: Injector>(cx: &Context, mut carrier: C) -> C {
    global::get_text_map_propagator(|propagator| propagator.inject_context(cx, &mut carrier));
    carrier
}

/// Extract a fresh context from `carrier` using the global propagator.
///
/// The currently attached context is not consulted: the result either
/// continues the carrier's trace or starts a new one.
pub fn extract(carrier: &dyn Extractor) -> Context {
    global::get_text_map_propagator(|propagator| {
        propagator.extract_with_context(&Context::new(), carrier)
    })
}

/// Add the trace fields and correlation ID of `cx` to a message's attributes.
///
/// Attributes already present under other keys are left untouched.
pub fn inject_message(cx: &Context, attributes: MessageAttributes) -> MessageAttributes {
    inject(cx, attributes)
}

/// Recover the producer's context from a message's attributes.
///
/// Attribute names are matched case-insensitively, since brokers do not agree
/// on how they store them.
pub fn extract_message(attributes: &MessageAttributes) -> Context {
    extract(&CaseInsensitive(attributes))
}

struct CaseInsensitive<'a>(&'a MessageAttributes);

impl Extractor for CaseInsensitive<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .or_else(|| {
                self.0
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(key))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::{CorrelationContextExt, CorrelationId};
    use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};

    fn with_propagator<R>(f: impl FnOnce() -> R) -> R {
        global::set_text_map_propagator(ContextPropagator::new());
        f()
    }

    #[test]
    fn message_round_trip() {
        with_propagator(|| {
            let span_context = SpanContext::new(
                TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
                SpanId::from_hex("00f067aa0ba902b7").unwrap(),
                TraceFlags::SAMPLED,
                true,
                TraceState::default(),
            );
            let cx = Context::new()
                .with_remote_span_context(span_context.clone())
                .with_correlation_id(CorrelationId::resolve(Some("order-17")));

            let mut attributes = MessageAttributes::new();
            attributes.insert("event".to_owned(), "order.created".to_owned());
            let attributes = inject_message(&cx, attributes);
            assert_eq!(attributes.get("event").map(String::as_str), Some("order.created"));

            let consumed = extract_message(&attributes);
            assert_eq!(consumed.span().span_context(), &span_context);
            assert_eq!(
                consumed.correlation_id().map(CorrelationId::as_str),
                Some("order-17")
            );
        });
    }

    #[test]
    fn message_attributes_match_case_insensitively() {
        with_propagator(|| {
            let attributes = MessageAttributes::from([
                (
                    "TraceParent".to_owned(),
                    "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_owned(),
                ),
                ("X-Request-ID".to_owned(), "mixed-case".to_owned()),
            ]);
            let cx = extract_message(&attributes);
            assert_eq!(
                cx.span().span_context().trace_id().to_string(),
                "4bf92f3577b34da6a3ce929d0e0e4736"
            );
            assert_eq!(
                cx.correlation_id().map(CorrelationId::as_str),
                Some("mixed-case")
            );
        });
    }

    #[test]
    fn extract_ignores_attached_context() {
        with_propagator(|| {
            let _guard = Context::new()
                .with_correlation_id(CorrelationId::resolve(Some("outer")))
                .attach();
            let cx = extract_message(&MessageAttributes::new());
            assert!(!cx.has_active_span());
            assert!(cx.correlation_id().is_none());
        });
    }
}
