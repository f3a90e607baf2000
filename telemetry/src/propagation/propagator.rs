use super::traceparent::TraceParent;
use crate::correlation::{CorrelationContextExt, CorrelationId, DEFAULT_CORRELATION_HEADER};
use opentelemetry::{
    propagation::{text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator},
    trace::{TraceContextExt, TraceState},
    Context,
};
use std::borrow::Cow;
use std::str::FromStr;

/// Header carrying the W3C trace parent.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Header carrying vendor specific W3C trace state.
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Propagates the trace context in [W3C TraceContext] format together with a
/// request correlation ID.
///
/// Three fields are read and written: `traceparent`, `tracestate` and the
/// correlation header (`x-request-id` unless configured otherwise).
///
/// Extraction is best-effort. A missing or malformed `traceparent` yields a
/// context with no active span, so the next span started under it is a new
/// root. A malformed `tracestate` is dropped on its own.
///
/// [W3C TraceContext]: https://www.w3.org/TR/trace-context/
#[derive(Clone, Debug)]
pub struct ContextPropagator {
    correlation_header: Cow<'static, str>,
    fields: [String; 3],
}

impl Default for ContextPropagator {
    fn default() -> Self {
        ContextPropagator::new()
    }
}

impl ContextPropagator {
    /// Create a propagator using the default `x-request-id` correlation header.
    pub fn new() -> Self {
        ContextPropagator::with_correlation_header(DEFAULT_CORRELATION_HEADER)
    }

    /// Create a propagator carrying the correlation ID under `header`.
    ///
    /// Header names are matched case-insensitively, so the name is stored in
    /// lowercase.
    pub fn with_correlation_header(header: impl Into<Cow<'static, str>>) -> Self {
        let header = header.into();
        let correlation_header: Cow<'static, str> =
            if header.bytes().any(|b| b.is_ascii_uppercase()) {
                Cow::Owned(header.to_ascii_lowercase())
            } else {
                header
            };
        let fields = [
            TRACEPARENT_HEADER.to_owned(),
            TRACESTATE_HEADER.to_owned(),
            correlation_header.to_string(),
        ];
        ContextPropagator {
            correlation_header,
            fields,
        }
    }

    /// The (lowercase) name of the correlation header.
    pub fn correlation_header(&self) -> &str {
        &self.correlation_header
    }

    /// Inject `cx` into an owned carrier and hand it back.
    pub fn inject_carrier<C: Injector>(&self, cx: &Context, mut carrier: C) -> C {
        self.inject_context(cx, &mut carrier);
        carrier
    }

    /// Extract a fresh context from `extractor`, ignoring whatever context is
    /// currently attached.
    pub fn extract_carrier(&self, extractor: &dyn Extractor) -> Context {
        self.extract_with_context(&Context::new(), extractor)
    }

    fn extract_trace_parent(&self, extractor: &dyn Extractor) -> Option<TraceParent> {
        let header = extractor.get(TRACEPARENT_HEADER)?;
        match header.parse::<TraceParent>() {
            Ok(trace_parent) => Some(trace_parent),
            Err(err) => {
                tracing::debug!(
                    target: "telemetry::propagation",
                    error = %err,
                    "ignoring malformed traceparent, starting a new trace"
                );
                None
            }
        }
    }

    fn extract_trace_state(&self, extractor: &dyn Extractor) -> TraceState {
        match extractor.get(TRACESTATE_HEADER) {
            Some(value) if !value.trim().is_empty() => TraceState::from_str(value.trim())
                .unwrap_or_else(|err| {
                    tracing::debug!(
                        target: "telemetry::propagation",
                        error = %err,
                        "dropping malformed tracestate"
                    );
                    TraceState::default()
                }),
            _ => TraceState::default(),
        }
    }
}

impl TextMapPropagator for ContextPropagator {
    /// Writes `traceparent` and `tracestate` for the active span of `cx`, and
    /// the correlation header when `cx` carries a correlation ID.
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span = cx.span();
        let span_context = span.span_context();
        if let Some(trace_parent) = TraceParent::from_span_context(span_context) {
            injector.set(TRACEPARENT_HEADER, trace_parent.to_string());
            let trace_state = span_context.trace_state().header();
            if !trace_state.is_empty() {
                injector.set(TRACESTATE_HEADER, trace_state);
            }
        }

        if let Some(id) = cx.correlation_id() {
            injector.set(&self.correlation_header, id.to_string());
        }
    }

    /// Continues the upstream trace when `traceparent` is valid and attaches
    /// the inbound correlation ID when it is non-blank.
    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        let mut cx = match self.extract_trace_parent(extractor) {
            Some(trace_parent) => {
                let trace_state = self.extract_trace_state(extractor);
                cx.with_remote_span_context(trace_parent.into_span_context(trace_state))
            }
            None => cx.clone(),
        };

        if let Some(id) = extractor
            .get(&self.correlation_header)
            .and_then(CorrelationId::parse)
        {
            cx = cx.with_correlation_id(id);
        }

        cx
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(&self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{
        Span as _, SpanContext, SpanId, TraceFlags, TraceId, Tracer, TracerProvider as _,
    };
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
    use rstest::rstest;
    use std::collections::HashMap;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn carrier(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn remote_context(trace_state: &str) -> Context {
        let span_context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::from_str(trace_state).unwrap(),
        );
        Context::new().with_remote_span_context(span_context)
    }

    #[test]
    fn extracts_upstream_trace_id() {
        let propagator = ContextPropagator::new();
        let cx = propagator.extract_carrier(&carrier(&[(TRACEPARENT_HEADER, TRACEPARENT)]));

        let span = cx.span();
        let span_context = span.span_context();
        assert!(span_context.is_remote());
        assert_eq!(
            span_context.trace_id().to_string(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert_eq!(span_context.span_id().to_string(), "00f067aa0ba902b7");
        assert!(span_context.is_sampled());
    }

    #[test]
    fn configured_header_is_lowercased() {
        let propagator = ContextPropagator::with_correlation_header("X-Correlation-ID");
        assert_eq!(propagator.correlation_header(), "x-correlation-id");

        let cx = propagator.extract_carrier(&carrier(&[
            (TRACEPARENT_HEADER, TRACEPARENT),
            ("x-correlation-id", "abc-123"),
        ]));
        assert!(cx.has_active_span());
        assert_eq!(cx.correlation_id().map(CorrelationId::as_str), Some("abc-123"));
    }

    #[rstest]
    #[case("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7")]
    #[case("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra")]
    #[case("00:4bf92f3577b34da6a3ce929d0e0e4736:00f067aa0ba902b7:01")]
    #[case("00-4bf92f3577b34da6a3ce929d0e0e47zz-00f067aa0ba902b7-01")]
    #[case("00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01")]
    #[case("00-00000000000000000000000000000000-00f067aa0ba902b7-01")]
    #[case("00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01")]
    #[case("")]
    fn malformed_traceparent_yields_fresh_root(#[case] header: &str) {
        let propagator = ContextPropagator::new();
        let cx = propagator.extract_carrier(&carrier(&[
            (TRACEPARENT_HEADER, header),
            (DEFAULT_CORRELATION_HEADER, "req-1"),
        ]));
        assert!(!cx.has_active_span());
        assert_eq!(cx.correlation_id().map(CorrelationId::as_str), Some("req-1"));
    }

    #[test]
    fn malformed_tracestate_keeps_traceparent() {
        let propagator = ContextPropagator::new();
        let cx = propagator.extract_carrier(&carrier(&[
            (TRACEPARENT_HEADER, TRACEPARENT),
            (TRACESTATE_HEADER, "not a valid=trace,state==="),
        ]));
        assert!(cx.has_active_span());
        assert_eq!(cx.span().span_context().trace_state().header(), "");
    }

    #[test]
    fn blank_correlation_header_is_ignored() {
        let propagator = ContextPropagator::new();
        let cx = propagator.extract_carrier(&carrier(&[(DEFAULT_CORRELATION_HEADER, "  ")]));
        assert!(cx.correlation_id().is_none());
    }

    #[test]
    fn inject_writes_all_fields() {
        let propagator = ContextPropagator::new();
        let cx = remote_context("foo=bar")
            .with_correlation_id(CorrelationId::resolve(Some("req-7")));

        let out = propagator.inject_carrier(&cx, carrier(&[("content-type", "text/plain")]));
        assert_eq!(out.get(TRACEPARENT_HEADER).map(String::as_str), Some(TRACEPARENT));
        assert_eq!(out.get(TRACESTATE_HEADER).map(String::as_str), Some("foo=bar"));
        assert_eq!(out.get(DEFAULT_CORRELATION_HEADER).map(String::as_str), Some("req-7"));
        assert_eq!(out.get("content-type").map(String::as_str), Some("text/plain"));
    }

    #[test]
    fn inject_is_idempotent() {
        let propagator = ContextPropagator::new();
        let cx = remote_context("");
        let once = propagator.inject_carrier(&cx, HashMap::new());
        let twice = propagator.inject_carrier(&cx, once.clone());
        assert_eq!(once, twice);
        assert!(!once.contains_key(TRACESTATE_HEADER));
    }

    #[test]
    fn inject_without_span_writes_no_trace_fields() {
        let propagator = ContextPropagator::new();
        let out = propagator.inject_carrier(&Context::new(), HashMap::new());
        assert!(out.is_empty());
    }

    #[test]
    fn round_trip_continues_the_trace() {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = provider.tracer("propagation-test");
        let propagator = ContextPropagator::new();

        let upstream = tracer.start("upstream");
        let upstream_cx = Context::new().with_span(upstream);
        let upstream_span_context = upstream_cx.span().span_context().clone();

        let headers = propagator.inject_carrier(&upstream_cx, HashMap::new());
        let extracted = propagator.extract_carrier(&headers);
        let downstream = tracer.start_with_context("downstream", &extracted);
        let downstream_span_context = downstream.span_context().clone();
        drop(downstream);
        upstream_cx.span().end();

        assert_eq!(
            downstream_span_context.trace_id(),
            upstream_span_context.trace_id()
        );
        assert_ne!(
            downstream_span_context.span_id(),
            upstream_span_context.span_id()
        );

        let spans = exporter.get_finished_spans().unwrap();
        let finished = spans.iter().find(|s| s.name == "downstream").unwrap();
        assert_eq!(finished.parent_span_id, upstream_span_context.span_id());
    }

    #[test]
    fn fields_lists_every_header() {
        let propagator = ContextPropagator::with_correlation_header("X-Trace-Tag");
        let fields = propagator.fields().collect::<Vec<&str>>();
        assert_eq!(fields, vec![TRACEPARENT_HEADER, TRACESTATE_HEADER, "x-trace-tag"]);
    }
}
