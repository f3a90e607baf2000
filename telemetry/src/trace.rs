//! Where spans come from.
use opentelemetry::{
    global,
    trace::{SpanBuilder, TraceContextExt, Tracer},
    Context,
};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Instrumentation scope used when no tracer name is given.
pub const DEFAULT_TRACER_NAME: &str = "telemetry";

trait StartSpan: Send + Sync {
    fn start_span(&self, builder: SpanBuilder, parent: &Context) -> Context;
}

impl<T> StartSpan for T
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    fn start_span(&self, builder: SpanBuilder, parent: &Context) -> Context {
        let span = self.build_with_context(builder, parent);
        parent.with_span(span)
    }
}

#[derive(Clone)]
enum Source {
    Global(Cow<'static, str>),
    Tracer(Arc<dyn StartSpan>),
}

/// A cheap to clone, type-erased handle that starts spans.
///
/// [`TracerSource::global`] looks the tracer up on every span start, so a
/// provider installed after the handle was created is still used.
/// [`TracerSource::from_tracer`] pins a concrete tracer, typically one built
/// from a test provider.
#[derive(Clone)]
pub struct TracerSource {
    source: Source,
}

impl TracerSource {
    /// Resolve the tracer named `name` from the global provider on each use.
    pub fn global(name: impl Into<Cow<'static, str>>) -> Self {
        TracerSource {
            source: Source::Global(name.into()),
        }
    }

    /// Always start spans with `tracer`.
    pub fn from_tracer<T>(tracer: T) -> Self
    where
        T: Tracer + Send + Sync + 'static,
        T::Span: Send + Sync + 'static,
    {
        TracerSource {
            source: Source::Tracer(Arc::new(tracer)),
        }
    }

    /// Start a span described by `builder` as a child of `parent`, returning
    /// `parent` extended with the new span.
    pub fn start(&self, builder: SpanBuilder, parent: &Context) -> Context {
        match &self.source {
            Source::Global(name) => global::tracer(name.clone()).start_span(builder, parent),
            Source::Tracer(tracer) => tracer.start_span(builder, parent),
        }
    }
}

impl Default for TracerSource {
    fn default() -> Self {
        TracerSource::global(DEFAULT_TRACER_NAME)
    }
}

impl fmt::Debug for TracerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Source::Global(name) => f.debug_tuple("TracerSource::Global").field(name).finish(),
            Source::Tracer(_) => f.write_str("TracerSource::Tracer"),
        }
    }
}
