//! # Span wrapping
//!
//! A [`SpanTemplate`] describes the span to create for a call: its name, kind
//! and attributes. Wrapping a function with it turns every call into a span.
//!
//! ```
//! use opentelemetry::trace::SpanKind;
//! use telemetry::instrument::SpanTemplate;
//!
//! let find_user = SpanTemplate::new("find_user")
//!     .with_kind(SpanKind::Internal)
//!     .with_derived_attributes(|id: &u64| vec![opentelemetry::KeyValue::new("user.id", *id as i64)])
//!     .wrap(|id: u64| -> Result<String, std::fmt::Error> { Ok(format!("user-{id}")) });
//!
//! assert_eq!(find_user.call(7).unwrap(), "user-7");
//! ```
//!
//! Every call:
//!
//! - starts a span as a child of the current context's active span, or a root
//!   span when there is none;
//! - runs the wrapped function with the new span as the current context, so
//!   nested wrapped calls become children;
//! - sets status `Ok` on success, or records an `exception` event and sets an
//!   error status on failure;
//! - returns the result unchanged;
//! - ends the span exactly once, including on panic and, for async calls, when
//!   the future is dropped early.
use crate::correlation::{CorrelationContextExt, CORRELATION_ID_ATTRIBUTE};
use crate::trace::TracerSource;
use opentelemetry::{
    trace::{SpanBuilder, SpanKind},
    Context, KeyValue,
};
use pin_project_lite::pin_project;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

mod guard;
pub mod operations;
mod service;

use guard::SpanGuard;
pub use guard::{
    record_exception, RecordDebug, RecordResult, RecordWith, Unrecorded, RESULT_ATTRIBUTE,
};
pub use service::{ServiceTracer, CODE_NAMESPACE};

type NameFn<A> = dyn Fn(&A) -> String + Send + Sync;
type AttributesFn<A> = dyn Fn(&A) -> Vec<KeyValue> + Send + Sync;

enum SpanName<A: ?Sized> {
    Static(Cow<'static, str>),
    Derived(Arc<NameFn<A>>),
}

impl<A: ?Sized> Clone for SpanName<A> {
    fn clone(&self) -> Self {
        match self {
            SpanName::Static(name) => SpanName::Static(name.clone()),
            SpanName::Derived(f) => SpanName::Derived(Arc::clone(f)),
        }
    }
}

/// Static description of the span created for each wrapped call taking
/// arguments of type `A`.
pub struct SpanTemplate<A: ?Sized> {
    name: SpanName<A>,
    kind: SpanKind,
    attributes: Vec<KeyValue>,
    derived_attributes: Option<Arc<AttributesFn<A>>>,
    tracer: TracerSource,
}

impl<A: ?Sized> Clone for SpanTemplate<A> {
    fn clone(&self) -> Self {
        SpanTemplate {
            name: self.name.clone(),
            kind: self.kind.clone(),
            attributes: self.attributes.clone(),
            derived_attributes: self.derived_attributes.clone(),
            tracer: self.tracer.clone(),
        }
    }
}

impl<A: ?Sized> fmt::Debug for SpanTemplate<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.name {
            SpanName::Static(name) => name.as_ref(),
            SpanName::Derived(_) => "<derived>",
        };
        f.debug_struct("SpanTemplate")
            .field("name", &name)
            .field("kind", &self.kind)
            .field("attributes", &self.attributes)
            .field("tracer", &self.tracer)
            .finish()
    }
}

impl<A: ?Sized> SpanTemplate<A> {
    /// A template for `Internal` spans with a fixed name.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        SpanTemplate {
            name: SpanName::Static(name.into()),
            kind: SpanKind::Internal,
            attributes: Vec::new(),
            derived_attributes: None,
            tracer: TracerSource::default(),
        }
    }

    /// A template whose span name is computed from each call's arguments.
    pub fn named_by<F>(name: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        SpanTemplate {
            name: SpanName::Derived(Arc::new(name)),
            ..SpanTemplate::new("")
        }
    }

    /// Set the span kind.
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add an attribute set on every span.
    pub fn with_attribute(mut self, attribute: KeyValue) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Add attributes set on every span.
    pub fn with_attributes<I>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = KeyValue>,
    {
        self.attributes.extend(attributes);
        self
    }

    /// Compute extra attributes from each call's arguments.
    pub fn with_derived_attributes<F>(mut self, attributes: F) -> Self
    where
        F: Fn(&A) -> Vec<KeyValue> + Send + Sync + 'static,
    {
        self.derived_attributes = Some(Arc::new(attributes));
        self
    }

    /// Start spans with `tracer` instead of the global `telemetry` tracer.
    pub fn with_tracer(mut self, tracer: TracerSource) -> Self {
        self.tracer = tracer;
        self
    }

    /// The span kind of this template.
    pub fn kind(&self) -> &SpanKind {
        &self.kind
    }

    /// The static attributes of this template.
    pub fn attributes(&self) -> &[KeyValue] {
        &self.attributes
    }

    /// Start a span for a call with `args` as a child of `parent`, returning
    /// `parent` extended with the new span.
    pub fn start_with_context(&self, args: &A, parent: &Context) -> Context {
        let name: Cow<'static, str> = match &self.name {
            SpanName::Static(name) => name.clone(),
            SpanName::Derived(f) => f(args).into(),
        };

        let mut attributes = self.attributes.clone();
        if let Some(derive) = &self.derived_attributes {
            attributes.extend(derive(args));
        }
        if let Some(id) = parent.correlation_id() {
            attributes.push(KeyValue::new(CORRELATION_ID_ATTRIBUTE, id.clone()));
        }

        let builder = SpanBuilder::from_name(name)
            .with_kind(self.kind.clone())
            .with_attributes(attributes);
        self.tracer.start(builder, parent)
    }

    /// Start a span for a call with `args` under the current context.
    pub fn start(&self, args: &A) -> Context {
        Context::map_current(|parent| self.start_with_context(args, parent))
    }

    /// Run `fut` inside a span for a call with `args`.
    pub fn instrument<Fut, T, E>(&self, args: &A, fut: Fut) -> TracedFuture<Fut>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        TracedFuture::new(self.start(args), fut, Unrecorded)
    }
}

impl<A> SpanTemplate<A> {
    /// Wrap a synchronous function.
    pub fn wrap<F, T, E>(self, f: F) -> Traced<A, F>
    where
        F: Fn(A) -> Result<T, E>,
    {
        Traced {
            template: self,
            f,
            recorder: Unrecorded,
        }
    }

    /// Wrap a function returning a future.
    pub fn wrap_async<F, Fut, T, E>(self, f: F) -> TracedAsync<A, F>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        TracedAsync {
            template: self,
            f,
            recorder: Unrecorded,
        }
    }
}

/// A synchronous function whose calls are each recorded as a span.
pub struct Traced<A, F, R = Unrecorded> {
    template: SpanTemplate<A>,
    f: F,
    recorder: R,
}

impl<A, F, R> Traced<A, F, R> {
    /// The template used for each call.
    pub fn template(&self) -> &SpanTemplate<A> {
        &self.template
    }

    /// Record the `Debug` form of successful results as the `result`
    /// attribute.
    pub fn record_result(self) -> Traced<A, F, RecordDebug> {
        self.with_recorder(RecordDebug)
    }

    /// Record successful results as the `result` attribute, rendered by
    /// `render`.
    pub fn record_result_with<G>(self, render: G) -> Traced<A, F, RecordWith<G>> {
        self.with_recorder(RecordWith(render))
    }

    fn with_recorder<R2>(self, recorder: R2) -> Traced<A, F, R2> {
        Traced {
            template: self.template,
            f: self.f,
            recorder,
        }
    }

    /// Call the wrapped function inside a new span.
    pub fn call<T, E>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Result<T, E>,
        E: fmt::Display,
        R: RecordResult<T>,
    {
        let cx = self.template.start(&args);
        let mut guard = SpanGuard::new(cx.clone());
        guard.enter();
        let result = {
            let _attached = cx.attach();
            (self.f)(args)
        };
        guard.exit();
        guard.finish(&result, &self.recorder);
        result
    }
}

impl<A, F, R> Clone for Traced<A, F, R>
where
    F: Clone,
    R: Clone,
{
    fn clone(&self) -> Self {
        Traced {
            template: self.template.clone(),
            f: self.f.clone(),
            recorder: self.recorder.clone(),
        }
    }
}

impl<A, F, R> fmt::Debug for Traced<A, F, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Traced")
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

/// An async function whose calls are each recorded as a span.
pub struct TracedAsync<A, F, R = Unrecorded> {
    template: SpanTemplate<A>,
    f: F,
    recorder: R,
}

impl<A, F, R> TracedAsync<A, F, R> {
    /// The template used for each call.
    pub fn template(&self) -> &SpanTemplate<A> {
        &self.template
    }

    /// Record the `Debug` form of successful results as the `result`
    /// attribute.
    pub fn record_result(self) -> TracedAsync<A, F, RecordDebug> {
        self.with_recorder(RecordDebug)
    }

    /// Record successful results as the `result` attribute, rendered by
    /// `render`.
    pub fn record_result_with<G>(self, render: G) -> TracedAsync<A, F, RecordWith<G>> {
        self.with_recorder(RecordWith(render))
    }

    fn with_recorder<R2>(self, recorder: R2) -> TracedAsync<A, F, R2> {
        TracedAsync {
            template: self.template,
            f: self.f,
            recorder,
        }
    }

    /// Call the wrapped function. The span starts now and ends when the
    /// returned future completes or is dropped.
    pub fn call<Fut, T, E>(&self, args: A) -> TracedFuture<Fut, R>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        R: RecordResult<T> + Clone,
    {
        let cx = self.template.start(&args);
        let fut = {
            let _attached = cx.clone().attach();
            (self.f)(args)
        };
        TracedFuture::new(cx, fut, self.recorder.clone())
    }
}

impl<A, F, R> Clone for TracedAsync<A, F, R>
where
    F: Clone,
    R: Clone,
{
    fn clone(&self) -> Self {
        TracedAsync {
            template: self.template.clone(),
            f: self.f.clone(),
            recorder: self.recorder.clone(),
        }
    }
}

impl<A, F, R> fmt::Debug for TracedAsync<A, F, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedAsync")
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

pin_project! {
    /// A future running inside a span, with the span's context attached on
    /// every poll.
    #[derive(Debug)]
    #[must_use = "futures do nothing unless polled"]
    pub struct TracedFuture<Fut, R = Unrecorded> {
        #[pin]
        inner: Fut,
        cx: Context,
        guard: Option<SpanGuard>,
        recorder: R,
    }
}

impl<Fut, R> TracedFuture<Fut, R> {
    fn new(cx: Context, inner: Fut, recorder: R) -> Self {
        TracedFuture {
            inner,
            guard: Some(SpanGuard::new(cx.clone())),
            cx,
            recorder,
        }
    }

    /// The context holding this call's span.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Record the `Debug` form of the successful result as the `result`
    /// attribute.
    pub fn record_result(self) -> TracedFuture<Fut, RecordDebug> {
        self.with_recorder(RecordDebug)
    }

    /// Record the successful result as the `result` attribute, rendered by
    /// `render`.
    pub fn record_result_with<G>(self, render: G) -> TracedFuture<Fut, RecordWith<G>> {
        self.with_recorder(RecordWith(render))
    }

    fn with_recorder<R2>(self, recorder: R2) -> TracedFuture<Fut, R2> {
        TracedFuture {
            inner: self.inner,
            cx: self.cx,
            guard: self.guard,
            recorder,
        }
    }
}

impl<Fut, R, T, E> Future for TracedFuture<Fut, R>
where
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    R: RecordResult<T>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _attached = this.cx.clone().attach();

        if let Some(guard) = this.guard.as_mut() {
            guard.enter();
        }
        let result = match this.inner.poll(task_cx) {
            Poll::Ready(result) => result,
            Poll::Pending => {
                if let Some(guard) = this.guard.as_mut() {
                    guard.exit();
                }
                return Poll::Pending;
            }
        };

        if let Some(mut guard) = this.guard.take() {
            guard.exit();
            guard.finish(&result, &*this.recorder);
        }
        Poll::Ready(result)
    }
}
