use opentelemetry::{
    trace::{SpanRef, Status, TraceContextExt},
    Context, KeyValue,
};
use opentelemetry_semantic_conventions::attribute::{ERROR_TYPE, EXCEPTION_MESSAGE, EXCEPTION_TYPE};
use std::fmt;

/// Attribute holding the rendering of a successful result.
pub const RESULT_ATTRIBUTE: &str = "result";

/// Renders a successful value for the [`RESULT_ATTRIBUTE`] attribute, or
/// returns `None` to leave it off the span.
pub trait RecordResult<T> {
    /// Render `value`.
    fn render(&self, value: &T) -> Option<String>;
}

/// Leaves results off the span. The default for every wrapped call.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unrecorded;

impl<T> RecordResult<T> for Unrecorded {
    fn render(&self, _value: &T) -> Option<String> {
        None
    }
}

/// Records the `Debug` form of results.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordDebug;

impl<T: fmt::Debug> RecordResult<T> for RecordDebug {
    fn render(&self, value: &T) -> Option<String> {
        Some(format!("{value:?}"))
    }
}

/// Records results with a caller supplied function.
#[derive(Clone, Copy)]
pub struct RecordWith<G>(pub G);

impl<G> fmt::Debug for RecordWith<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecordWith(..)")
    }
}

impl<T, G> RecordResult<T> for RecordWith<G>
where
    G: Fn(&T) -> String,
{
    fn render(&self, value: &T) -> Option<String> {
        Some((self.0)(value))
    }
}

pub(crate) const PANICKED: &str = "panicked";
pub(crate) const CANCELLED: &str = "cancelled";

/// Ends the span held in a context exactly once.
///
/// Dropping an unfinished guard ends the span with an error status: `panicked`
/// when the drop happens while the wrapped code was running, `cancelled`
/// otherwise.
#[derive(Debug)]
pub(crate) struct SpanGuard {
    cx: Option<Context>,
    running: bool,
}

impl SpanGuard {
    pub(crate) fn new(cx: Context) -> Self {
        SpanGuard {
            cx: Some(cx),
            running: false,
        }
    }

    /// Mark the start of a section that runs wrapped code.
    pub(crate) fn enter(&mut self) {
        self.running = true;
    }

    /// Mark the end of a section started with [`SpanGuard::enter`].
    pub(crate) fn exit(&mut self) {
        self.running = false;
    }

    pub(crate) fn finish<T, E, R>(mut self, result: &Result<T, E>, recorder: &R)
    where
        E: fmt::Display,
        R: RecordResult<T>,
    {
        if let Some(cx) = self.cx.take() {
            let span = cx.span();
            match result {
                Ok(value) => {
                    if let Some(rendered) = recorder.render(value) {
                        span.set_attribute(KeyValue::new(RESULT_ATTRIBUTE, rendered));
                    }
                    span.set_status(Status::Ok);
                }
                Err(err) => record_exception(&span, err),
            }
            span.end();
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(cx) = self.cx.take() {
            let reason = if self.running || std::thread::panicking() {
                PANICKED
            } else {
                CANCELLED
            };
            let span = cx.span();
            span.set_attribute(KeyValue::new(ERROR_TYPE, reason));
            span.set_status(Status::error(reason));
            span.end();
        }
    }
}

/// Record `err` on `span` as an `exception` event and set the span status to
/// an error carrying its message.
pub fn record_exception<E: fmt::Display + ?Sized>(span: &SpanRef<'_>, err: &E) {
    let message = err.to_string();
    let error_type = short_type_name::<E>();
    span.add_event(
        "exception",
        vec![
            KeyValue::new(EXCEPTION_MESSAGE, message.clone()),
            KeyValue::new(EXCEPTION_TYPE, error_type),
        ],
    );
    span.set_attribute(KeyValue::new(ERROR_TYPE, error_type));
    span.set_status(Status::error(message));
}

// `std::any::type_name` returns the full path, keep the last segment of the
// outer type only, e.g. `std::io::error::Error` -> `Error`.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let outer = full.split('<').next().unwrap_or(full);
    outer.rsplit("::").next().unwrap_or(outer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct LookupError;

    #[test]
    fn short_type_names() {
        assert_eq!(short_type_name::<std::io::Error>(), "Error");
        assert_eq!(short_type_name::<LookupError>(), "LookupError");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
        assert_eq!(short_type_name::<str>(), "str");
    }
}
