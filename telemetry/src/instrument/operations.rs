//! Ready-made templates for common kinds of outbound work.
//!
//! Each is a [`SpanTemplate`] with the kind and attributes filled in, and
//! behaves exactly like one.
use super::SpanTemplate;
use opentelemetry::{trace::SpanKind, KeyValue};
use opentelemetry_semantic_conventions::attribute::{
    DB_COLLECTION_NAME, DB_OPERATION_NAME, HTTP_REQUEST_METHOD, MESSAGING_DESTINATION_NAME,
    MESSAGING_OPERATION_TYPE, URL_FULL,
};

/// Cache operation attribute, e.g. `get` or `set`.
pub const CACHE_OPERATION: &str = "cache.operation";
/// Cache key attribute.
pub const CACHE_KEY: &str = "cache.key";

/// A `Client` span for a database call, named `"{operation} {table}"`.
pub fn db<A: ?Sized>(operation: &str, table: &str) -> SpanTemplate<A> {
    SpanTemplate::new(format!("{operation} {table}"))
        .with_kind(SpanKind::Client)
        .with_attributes([
            KeyValue::new(DB_OPERATION_NAME, operation.to_owned()),
            KeyValue::new(DB_COLLECTION_NAME, table.to_owned()),
        ])
}

/// A `Client` span for an outbound HTTP request, named after the method.
pub fn http_client<A: ?Sized>(method: &str, url: &str) -> SpanTemplate<A> {
    let method = method.to_ascii_uppercase();
    SpanTemplate::new(method.clone())
        .with_kind(SpanKind::Client)
        .with_attributes([
            KeyValue::new(HTTP_REQUEST_METHOD, method),
            KeyValue::new(URL_FULL, url.to_owned()),
        ])
}

/// A `Client` span for a cache lookup or write, named `"cache {operation}"`.
pub fn cache<A: ?Sized>(operation: &str, key: &str) -> SpanTemplate<A> {
    SpanTemplate::new(format!("cache {operation}"))
        .with_kind(SpanKind::Client)
        .with_attributes([
            KeyValue::new(CACHE_OPERATION, operation.to_owned()),
            KeyValue::new(CACHE_KEY, key.to_owned()),
        ])
}

/// A `Producer` span for publishing to `destination`.
pub fn queue_send<A: ?Sized>(destination: &str) -> SpanTemplate<A> {
    messaging(destination, "send", SpanKind::Producer)
}

/// A `Consumer` span for a message received from `destination`.
pub fn queue_receive<A: ?Sized>(destination: &str) -> SpanTemplate<A> {
    messaging(destination, "receive", SpanKind::Consumer)
}

fn messaging<A: ?Sized>(destination: &str, operation: &'static str, kind: SpanKind) -> SpanTemplate<A> {
    SpanTemplate::new(format!("{operation} {destination}"))
        .with_kind(kind)
        .with_attributes([
            KeyValue::new(MESSAGING_DESTINATION_NAME, destination.to_owned()),
            KeyValue::new(MESSAGING_OPERATION_TYPE, operation),
        ])
}
