//! HTTP integration for the `telemetry` crate.
//!
//! - [`carrier`]: [`http::HeaderMap`] injectors and extractors.
//! - [`middleware`]: a tower layer that starts a server span per request,
//!   resolves the correlation ID and echoes it in the response.
//! - [`client`]: propagation onto outgoing requests.
//! - [`endpoints`]: liveness, readiness and metrics responses.
//!
//! ```
//! use telemetry_http::middleware::CorrelationLayer;
//! use tower::Layer;
//!
//! # let handler = tower::service_fn(|_req: http::Request<()>| async {
//! #     Ok::<_, std::convert::Infallible>(http::Response::new(()))
//! # });
//! let service = CorrelationLayer::new().layer(handler);
//! # let _ = service;
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod carrier;
pub mod client;
pub mod endpoints;
pub mod middleware;

pub use carrier::{HeaderExtractor, HeaderInjector};
pub use middleware::{CorrelationLayer, CorrelationService, MatchedRoute, RequestContext};
