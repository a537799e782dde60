//! The request middleware pipeline.
//!
//! A middleware wraps the downstream handler and may short-circuit by
//! returning `Err(ProxyError)`; the error type decides the response shape, not
//! the middleware. Composition happens in `server::build_router`, where layer
//! order is explicit and significant:
//!
//! ```text
//! access log → context resolver → JWT parse → RS256 / OIDC → proxy handler
//! ```
//!
//! Request-scoped state travels in a [`crate::proxy::RequestContext`] struct
//! in the request extensions and is mirrored into the response extensions so
//! the outermost logger can label its output.

pub mod logging;

pub use logging::access_log;
