//! Provider dispatch for Mass Dispatch
//!
//! This crate turns a prompt into image bytes: it selects a provider, builds
//! and sends the request, interprets the provider's response shape (including
//! polling asynchronous jobs) and retries with backoff until it succeeds or
//! runs out of attempts.

pub mod dispatcher;
pub mod response;
pub mod transport;

// Re-export commonly used types
pub use dispatcher::{Dispatcher, DispatcherConfig, ImageGenerator};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
