//! Provider management for Mass Dispatch
//!
//! This crate holds the provider catalog, the per-provider usage ledgers and
//! credential pools, quota-aware selection, and the typed request builders
//! for each provider variant.

mod clock;
mod credentials;
mod registry;
mod request;
mod selector;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::CredentialPool;
pub use registry::{ProviderRegistry, QuotaReservation};
pub use request::ProviderRequest;
