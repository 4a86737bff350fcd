//! Core provider abstractions for aigate.
//!
//! This crate intentionally does **not** depend on any concrete HTTP client.
//! Adapters implement [`UpstreamAdapter`]; the pool manager and app layers
//! only see the trait plus the shared credential/error model.

pub mod adapter;
pub mod credential;
pub mod errors;
pub mod registry;
pub mod retry;
pub mod types;

pub use adapter::{AdapterStream, UpstreamAdapter};
pub use credential::ProviderInstance;
pub use errors::{NetworkErrorKind, ProviderError, ProviderResult};
pub use registry::AdapterRegistry;
pub use retry::{RetryPolicy, classify_status, classify_transport};
pub use types::ProviderType;
