//! Kiro (CodeWhisperer) upstream adapter.
//!
//! The hard parts live here: the OAuth refresh state machine, translation of
//! Anthropic-shaped requests into the Kiro wire format, the framed
//! event-stream parser, the thinking-tag splitter, bracketed tool-call
//! recovery, and the per-account prompt-cache estimator that reconstructs
//! cache usage the upstream does not report.

mod adapter;
mod auth;
pub mod cache;
mod request;
mod stream;
mod thinking;
mod tools;
mod usage;

use std::path::PathBuf;
use std::time::Duration;

use aigate_provider_core::RetryPolicy;

pub use adapter::KiroAdapter;
pub use cache::{CacheEstimatorRegistry, CacheSplit, ToolResultStrategy};
pub use usage::UsageLimits;

pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone)]
pub struct KiroConfig {
    /// Primary credential file (`kiro-auth-token.json` by convention).
    pub creds_file_path: Option<PathBuf>,
    /// Base64-encoded credential bundle, lowest-precedence layer.
    pub base64_creds: Option<String>,
    /// Region override; otherwise the credential file decides, then the default.
    pub region: Option<String>,
    pub retry: RetryPolicy,
    /// Refresh the token when it expires within this many minutes.
    pub near_minutes: i64,
    pub request_timeout: Duration,
    pub outbound_proxy: Option<String>,
    /// When false the client bypasses the system proxy configuration.
    pub use_system_proxy: bool,
    pub optimistic_cache: bool,
    pub cache_debug: bool,
}

impl Default for KiroConfig {
    fn default() -> Self {
        Self {
            creds_file_path: None,
            base64_creds: None,
            region: None,
            retry: RetryPolicy::default(),
            near_minutes: 10,
            request_timeout: Duration::from_secs(120),
            outbound_proxy: None,
            use_system_proxy: true,
            optimistic_cache: true,
            cache_debug: false,
        }
    }
}
