//! Prompt-cache estimation for the Kiro upstream.
//!
//! Kiro does not report prompt-cache usage, so the split between cache reads,
//! cache writes, and uncached input is reconstructed from the request body
//! plus a per-account history of recent requests. The estimate is optimistic
//! by default and documented as such.

mod estimator;
mod hash;
mod tokens;

pub use estimator::{AccountEstimator, CacheEstimatorRegistry, CacheSplit};
pub use hash::ToolResultStrategy;

use aigate_protocol::MessagesRequest;
use tokens::count_text_tokens;

/// Model-specific minimum cacheable prompt size; below it the upstream does
/// not cache at all.
pub(crate) fn min_cacheable_tokens(model: &str) -> u64 {
    if model.contains("opus-4-5") || model.contains("haiku-4-5") {
        4096
    } else if model.contains("haiku-3-5") || model.contains("haiku-3") {
        2048
    } else {
        // opus-4, sonnet-*, and everything unrecognised.
        1024
    }
}

/// Deterministic input-token total for a request. The upstream does not
/// report input usage either, so this total is what the estimator splits.
pub fn estimate_request_tokens(request: &MessagesRequest) -> u64 {
    let strategy = ToolResultStrategy::default();
    let static_tokens = count_text_tokens(&hash::static_prefix_projection(request));
    let message_tokens: u64 = request
        .messages
        .iter()
        .map(|message| count_text_tokens(&hash::message_projection(message, strategy)))
        .sum();
    static_tokens + message_tokens
}

pub fn count_output_tokens(text: &str) -> u64 {
    count_text_tokens(text)
}
