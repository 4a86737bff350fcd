use async_trait::async_trait;

use aigate_protocol::{MessagesRequest, StreamEvent};

use crate::credential::ProviderInstance;
use crate::errors::ProviderResult;
use crate::types::ProviderType;

/// Parsed events flow to the caller over a bounded channel; the adapter task
/// keeps producing until the upstream stream ends or errors.
pub type AdapterStream = tokio::sync::mpsc::Receiver<StreamEvent>;

#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn provider_type(&self) -> ProviderType;

    /// Translate and execute a chat request against the upstream.
    ///
    /// Token refresh, retry/backoff, and health signalling happen inside the
    /// adapter; only surfaced errors reach the caller.
    async fn generate(
        &self,
        instance: &ProviderInstance,
        request: MessagesRequest,
    ) -> ProviderResult<AdapterStream>;

    /// Minimal upstream call used by the health probe scheduler. Success means
    /// the credential can carry traffic again.
    async fn check_health(&self, instance: &ProviderInstance, model: &str) -> ProviderResult<()>;
}
