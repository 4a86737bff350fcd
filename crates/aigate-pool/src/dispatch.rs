use std::sync::Arc;

use tracing::warn;

use aigate_protocol::MessagesRequest;
use aigate_provider_core::{AdapterStream, ProviderError, ProviderResult, ProviderType};

use crate::pool::{FallbackSelection, ProviderPool, SelectOptions};

/// Outcome of a routed generate call: the parsed event stream plus which
/// credential actually served it.
#[derive(Debug)]
pub struct RoutedStream {
    pub events: AdapterStream,
    pub selection: FallbackSelection,
}

/// Thin request router: selects a credential (with fallback), hands the
/// request to the adapter, and translates surfaced errors into health marks.
///
/// The pool stays the only writer of health state; this is where adapter
/// failure classes become `mark_*` calls.
#[derive(Clone)]
pub struct Gateway {
    pool: Arc<ProviderPool>,
}

impl Gateway {
    pub fn new(pool: Arc<ProviderPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    pub async fn generate(
        &self,
        provider_type: ProviderType,
        mut request: MessagesRequest,
        session_id: Option<&str>,
    ) -> ProviderResult<RoutedStream> {
        let options = SelectOptions {
            session_id,
            ..Default::default()
        };
        let selection = self
            .pool
            .select_provider_with_fallback(provider_type, Some(&request.model), options)
            .await
            .ok_or_else(|| {
                ProviderError::PoolExhausted(format!(
                    "no healthy credential for {provider_type} (model {})",
                    request.model
                ))
            })?;

        if let Some(actual_model) = &selection.actual_model {
            request.model = actual_model.clone();
        }

        let adapter = self
            .pool
            .registry()
            .get(selection.actual_provider_type)
            .ok_or_else(|| {
                ProviderError::LocalConfig(format!(
                    "no adapter registered for {}",
                    selection.actual_provider_type
                ))
            })?;

        match adapter.generate(&selection.instance, request).await {
            Ok(events) => Ok(RoutedStream { events, selection }),
            Err(err) => {
                self.record_failure(&selection, &err).await;
                Err(err)
            }
        }
    }

    async fn record_failure(&self, selection: &FallbackSelection, err: &ProviderError) {
        let provider_type = selection.actual_provider_type;
        let uuid = &selection.instance.uuid;
        match err {
            // Auth-fatal failures kill the credential at once. A surfaced
            // TokenExpired means the adapter already burned its one
            // refresh+retry, so it is equivalent here.
            ProviderError::AuthFatal(_) | ProviderError::TokenExpired(_) => {
                self.pool
                    .mark_provider_unhealthy_immediately(provider_type, uuid, Some(&err.reason()))
                    .await;
            }
            // Transient classes surfaced here exhausted the adapter's retry
            // ladder; count them through the error window.
            ProviderError::Throttled(_)
            | ProviderError::UpstreamServer { .. }
            | ProviderError::Network { .. } => {
                self.pool
                    .mark_provider_unhealthy(provider_type, uuid, Some(&err.reason()))
                    .await;
            }
            // Malformed frames and local config problems are not credential
            // signals.
            ProviderError::UpstreamMalformed(_)
            | ProviderError::LocalConfig(_)
            | ProviderError::PoolExhausted(_)
            | ProviderError::Other(_) => {
                warn!(
                    provider = %provider_type,
                    uuid = %uuid,
                    error = %err,
                    "request failed without health signal"
                );
            }
        }
    }
}
