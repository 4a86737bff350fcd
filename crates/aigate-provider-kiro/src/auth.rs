use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use tracing::{info, warn};

use aigate_provider_core::{ProviderError, ProviderInstance, ProviderResult};
use aigate_store::{CredentialStore, TokenUpdate};

use crate::{DEFAULT_REGION, KiroConfig};

pub(crate) struct KiroUrls {
    pub refresh_social: String,
    pub refresh_idc: String,
    pub generate: String,
    pub generate_amazonq: String,
    pub usage_limits: String,
}

pub(crate) fn urls_for_region(region: &str) -> KiroUrls {
    KiroUrls {
        refresh_social: format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken"),
        refresh_idc: format!("https://oidc.{region}.amazonaws.com/token"),
        generate: format!("https://q.{region}.amazonaws.com/generateAssistantResponse"),
        generate_amazonq: format!("https://codewhisperer.{region}.amazonaws.com/SendMessageStreaming"),
        usage_limits: format!("https://q.{region}.amazonaws.com/getUsageLimits"),
    }
}

/// Anti-abuse fingerprint embedded in outbound user agents: one stable id per
/// credential so the upstream sees distinct clients.
pub(crate) fn machine_id(instance: &ProviderInstance) -> String {
    let seed = if !instance.uuid.is_empty() {
        instance.uuid.clone()
    } else if let Some(profile_arn) = instance.profile_arn.clone().filter(|s| !s.is_empty()) {
        profile_arn
    } else if let Some(client_id) = instance.client_id.clone().filter(|s| !s.is_empty()) {
        client_id
    } else {
        "kiro".to_string()
    };
    let digest = Sha256::digest(seed.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    auth_method: String,
    profile_arn: Option<String>,
    expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(default, alias = "expiresAt")]
    expires_at: Option<String>,
    #[serde(default, alias = "expiresIn", alias = "expires_in")]
    expires_in: Option<i64>,
    #[serde(default, alias = "profileArn")]
    profile_arn: Option<String>,
}

/// Per-credential token lifecycle. The state mutex single-flights refreshes:
/// concurrent requests near expiry trigger exactly one upstream refresh.
pub(crate) struct KiroAuth {
    store: Option<CredentialStore>,
    region: String,
    near: Duration,
    profile_arn_hint: Option<String>,
    state: Mutex<TokenState>,
    client: wreq::Client,
}

impl KiroAuth {
    /// Build auth for one pool instance. Inline instance tokens seed the
    /// state; a credential file (with sibling merge) overrides them.
    pub(crate) async fn for_instance(
        config: &KiroConfig,
        client: wreq::Client,
        instance: &ProviderInstance,
    ) -> ProviderResult<Arc<Self>> {
        let path = instance
            .creds_file_path
            .clone()
            .map(std::path::PathBuf::from)
            .or_else(|| config.creds_file_path.clone());
        let store = path.map(CredentialStore::new);

        let mut state = TokenState {
            access_token: instance.access_token.clone(),
            refresh_token: instance.refresh_token.clone(),
            client_id: instance.client_id.clone(),
            client_secret: instance.client_secret.clone(),
            auth_method: instance
                .auth_method
                .clone()
                .unwrap_or_else(|| "social".to_string()),
            profile_arn: instance.profile_arn.clone(),
            expires_at: instance.expires_at,
        };
        let mut region = instance.region.clone();

        if let Some(store) = &store {
            let store = store.clone();
            let bundle = config.base64_creds.clone();
            let merged = tokio::task::spawn_blocking(move || store.load(bundle.as_deref()))
                .await
                .map_err(|err| ProviderError::Other(err.to_string()))?
                .map_err(|err| ProviderError::LocalConfig(err.to_string()))?;
            apply_credential_file(&mut state, &mut region, &merged);
        }

        if state.access_token.is_none() && state.refresh_token.is_none() {
            return Err(ProviderError::LocalConfig(
                "kiro credential has neither access token nor refresh token".to_string(),
            ));
        }

        let region = config
            .region
            .clone()
            .or(region)
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        Ok(Arc::new(Self {
            store,
            region,
            near: Duration::from_secs((config.near_minutes.max(0) as u64) * 60),
            profile_arn_hint: instance.profile_arn.clone(),
            state: Mutex::new(state),
            client,
        }))
    }

    pub(crate) fn region(&self) -> &str {
        &self.region
    }

    pub(crate) async fn profile_arn(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.profile_arn.clone().or(self.profile_arn_hint.clone())
    }

    /// Current access token, proactively refreshed when near expiry.
    pub(crate) async fn access_token(&self) -> ProviderResult<String> {
        let mut state = self.state.lock().await;
        let near_expiry = match (&state.access_token, state.expires_at) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => {
                expires_at - OffsetDateTime::now_utc() <= self.near
            }
            (Some(_), None) => false,
        };
        if near_expiry {
            self.refresh_locked(&mut state).await?;
        }
        state
            .access_token
            .clone()
            .ok_or_else(|| ProviderError::LocalConfig("no access token after refresh".to_string()))
    }

    /// Unconditional refresh, used for the single 401 retry.
    pub(crate) async fn force_refresh(&self) -> ProviderResult<String> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await?;
        state
            .access_token
            .clone()
            .ok_or_else(|| ProviderError::LocalConfig("no access token after refresh".to_string()))
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> ProviderResult<()> {
        let Some(refresh_token) = state.refresh_token.clone() else {
            return Err(ProviderError::AuthFatal(
                "token expired and no refresh token available".to_string(),
            ));
        };
        let urls = urls_for_region(&self.region);

        let (url, payload) = if state.auth_method.eq_ignore_ascii_case("idc") {
            let client_id = state.client_id.clone().ok_or_else(|| {
                ProviderError::LocalConfig("idc auth requires clientId".to_string())
            })?;
            let client_secret = state.client_secret.clone().ok_or_else(|| {
                ProviderError::LocalConfig("idc auth requires clientSecret".to_string())
            })?;
            (
                urls.refresh_idc,
                serde_json::json!({
                    "clientId": client_id,
                    "clientSecret": client_secret,
                    "refreshToken": refresh_token,
                    "grantType": "refresh_token",
                }),
            )
        } else {
            (
                urls.refresh_social,
                serde_json::json!({ "refreshToken": refresh_token }),
            )
        };

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::AuthFatal(format!("token refresh failed: {err}")))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ProviderError::AuthFatal(format!("token refresh failed: {err}")))?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(ProviderError::AuthFatal(format!(
                "token refresh failed: {} {}",
                status.as_u16(),
                text
            )));
        }
        let parsed: RefreshResponse = serde_json::from_slice(&bytes)
            .map_err(|err| ProviderError::AuthFatal(format!("token refresh failed: {err}")))?;

        let expires_at = resolve_expires_at(&parsed);
        state.access_token = Some(parsed.access_token.clone());
        if let Some(refreshed) = parsed.refresh_token.clone() {
            state.refresh_token = Some(refreshed);
        }
        if let Some(profile_arn) = parsed.profile_arn.clone() {
            state.profile_arn = Some(profile_arn);
        }
        state.expires_at = expires_at;
        info!(region = %self.region, "kiro access token refreshed");

        if let Some(store) = &self.store
            && let Some(expires_at) = expires_at
        {
            let update = TokenUpdate {
                access_token: parsed.access_token,
                refresh_token: state.refresh_token.clone().unwrap_or(refresh_token),
                expires_at,
                profile_arn: state.profile_arn.clone(),
            };
            let store = store.clone();
            let persisted =
                tokio::task::spawn_blocking(move || store.persist_refresh(&update)).await;
            match persisted {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "failed to persist refreshed kiro tokens"),
                Err(err) => warn!(error = %err, "token persist task panicked"),
            }
        }
        Ok(())
    }
}

fn resolve_expires_at(parsed: &RefreshResponse) -> Option<OffsetDateTime> {
    if let Some(raw) = &parsed.expires_at
        && let Ok(when) = OffsetDateTime::parse(raw, &Rfc3339)
    {
        return Some(when);
    }
    parsed
        .expires_in
        .map(|secs| OffsetDateTime::now_utc() + Duration::from_secs(secs.max(0) as u64))
}

fn apply_credential_file(
    state: &mut TokenState,
    region: &mut Option<String>,
    merged: &Map<String, Value>,
) {
    if let Some(value) = string_field(merged, "accessToken") {
        state.access_token = Some(value);
    }
    if let Some(value) = string_field(merged, "refreshToken") {
        state.refresh_token = Some(value);
    }
    if let Some(value) = string_field(merged, "clientId") {
        state.client_id = Some(value);
    }
    if let Some(value) = string_field(merged, "clientSecret") {
        state.client_secret = Some(value);
    }
    if let Some(value) = string_field(merged, "authMethod") {
        state.auth_method = value;
    }
    if let Some(value) = string_field(merged, "profileArn") {
        state.profile_arn = Some(value);
    }
    if let Some(value) = string_field(merged, "region") {
        *region = Some(value);
    }
    if let Some(raw) = string_field(merged, "expiresAt")
        && let Ok(when) = OffsetDateTime::parse(&raw, &Rfc3339)
    {
        state.expires_at = Some(when);
    }
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(|value| value.as_str())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
