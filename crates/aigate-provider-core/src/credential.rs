use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::ProviderType;

/// One upstream account worth of secrets plus health state.
///
/// Instances are referenced by `uuid` everywhere else in the system; the pool
/// file and the sticky session table never hold object references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInstance {
    #[serde(default = "new_uuid")]
    pub uuid: String,
    #[serde(alias = "providerType")]
    pub provider_type: ProviderType,

    // ---- Secrets ----
    #[serde(default, alias = "accessToken", skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, alias = "refreshToken", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, alias = "clientSecret", skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, alias = "profileArn", skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(
        default,
        alias = "expiresAt",
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default, alias = "authMethod", skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    /// Path of the credential file backing this instance, when file-backed.
    #[serde(default, alias = "credsFilePath", skip_serializing_if = "Option::is_none")]
    pub creds_file_path: Option<String>,

    // ---- Health ----
    #[serde(default = "default_true", alias = "isHealthy")]
    pub is_healthy: bool,
    #[serde(default, alias = "isDisabled")]
    pub is_disabled: bool,
    #[serde(default, alias = "errorCount")]
    pub error_count: u32,
    #[serde(
        default,
        alias = "lastErrorTime",
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_error_time: Option<OffsetDateTime>,
    #[serde(default, alias = "lastErrorMessage", skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    #[serde(
        default,
        alias = "lastUsed",
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_used: Option<OffsetDateTime>,
    #[serde(default, alias = "usageCount")]
    pub usage_count: u64,
    #[serde(
        default,
        alias = "lastHealthCheckTime",
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_health_check_time: Option<OffsetDateTime>,
    #[serde(
        default,
        alias = "lastHealthCheckModel",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_health_check_model: Option<String>,

    // ---- Capability hints ----
    #[serde(default, alias = "notSupportedModels", skip_serializing_if = "HashSet::is_empty")]
    pub not_supported_models: HashSet<String>,
    #[serde(default = "default_true", alias = "checkHealth")]
    pub check_health: bool,
    #[serde(default, alias = "checkModelName", skip_serializing_if = "Option::is_none")]
    pub check_model_name: Option<String>,
    #[serde(default, alias = "customName", skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
}

fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

fn default_true() -> bool {
    true
}

impl ProviderInstance {
    pub fn new(provider_type: ProviderType) -> Self {
        Self {
            uuid: new_uuid(),
            provider_type,
            access_token: None,
            refresh_token: None,
            client_id: None,
            client_secret: None,
            region: None,
            profile_arn: None,
            expires_at: None,
            auth_method: None,
            creds_file_path: None,
            is_healthy: true,
            is_disabled: false,
            error_count: 0,
            last_error_time: None,
            last_error_message: None,
            last_used: None,
            usage_count: 0,
            last_health_check_time: None,
            last_health_check_model: None,
            not_supported_models: HashSet::new(),
            check_health: true,
            check_model_name: None,
            custom_name: None,
        }
    }

    /// LRU sort key: never-used instances sort first.
    pub fn last_used_epoch_ms(&self) -> i128 {
        self.last_used
            .map(|when| when.unix_timestamp_nanos() / 1_000_000)
            .unwrap_or(0)
    }

    pub fn supports_model(&self, model: &str) -> bool {
        !self.not_supported_models.contains(model)
    }

    /// Eligible for new traffic.
    pub fn is_selectable(&self) -> bool {
        self.is_healthy && !self.is_disabled
    }
}
