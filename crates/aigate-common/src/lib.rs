use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Cross-protocol redirection target for a single model name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFallbackTarget {
    #[serde(alias = "targetProviderType")]
    pub provider_type: String,
    #[serde(alias = "targetModel")]
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickySessionSettings {
    pub enabled: bool,
    /// Idle lifetime of a binding, milliseconds since last access.
    pub ttl_ms: u64,
    pub cleanup_interval_ms: u64,
    pub max_sessions: usize,
}

impl Default for StickySessionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 30 * 60 * 1000,
            cleanup_interval_ms: 5 * 60 * 1000,
            max_sessions: 1000,
        }
    }
}

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub health_check_interval_ms: u64,
    pub max_error_count: u32,
    pub save_debounce_ms: u64,
    pub sticky_sessions: StickySessionSettings,
    /// Same-protocol peer chains, keyed by provider type tag.
    pub provider_fallback_chain: HashMap<String, Vec<String>>,
    /// Cross-protocol redirections, keyed by model name.
    pub model_fallback_mapping: HashMap<String, ModelFallbackTarget>,
    pub request_max_retries: u32,
    pub request_base_delay_ms: u64,
    /// Refresh tokens this many minutes before expiry.
    pub cron_near_minutes: i64,
    /// Per-protocol system proxy toggles, keyed by protocol prefix.
    pub use_system_proxy: HashMap<String, bool>,
    pub kiro_optimistic_cache: bool,
    pub kiro_cache_debug: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 5 * 60 * 1000,
            max_error_count: 3,
            save_debounce_ms: 1000,
            sticky_sessions: StickySessionSettings::default(),
            provider_fallback_chain: HashMap::new(),
            model_fallback_mapping: HashMap::new(),
            request_max_retries: 3,
            request_base_delay_ms: 1000,
            cron_near_minutes: 10,
            use_system_proxy: HashMap::new(),
            kiro_optimistic_cache: true,
            kiro_cache_debug: false,
        }
    }
}

/// Optional layer used when merging settings from CLI/env.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewaySettingsPatch {
    pub health_check_interval_ms: Option<u64>,
    pub max_error_count: Option<u32>,
    pub save_debounce_ms: Option<u64>,
    pub sticky_sessions: Option<StickySessionSettings>,
    pub provider_fallback_chain: Option<HashMap<String, Vec<String>>>,
    pub model_fallback_mapping: Option<HashMap<String, ModelFallbackTarget>>,
    pub request_max_retries: Option<u32>,
    pub request_base_delay_ms: Option<u64>,
    pub cron_near_minutes: Option<i64>,
    pub use_system_proxy: Option<HashMap<String, bool>>,
    pub kiro_optimistic_cache: Option<bool>,
    pub kiro_cache_debug: Option<bool>,
}

impl GatewaySettingsPatch {
    pub fn overlay(&mut self, other: GatewaySettingsPatch) {
        if other.health_check_interval_ms.is_some() {
            self.health_check_interval_ms = other.health_check_interval_ms;
        }
        if other.max_error_count.is_some() {
            self.max_error_count = other.max_error_count;
        }
        if other.save_debounce_ms.is_some() {
            self.save_debounce_ms = other.save_debounce_ms;
        }
        if other.sticky_sessions.is_some() {
            self.sticky_sessions = other.sticky_sessions;
        }
        if other.provider_fallback_chain.is_some() {
            self.provider_fallback_chain = other.provider_fallback_chain;
        }
        if other.model_fallback_mapping.is_some() {
            self.model_fallback_mapping = other.model_fallback_mapping;
        }
        if other.request_max_retries.is_some() {
            self.request_max_retries = other.request_max_retries;
        }
        if other.request_base_delay_ms.is_some() {
            self.request_base_delay_ms = other.request_base_delay_ms;
        }
        if other.cron_near_minutes.is_some() {
            self.cron_near_minutes = other.cron_near_minutes;
        }
        if other.use_system_proxy.is_some() {
            self.use_system_proxy = other.use_system_proxy;
        }
        if other.kiro_optimistic_cache.is_some() {
            self.kiro_optimistic_cache = other.kiro_optimistic_cache;
        }
        if other.kiro_cache_debug.is_some() {
            self.kiro_cache_debug = other.kiro_cache_debug;
        }
    }

    /// Environment knobs recognised by the runtime.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut patch = Self::default();
        patch.health_check_interval_ms = parse_env("HEALTH_CHECK_INTERVAL")?;
        patch.request_max_retries = parse_env("REQUEST_MAX_RETRIES")?;
        patch.request_base_delay_ms = parse_env("REQUEST_BASE_DELAY")?;
        patch.cron_near_minutes = parse_env("CRON_NEAR_MINUTES")?;
        patch.kiro_optimistic_cache = parse_bool_env("KIRO_OPTIMISTIC_CACHE")?;
        patch.kiro_cache_debug = parse_bool_env("KIRO_CACHE_DEBUG")?;

        let mut proxy_toggles = HashMap::new();
        for protocol in ["claude", "gemini", "openai"] {
            let name: &'static str = match protocol {
                "claude" => "USE_SYSTEM_PROXY_CLAUDE",
                "gemini" => "USE_SYSTEM_PROXY_GEMINI",
                _ => "USE_SYSTEM_PROXY_OPENAI",
            };
            if let Some(enabled) = parse_bool_env(name)? {
                proxy_toggles.insert(protocol.to_string(), enabled);
            }
        }
        if !proxy_toggles.is_empty() {
            patch.use_system_proxy = Some(proxy_toggles);
        }
        Ok(patch)
    }

    pub fn into_settings(self) -> GatewaySettings {
        let defaults = GatewaySettings::default();
        GatewaySettings {
            health_check_interval_ms: self
                .health_check_interval_ms
                .unwrap_or(defaults.health_check_interval_ms),
            max_error_count: self.max_error_count.unwrap_or(defaults.max_error_count),
            save_debounce_ms: self.save_debounce_ms.unwrap_or(defaults.save_debounce_ms),
            sticky_sessions: self.sticky_sessions.unwrap_or(defaults.sticky_sessions),
            provider_fallback_chain: self
                .provider_fallback_chain
                .unwrap_or(defaults.provider_fallback_chain),
            model_fallback_mapping: self
                .model_fallback_mapping
                .unwrap_or(defaults.model_fallback_mapping),
            request_max_retries: self
                .request_max_retries
                .unwrap_or(defaults.request_max_retries),
            request_base_delay_ms: self
                .request_base_delay_ms
                .unwrap_or(defaults.request_base_delay_ms),
            cron_near_minutes: self.cron_near_minutes.unwrap_or(defaults.cron_near_minutes),
            use_system_proxy: self.use_system_proxy.unwrap_or(defaults.use_system_proxy),
            kiro_optimistic_cache: self
                .kiro_optimistic_cache
                .unwrap_or(defaults.kiro_optimistic_cache),
            kiro_cache_debug: self.kiro_cache_debug.unwrap_or(defaults.kiro_cache_debug),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, SettingsError> {
    match std::env::var(name) {
        Ok(raw) => {
            let raw = raw.trim().to_string();
            if raw.is_empty() {
                return Ok(None);
            }
            raw.parse::<T>()
                .map(Some)
                .map_err(|_| SettingsError::InvalidValue { name, value: raw })
        }
        Err(_) => Ok(None),
    }
}

fn parse_bool_env(name: &'static str) -> Result<Option<bool>, SettingsError> {
    match std::env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            match trimmed.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(SettingsError::InvalidValue {
                    name,
                    value: trimmed.to_string(),
                }),
            }
        }
        Err(_) => Ok(None),
    }
}
