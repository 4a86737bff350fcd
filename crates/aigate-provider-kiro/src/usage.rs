use serde::Deserialize;

/// Best-effort view of `getUsageLimits`; the upstream shape is loosely
/// specified, so every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageLimits {
    #[serde(default)]
    pub limits: Vec<UsageLimit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimit {
    #[serde(default)]
    pub limit_type: Option<String>,
    #[serde(default)]
    pub limit_value: Option<f64>,
    #[serde(default)]
    pub current_usage: Option<f64>,
    #[serde(default)]
    pub overage_status: Option<String>,
}

impl UsageLimits {
    pub fn any_breached(&self) -> bool {
        self.limits.iter().any(|limit| {
            if let Some(status) = &limit.overage_status
                && !status.eq_ignore_ascii_case("none")
            {
                return true;
            }
            match (limit.limit_value, limit.current_usage) {
                (Some(value), Some(used)) => used >= value && value > 0.0,
                _ => false,
            }
        })
    }
}
