use std::error::Error;
use std::fmt;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionReset,
    ConnectionClosed,
    Dns,
    Timeout,
}

impl NetworkErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkErrorKind::ConnectionReset => "connection_reset",
            NetworkErrorKind::ConnectionClosed => "connection_closed",
            NetworkErrorKind::Dns => "dns",
            NetworkErrorKind::Timeout => "timeout",
        }
    }
}

/// Closed error taxonomy for the provider runtime.
///
/// Adapters recover `TokenExpired`, `Throttled`, `UpstreamServer` and
/// `Network` locally; everything else surfaces to the caller.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// 401 on first try; one transparent refresh+retry is allowed.
    TokenExpired(String),
    /// 401 after a failed refresh, or any 403. Credential is done.
    AuthFatal(String),
    /// 429.
    Throttled(String),
    /// 5xx.
    UpstreamServer { status: u16, message: String },
    Network {
        kind: NetworkErrorKind,
        message: String,
    },
    /// Unparseable upstream frames; never a credential signal.
    UpstreamMalformed(String),
    /// Missing/invalid local credential material; fatal for one adapter only.
    LocalConfig(String),
    /// No credential could be selected, even via fallback.
    PoolExhausted(String),
    Other(String),
}

impl ProviderError {
    /// Eligible for the exponential backoff ladder.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Throttled(_)
                | ProviderError::UpstreamServer { .. }
                | ProviderError::Network { .. }
        )
    }

    /// Short reason string stored into `last_error_message`.
    pub fn reason(&self) -> String {
        match self {
            ProviderError::TokenExpired(msg) => format!("token expired: {msg}"),
            ProviderError::AuthFatal(msg) => format!("auth fatal: {msg}"),
            ProviderError::Throttled(msg) => format!("throttled: {msg}"),
            ProviderError::UpstreamServer { status, message } => {
                format!("upstream {status}: {message}")
            }
            ProviderError::Network { kind, message } => {
                format!("network {}: {message}", kind.as_str())
            }
            ProviderError::UpstreamMalformed(msg) => format!("malformed upstream data: {msg}"),
            ProviderError::LocalConfig(msg) => format!("local config: {msg}"),
            ProviderError::PoolExhausted(msg) => format!("pool exhausted: {msg}"),
            ProviderError::Other(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

impl Error for ProviderError {}
