use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "aigate", about = "Multi-provider AI gateway pool runtime")]
pub struct Cli {
    /// Pool persistence file.
    #[arg(long, env = "AIGATE_POOL_FILE", default_value = "configs/provider_pools.json")]
    pub pool_file: PathBuf,

    /// Kiro credential file (sibling JSON files in the directory are merged).
    #[arg(long, env = "KIRO_OAUTH_CREDS_FILE")]
    pub kiro_creds: Option<PathBuf>,

    /// Base64-encoded Kiro credential bundle.
    #[arg(long, env = "KIRO_OAUTH_CREDS_BASE64", hide_env_values = true)]
    pub kiro_creds_base64: Option<String>,

    /// Explicit outbound proxy for Kiro traffic.
    #[arg(long, env = "AIGATE_CLAUDE_PROXY")]
    pub claude_proxy: Option<String>,

    /// Run a health check sweep immediately at startup.
    #[arg(long, default_value_t = false)]
    pub initial_health_check: bool,

    /// Log level when KIRO_LOG_LEVEL/RUST_LOG are unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
