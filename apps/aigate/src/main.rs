mod cli;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aigate_common::GatewaySettingsPatch;
use aigate_pool::{ProviderPool, spawn_health_scheduler};
use aigate_provider_core::{AdapterRegistry, ProviderInstance, ProviderType, RetryPolicy};
use aigate_provider_kiro::{KiroAdapter, KiroConfig};
use aigate_store::PoolFile;

use crate::cli::Cli;

fn init_tracing(fallback_level: &str) {
    let directive = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("KIRO_LOG_LEVEL"))
        .unwrap_or_else(|_| fallback_level.to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let patch = GatewaySettingsPatch::from_env().context("invalid environment settings")?;
    let settings = patch.into_settings();

    let kiro_config = KiroConfig {
        creds_file_path: cli.kiro_creds.clone(),
        base64_creds: cli.kiro_creds_base64.clone(),
        retry: RetryPolicy::new(
            settings.request_max_retries,
            Duration::from_millis(settings.request_base_delay_ms),
        ),
        near_minutes: settings.cron_near_minutes,
        outbound_proxy: cli.claude_proxy.clone(),
        use_system_proxy: settings
            .use_system_proxy
            .get("claude")
            .copied()
            .unwrap_or(true),
        optimistic_cache: settings.kiro_optimistic_cache,
        cache_debug: settings.kiro_cache_debug,
        ..Default::default()
    };
    let kiro = KiroAdapter::new(kiro_config).context("failed to build kiro adapter")?;

    let mut registry = AdapterRegistry::new();
    registry.register(std::sync::Arc::new(kiro));

    let pool_file = PoolFile::new(&cli.pool_file);
    let loaded = pool_file
        .load_instances()
        .context("failed to read pool file")?;
    let pool = ProviderPool::new(settings, registry, pool_file);
    let loaded_kiro = loaded
        .get(&ProviderType::ClaudeKiroOAuth)
        .map(Vec::len)
        .unwrap_or(0);
    pool.load_instances(loaded).await;

    // A credential file on the command line bootstraps a pool entry when the
    // pool file does not carry one yet.
    if loaded_kiro == 0 && cli.kiro_creds.is_some() {
        let mut instance = ProviderInstance::new(ProviderType::ClaudeKiroOAuth);
        instance.creds_file_path = cli
            .kiro_creds
            .as_ref()
            .map(|path| path.display().to_string());
        info!(uuid = %instance.uuid, "registering kiro credential from --kiro-creds");
        pool.add_provider(instance).await;
    }

    for provider_type in ProviderType::ALL {
        let stats = pool.get_provider_stats(provider_type).await;
        if stats.total > 0 {
            info!(
                provider = %provider_type,
                total = stats.total,
                healthy = stats.healthy,
                unhealthy = stats.unhealthy,
                disabled = stats.disabled,
                "pool loaded"
            );
        }
    }

    spawn_health_scheduler(&pool, cli.initial_health_check);
    info!("aigate pool runtime started, press ctrl-c to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "signal listener failed, shutting down");
    }
    pool.destroy();
    info!("shut down cleanly");
    Ok(())
}
