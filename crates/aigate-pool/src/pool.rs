use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use aigate_common::{GatewaySettings, ModelFallbackTarget};
use aigate_provider_core::{AdapterRegistry, ProviderInstance, ProviderType};
use aigate_store::PoolFile;

use crate::persist::DebouncedPersistor;
use crate::sticky::StickySessionTable;

/// Timing knobs that the spec fixes but tests need to shrink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolTuning {
    /// Errors inside this window accumulate; outside it the counter resets.
    pub error_window: Duration,
    /// Minimum quiet time after the last error before a probe retries.
    pub probe_backoff: Duration,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            error_window: Duration::from_secs(10),
            probe_backoff: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectOptions<'a> {
    pub session_id: Option<&'a str>,
    pub skip_usage_count: bool,
    pub is_from_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct FallbackSelection {
    pub instance: ProviderInstance,
    pub actual_provider_type: ProviderType,
    pub is_fallback: bool,
    /// Set when a model-fallback mapping rewrote the request model.
    pub actual_model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub disabled: usize,
}

type Pools = Arc<RwLock<HashMap<ProviderType, Vec<ProviderInstance>>>>;

/// Holds the status of every credential and picks one per request.
///
/// The pool is the sole authority for health mutations; adapters and the
/// dispatch layer only signal through the `mark_*` operations.
pub struct ProviderPool {
    settings: GatewaySettings,
    tuning: PoolTuning,
    pools: Pools,
    sessions: StickySessionTable,
    fallback_chain: RwLock<HashMap<ProviderType, Vec<ProviderType>>>,
    model_fallback: HashMap<String, ModelFallbackTarget>,
    registry: AdapterRegistry,
    persistor: DebouncedPersistor,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ProviderPool {
    pub fn new(
        settings: GatewaySettings,
        registry: AdapterRegistry,
        pool_file: PoolFile,
    ) -> Arc<Self> {
        Self::with_tuning(settings, registry, pool_file, PoolTuning::default())
    }

    pub fn with_tuning(
        settings: GatewaySettings,
        registry: AdapterRegistry,
        pool_file: PoolFile,
        tuning: PoolTuning,
    ) -> Arc<Self> {
        let fallback_chain = parse_fallback_chain(&settings.provider_fallback_chain);
        let model_fallback = settings.model_fallback_mapping.clone();
        let persistor =
            DebouncedPersistor::new(Duration::from_millis(settings.save_debounce_ms.max(1)));
        let pools: Pools = Arc::new(RwLock::new(HashMap::new()));
        let sessions = StickySessionTable::new(settings.sticky_sessions.clone());

        let flush_task = persistor.spawn_flush_task(pool_file, pools.clone());
        let cleanup_task = sessions.spawn_cleanup_task();

        let pool = Arc::new(Self {
            settings,
            tuning,
            pools,
            sessions,
            fallback_chain: RwLock::new(fallback_chain),
            model_fallback,
            registry,
            persistor,
            tasks: std::sync::Mutex::new(Vec::new()),
        });
        pool.register_task(flush_task);
        pool.register_task(cleanup_task);
        pool
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &StickySessionTable {
        &self.sessions
    }

    /// Track a background task so `destroy` can cancel it.
    pub fn register_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().expect("task list poisoned").push(handle);
    }

    pub async fn add_provider(&self, instance: ProviderInstance) {
        let provider_type = instance.provider_type;
        let mut pools = self.pools.write().await;
        let entries = pools.entry(provider_type).or_default();
        // Re-adding an existing uuid replaces the entry rather than duplicating it.
        match entries.iter_mut().find(|entry| entry.uuid == instance.uuid) {
            Some(existing) => *existing = instance,
            None => entries.push(instance),
        }
    }

    pub async fn load_instances(&self, loaded: HashMap<ProviderType, Vec<ProviderInstance>>) {
        for (_, instances) in loaded {
            for instance in instances {
                self.add_provider(instance).await;
            }
        }
    }

    pub async fn snapshot(&self, provider_type: ProviderType) -> Vec<ProviderInstance> {
        self.pools
            .read()
            .await
            .get(&provider_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Pick one credential for new traffic.
    ///
    /// Sticky binding first (when enabled and a session id is present), then
    /// deterministic LRU over the healthy remainder.
    pub async fn select_provider(
        &self,
        provider_type: ProviderType,
        model: Option<&str>,
        options: SelectOptions<'_>,
    ) -> Option<ProviderInstance> {
        if !options.is_from_fallback
            && self.sessions.enabled()
            && let Some(session_id) = options.session_id
            && let Some(instance) = self
                .try_sticky(provider_type, model, session_id, options.skip_usage_count)
                .await
        {
            return Some(instance);
        }

        let selected = {
            let mut pools = self.pools.write().await;
            let instances = pools.get_mut(&provider_type)?;
            let mut best: Option<usize> = None;
            let mut best_key = (i128::MAX, u64::MAX);
            for (index, instance) in instances.iter().enumerate() {
                if !instance.is_selectable() {
                    continue;
                }
                if let Some(model) = model
                    && !instance.supports_model(model)
                {
                    continue;
                }
                let key = (instance.last_used_epoch_ms(), instance.usage_count);
                if key < best_key {
                    best_key = key;
                    best = Some(index);
                }
            }
            let index = best?;
            if !options.skip_usage_count {
                let instance = &mut instances[index];
                instance.last_used = Some(OffsetDateTime::now_utc());
                instance.usage_count += 1;
            }
            instances[index].clone()
        };

        if !options.is_from_fallback
            && self.sessions.enabled()
            && let Some(session_id) = options.session_id
        {
            self.sessions
                .bind(session_id, provider_type, &selected.uuid);
        }
        if !options.skip_usage_count {
            self.persistor.mark(provider_type).await;
        }
        Some(selected)
    }

    async fn try_sticky(
        &self,
        provider_type: ProviderType,
        model: Option<&str>,
        session_id: &str,
        skip_usage_count: bool,
    ) -> Option<ProviderInstance> {
        let binding = self.sessions.touch(session_id)?;
        if binding.provider_type != provider_type {
            self.sessions.remove(session_id);
            return None;
        }

        enum Miss {
            DropBinding,
            BypassOnly,
        }
        let outcome = {
            let mut pools = self.pools.write().await;
            let instances = pools.get_mut(&provider_type);
            let instance = instances
                .and_then(|entries| entries.iter_mut().find(|entry| entry.uuid == binding.uuid));
            match instance {
                None => Err(Miss::DropBinding),
                Some(instance) if !instance.is_selectable() => Err(Miss::DropBinding),
                Some(instance) => {
                    if let Some(model) = model
                        && !instance.supports_model(model)
                    {
                        // A model-support miss only bypasses stickiness for
                        // this call; the binding survives.
                        Err(Miss::BypassOnly)
                    } else {
                        if !skip_usage_count {
                            instance.last_used = Some(OffsetDateTime::now_utc());
                            instance.usage_count += 1;
                        }
                        Ok(instance.clone())
                    }
                }
            }
        };

        match outcome {
            Ok(instance) => {
                if !skip_usage_count {
                    self.persistor.mark(provider_type).await;
                }
                Some(instance)
            }
            Err(Miss::DropBinding) => {
                self.sessions.remove(session_id);
                None
            }
            Err(Miss::BypassOnly) => None,
        }
    }

    /// Two-tier cascade: same-protocol peers first, then the model mapping.
    pub async fn select_provider_with_fallback(
        &self,
        provider_type: ProviderType,
        model: Option<&str>,
        options: SelectOptions<'_>,
    ) -> Option<FallbackSelection> {
        let mut tried: Vec<ProviderType> = Vec::new();

        let mut candidates = vec![provider_type];
        candidates.extend(
            self.fallback_chain
                .read()
                .await
                .get(&provider_type)
                .cloned()
                .unwrap_or_default(),
        );
        for candidate in candidates {
            if tried.contains(&candidate) {
                continue;
            }
            tried.push(candidate);
            let is_fallback = candidate != provider_type;
            if is_fallback && candidate.protocol_prefix() != provider_type.protocol_prefix() {
                continue;
            }
            let attempt = SelectOptions {
                session_id: options.session_id,
                skip_usage_count: options.skip_usage_count,
                is_from_fallback: options.is_from_fallback || is_fallback,
            };
            if let Some(instance) = self.select_provider(candidate, model, attempt).await {
                if is_fallback {
                    info!(
                        from = %provider_type,
                        to = %candidate,
                        "primary pool exhausted, used fallback provider"
                    );
                }
                return Some(FallbackSelection {
                    instance,
                    actual_provider_type: candidate,
                    is_fallback,
                    actual_model: None,
                });
            }
        }

        // Tier 2: cross-protocol model mapping. No recursive mapping lookup.
        let model = model?;
        let target = self.model_fallback.get(model)?;
        let target_type = ProviderType::parse(&target.provider_type)?;
        let target_model = target.model.clone();

        let mut targets = vec![target_type];
        targets.extend(
            self.fallback_chain
                .read()
                .await
                .get(&target_type)
                .cloned()
                .unwrap_or_default(),
        );
        for candidate in targets {
            if tried.contains(&candidate) {
                continue;
            }
            tried.push(candidate);
            if candidate != target_type
                && candidate.protocol_prefix() != target_type.protocol_prefix()
            {
                continue;
            }
            let attempt = SelectOptions {
                session_id: options.session_id,
                skip_usage_count: options.skip_usage_count,
                is_from_fallback: true,
            };
            if let Some(instance) = self
                .select_provider(candidate, Some(&target_model), attempt)
                .await
            {
                info!(
                    model = %model,
                    to = %candidate,
                    target_model = %target_model,
                    "model fallback mapping redirected request"
                );
                return Some(FallbackSelection {
                    instance,
                    actual_provider_type: candidate,
                    is_fallback: true,
                    actual_model: Some(target_model),
                });
            }
        }
        None
    }

    /// Windowed failure accounting. Also bumps `last_used` so a broken
    /// credential is not immediately re-picked by LRU.
    pub async fn mark_provider_unhealthy(
        &self,
        provider_type: ProviderType,
        uuid: &str,
        message: Option<&str>,
    ) {
        let now = OffsetDateTime::now_utc();
        let max_error_count = self.settings.max_error_count;
        let window = self.tuning.error_window;
        let state = {
            let mut pools = self.pools.write().await;
            let Some(instance) = find_mut(&mut pools, provider_type, uuid) else {
                return;
            };
            let within_window = instance
                .last_error_time
                .map(|last| now - last <= window)
                .unwrap_or(false);
            // The quiet-period reset only applies while the credential is
            // still healthy; an unhealthy one must keep its counter at or
            // above the threshold.
            instance.error_count = if within_window || !instance.is_healthy {
                instance.error_count.saturating_add(1)
            } else {
                1
            };
            if instance.error_count >= max_error_count {
                instance.is_healthy = false;
            }
            instance.last_error_time = Some(now);
            instance.last_used = Some(now);
            instance.last_error_message = message.map(str::to_string);
            (instance.error_count, instance.is_healthy)
        };
        warn!(
            provider = %provider_type,
            uuid = %uuid,
            error_count = state.0,
            healthy = state.1,
            error = message.unwrap_or("unspecified"),
            "provider error recorded"
        );
        self.persistor.mark(provider_type).await;
    }

    /// Force-unhealthy, bypassing the error window. Used for auth-fatal
    /// failures (401 after refresh failure, any 403).
    pub async fn mark_provider_unhealthy_immediately(
        &self,
        provider_type: ProviderType,
        uuid: &str,
        message: Option<&str>,
    ) {
        let now = OffsetDateTime::now_utc();
        let max_error_count = self.settings.max_error_count;
        {
            let mut pools = self.pools.write().await;
            let Some(instance) = find_mut(&mut pools, provider_type, uuid) else {
                return;
            };
            instance.error_count = max_error_count;
            instance.is_healthy = false;
            instance.last_error_time = Some(now);
            instance.last_used = Some(now);
            instance.last_error_message = message.map(str::to_string);
        }
        warn!(
            provider = %provider_type,
            uuid = %uuid,
            error = message.unwrap_or("unspecified"),
            "provider marked unhealthy immediately"
        );
        self.persistor.mark(provider_type).await;
    }

    pub async fn mark_provider_healthy(
        &self,
        provider_type: ProviderType,
        uuid: &str,
        reset_usage: bool,
        health_check_model: Option<&str>,
    ) {
        let now = OffsetDateTime::now_utc();
        {
            let mut pools = self.pools.write().await;
            let Some(instance) = find_mut(&mut pools, provider_type, uuid) else {
                return;
            };
            instance.is_healthy = true;
            instance.error_count = 0;
            instance.last_error_time = None;
            instance.last_error_message = None;
            instance.last_health_check_time = Some(now);
            if let Some(model) = health_check_model {
                instance.last_health_check_model = Some(model.to_string());
            }
            if reset_usage {
                instance.usage_count = 0;
            } else {
                // Keep a just-recovered credential from dominating LRU order.
                instance.usage_count += 1;
                instance.last_used = Some(now);
            }
        }
        info!(provider = %provider_type, uuid = %uuid, "provider marked healthy");
        self.persistor.mark(provider_type).await;
    }

    /// Operator action; selection honours the flag immediately, sticky
    /// bindings to the credential are dropped at their next access.
    pub async fn disable_provider(&self, provider_type: ProviderType, uuid: &str) {
        self.set_disabled(provider_type, uuid, true).await;
    }

    pub async fn enable_provider(&self, provider_type: ProviderType, uuid: &str) {
        self.set_disabled(provider_type, uuid, false).await;
    }

    async fn set_disabled(&self, provider_type: ProviderType, uuid: &str, disabled: bool) {
        {
            let mut pools = self.pools.write().await;
            let Some(instance) = find_mut(&mut pools, provider_type, uuid) else {
                return;
            };
            instance.is_disabled = disabled;
        }
        info!(provider = %provider_type, uuid = %uuid, disabled, "provider disabled flag changed");
        self.persistor.mark(provider_type).await;
    }

    pub async fn reset_provider_counters(&self, provider_type: ProviderType) {
        {
            let mut pools = self.pools.write().await;
            let Some(instances) = pools.get_mut(&provider_type) else {
                return;
            };
            for instance in instances.iter_mut() {
                instance.error_count = 0;
                instance.usage_count = 0;
                instance.last_error_time = None;
                instance.last_error_message = None;
                instance.is_healthy = true;
            }
        }
        self.persistor.mark(provider_type).await;
    }

    pub async fn get_provider_stats(&self, provider_type: ProviderType) -> ProviderStats {
        let pools = self.pools.read().await;
        let mut stats = ProviderStats::default();
        let Some(instances) = pools.get(&provider_type) else {
            return stats;
        };
        stats.total = instances.len();
        for instance in instances {
            if instance.is_disabled {
                stats.disabled += 1;
            } else if instance.is_healthy {
                stats.healthy += 1;
            } else {
                stats.unhealthy += 1;
            }
        }
        stats
    }

    pub async fn is_all_providers_unhealthy(&self, provider_type: ProviderType) -> bool {
        let pools = self.pools.read().await;
        match pools.get(&provider_type) {
            Some(instances) if !instances.is_empty() => {
                instances.iter().all(|instance| !instance.is_selectable())
            }
            _ => false,
        }
    }

    pub async fn get_fallback_chain(&self, provider_type: ProviderType) -> Vec<ProviderType> {
        self.fallback_chain
            .read()
            .await
            .get(&provider_type)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_fallback_chain(&self, provider_type: ProviderType, chain: Vec<ProviderType>) {
        self.fallback_chain
            .write()
            .await
            .insert(provider_type, chain);
    }

    /// Probe unhealthy credentials. Healthy ones are skipped outright; they
    /// are verified implicitly by real traffic.
    pub async fn perform_health_checks(&self, is_init: bool) {
        let now = OffsetDateTime::now_utc();
        let snapshot: Vec<(ProviderType, Vec<ProviderInstance>)> = {
            let pools = self.pools.read().await;
            pools
                .iter()
                .map(|(provider_type, instances)| (*provider_type, instances.clone()))
                .collect()
        };

        for (provider_type, instances) in snapshot {
            let Some(adapter) = self.registry.get(provider_type) else {
                continue;
            };
            for instance in instances {
                if instance.is_disabled || !instance.check_health || instance.is_healthy {
                    continue;
                }
                if !is_init
                    && let Some(last_error) = instance.last_error_time
                    && now - last_error < self.tuning.probe_backoff
                {
                    continue;
                }
                let model = instance
                    .check_model_name
                    .clone()
                    .unwrap_or_else(|| default_probe_model(provider_type).to_string());
                match adapter.check_health(&instance, &model).await {
                    Ok(()) => {
                        self.mark_provider_healthy(provider_type, &instance.uuid, true, Some(&model))
                            .await;
                    }
                    Err(err) => {
                        self.mark_provider_unhealthy(
                            provider_type,
                            &instance.uuid,
                            Some(&err.reason()),
                        )
                        .await;
                        self.stamp_health_check(provider_type, &instance.uuid, &model)
                            .await;
                    }
                }
            }
        }
    }

    async fn stamp_health_check(&self, provider_type: ProviderType, uuid: &str, model: &str) {
        let mut pools = self.pools.write().await;
        if let Some(instance) = find_mut(&mut pools, provider_type, uuid) {
            instance.last_health_check_time = Some(OffsetDateTime::now_utc());
            instance.last_health_check_model = Some(model.to_string());
        }
    }

    /// Cancel every owned background task and drop all session bindings.
    /// In-flight requests are not aborted.
    pub fn destroy(&self) {
        for handle in self.tasks.lock().expect("task list poisoned").drain(..) {
            handle.abort();
        }
        self.sessions.clear();
    }
}

impl Drop for ProviderPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn find_mut<'a>(
    pools: &'a mut HashMap<ProviderType, Vec<ProviderInstance>>,
    provider_type: ProviderType,
    uuid: &str,
) -> Option<&'a mut ProviderInstance> {
    pools
        .get_mut(&provider_type)?
        .iter_mut()
        .find(|instance| instance.uuid == uuid)
}

fn parse_fallback_chain(
    raw: &HashMap<String, Vec<String>>,
) -> HashMap<ProviderType, Vec<ProviderType>> {
    let mut chains = HashMap::new();
    for (tag, peers) in raw {
        let Some(provider_type) = ProviderType::parse(tag) else {
            warn!(provider = %tag, "unknown provider type in fallback chain, ignored");
            continue;
        };
        let mut parsed = Vec::with_capacity(peers.len());
        for peer in peers {
            match ProviderType::parse(peer) {
                Some(peer) => parsed.push(peer),
                None => warn!(provider = %peer, "unknown fallback peer, ignored"),
            }
        }
        chains.insert(provider_type, parsed);
    }
    chains
}

fn default_probe_model(provider_type: ProviderType) -> &'static str {
    match provider_type.protocol_prefix() {
        "claude" => "claude-haiku-4-5",
        "gemini" => "gemini-2.5-flash",
        _ => "gpt-4o-mini",
    }
}
