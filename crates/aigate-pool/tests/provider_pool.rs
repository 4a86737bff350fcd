use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use aigate_common::{GatewaySettings, ModelFallbackTarget, StickySessionSettings};
use aigate_pool::{Gateway, PoolTuning, ProviderPool, SelectOptions, spawn_health_scheduler};
use aigate_protocol::{Message, MessagesRequest, StreamEvent};
use aigate_provider_core::{
    AdapterRegistry, AdapterStream, ProviderError, ProviderInstance, ProviderResult, ProviderType,
    UpstreamAdapter,
};
use aigate_store::PoolFile;

struct MockAdapter {
    provider_type: ProviderType,
    probe_ok: AtomicBool,
    probe_calls: AtomicUsize,
    generate_error: std::sync::Mutex<Option<ProviderError>>,
}

impl MockAdapter {
    fn new(provider_type: ProviderType) -> Arc<Self> {
        Arc::new(Self {
            provider_type,
            probe_ok: AtomicBool::new(true),
            probe_calls: AtomicUsize::new(0),
            generate_error: std::sync::Mutex::new(None),
        })
    }

    fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    fn fail_generate_with(&self, err: ProviderError) {
        *self.generate_error.lock().unwrap() = Some(err);
    }
}

#[async_trait]
impl UpstreamAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    async fn generate(
        &self,
        _instance: &ProviderInstance,
        _request: MessagesRequest,
    ) -> ProviderResult<AdapterStream> {
        if let Some(err) = self.generate_error.lock().unwrap().clone() {
            return Err(err);
        }
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tx.send(StreamEvent::MessageStop).await.ok();
        Ok(rx)
    }

    async fn check_health(
        &self,
        _instance: &ProviderInstance,
        _model: &str,
    ) -> ProviderResult<()> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::AuthFatal("probe rejected".to_string()))
        }
    }
}

struct Fixture {
    pool: Arc<ProviderPool>,
    kiro: Arc<MockAdapter>,
    _dir: tempfile::TempDir,
}

fn settings() -> GatewaySettings {
    GatewaySettings {
        save_debounce_ms: 10,
        sticky_sessions: StickySessionSettings {
            enabled: true,
            ttl_ms: 60_000,
            cleanup_interval_ms: 60_000,
            max_sessions: 100,
        },
        ..Default::default()
    }
}

fn fixture_with(settings: GatewaySettings, tuning: PoolTuning) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let pool_file = PoolFile::new(dir.path().join("provider_pools.json"));

    let kiro = MockAdapter::new(ProviderType::ClaudeKiroOAuth);
    let mut registry = AdapterRegistry::new();
    registry.register(kiro.clone());
    registry.register(MockAdapter::new(ProviderType::ClaudeCustom));

    let pool = ProviderPool::with_tuning(settings, registry, pool_file, tuning);
    Fixture {
        pool,
        kiro,
        _dir: dir,
    }
}

fn fixture() -> Fixture {
    fixture_with(settings(), PoolTuning::default())
}

async fn add_instance(pool: &ProviderPool, provider_type: ProviderType) -> String {
    let instance = ProviderInstance::new(provider_type);
    let uuid = instance.uuid.clone();
    pool.add_provider(instance).await;
    uuid
}

async fn instance_by_uuid(
    pool: &ProviderPool,
    provider_type: ProviderType,
    uuid: &str,
) -> ProviderInstance {
    pool.snapshot(provider_type)
        .await
        .into_iter()
        .find(|instance| instance.uuid == uuid)
        .expect("instance should exist")
}

#[tokio::test]
async fn fresh_pool_selects_in_insertion_order_then_balances() {
    let fx = fixture();
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    let b = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    let first = fx
        .pool
        .select_provider(ProviderType::ClaudeKiroOAuth, None, SelectOptions::default())
        .await
        .expect("first selection");
    assert_eq!(first.uuid, a);

    let second = fx
        .pool
        .select_provider(ProviderType::ClaudeKiroOAuth, None, SelectOptions::default())
        .await
        .expect("second selection");
    assert_eq!(second.uuid, b);

    let a_state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
    let b_state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &b).await;
    assert_eq!(a_state.usage_count, 1);
    assert_eq!(b_state.usage_count, 1);
    assert!(b_state.last_used >= a_state.last_used);
}

#[tokio::test]
async fn selection_skips_unhealthy_and_disabled() {
    let fx = fixture();
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    let b = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    let c = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    fx.pool
        .mark_provider_unhealthy_immediately(ProviderType::ClaudeKiroOAuth, &a, Some("down"))
        .await;
    fx.pool
        .disable_provider(ProviderType::ClaudeKiroOAuth, &b)
        .await;

    for _ in 0..3 {
        let selected = fx
            .pool
            .select_provider(ProviderType::ClaudeKiroOAuth, None, SelectOptions::default())
            .await
            .expect("only c is eligible");
        assert_eq!(selected.uuid, c);
    }
}

#[tokio::test]
async fn model_filter_respects_not_supported_models() {
    let fx = fixture();
    let mut instance = ProviderInstance::new(ProviderType::ClaudeKiroOAuth);
    instance
        .not_supported_models
        .insert("claude-opus-4-5".to_string());
    let blocked = instance.uuid.clone();
    fx.pool.add_provider(instance).await;
    let open = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    let selected = fx
        .pool
        .select_provider(
            ProviderType::ClaudeKiroOAuth,
            Some("claude-opus-4-5"),
            SelectOptions::default(),
        )
        .await
        .expect("one instance supports the model");
    assert_eq!(selected.uuid, open);
    assert_ne!(selected.uuid, blocked);
}

#[tokio::test]
async fn error_count_trips_exactly_at_threshold() {
    let fx = fixture();
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    for expected in 1..=2u32 {
        fx.pool
            .mark_provider_unhealthy(ProviderType::ClaudeKiroOAuth, &a, Some("err"))
            .await;
        let state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
        assert_eq!(state.error_count, expected);
        assert!(state.is_healthy, "healthy until the threshold");
    }

    fx.pool
        .mark_provider_unhealthy(ProviderType::ClaudeKiroOAuth, &a, Some("err"))
        .await;
    let state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
    assert_eq!(state.error_count, 3);
    assert!(!state.is_healthy);
    assert_eq!(state.last_error_message.as_deref(), Some("err"));
}

#[tokio::test]
async fn error_window_resets_after_quiet_period() {
    let tuning = PoolTuning {
        error_window: Duration::from_millis(50),
        ..Default::default()
    };
    let fx = fixture_with(settings(), tuning);
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    fx.pool
        .mark_provider_unhealthy(ProviderType::ClaudeKiroOAuth, &a, Some("e1"))
        .await;
    fx.pool
        .mark_provider_unhealthy(ProviderType::ClaudeKiroOAuth, &a, Some("e2"))
        .await;
    let state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
    assert_eq!(state.error_count, 2);

    tokio::time::sleep(Duration::from_millis(80)).await;
    fx.pool
        .mark_provider_unhealthy(ProviderType::ClaudeKiroOAuth, &a, Some("e3"))
        .await;
    let state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
    assert_eq!(state.error_count, 1, "counter resets outside the window");
    assert!(state.is_healthy);
}

#[tokio::test]
async fn immediate_mark_forces_threshold_and_unhealthy() {
    let fx = fixture();
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    fx.pool
        .mark_provider_unhealthy_immediately(ProviderType::ClaudeKiroOAuth, &a, Some("forbidden"))
        .await;
    let state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
    assert!(!state.is_healthy);
    assert_eq!(state.error_count, 3);
    assert!(state.last_used.is_some(), "broken credential leaves LRU head");
}

#[tokio::test]
async fn probe_recovers_immediately_marked_credential() {
    let fx = fixture();
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    fx.pool
        .mark_provider_unhealthy_immediately(ProviderType::ClaudeKiroOAuth, &a, Some("test"))
        .await;
    fx.kiro.set_probe_ok(true);
    fx.pool.perform_health_checks(true).await;

    let state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
    assert!(state.is_healthy);
    assert_eq!(state.error_count, 0);
    assert_eq!(state.last_error_message, None);
    assert_eq!(state.usage_count, 0, "probe recovery resets usage");
    assert_eq!(
        state.last_health_check_model.as_deref(),
        Some("claude-haiku-4-5")
    );
    assert!(state.last_health_check_time.is_some());
}

#[tokio::test]
async fn health_checks_skip_healthy_credentials() {
    let fx = fixture();
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    let before = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
    fx.pool.perform_health_checks(false).await;
    let after = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;

    assert_eq!(fx.kiro.probe_calls(), 0);
    assert_eq!(before, after, "skip path must not mutate");
}

#[tokio::test]
async fn probe_backoff_defers_recent_failures() {
    let tuning = PoolTuning {
        probe_backoff: Duration::from_millis(100),
        ..Default::default()
    };
    let fx = fixture_with(settings(), tuning);
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    fx.pool
        .mark_provider_unhealthy_immediately(ProviderType::ClaudeKiroOAuth, &a, Some("down"))
        .await;

    fx.pool.perform_health_checks(false).await;
    assert_eq!(fx.kiro.probe_calls(), 0, "error too recent, probe deferred");

    tokio::time::sleep(Duration::from_millis(130)).await;
    fx.pool.perform_health_checks(false).await;
    assert_eq!(fx.kiro.probe_calls(), 1);
}

#[tokio::test]
async fn failed_probe_stamps_health_check_fields() {
    let fx = fixture();
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    fx.pool
        .mark_provider_unhealthy_immediately(ProviderType::ClaudeKiroOAuth, &a, Some("down"))
        .await;

    fx.kiro.set_probe_ok(false);
    fx.pool.perform_health_checks(true).await;

    let state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
    assert!(!state.is_healthy);
    assert!(state.last_health_check_time.is_some());
    assert_eq!(
        state.last_health_check_model.as_deref(),
        Some("claude-haiku-4-5")
    );
}

#[tokio::test]
async fn sticky_session_pins_credential_while_eligible() {
    let fx = fixture();
    add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    let options = SelectOptions {
        session_id: Some("S1"),
        ..Default::default()
    };
    let first = fx
        .pool
        .select_provider(ProviderType::ClaudeKiroOAuth, None, options)
        .await
        .expect("selection");
    let second = fx
        .pool
        .select_provider(ProviderType::ClaudeKiroOAuth, None, options)
        .await
        .expect("selection");
    assert_eq!(first.uuid, second.uuid, "session stays pinned");
}

#[tokio::test]
async fn sticky_degrades_when_bound_credential_goes_unhealthy() {
    let fx = fixture();
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    let c = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    let options = SelectOptions {
        session_id: Some("S1"),
        ..Default::default()
    };
    let bound = fx
        .pool
        .select_provider(ProviderType::ClaudeKiroOAuth, None, options)
        .await
        .expect("selection");
    assert_eq!(bound.uuid, a);

    fx.pool
        .mark_provider_unhealthy_immediately(ProviderType::ClaudeKiroOAuth, &a, Some("down"))
        .await;

    let rebound = fx
        .pool
        .select_provider(ProviderType::ClaudeKiroOAuth, None, options)
        .await
        .expect("degrades to LRU");
    assert_eq!(rebound.uuid, c);

    // The binding now points at the replacement credential.
    let again = fx
        .pool
        .select_provider(ProviderType::ClaudeKiroOAuth, None, options)
        .await
        .expect("selection");
    assert_eq!(again.uuid, c);
}

#[tokio::test]
async fn sticky_model_miss_bypasses_without_dropping_binding() {
    let fx = fixture();
    let mut limited = ProviderInstance::new(ProviderType::ClaudeKiroOAuth);
    limited
        .not_supported_models
        .insert("claude-opus-4-5".to_string());
    let a = limited.uuid.clone();
    fx.pool.add_provider(limited).await;
    let b = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    let options = SelectOptions {
        session_id: Some("S1"),
        ..Default::default()
    };
    let bound = fx
        .pool
        .select_provider(ProviderType::ClaudeKiroOAuth, None, options)
        .await
        .expect("selection");
    assert_eq!(bound.uuid, a);

    // Unsupported model: this call bypasses the binding...
    let bypass = fx
        .pool
        .select_provider(ProviderType::ClaudeKiroOAuth, Some("claude-opus-4-5"), options)
        .await
        .expect("other instance serves the model");
    assert_eq!(bypass.uuid, b);
}

#[tokio::test]
async fn fallback_chain_serves_when_primary_pool_is_down() {
    let mut cfg = settings();
    cfg.provider_fallback_chain.insert(
        "claude-kiro-oauth".to_string(),
        vec!["claude-custom".to_string()],
    );
    let fx = fixture_with(cfg, PoolTuning::default());

    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    let fallback = add_instance(&fx.pool, ProviderType::ClaudeCustom).await;
    fx.pool
        .mark_provider_unhealthy_immediately(ProviderType::ClaudeKiroOAuth, &a, Some("down"))
        .await;

    let selection = fx
        .pool
        .select_provider_with_fallback(
            ProviderType::ClaudeKiroOAuth,
            Some("claude-sonnet-4-5"),
            SelectOptions {
                session_id: Some("S1"),
                ..Default::default()
            },
        )
        .await
        .expect("fallback should serve");
    assert!(selection.is_fallback);
    assert_eq!(
        selection.actual_provider_type,
        ProviderType::ClaudeCustom
    );
    assert_eq!(selection.instance.uuid, fallback);
    assert_eq!(selection.actual_model, None);

    // Fallback selection never writes a sticky binding for the session.
    let binding = fx.pool.sessions().touch("S1");
    assert!(
        binding.is_none()
            || binding.as_ref().unwrap().provider_type != ProviderType::ClaudeCustom
    );
}

#[tokio::test]
async fn cross_protocol_fallback_requires_model_mapping() {
    let mut cfg = settings();
    // gemini peer is not same-protocol: tier 1 must skip it.
    cfg.provider_fallback_chain.insert(
        "claude-kiro-oauth".to_string(),
        vec!["gemini-cli-oauth".to_string()],
    );
    cfg.model_fallback_mapping.insert(
        "claude-sonnet-4-5".to_string(),
        ModelFallbackTarget {
            provider_type: "gemini-cli-oauth".to_string(),
            model: "gemini-2.5-pro".to_string(),
        },
    );
    let fx = fixture_with(cfg, PoolTuning::default());

    let gemini = add_instance(&fx.pool, ProviderType::GeminiCliOAuth).await;

    let selection = fx
        .pool
        .select_provider_with_fallback(
            ProviderType::ClaudeKiroOAuth,
            Some("claude-sonnet-4-5"),
            SelectOptions::default(),
        )
        .await
        .expect("model mapping should serve");
    assert!(selection.is_fallback);
    assert_eq!(selection.actual_provider_type, ProviderType::GeminiCliOAuth);
    assert_eq!(selection.instance.uuid, gemini);
    assert_eq!(selection.actual_model.as_deref(), Some("gemini-2.5-pro"));
}

#[tokio::test]
async fn stats_and_exhaustion_accessors() {
    let fx = fixture();
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    let b = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;

    fx.pool
        .mark_provider_unhealthy_immediately(ProviderType::ClaudeKiroOAuth, &a, None)
        .await;
    fx.pool
        .disable_provider(ProviderType::ClaudeKiroOAuth, &b)
        .await;

    let stats = fx.pool.get_provider_stats(ProviderType::ClaudeKiroOAuth).await;
    assert_eq!(stats.total, 3);
    assert_eq!(stats.healthy, 1);
    assert_eq!(stats.unhealthy, 1);
    assert_eq!(stats.disabled, 1);

    assert!(
        !fx.pool
            .is_all_providers_unhealthy(ProviderType::ClaudeKiroOAuth)
            .await
    );
    assert!(
        !fx.pool
            .is_all_providers_unhealthy(ProviderType::ClaudeCustom)
            .await,
        "empty pool is not reported as all-unhealthy"
    );
}

#[tokio::test]
async fn reset_counters_restores_fresh_state() {
    let fx = fixture();
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    fx.pool
        .select_provider(ProviderType::ClaudeKiroOAuth, None, SelectOptions::default())
        .await
        .unwrap();
    fx.pool
        .mark_provider_unhealthy_immediately(ProviderType::ClaudeKiroOAuth, &a, Some("x"))
        .await;

    fx.pool
        .reset_provider_counters(ProviderType::ClaudeKiroOAuth)
        .await;
    let state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
    assert!(state.is_healthy);
    assert_eq!(state.error_count, 0);
    assert_eq!(state.usage_count, 0);
    assert_eq!(state.last_error_message, None);
}

#[tokio::test]
async fn mutations_reach_the_pool_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("provider_pools.json");
    let pool_file = PoolFile::new(&path);
    let mut registry = AdapterRegistry::new();
    registry.register(MockAdapter::new(ProviderType::ClaudeKiroOAuth));
    let pool = ProviderPool::new(settings(), registry, pool_file.clone());

    let uuid = add_instance(&pool, ProviderType::ClaudeKiroOAuth).await;
    pool.select_provider(ProviderType::ClaudeKiroOAuth, None, SelectOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let on_disk = pool_file.load_instances().unwrap();
    let entry = &on_disk[&ProviderType::ClaudeKiroOAuth];
    assert_eq!(entry.len(), 1);
    assert_eq!(entry[0].uuid, uuid);
    assert_eq!(entry[0].usage_count, 1);
    pool.destroy();
}

#[tokio::test]
async fn scheduler_drives_recovery_end_to_end() {
    let mut cfg = settings();
    cfg.health_check_interval_ms = 30;
    let tuning = PoolTuning {
        probe_backoff: Duration::from_millis(1),
        ..Default::default()
    };
    let fx = fixture_with(cfg, tuning);
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    fx.pool
        .mark_provider_unhealthy_immediately(ProviderType::ClaudeKiroOAuth, &a, Some("test"))
        .await;

    spawn_health_scheduler(&fx.pool, false);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
    assert!(state.is_healthy, "scheduler probe should recover the credential");
    fx.pool.destroy();
}

#[tokio::test]
async fn gateway_surfaces_pool_exhausted() {
    let fx = fixture();
    let gateway = Gateway::new(fx.pool.clone());
    let request = MessagesRequest {
        model: "claude-sonnet-4-5".to_string(),
        system: None,
        messages: vec![Message::user("Hi")],
        tools: Vec::new(),
        tool_choice: None,
        thinking: None,
        max_tokens: Some(64),
        stream: Some(true),
    };
    let err = gateway
        .generate(ProviderType::ClaudeKiroOAuth, request, None)
        .await
        .expect_err("empty pool must not serve");
    assert!(matches!(err, ProviderError::PoolExhausted(_)));
}

#[tokio::test]
async fn gateway_marks_health_on_adapter_failure() {
    let fx = fixture();
    let a = add_instance(&fx.pool, ProviderType::ClaudeKiroOAuth).await;
    fx.kiro
        .fail_generate_with(ProviderError::AuthFatal("403".to_string()));

    let gateway = Gateway::new(fx.pool.clone());
    let request = MessagesRequest {
        model: "claude-sonnet-4-5".to_string(),
        system: None,
        messages: vec![Message::user("Hi")],
        tools: Vec::new(),
        tool_choice: None,
        thinking: None,
        max_tokens: Some(64),
        stream: Some(true),
    };
    let err = gateway
        .generate(ProviderType::ClaudeKiroOAuth, request, None)
        .await
        .expect_err("adapter failure surfaces");
    assert!(matches!(err, ProviderError::AuthFatal(_)));

    let state = instance_by_uuid(&fx.pool, ProviderType::ClaudeKiroOAuth, &a).await;
    assert!(!state.is_healthy);
    assert_eq!(state.error_count, 3);
}
