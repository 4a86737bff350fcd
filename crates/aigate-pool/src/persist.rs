use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use aigate_provider_core::{ProviderInstance, ProviderType};
use aigate_store::PoolFile;

type Pools = Arc<RwLock<HashMap<ProviderType, Vec<ProviderInstance>>>>;

/// Coalesces pool mutations into one file write.
///
/// Every mark re-arms the deadline, so a burst of mutations produces a single
/// rewrite `debounce` after the last one.
pub struct DebouncedPersistor {
    pending: Arc<Mutex<HashSet<ProviderType>>>,
    deadline: Arc<Mutex<Option<Instant>>>,
    notify: Arc<Notify>,
    debounce: Duration,
}

impl DebouncedPersistor {
    pub fn new(debounce: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashSet::new())),
            deadline: Arc::new(Mutex::new(None)),
            notify: Arc::new(Notify::new()),
            debounce,
        }
    }

    /// Queue a provider type for the next flush and re-arm the timer.
    pub async fn mark(&self, provider_type: ProviderType) {
        self.pending.lock().await.insert(provider_type);
        *self.deadline.lock().await = Some(Instant::now() + self.debounce);
        self.notify.notify_one();
    }

    pub fn spawn_flush_task(&self, pool_file: PoolFile, pools: Pools) -> JoinHandle<()> {
        let pending = self.pending.clone();
        let deadline = self.deadline.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            loop {
                let next = *deadline.lock().await;
                match next {
                    None => notify.notified().await,
                    Some(when) if Instant::now() < when => {
                        tokio::select! {
                            _ = sleep_until(when) => {}
                            _ = notify.notified() => {}
                        }
                    }
                    Some(_) => {
                        *deadline.lock().await = None;
                        let types: Vec<ProviderType> = {
                            let mut guard = pending.lock().await;
                            guard.drain().collect()
                        };
                        if types.is_empty() {
                            continue;
                        }
                        flush(&pool_file, &pools, &types).await;
                    }
                }
            }
        })
    }
}

async fn flush(pool_file: &PoolFile, pools: &Pools, types: &[ProviderType]) {
    let updates: HashMap<ProviderType, Vec<ProviderInstance>> = {
        let guard = pools.read().await;
        types
            .iter()
            .map(|provider_type| {
                (
                    *provider_type,
                    guard.get(provider_type).cloned().unwrap_or_default(),
                )
            })
            .collect()
    };

    let file = pool_file.clone();
    let written = tokio::task::spawn_blocking(move || file.replace_types(&updates)).await;
    match written {
        Ok(Ok(())) => debug!(types = types.len(), "pool file flushed"),
        Ok(Err(err)) => warn!(error = %err, "pool file flush failed"),
        Err(err) => warn!(error = %err, "pool file flush task panicked"),
    }
}
