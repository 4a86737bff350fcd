use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::debug;

use aigate_common::StickySessionSettings;
use aigate_provider_core::ProviderType;

/// One session binding. Referencing the credential by uuid keeps the table
/// free of object references into the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBinding {
    pub provider_type: ProviderType,
    pub uuid: String,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
    pub request_count: u64,
}

#[derive(Clone)]
pub struct StickySessionTable {
    settings: StickySessionSettings,
    sessions: Arc<std::sync::Mutex<HashMap<String, SessionBinding>>>,
}

impl StickySessionTable {
    pub fn new(settings: StickySessionSettings) -> Self {
        Self {
            settings,
            sessions: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.settings.ttl_ms)
    }

    /// Look up a live binding and refresh its access stamp. Expired bindings
    /// are removed and read as a miss.
    pub fn touch(&self, session_id: &str) -> Option<SessionBinding> {
        let now = OffsetDateTime::now_utc();
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        match sessions.get_mut(session_id) {
            Some(binding) => {
                if now - binding.last_accessed_at > self.ttl() {
                    sessions.remove(session_id);
                    return None;
                }
                binding.last_accessed_at = now;
                binding.request_count += 1;
                Some(binding.clone())
            }
            None => None,
        }
    }

    pub fn bind(&self, session_id: &str, provider_type: ProviderType, uuid: &str) {
        let now = OffsetDateTime::now_utc();
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        if !sessions.contains_key(session_id) && sessions.len() >= self.settings.max_sessions {
            evict_lru_tail(&mut sessions, self.settings.max_sessions / 10);
        }
        sessions.insert(
            session_id.to_string(),
            SessionBinding {
                provider_type,
                uuid: uuid.to_string(),
                created_at: now,
                last_accessed_at: now,
                request_count: 1,
            },
        );
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.sessions.lock().expect("session table poisoned").clear();
    }

    pub fn cleanup_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let ttl = self.ttl();
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        let before = sessions.len();
        sessions.retain(|_, binding| now - binding.last_accessed_at <= ttl);
        before - sessions.len()
    }

    pub fn spawn_cleanup_task(&self) -> JoinHandle<()> {
        let table = self.clone();
        let interval = Duration::from_millis(self.settings.cleanup_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = table.cleanup_expired();
                if removed > 0 {
                    debug!(removed, "expired sticky sessions dropped");
                }
            }
        })
    }
}

fn evict_lru_tail(sessions: &mut HashMap<String, SessionBinding>, batch: usize) {
    if batch == 0 {
        return;
    }
    let mut by_access: Vec<(String, OffsetDateTime)> = sessions
        .iter()
        .map(|(id, binding)| (id.clone(), binding.last_accessed_at))
        .collect();
    by_access.sort_by_key(|(_, accessed)| *accessed);
    for (id, _) in by_access.into_iter().take(batch) {
        sessions.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_sessions: usize, ttl_ms: u64) -> StickySessionSettings {
        StickySessionSettings {
            enabled: true,
            ttl_ms,
            cleanup_interval_ms: 60_000,
            max_sessions,
        }
    }

    #[test]
    fn touch_refreshes_and_counts() {
        let table = StickySessionTable::new(settings(100, 60_000));
        table.bind("s1", ProviderType::ClaudeKiroOAuth, "u1");
        let first = table.touch("s1").expect("binding should exist");
        assert_eq!(first.request_count, 2);
        let second = table.touch("s1").expect("binding should exist");
        assert_eq!(second.request_count, 3);
        assert!(second.last_accessed_at >= first.last_accessed_at);
    }

    #[test]
    fn expired_binding_reads_as_miss() {
        let table = StickySessionTable::new(settings(100, 0));
        table.bind("s1", ProviderType::ClaudeKiroOAuth, "u1");
        std::thread::sleep(Duration::from_millis(5));
        assert!(table.touch("s1").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn overflow_evicts_exactly_ten_percent_of_cap() {
        let table = StickySessionTable::new(settings(30, 60_000));
        for i in 0..30 {
            table.bind(&format!("s{i}"), ProviderType::ClaudeCustom, "u");
            // Distinct access stamps so the LRU tail is well-defined.
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(table.len(), 30);
        table.bind("overflow", ProviderType::ClaudeCustom, "u");
        assert_eq!(table.len(), 30 - 3 + 1);
        // The oldest entries are the ones that went.
        assert!(table.touch("s0").is_none());
        assert!(table.touch("s1").is_none());
        assert!(table.touch("s2").is_none());
        assert!(table.touch("s3").is_some());
    }

    #[test]
    fn cleanup_drops_only_expired_entries() {
        let table = StickySessionTable::new(settings(100, 50));
        table.bind("old", ProviderType::ClaudeCustom, "u");
        std::thread::sleep(Duration::from_millis(80));
        table.bind("new", ProviderType::ClaudeCustom, "u");
        let removed = table.cleanup_expired();
        assert_eq!(removed, 1);
        assert!(table.touch("new").is_some());
    }
}
