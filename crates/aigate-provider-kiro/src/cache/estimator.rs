use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use aigate_protocol::MessagesRequest;

use super::hash::{
    ToolResultStrategy, message_content_hash, message_projection, static_prefix_projection,
    stable_prefix_hash,
};
use super::min_cacheable_tokens;
use super::tokens::count_text_tokens;

const DEFAULT_ENTRY_CAPACITY: usize = 500;
/// Matches the upstream prompt-cache TTL.
const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_ACCOUNT_CAPACITY: usize = 100;
const DEFAULT_ACCOUNT_TTL: Duration = Duration::from_secs(60 * 60);

/// The reconstructed split. Components always sum to the request total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheSplit {
    pub cache_read: u64,
    pub cache_creation: u64,
    pub uncached: u64,
}

impl CacheSplit {
    fn all_uncached(total: u64) -> Self {
        Self {
            cache_read: 0,
            cache_creation: 0,
            uncached: total,
        }
    }

    pub fn total(&self) -> u64 {
        self.cache_read + self.cache_creation + self.uncached
    }
}

#[derive(Debug, Clone)]
struct CachedMessage {
    index: usize,
    content_hash: String,
    tokens: u64,
}

#[derive(Debug, Clone)]
struct PrefixEntry {
    static_prefix_tokens: u64,
    prefix_messages_tokens: u64,
    cached_messages: Vec<CachedMessage>,
    all_messages_tokens: Vec<u64>,
    hit_count: u64,
    timestamp: Instant,
}

/// One account's worth of recent static-prefix history.
#[derive(Debug)]
pub struct AccountEstimator {
    entries: HashMap<String, PrefixEntry>,
    capacity: usize,
    ttl: Duration,
    optimistic: bool,
    debug: bool,
    strategy: ToolResultStrategy,
}

impl AccountEstimator {
    pub fn new(optimistic: bool, debug: bool) -> Self {
        Self::with_limits(optimistic, debug, DEFAULT_ENTRY_CAPACITY, DEFAULT_ENTRY_TTL)
    }

    pub fn with_limits(optimistic: bool, debug: bool, capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            ttl,
            optimistic,
            debug,
            strategy: ToolResultStrategy::default(),
        }
    }

    /// Reconstruct `(cache_read, cache_creation, uncached)` for one request.
    /// `total_input_tokens` is the externally counted request total; the
    /// returned components always sum to it.
    pub fn estimate(&mut self, request: &MessagesRequest, total_input_tokens: u64) -> CacheSplit {
        let system_has_cc = request
            .system
            .as_ref()
            .map(|system| system.has_cache_control())
            .unwrap_or(false);
        let tools_have_cc = request
            .tools
            .last()
            .map(|tool| tool.cache_control.is_some())
            .unwrap_or(false);
        let breakpoint = request
            .messages
            .iter()
            .rposition(|message| message.has_cache_control());

        if !system_has_cc && !tools_have_cc && breakpoint.is_none() {
            return CacheSplit::all_uncached(total_input_tokens);
        }

        let message_tokens: Vec<u64> = request
            .messages
            .iter()
            .map(|message| count_text_tokens(&message_projection(message, self.strategy)))
            .collect();
        let prefix_len = breakpoint.map(|k| k + 1).unwrap_or(0);
        let prefix_messages_tokens: u64 = message_tokens[..prefix_len].iter().sum();

        let static_prefix_tokens = count_text_tokens(&static_prefix_projection(request));
        let static_cacheable = if system_has_cc || tools_have_cc {
            static_prefix_tokens
        } else {
            0
        };
        let total_cacheable = static_cacheable + prefix_messages_tokens;
        if total_cacheable < min_cacheable_tokens(&request.model) {
            return CacheSplit::all_uncached(total_input_tokens);
        }

        let prefix_hash = stable_prefix_hash(request);
        let current: Vec<CachedMessage> = request.messages[..prefix_len]
            .iter()
            .enumerate()
            .map(|(index, message)| CachedMessage {
                index,
                content_hash: message_content_hash(message, self.strategy),
                tokens: message_tokens[index],
            })
            .collect();

        let now = Instant::now();
        let live_entry = self
            .entries
            .get(&prefix_hash)
            .filter(|entry| now.duration_since(entry.timestamp) <= self.ttl);

        let (mut cache_read, mut cache_creation) = match live_entry {
            None => (0, total_cacheable),
            Some(entry) => {
                if self.debug {
                    debug!(
                        static_tokens = entry.static_prefix_tokens,
                        prefix_tokens = entry.prefix_messages_tokens,
                        stored_messages = entry.all_messages_tokens.len(),
                        hits = entry.hit_count,
                        "prefix cache hit"
                    );
                }
                let (read, creation) = if self.optimistic {
                    self.compare_optimistic(entry, &current)
                } else {
                    self.compare_strict(entry, &current)
                };
                // The prefix hash matching means the static parts matched.
                (read + static_cacheable, creation)
            }
        };

        let hit_count = live_entry.map(|entry| entry.hit_count + 1).unwrap_or(1);
        self.entries.insert(
            prefix_hash,
            PrefixEntry {
                static_prefix_tokens,
                prefix_messages_tokens,
                cached_messages: current,
                all_messages_tokens: message_tokens,
                hit_count,
                timestamp: now,
            },
        );
        self.evict(now);

        // Clamp so the three components always sum to the reported total.
        cache_read = cache_read.min(total_input_tokens);
        cache_creation = cache_creation.min(total_input_tokens - cache_read);
        let uncached = total_input_tokens - cache_read - cache_creation;
        CacheSplit {
            cache_read,
            cache_creation,
            uncached,
        }
    }

    /// A single mismatch breaks the prefix; everything after it is written
    /// fresh. This mirrors real prefix-cache semantics.
    fn compare_strict(&self, entry: &PrefixEntry, current: &[CachedMessage]) -> (u64, u64) {
        let mut cache_read = 0;
        let mut broken_at = current.len();
        for (index, message) in current.iter().enumerate() {
            let matches = entry
                .cached_messages
                .get(index)
                .map(|stored| stored.content_hash == message.content_hash)
                .unwrap_or(false);
            if matches {
                cache_read += message.tokens;
            } else {
                broken_at = index;
                break;
            }
        }
        let cache_creation = current[broken_at..]
            .iter()
            .map(|message| message.tokens)
            .sum();
        if self.debug {
            debug!(
                matched = broken_at,
                total = current.len(),
                "strict cache comparison"
            );
        }
        (cache_read, cache_creation)
    }

    /// Every individually matching message counts as a hit, holes included.
    /// Overestimates real upstream hits; documented trade-off.
    fn compare_optimistic(&self, entry: &PrefixEntry, current: &[CachedMessage]) -> (u64, u64) {
        let mut cache_read = 0;
        let mut cache_creation = 0;
        let mut matched = 0usize;
        for (index, message) in current.iter().enumerate() {
            let matches = entry
                .cached_messages
                .get(index)
                .map(|stored| stored.content_hash == message.content_hash)
                .unwrap_or(false);
            if matches {
                cache_read += message.tokens;
                matched += 1;
            } else {
                cache_creation += message.tokens;
                if self.debug {
                    debug!(index = message.index, "cache miss at message");
                }
            }
        }
        if self.debug {
            debug!(
                matched,
                total = current.len(),
                "optimistic cache comparison"
            );
        }
        (cache_read, cache_creation)
    }

    fn evict(&mut self, now: Instant) {
        self.entries
            .retain(|_, entry| now.duration_since(entry.timestamp) <= self.ttl);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.timestamp)
                .map(|(hash, _)| hash.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

struct AccountSlot {
    estimator: AccountEstimator,
    last_access: Instant,
}

/// Per-account estimators behind a global LRU so memory stays bounded:
/// different credentials see different upstream caches.
pub struct CacheEstimatorRegistry {
    accounts: Mutex<HashMap<String, AccountSlot>>,
    capacity: usize,
    ttl: Duration,
    optimistic: bool,
    debug: bool,
}

impl CacheEstimatorRegistry {
    pub fn new(optimistic: bool, debug: bool) -> Self {
        Self::with_limits(optimistic, debug, DEFAULT_ACCOUNT_CAPACITY, DEFAULT_ACCOUNT_TTL)
    }

    pub fn with_limits(optimistic: bool, debug: bool, capacity: usize, ttl: Duration) -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            capacity,
            ttl,
            optimistic,
            debug,
        }
    }

    pub fn estimate(
        &self,
        account_id: &str,
        request: &MessagesRequest,
        total_input_tokens: u64,
    ) -> CacheSplit {
        let now = Instant::now();
        let mut accounts = self.accounts.lock().expect("estimator registry poisoned");
        accounts.retain(|_, slot| now.duration_since(slot.last_access) <= self.ttl);
        if !accounts.contains_key(account_id) && accounts.len() >= self.capacity {
            if let Some(oldest) = accounts
                .iter()
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(id, _)| id.clone())
            {
                accounts.remove(&oldest);
            }
        }
        let slot = accounts
            .entry(account_id.to_string())
            .or_insert_with(|| AccountSlot {
                estimator: AccountEstimator::new(self.optimistic, self.debug),
                last_access: now,
            });
        slot.last_access = now;
        slot.estimator.estimate(request, total_input_tokens)
    }

    pub fn account_count(&self) -> usize {
        self.accounts.lock().expect("estimator registry poisoned").len()
    }
}
