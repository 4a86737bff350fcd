//! Provider pool runtime: credential selection, health lifecycle, sticky
//! sessions, fallback cascades, and debounced pool-file persistence.

mod dispatch;
mod health;
mod persist;
mod pool;
mod sticky;

pub use dispatch::{Gateway, RoutedStream};
pub use health::spawn_health_scheduler;
pub use persist::DebouncedPersistor;
pub use pool::{FallbackSelection, PoolTuning, ProviderPool, ProviderStats, SelectOptions};
pub use sticky::{SessionBinding, StickySessionTable};
