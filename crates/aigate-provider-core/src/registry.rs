use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::UpstreamAdapter;
use crate::types::ProviderType;

#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderType, Arc<dyn UpstreamAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn UpstreamAdapter>) {
        self.adapters.insert(adapter.provider_type(), adapter);
    }

    pub fn get(&self, provider_type: ProviderType) -> Option<Arc<dyn UpstreamAdapter>> {
        self.adapters.get(&provider_type).cloned()
    }

    pub fn types(&self) -> Vec<ProviderType> {
        self.adapters.keys().copied().collect()
    }
}
