//! Owns one [`ProviderClient`] per physical model (spec §4.2).

use std::collections::HashMap;
use std::sync::Arc;

use mindmap_core::{CoreError, PhysicalModel, Result};

use crate::provider::ProviderClient;
use crate::providers;

/// Configured once at startup; no hot reload.
pub struct ClientPool {
    clients: HashMap<PhysicalModel, Arc<dyn ProviderClient>>,
}

impl ClientPool {
    /// Build a pool covering every physical model this deployment knows
    /// about (`providers::all_physical_models`).
    pub fn new() -> Result<Self> {
        let mut clients = HashMap::new();
        for physical_model in providers::all_physical_models() {
            let client = providers::build_client(&physical_model)?;
            clients.insert(physical_model, client);
        }
        Ok(Self { clients })
    }

    /// Build a pool from an explicit set of clients — used by tests to
    /// substitute stubs for real provider adapters.
    pub fn from_clients(clients: HashMap<PhysicalModel, Arc<dyn ProviderClient>>) -> Self {
        Self { clients }
    }

    pub fn get(&self, physical_model: &str) -> Result<Arc<dyn ProviderClient>> {
        self.clients
            .get(physical_model)
            .cloned()
            .ok_or_else(|| CoreError::UnknownModel(physical_model.to_string()))
    }

    pub fn physical_models(&self) -> Vec<PhysicalModel> {
        self.clients.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_support::StubProvider;

    #[test]
    fn unknown_model_is_distinct_error() {
        let pool = ClientPool::from_clients(HashMap::new());
        let err = pool.get("nope").unwrap_err();
        assert_eq!(err.kind(), "unknown_model");
    }

    #[test]
    fn known_model_resolves() {
        let mut clients: HashMap<PhysicalModel, Arc<dyn ProviderClient>> = HashMap::new();
        clients.insert("qwen".to_string(), Arc::new(StubProvider::new("qwen")));
        let pool = ClientPool::from_clients(clients);
        assert!(pool.get("qwen").is_ok());
    }
}
