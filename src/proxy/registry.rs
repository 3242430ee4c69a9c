//! Model registry populated once at startup. Maps every public model id to
//! its provider adapter and backs the `/v1/models` catalog.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::proxy::providers::ProviderAdapter;

#[derive(Clone)]
struct ModelEntry {
    owner_tag: String,
    created_at: i64,
}

#[derive(Default)]
pub struct ProviderRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
    /// Insertion-ordered catalog: `modelId -> {ownerTag, createdAt}`.
    models: RwLock<Vec<(String, ModelEntry)>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter and all models it serves. Re-registering a
    /// model id updates the owner tag instead of duplicating the entry.
    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        let owner = adapter.name().to_string();
        let model_ids = adapter.models();
        self.adapters.write().insert(owner.clone(), adapter);

        let now = chrono::Utc::now().timestamp();
        let mut models = self.models.write();
        for id in model_ids {
            if let Some((_, entry)) = models.iter_mut().find(|(m, _)| *m == id) {
                entry.owner_tag = owner.clone();
            } else {
                models.push((
                    id,
                    ModelEntry {
                        owner_tag: owner.clone(),
                        created_at: now,
                    },
                ));
            }
        }
        tracing::info!("[Registry] Registered provider '{}'", owner);
    }

    pub fn resolve(&self, model: &str) -> Option<Arc<dyn ProviderAdapter>> {
        let owner = {
            let models = self.models.read();
            models
                .iter()
                .find(|(m, _)| m == model)
                .map(|(_, e)| e.owner_tag.clone())?
        };
        self.adapters.read().get(&owner).cloned()
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.read().iter().map(|(m, _)| m.clone()).collect()
    }

    /// OpenAI-shaped `/v1/models` payload.
    pub fn catalog(&self) -> Value {
        let data: Vec<Value> = self
            .models
            .read()
            .iter()
            .map(|(id, entry)| {
                json!({
                    "id": id,
                    "object": "model",
                    "created": entry.created_at,
                    "owned_by": entry.owner_tag,
                })
            })
            .collect();
        json!({ "object": "list", "data": data })
    }
}
