// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Model registry: immutable model definitions shared by reference.
//!
//! Models are registered once at startup (from configuration or an embedded
//! default set) and looked up by (provider, id).  Cost accounting helpers
//! live here because they depend only on the model's pricing table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::types::{Model, Usage};

static REGISTRY: RwLock<Option<HashMap<String, HashMap<String, Arc<Model>>>>> = RwLock::new(None);

/// Register (or replace) the model set for a provider.
pub fn register_models(provider: &str, models: Vec<Model>) {
    let mut guard = REGISTRY.write().unwrap_or_else(|p| p.into_inner());
    let map = guard.get_or_insert_with(HashMap::new);
    let entry = map.entry(provider.to_string()).or_default();
    for m in models {
        entry.insert(m.id.clone(), Arc::new(m));
    }
}

/// Look up a model by provider and id.
pub fn get_model(provider: &str, model_id: &str) -> Option<Arc<Model>> {
    let guard = REGISTRY.read().unwrap_or_else(|p| p.into_inner());
    guard
        .as_ref()?
        .get(provider)?
        .get(model_id)
        .cloned()
}

/// All providers with at least one registered model.
pub fn get_providers() -> Vec<String> {
    let guard = REGISTRY.read().unwrap_or_else(|p| p.into_inner());
    guard
        .as_ref()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

/// All models registered for a provider.
pub fn get_models(provider: &str) -> Vec<Arc<Model>> {
    let guard = REGISTRY.read().unwrap_or_else(|p| p.into_inner());
    guard
        .as_ref()
        .and_then(|m| m.get(provider))
        .map(|models| models.values().cloned().collect())
        .unwrap_or_default()
}

/// Fill in the dollar cost of `usage` from the model's per-megatoken prices.
pub fn calculate_cost(model: &Model, usage: &mut Usage) {
    let per = |price: f64, tokens: u64| price / 1_000_000.0 * tokens as f64;
    usage.cost.input = per(model.cost.input, usage.input);
    usage.cost.output = per(model.cost.output, usage.output);
    usage.cost.cache_read = per(model.cost.cache_read, usage.cache_read);
    usage.cost.cache_write = per(model.cost.cache_write, usage.cache_write);
    usage.cost.total =
        usage.cost.input + usage.cost.output + usage.cost.cache_read + usage.cost.cache_write;
}

/// Whether a model accepts the `xhigh` reasoning level.
pub fn supports_xhigh(model: &Model) -> bool {
    if model.id.contains("gpt-5.2") || model.id.contains("gpt-5.3") {
        return true;
    }
    if model.api == "anthropic-messages" {
        return model.id.contains("opus-4-6") || model.id.contains("opus-4.6");
    }
    false
}

/// Model identity comparison by (id, provider).
pub fn models_are_equal(a: Option<&Model>, b: Option<&Model>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.id == b.id && a.provider == b.provider,
        _ => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
