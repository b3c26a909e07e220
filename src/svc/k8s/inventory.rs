//! # Inventory module
//!
//! This module provide the batched background sync fed by namespace events,
//! it keeps the binding registry consistent with the live namespace set

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use k8s_openapi::api::core::v1::Namespace;
use kube::{api::ListParams, Api, ResourceExt};
use tracing::{debug, info, warn};

use crate::svc::k8s::State;

// -----------------------------------------------------------------------------
// Constants

pub const SYNC_PERIOD: Duration = Duration::from_secs(60);

// -----------------------------------------------------------------------------
// Batcher structure

/// namespace events drop a key here, the background task drains the batch on
/// a period instead of reacting to every event
#[derive(Default)]
pub struct Batcher {
    keys: Mutex<BTreeSet<String>>,
}

impl Batcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: &str) {
        self.lock().insert(key.to_string());
    }

    pub fn drain(&self) -> Vec<String> {
        let mut keys = self.lock();
        let drained = keys.iter().cloned().collect();
        keys.clear();

        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// -----------------------------------------------------------------------------
// Background task

/// drain the batch periodically and drop bindings whose namespace is gone
pub async fn run(state: Arc<State>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let batch = state.inventory.drain();
        if batch.is_empty() {
            continue;
        }

        debug!(batch = batch.len(), "Run inventory sync for batched namespace keys");

        let api: Api<Namespace> = Api::all(state.kube.to_owned());
        let live: Vec<String> = match api.list(&ListParams::default()).await {
            Ok(namespaces) => namespaces
                .items
                .iter()
                .filter(|namespace| namespace.metadata.deletion_timestamp.is_none())
                .map(ResourceExt::name_any)
                .collect(),
            Err(err) => {
                warn!(error = err.to_string(), "Failed to list namespaces for inventory sync");
                continue;
            }
        };

        let dropped = state.bindings.retain_namespaces(&live);
        if !dropped.is_empty() {
            info!(
                dropped = dropped.join(", "),
                "Unregistered bindings of deleted namespaces"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_should_empty_the_batch() {
        let batcher = Batcher::new();
        batcher.add("ns-a");
        batcher.add("ns-b");
        batcher.add("ns-a");

        assert_eq!(batcher.len(), 2);
        assert_eq!(batcher.drain(), vec!["ns-a".to_string(), "ns-b".to_string()]);
        assert!(batcher.is_empty());
    }
}
