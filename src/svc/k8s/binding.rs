//! # Binding module
//!
//! This module provide the process-wide registry mapping namespaces to the
//! network configuration they draw vpc settings from

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

// -----------------------------------------------------------------------------
// Registry structure

/// read-through registry, every non-terminating namespace has exactly one
/// entry while the operator is idle
#[derive(Default)]
pub struct Registry {
    inner: Mutex<HashMap<String, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// bind the namespace to the given network configuration, replacing any
    /// previous binding
    pub fn bind(&self, namespace: &str, network_config: &str) {
        self.lock()
            .insert(namespace.to_string(), network_config.to_string());
    }

    /// remove the namespace's binding, returns the previous one if any
    pub fn unbind(&self, namespace: &str) -> Option<String> {
        self.lock().remove(namespace)
    }

    pub fn get(&self, namespace: &str) -> Option<String> {
        self.lock().get(namespace).cloned()
    }

    /// returns every namespace bound to the given network configuration,
    /// used by the fan-out on configuration change
    pub fn namespaces_for(&self, network_config: &str) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, bound)| bound.as_str() == network_config)
            .map(|(namespace, _)| namespace.to_owned())
            .collect();

        namespaces.sort();
        namespaces
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.lock().to_owned()
    }

    /// drop bindings for namespaces absent from the given live set, invoked
    /// by the background inventory sync
    pub fn retain_namespaces(&self, live: &[String]) -> Vec<String> {
        let mut dropped = vec![];
        self.lock().retain(|namespace, _| {
            if live.iter().any(|l| l == namespace) {
                true
            } else {
                dropped.push(namespace.to_owned());
                false
            }
        });

        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_should_replace_previous_binding() {
        let registry = Registry::new();
        registry.bind("ns-a", "default");
        registry.bind("ns-a", "nc-1");

        assert_eq!(registry.get("ns-a"), Some("nc-1".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn namespaces_for_should_filter_by_configuration() {
        let registry = Registry::new();
        registry.bind("ns-a", "nc-1");
        registry.bind("ns-b", "nc-2");
        registry.bind("ns-c", "nc-1");

        assert_eq!(
            registry.namespaces_for("nc-1"),
            vec!["ns-a".to_string(), "ns-c".to_string()]
        );
    }

    #[test]
    fn retain_should_drop_gone_namespaces() {
        let registry = Registry::new();
        registry.bind("ns-a", "nc-1");
        registry.bind("ns-b", "nc-1");

        let dropped = registry.retain_namespaces(&["ns-a".to_string()]);

        assert_eq!(dropped, vec!["ns-b".to_string()]);
        assert_eq!(registry.get("ns-b"), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unbind_should_return_previous_binding() {
        let registry = Registry::new();
        registry.bind("ns-a", "nc-1");

        assert_eq!(registry.unbind("ns-a"), Some("nc-1".to_string()));
        assert_eq!(registry.unbind("ns-a"), None);
        assert!(registry.is_empty());
    }
}
