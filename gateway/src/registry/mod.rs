use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// A single backend instance of a service.
///
/// `addr` is a base URL; a missing scheme defaults to `http://` at forward
/// time. `weight >= 1` on every instance of a service enables the weighted
/// balancing strategies; a `0` anywhere disables weighting for that service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub addr: String,
    #[serde(default)]
    pub weight: u32,
}

/// In-memory service table: service name → ordered instance list.
///
/// Insertion order is preserved and observable — round-robin selection visits
/// instances in the order they were registered. Reads hand out copies so that
/// callers iterate without holding the lock; mutations take the write lock.
pub struct Registry {
    services: RwLock<HashMap<String, Vec<Instance>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update an instance. An existing instance with the same id is
    /// replaced in place, keeping its position in the rotation.
    pub fn register(&self, service: &str, instance: Instance) {
        let mut services = self.services.write().unwrap();
        let instances = services.entry(service.to_string()).or_default();
        match instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => *existing = instance,
            None => instances.push(instance),
        }
    }

    /// Remove an instance by id. Unknown service or id is a no-op. An empty
    /// instance list is left behind — it reads the same as an unknown service.
    pub fn unregister(&self, service: &str, id: &str) {
        let mut services = self.services.write().unwrap();
        if let Some(instances) = services.get_mut(service) {
            instances.retain(|i| i.id != id);
        }
    }

    /// Snapshot of the instance list for a service. Empty when the service is
    /// unknown or has no live instances; the two are indistinguishable.
    pub fn instances(&self, service: &str) -> Vec<Instance> {
        let services = self.services.read().unwrap();
        services.get(service).cloned().unwrap_or_default()
    }

    /// Names of all registered services, in no particular order.
    pub fn services(&self) -> Vec<String> {
        let services = self.services.read().unwrap();
        services.keys().cloned().collect()
    }
}
