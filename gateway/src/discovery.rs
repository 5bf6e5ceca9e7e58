//! Service discovery resolution for `lb://` targets.
//!
//! The registry itself is an external collaborator; the gateway consumes
//! its current instance set through [`ServiceRegistry`] and picks one
//! instance per dispatch with health-weighted round-robin.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One upstream instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    /// Base URL, e.g. `http://10.0.0.5:8082`.
    pub base_url: String,
    /// Health weight; 0 removes the instance from rotation.
    pub weight: u32,
}

impl Instance {
    /// Create an instance with weight 1.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            weight: 1,
        }
    }
}

/// Current instance set per service name.
pub trait ServiceRegistry: Send + Sync {
    /// The instances currently registered for `service`.
    fn instances(
        &self,
        service: &str,
    ) -> Pin<Box<dyn Future<Output = Vec<Instance>> + Send + '_>>;
}

/// Fixed registry populated from configuration; replaceable at runtime.
#[derive(Default)]
pub struct StaticRegistry {
    services: Mutex<HashMap<String, Vec<Instance>>>,
}

impl StaticRegistry {
    /// Create a registry from `(service, instances)` pairs.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = (String, Vec<Instance>)>) -> Self {
        Self {
            services: Mutex::new(entries.into_iter().collect()),
        }
    }

    /// Replace one service's instance set.
    pub fn set(&self, service: &str, instances: Vec<Instance>) {
        if let Ok(mut services) = self.services.lock() {
            services.insert(service.to_string(), instances);
        }
    }
}

impl ServiceRegistry for StaticRegistry {
    fn instances(
        &self,
        service: &str,
    ) -> Pin<Box<dyn Future<Output = Vec<Instance>> + Send + '_>> {
        let service = service.to_string();
        Box::pin(async move {
            self.services
                .lock()
                .ok()
                .and_then(|services| services.get(&service).cloned())
                .unwrap_or_default()
        })
    }
}

/// Health-weighted round-robin instance picker.
#[derive(Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    /// Create a picker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Pick the next instance, weighting by health. `None` when the set is
    /// empty or entirely weighted zero.
    #[must_use]
    pub fn pick<'a>(&self, instances: &'a [Instance]) -> Option<&'a Instance> {
        let total: usize = instances.iter().map(|i| i.weight as usize).sum();
        if total == 0 {
            return None;
        }

        let mut slot = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        for instance in instances {
            let weight = instance.weight as usize;
            if slot < weight {
                return Some(instance);
            }
            slot -= weight;
        }
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_instances() {
        let picker = RoundRobin::new();
        let instances = vec![Instance::new("http://a"), Instance::new("http://b")];

        let picks: Vec<&str> = (0..4)
            .map(|_| picker.pick(&instances).unwrap().base_url.as_str())
            .collect();
        assert_eq!(picks, vec!["http://a", "http://b", "http://a", "http://b"]);
    }

    #[test]
    fn weights_skew_the_rotation() {
        let picker = RoundRobin::new();
        let instances = vec![
            Instance {
                base_url: "http://heavy".to_string(),
                weight: 3,
            },
            Instance::new("http://light"),
        ];

        let heavy = (0..40)
            .filter(|_| picker.pick(&instances).unwrap().base_url == "http://heavy")
            .count();
        assert_eq!(heavy, 30);
    }

    #[test]
    fn zero_weight_instances_are_skipped() {
        let picker = RoundRobin::new();
        let instances = vec![
            Instance {
                base_url: "http://down".to_string(),
                weight: 0,
            },
            Instance::new("http://up"),
        ];

        for _ in 0..5 {
            assert_eq!(picker.pick(&instances).unwrap().base_url, "http://up");
        }
    }

    #[test]
    fn empty_set_yields_none() {
        let picker = RoundRobin::new();
        assert!(picker.pick(&[]).is_none());
    }

    #[tokio::test]
    async fn static_registry_resolves_and_updates() {
        let registry = StaticRegistry::new([(
            "orders".to_string(),
            vec![Instance::new("http://orders-1")],
        )]);

        assert_eq!(registry.instances("orders").await.len(), 1);
        assert!(registry.instances("unknown").await.is_empty());

        registry.set("orders", vec![]);
        assert!(registry.instances("orders").await.is_empty());
    }
}
