use crate::queue::{Queue, DELETED_PREFIX};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use pod_configmap_controller_core::{ConfigView, PodView};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Cached views of Pods and PodConfigMapConfigs, grouped by namespace.
///
/// A single writer (the informer tasks, via `kubert::index`) mutates the
/// maps; reconcile workers are concurrent readers. Followers keep the cache
/// warm at all times, but enqueueing is gated on leadership so that only one
/// replica cluster-wide drives writes.
pub struct Index {
    namespaces: HashMap<String, NamespaceIndex>,
    pod_queue: Queue,
    config_queue: Queue,
    enqueue_enabled: Arc<AtomicBool>,
}

#[derive(Default)]
struct NamespaceIndex {
    pods: HashMap<String, Arc<PodView>>,
    configs: HashMap<String, Arc<ConfigView>>,
}

impl Index {
    pub fn shared(
        pod_queue: Queue,
        config_queue: Queue,
        enqueue_enabled: Arc<AtomicBool>,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            namespaces: HashMap::default(),
            pod_queue,
            config_queue,
            enqueue_enabled,
        }))
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Arc<PodView>> {
        self.namespaces.get(namespace)?.pods.get(name).cloned()
    }

    pub fn config(&self, namespace: &str, name: &str) -> Option<Arc<ConfigView>> {
        self.namespaces.get(namespace)?.configs.get(name).cloned()
    }

    pub fn pods_in(&self, namespace: &str) -> Vec<Arc<PodView>> {
        self.namespaces
            .get(namespace)
            .map(|ns| ns.pods.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn configs_in(&self, namespace: &str) -> Vec<Arc<ConfigView>> {
        self.namespaces
            .get(namespace)
            .map(|ns| ns.configs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Re-enqueues every cached object. Invoked when leadership is acquired
    /// (to warm-start the queues from the follower cache) and on every
    /// resync tick (to repair out-of-band drift in the generated
    /// ConfigMaps).
    pub fn enqueue_all(&self) {
        for (namespace, ns) in &self.namespaces {
            for name in ns.pods.keys() {
                self.enqueue_pod(namespace, name);
            }
            for name in ns.configs.keys() {
                self.enqueue_config(namespace, name);
            }
        }
    }

    pub(crate) fn apply_pod(&mut self, pod: PodView) {
        let (namespace, name) = (pod.namespace.clone(), pod.name.clone());
        let pod = Arc::new(pod);
        let ns = self.namespaces.entry(namespace.clone()).or_default();
        // Suppress event storms: a redelivery that decodes to the cached
        // view (resourceVersion included) is not re-enqueued.
        let changed = ns.pods.get(&name).is_none_or(|old| **old != *pod);
        ns.pods.insert(name.clone(), pod);
        if changed {
            self.enqueue_pod(&namespace, &name);
        }
    }

    pub(crate) fn delete_pod(&mut self, namespace: String, name: String) {
        if let Some(ns) = self.namespaces.get_mut(&namespace) {
            ns.pods.remove(&name);
            if ns.pods.is_empty() && ns.configs.is_empty() {
                self.namespaces.remove(&namespace);
            }
        }
        self.enqueue_pod(&namespace, &name);
    }

    pub(crate) fn apply_config(&mut self, config: ConfigView) {
        let (namespace, name) = (config.namespace.clone(), config.name.clone());
        let config = Arc::new(config);
        let ns = self.namespaces.entry(namespace.clone()).or_default();
        let changed = ns.configs.get(&name).is_none_or(|old| **old != *config);
        ns.configs.insert(name.clone(), config);
        if changed {
            self.enqueue_config(&namespace, &name);
        }
    }

    pub(crate) fn delete_config(&mut self, namespace: String, name: String) {
        if let Some(ns) = self.namespaces.get_mut(&namespace) {
            ns.configs.remove(&name);
            if ns.pods.is_empty() && ns.configs.is_empty() {
                self.namespaces.remove(&namespace);
            }
        }
        if self.enqueue_enabled.load(Ordering::Acquire) {
            self.config_queue
                .add(format!("{DELETED_PREFIX}{namespace}/{name}"));
        }
    }

    fn enqueue_pod(&self, namespace: &str, name: &str) {
        if self.enqueue_enabled.load(Ordering::Acquire) {
            self.pod_queue.add(format!("{namespace}/{name}"));
        }
    }

    fn enqueue_config(&self, namespace: &str, name: &str) {
        if self.enqueue_enabled.load(Ordering::Acquire) {
            self.config_queue.add(format!("{namespace}/{name}"));
        }
    }
}

/// Splits a queue key into (namespace, name).
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (namespace, name) = key.split_once('/')?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((namespace, name))
}
