use crate::Index;
use pod_configmap_controller_core::{PodPhase, PodView};
use pod_configmap_controller_k8s_api as k8s;

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        match pod_view(pod) {
            Some(view) => self.apply_pod(view),
            None => tracing::warn!("ignoring pod without namespace or name"),
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_pod(namespace, name);
    }

    // Applies and deletes are per-object, so the default reset handling is
    // sufficient.
}

/// Decodes the projection-relevant fields of a pod.
fn pod_view(pod: k8s::Pod) -> Option<PodView> {
    let k8s::Pod {
        metadata,
        spec,
        status,
    } = pod;

    let namespace = metadata.namespace.filter(|ns| !ns.is_empty())?;
    let name = metadata.name.filter(|n| !n.is_empty())?;

    let node_name = spec.and_then(|s| s.node_name).unwrap_or_default();
    let (phase, container_ids) = match status {
        Some(status) => {
            let phase = status
                .phase
                .as_deref()
                .map(PodPhase::parse)
                .unwrap_or(PodPhase::Unknown);
            let container_ids = status
                .container_statuses
                .into_iter()
                .flatten()
                .filter_map(|c| c.container_id)
                .collect();
            (phase, container_ids)
        }
        None => (PodPhase::Unknown, Vec::new()),
    };

    Some(PodView {
        namespace,
        name,
        uid: metadata.uid.unwrap_or_default(),
        node_name,
        phase,
        labels: metadata.labels.unwrap_or_default(),
        annotations: metadata.annotations.unwrap_or_default(),
        resource_version: metadata.resource_version.unwrap_or_default(),
        container_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{harness, mk_pod};
    use kubert::index::IndexNamespacedResource;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn apply_caches_and_enqueues() {
        let h = harness();
        h.index
            .write()
            .apply(mk_pod("default", "web-0", "1", &[("app", "web")]));

        let cached = h.index.read().pod("default", "web-0").unwrap();
        assert_eq!(cached.phase, PodPhase::Running);
        assert_eq!(cached.node_name, "node-a");
        assert_eq!(cached.labels.get("app").unwrap(), "web");
        assert_eq!(h.pod_queue.next().await.unwrap(), "default/web-0");
    }

    #[tokio::test]
    async fn unchanged_redelivery_is_suppressed() {
        let h = harness();
        let pod = mk_pod("default", "web-0", "1", &[("app", "web")]);
        h.index.write().apply(pod.clone());
        assert_eq!(h.pod_queue.next().await.unwrap(), "default/web-0");
        h.pod_queue.done("default/web-0");

        // A resync redelivers the same object at the same resourceVersion.
        h.index.write().apply(pod);
        assert!(h.pod_queue.is_empty());

        // A real change is enqueued.
        h.index
            .write()
            .apply(mk_pod("default", "web-0", "2", &[("app", "api")]));
        assert_eq!(h.pod_queue.next().await.unwrap(), "default/web-0");
    }

    #[tokio::test]
    async fn delete_evicts_and_enqueues() {
        let h = harness();
        h.index
            .write()
            .apply(mk_pod("default", "web-0", "1", &[]));
        assert_eq!(h.pod_queue.next().await.unwrap(), "default/web-0");
        h.pod_queue.done("default/web-0");

        IndexNamespacedResource::<k8s::Pod>::delete(
            &mut *h.index.write(),
            "default".to_string(),
            "web-0".to_string(),
        );
        assert!(h.index.read().pod("default", "web-0").is_none());
        assert_eq!(h.pod_queue.next().await.unwrap(), "default/web-0");
    }

    #[tokio::test]
    async fn followers_do_not_enqueue() {
        let h = harness();
        h.gate.store(false, Ordering::Release);
        h.index
            .write()
            .apply(mk_pod("default", "web-0", "1", &[]));

        // The cache still warms so a newly elected leader can re-enqueue it.
        assert!(h.index.read().pod("default", "web-0").is_some());
        assert!(h.pod_queue.is_empty());

        h.gate.store(true, Ordering::Release);
        h.index.read().enqueue_all();
        assert_eq!(h.pod_queue.next().await.unwrap(), "default/web-0");
    }
}
