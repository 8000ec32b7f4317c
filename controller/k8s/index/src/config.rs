use crate::Index;
use pod_configmap_controller_k8s_api as k8s;

impl kubert::index::IndexNamespacedResource<k8s::PodConfigMapConfig> for Index {
    fn apply(&mut self, config: k8s::PodConfigMapConfig) {
        // The decode step turns the permissive wire object into the typed
        // view the reconcilers consume. An undecodable object is skipped
        // until a corrected revision arrives; there is nothing to retry.
        match config.to_view() {
            Ok(view) => self.apply_config(view),
            Err(error) => {
                tracing::warn!(%error, "skipping undecodable PodConfigMapConfig");
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_config(namespace, name);
    }
}

#[cfg(test)]
mod tests {
    use crate::test_helpers::{harness, mk_config};
    use crate::DELETED_PREFIX;
    use kubert::index::IndexNamespacedResource;
    use pod_configmap_controller_k8s_api as k8s;

    #[tokio::test]
    async fn apply_decodes_and_enqueues() {
        let h = harness();
        h.index
            .write()
            .apply(mk_config("default", "cfg", "1", 1, &["app"]));

        let cached = h.index.read().config("default", "cfg").unwrap();
        assert_eq!(cached.generation, 1);
        assert_eq!(cached.labels_to_include, vec!["app"]);
        assert_eq!(h.config_queue.next().await.unwrap(), "default/cfg");
    }

    #[tokio::test]
    async fn status_only_updates_are_enqueued() {
        let h = harness();
        h.index
            .write()
            .apply(mk_config("default", "cfg", "1", 1, &["app"]));
        assert_eq!(h.config_queue.next().await.unwrap(), "default/cfg");
        h.config_queue.done("default/cfg");

        // The status writer's own update comes back through the watch; the
        // changed observedGeneration makes it through suppression, and the
        // follow-up reconcile is then a no-op.
        let mut updated = mk_config("default", "cfg", "2", 1, &["app"]);
        updated.status = Some(k8s::PodConfigMapConfigStatus {
            observed_generation: 1,
        });
        h.index.write().apply(updated.clone());
        assert_eq!(h.config_queue.next().await.unwrap(), "default/cfg");
        h.config_queue.done("default/cfg");

        // Redelivery of the identical object is suppressed.
        h.index.write().apply(updated);
        assert!(h.config_queue.is_empty());
    }

    #[tokio::test]
    async fn undecodable_config_is_skipped() {
        let h = harness();
        let mut bad = mk_config("default", "cfg", "1", 1, &[]);
        bad.spec.ebpf_config = Some(k8s::EbpfConfig {
            l4_firewall: Some(k8s::L4FirewallConfig {
                enabled: true,
                default_action: "reject".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        h.index.write().apply(bad);

        assert!(h.index.read().config("default", "cfg").is_none());
        assert!(h.config_queue.is_empty());
    }

    #[tokio::test]
    async fn delete_enqueues_tombstone() {
        let h = harness();
        h.index
            .write()
            .apply(mk_config("default", "cfg", "1", 1, &[]));
        assert_eq!(h.config_queue.next().await.unwrap(), "default/cfg");
        h.config_queue.done("default/cfg");

        IndexNamespacedResource::<k8s::PodConfigMapConfig>::delete(
            &mut *h.index.write(),
            "default".to_string(),
            "cfg".to_string(),
        );
        assert!(h.index.read().config("default", "cfg").is_none());
        assert_eq!(
            h.config_queue.next().await.unwrap(),
            format!("{DELETED_PREFIX}default/cfg")
        );
    }
}
