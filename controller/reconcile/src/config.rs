use crate::Reconciler;
use pod_configmap_controller_core::{configmap_name, EbpfView, Errors};
use pod_configmap_controller_k8s_index::{split_key, DELETED_PREFIX};

impl Reconciler {
    /// Converges every ConfigMap derived from one config: status first,
    /// then one pair sync per pod in the namespace.
    pub(crate) async fn reconcile_config(&self, key: &str) -> Result<(), Errors> {
        let (key, deleted) = match key.strip_prefix(DELETED_PREFIX) {
            Some(rest) => (rest, true),
            None => (key, false),
        };
        let Some((namespace, name)) = split_key(key) else {
            tracing::warn!(%key, "invalid config key");
            return Ok(());
        };

        if deleted {
            return self.handle_deleted_config(namespace, name).await;
        }
        let Some(config) = self.index.read().config(namespace, name) else {
            // Evicted from the cache between enqueue and processing.
            return self.handle_deleted_config(namespace, name).await;
        };

        // Status is best-effort: a failed write is logged and the
        // ConfigMaps still converge.
        if let Err(error) = self.status.sync(&self.index, namespace, name).await {
            tracing::warn!(%namespace, config = %name, %error, "failed to update status");
        }

        let pods = self.index.read().pods_in(namespace);
        let mut errors = Vec::new();
        let mut active = 0usize;
        for pod in pods {
            if pod.validate().is_err() {
                continue;
            }
            match self.sync_pair(&pod, &config).await {
                Ok(projected) => {
                    if projected {
                        active += 1;
                    }
                    // Kernel programs follow the config-keyed pass only:
                    // attach or update for covered pods, release for pods
                    // the selector no longer covers.
                    if let Some(ebpf_config) = &config.ebpf {
                        if projected {
                            self.ebpf.apply(&pod, &config.name, ebpf_config);
                        } else {
                            self.ebpf.apply(&pod, &config.name, &EbpfView::default());
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        %namespace,
                        config = %name,
                        pod = %pod.name,
                        %error,
                        "failed to sync ConfigMap for config",
                    );
                    errors.push(error);
                }
            }
        }
        self.metrics.set_active_configmaps(namespace, name, active);
        Errors::ok_if_empty(errors)
    }

    /// Deletes every ConfigMap whose name encodes the removed config and
    /// releases any kernel programs it had attached.
    async fn handle_deleted_config(&self, namespace: &str, name: &str) -> Result<(), Errors> {
        tracing::info!(%namespace, config = %name, "cleaning up after deleted config");
        self.ebpf.detach_policy(namespace, name);
        self.status.forget(namespace, name);
        self.metrics.forget_config(namespace, name);

        let pods = self.index.read().pods_in(namespace);
        let mut errors = Vec::new();
        for pod in pods {
            let cm_name = configmap_name(&pod.name, name);
            if let Err(error) = self.delete_configmap(namespace, &cm_name).await {
                errors.push(error);
            }
        }
        Errors::ok_if_empty(errors)
    }
}
