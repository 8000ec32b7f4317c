use crate::Reconciler;
use pod_configmap_controller_core::{configmap_name, Errors};
use pod_configmap_controller_k8s_index::split_key;

impl Reconciler {
    /// Converges every ConfigMap derived from one pod: one pair sync per
    /// config in the pod's namespace. Failed pairs are collected so one bad
    /// config cannot starve the others.
    pub(crate) async fn reconcile_pod(&self, key: &str) -> Result<(), Errors> {
        let Some((namespace, name)) = split_key(key) else {
            tracing::warn!(%key, "invalid pod key");
            return Ok(());
        };

        let Some(pod) = self.index.read().pod(namespace, name) else {
            return self.handle_deleted_pod(namespace, name).await;
        };

        if let Err(error) = pod.validate() {
            tracing::info!(%namespace, pod = %name, %error, "skipping pod");
            return Ok(());
        }

        let configs = self.index.read().configs_in(namespace);
        let mut errors = Vec::new();
        for config in configs {
            if let Err(error) = self.sync_pair(&pod, &config).await {
                tracing::warn!(
                    %namespace,
                    pod = %name,
                    config = %config.name,
                    %error,
                    "failed to sync ConfigMap for pod",
                );
                errors.push(error);
            }
        }
        Errors::ok_if_empty(errors)
    }

    /// The cluster's garbage collector removes owned ConfigMaps with the
    /// pod, but an explicit best-effort pass bounds the cleanup latency and
    /// covers ConfigMaps whose owner reference was never written.
    async fn handle_deleted_pod(&self, namespace: &str, name: &str) -> Result<(), Errors> {
        tracing::info!(%namespace, pod = %name, "cleaning up after deleted pod");
        self.ebpf.detach_pod(namespace, name);

        let configs = self.index.read().configs_in(namespace);
        let mut errors = Vec::new();
        for config in configs {
            let cm_name = configmap_name(name, &config.name);
            if let Err(error) = self.delete_configmap(namespace, &cm_name).await {
                errors.push(error);
            }
        }
        Errors::ok_if_empty(errors)
    }
}
