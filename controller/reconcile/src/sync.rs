use crate::{metrics::Operation, Reconciler};
use pod_configmap_controller_core::{project, ConfigView, Error, PodView, Projection};
use pod_configmap_controller_k8s_api as k8s;
use rand::Rng;
use std::time::Duration;
use tokio::time;

impl Reconciler {
    /// Converges the ConfigMap for a single (pod, config) pair. Returns
    /// whether the pair currently projects a ConfigMap (false when the
    /// selector excludes the pod).
    pub(crate) async fn sync_pair(&self, pod: &PodView, config: &ConfigView) -> Result<bool, Error> {
        if let Some(selector) = &config.pod_selector {
            if !selector.matches(&pod.labels) {
                // A pod that stopped matching must lose its ConfigMap.
                let name = pod_configmap_controller_core::configmap_name(&pod.name, &config.name);
                self.delete_configmap(&pod.namespace, &name).await?;
                return Ok(false);
            }
        }

        let projection = project(pod, config)?;
        self.apply_configmap(pod, projection).await?;
        Ok(true)
    }

    /// The create-or-update loop. Reads always hit the API server, never
    /// the cache: a ConfigMap written moments ago may not have landed in
    /// the informer yet, and diffing against a stale copy would thrash.
    async fn apply_configmap(&self, pod: &PodView, projection: Projection) -> Result<(), Error> {
        let api = k8s::Api::<k8s::ConfigMap>::namespaced(self.client.clone(), &pod.namespace);
        let owner = owner_reference(pod);
        let resource = format!("{}/{}", pod.namespace, projection.name);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_apply(&api, pod, &projection, &owner).await {
                Ok(op) => {
                    if op != Operation::Noop {
                        tracing::info!(
                            namespace = %pod.namespace,
                            configmap = %projection.name,
                            pod = %pod.name,
                            operation = op.as_str(),
                            "reconciled ConfigMap",
                        );
                    }
                    self.metrics.record_operation(op, &pod.namespace, true);
                    return Ok(());
                }
                Err(error) if k8s::is_conflict(&error) && attempt < self.settings.max_retries => {
                    time::sleep(conflict_backoff(attempt)).await;
                }
                Err(error) => {
                    self.metrics
                        .record_operation(Operation::Update, &pod.namespace, false);
                    return Err(Error::api("apply-configmap", resource, error));
                }
            }
        }
    }

    async fn try_apply(
        &self,
        api: &k8s::Api<k8s::ConfigMap>,
        pod: &PodView,
        projection: &Projection,
        owner: &k8s::OwnerReference,
    ) -> Result<Operation, k8s::Error> {
        match api.get(&projection.name).await {
            Err(error) if k8s::is_not_found(&error) => {
                let cm = new_configmap(&pod.namespace, projection, owner);
                // AlreadyExists means another writer won the race; surface
                // it as a conflict so the loop re-reads and diffs.
                api.create(&k8s::PostParams::default(), &cm).await?;
                Ok(Operation::Create)
            }
            Err(error) => Err(error),
            Ok(existing) => match merge_configmap(&existing, projection, owner) {
                None => Ok(Operation::Noop),
                Some(merged) => {
                    // The merged object carries the live resourceVersion, so
                    // a concurrent writer surfaces as a 409.
                    api.replace(&projection.name, &k8s::PostParams::default(), &merged)
                        .await?;
                    Ok(Operation::Update)
                }
            },
        }
    }

    /// Best-effort delete: NotFound is success.
    pub(crate) async fn delete_configmap(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api = k8s::Api::<k8s::ConfigMap>::namespaced(self.client.clone(), namespace);
        match api.delete(name, &k8s::DeleteParams::default()).await {
            Ok(_) => {
                tracing::info!(%namespace, configmap = %name, "deleted ConfigMap");
                self.metrics
                    .record_operation(Operation::Delete, namespace, true);
                Ok(())
            }
            Err(error) if k8s::is_not_found(&error) => Ok(()),
            Err(error) => {
                self.metrics
                    .record_operation(Operation::Delete, namespace, false);
                Err(Error::api(
                    "delete-configmap",
                    format!("{namespace}/{name}"),
                    error,
                ))
            }
        }
    }
}

/// The controller reference tying a generated ConfigMap to its pod, so
/// cluster garbage collection removes the ConfigMap with the pod.
pub(crate) fn owner_reference(pod: &PodView) -> k8s::OwnerReference {
    k8s::OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name: pod.name.clone(),
        uid: pod.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn new_configmap(
    namespace: &str,
    projection: &Projection,
    owner: &k8s::OwnerReference,
) -> k8s::ConfigMap {
    k8s::ConfigMap {
        metadata: k8s::ObjectMeta {
            name: Some(projection.name.clone()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner.clone()]),
            labels: Some(projection.labels.clone()),
            ..Default::default()
        },
        data: Some(projection.data.clone()),
        ..Default::default()
    }
}

/// Computes the updated ConfigMap when the live object differs from the
/// projection; `None` means no write is needed. The body and owner list are
/// replaced outright, but only the controller's two reserved labels are
/// touched so user-added labels survive.
pub(crate) fn merge_configmap(
    existing: &k8s::ConfigMap,
    projection: &Projection,
    owner: &k8s::OwnerReference,
) -> Option<k8s::ConfigMap> {
    let mut merged = existing.clone();
    let mut changed = false;

    if merged.data.as_ref() != Some(&projection.data) {
        merged.data = Some(projection.data.clone());
        changed = true;
    }

    let owners = std::slice::from_ref(owner);
    if merged.metadata.owner_references.as_deref() != Some(owners) {
        merged.metadata.owner_references = Some(vec![owner.clone()]);
        changed = true;
    }

    let labels = merged.metadata.labels.get_or_insert_with(Default::default);
    for (key, value) in &projection.labels {
        if labels.get(key) != Some(value) {
            labels.insert(key.clone(), value.clone());
            changed = true;
        }
    }

    changed.then_some(merged)
}

fn conflict_backoff(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..25);
    Duration::from_millis(u64::from(50 * attempt + jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pod_configmap_controller_core::{PodPhase, Projection};
    use std::collections::BTreeMap;

    fn pod() -> PodView {
        PodView {
            namespace: "default".to_string(),
            name: "web-0".to_string(),
            uid: "uid-1".to_string(),
            node_name: "node-a".to_string(),
            phase: PodPhase::Running,
            labels: Default::default(),
            annotations: Default::default(),
            resource_version: "1".to_string(),
            container_ids: vec![],
        }
    }

    fn projection() -> Projection {
        let mut data = BTreeMap::new();
        data.insert("podName".to_string(), "web-0".to_string());
        data.insert("pcmcName".to_string(), "cfg".to_string());
        let mut labels = BTreeMap::new();
        labels.insert(
            "podconfig.example.com/generated-by-pcmc".to_string(),
            "cfg".to_string(),
        );
        labels.insert("podconfig.example.com/pod-uid".to_string(), "uid-1".to_string());
        Projection {
            name: "pod-web-0-from-cfg-cfg".to_string(),
            data,
            labels,
        }
    }

    fn live(projection: &Projection, owner: &k8s::OwnerReference) -> k8s::ConfigMap {
        let mut cm = new_configmap("default", projection, owner);
        cm.metadata.resource_version = Some("5".to_string());
        cm
    }

    #[test]
    fn in_sync_objects_need_no_write() {
        let owner = owner_reference(&pod());
        let projection = projection();
        let existing = live(&projection, &owner);
        assert_eq!(merge_configmap(&existing, &projection, &owner), None);
    }

    #[test]
    fn drifted_data_is_replaced() {
        let owner = owner_reference(&pod());
        let projection = projection();
        let mut existing = live(&projection, &owner);
        existing
            .data
            .as_mut()
            .unwrap()
            .insert("podName".to_string(), "stale".to_string());
        existing
            .data
            .as_mut()
            .unwrap()
            .insert("extra".to_string(), "junk".to_string());

        let merged = merge_configmap(&existing, &projection, &owner).unwrap();
        assert_eq!(merged.data.as_ref(), Some(&projection.data));
        // The live resourceVersion rides along for optimistic concurrency.
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("5"));
    }

    #[test]
    fn foreign_owner_is_overwritten() {
        let owner = owner_reference(&pod());
        let projection = projection();
        let mut existing = live(&projection, &owner);
        existing.metadata.owner_references = Some(vec![k8s::OwnerReference {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            name: "other-pod".to_string(),
            uid: "uid-9".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);

        let merged = merge_configmap(&existing, &projection, &owner).unwrap();
        assert_eq!(merged.metadata.owner_references, Some(vec![owner]));
    }

    #[test]
    fn user_labels_survive_reconcile() {
        let owner = owner_reference(&pod());
        let projection = projection();
        let mut existing = live(&projection, &owner);
        existing
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("team".to_string(), "payments".to_string());
        // User-added labels alone do not force a write.
        assert_eq!(merge_configmap(&existing, &projection, &owner), None);

        // When a reserved label drifts, the write restores it but keeps the
        // user's label.
        existing.metadata.labels.as_mut().unwrap().insert(
            "podconfig.example.com/generated-by-pcmc".to_string(),
            "hijacked".to_string(),
        );
        let merged = merge_configmap(&existing, &projection, &owner).unwrap();
        let labels = merged.metadata.labels.unwrap();
        assert_eq!(labels["team"], "payments");
        assert_eq!(labels["podconfig.example.com/generated-by-pcmc"], "cfg");
    }

    #[test]
    fn unlabeled_live_object_gains_labels() {
        let owner = owner_reference(&pod());
        let projection = projection();
        let mut existing = live(&projection, &owner);
        existing.metadata.labels = None;

        let merged = merge_configmap(&existing, &projection, &owner).unwrap();
        assert_eq!(merged.metadata.labels.as_ref(), Some(&projection.labels));
    }

    #[test]
    fn conflict_backoff_is_small_and_grows() {
        for attempt in 1..=5 {
            let delay = conflict_backoff(attempt);
            assert!(delay >= Duration::from_millis(u64::from(50 * attempt)));
            assert!(delay < Duration::from_millis(u64::from(50 * attempt + 25)));
        }
    }
}
