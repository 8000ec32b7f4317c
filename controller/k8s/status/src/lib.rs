//! Writes `status.observedGeneration` on PodConfigMapConfigs.
//!
//! The writer runs inline on a reconcile worker, never on the informer
//! task: the status update itself comes back as an update event, and
//! patching from the informer callback would loop. Writes go through the
//! status subresource so they do not disturb the spec's resourceVersion
//! churn detection.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use pod_configmap_controller_core::Error;
use pod_configmap_controller_k8s_api as k8s;
use pod_configmap_controller_k8s_index::SharedIndex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};

const FIELD_MANAGER: &str = "pod-configmap-controller";

pub struct Writer {
    client: k8s::Client,
    metrics: StatusMetrics,
}

impl Writer {
    pub fn new(client: k8s::Client, metrics: StatusMetrics) -> Self {
        Self { client, metrics }
    }

    /// Records the config's generation into its status when the two differ.
    /// A conflict is retried once against a fresh cache read. Callers log
    /// failures and continue reconciling; a stale status never blocks
    /// ConfigMap convergence.
    pub async fn sync(&self, index: &SharedIndex, namespace: &str, name: &str) -> Result<(), Error> {
        let Some(config) = index.read().config(namespace, name) else {
            return Ok(());
        };
        if config.observed_generation == Some(config.generation) {
            self.metrics.set_ready(namespace, name, true);
            return Ok(());
        }
        self.metrics.set_ready(namespace, name, false);

        match self.patch(namespace, name, config.generation).await {
            Ok(()) => {}
            Err(error) if k8s::is_conflict(&error) => {
                // The cached generation may be stale; re-read and retry once.
                let Some(config) = index.read().config(namespace, name) else {
                    return Ok(());
                };
                self.patch(namespace, name, config.generation)
                    .await
                    .map_err(|error| {
                        Error::api("update-status", format!("{namespace}/{name}"), error)
                    })?;
            }
            Err(error) if k8s::is_not_found(&error) => return Ok(()),
            Err(error) => {
                return Err(Error::api(
                    "update-status",
                    format!("{namespace}/{name}"),
                    error,
                ));
            }
        }

        tracing::debug!(%namespace, %name, generation = config.generation, "updated observedGeneration");
        self.metrics.set_ready(namespace, name, true);
        Ok(())
    }

    /// Drops the readiness gauge for a deleted config.
    pub fn forget(&self, namespace: &str, name: &str) {
        self.metrics.forget(namespace, name);
    }

    async fn patch(&self, namespace: &str, name: &str, generation: i64) -> Result<(), k8s::Error> {
        let api = k8s::Api::<k8s::PodConfigMapConfig>::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "apiVersion": "podconfig.example.com/v1alpha1",
            "kind": "PodConfigMapConfig",
            "status": { "observedGeneration": generation },
        });
        api.patch_status(
            name,
            &k8s::PatchParams::apply(FIELD_MANAGER),
            &k8s::Patch::Merge(patch),
        )
        .await
        .map(|_| ())
    }
}

/// Registers `pcmc_status{name,namespace}`: 1 when the config's
/// observedGeneration matches its generation.
#[derive(Clone, Debug)]
pub struct StatusMetrics {
    status: Family<StatusLabels, Gauge>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct StatusLabels {
    name: String,
    namespace: String,
}

impl StatusMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let status = Family::<StatusLabels, Gauge>::default();
        registry.register(
            "pcmc_status",
            "Whether each PodConfigMapConfig has been observed at its current generation",
            status.clone(),
        );
        Self { status }
    }

    fn set_ready(&self, namespace: &str, name: &str, ready: bool) {
        self.status
            .get_or_create(&StatusLabels {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
            .set(ready as i64);
    }

    fn forget(&self, namespace: &str, name: &str) {
        self.status.remove(&StatusLabels {
            name: name.to_string(),
            namespace: namespace.to_string(),
        });
    }
}
