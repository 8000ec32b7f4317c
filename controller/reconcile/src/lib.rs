//! The two reconcile loops.
//!
//! Workers drain the pod and config queues, fan each key out over the
//! paired resources in its namespace, and converge the generated ConfigMaps
//! through the API server. Reads go to the informer cache; writes always go
//! to the API, and a write is never confirmed against the cache (the next
//! event or the conflict-retry loop's fresh GET sees it instead).

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod config;
mod metrics;
mod pod;
mod sync;

pub use self::metrics::{Metrics, ResourceType};

use pod_configmap_controller_core::{Error, Errors};
use pod_configmap_controller_ebpf as ebpf;
use pod_configmap_controller_k8s_api as k8s;
use pod_configmap_controller_k8s_index::{Queue, SharedIndex};
use pod_configmap_controller_k8s_status as status;
use std::{sync::Arc, time::Duration};
use tokio::time;

/// Settings governing the reconcile workers.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Attempts for the in-line conflict-retry loop of a single pair sync.
    pub max_retries: u32,
    /// Deadline for processing one key.
    pub timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Shared state for both reconcile loops; cheap to clone, one clone per
/// worker task.
#[derive(Clone)]
pub struct Reconciler {
    client: k8s::Client,
    index: SharedIndex,
    pod_queue: Queue,
    config_queue: Queue,
    status: Arc<status::Writer>,
    ebpf: Arc<ebpf::Manager>,
    metrics: Metrics,
    settings: Settings,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: k8s::Client,
        index: SharedIndex,
        pod_queue: Queue,
        config_queue: Queue,
        status: Arc<status::Writer>,
        ebpf: Arc<ebpf::Manager>,
        metrics: Metrics,
        settings: Settings,
    ) -> Self {
        Self {
            client,
            index,
            pod_queue,
            config_queue,
            status,
            ebpf,
            metrics,
            settings,
        }
    }

    /// Processes pod keys until the queue shuts down.
    pub async fn run_pod_worker(self) {
        while let Some(key) = self.pod_queue.next().await {
            self.step(ResourceType::Pod, &key).await;
        }
    }

    /// Processes config keys (including `DELETED:` tombstones) until the
    /// queue shuts down.
    pub async fn run_config_worker(self) {
        while let Some(key) = self.config_queue.next().await {
            self.step(ResourceType::Config, &key).await;
        }
    }

    async fn step(&self, resource: ResourceType, key: &str) {
        let queue = match resource {
            ResourceType::Pod => &self.pod_queue,
            ResourceType::Config => &self.config_queue,
        };
        let namespace = key
            .trim_start_matches(pod_configmap_controller_k8s_index::DELETED_PREFIX)
            .split_once('/')
            .map(|(ns, _)| ns.to_string())
            .unwrap_or_default();

        let start = time::Instant::now();
        let result = match time::timeout(self.settings.timeout, self.dispatch(resource, key)).await
        {
            Ok(result) => result,
            Err(_) => Err(Errors::from(Error::timeout(
                "reconcile",
                key,
                self.settings.timeout,
            ))),
        };
        self.metrics
            .observe_duration(resource, &namespace, start.elapsed());
        queue.done(key);

        match result {
            Ok(()) => queue.forget(key),
            Err(errors) => {
                for error in errors.iter() {
                    self.metrics
                        .record_error(resource, &namespace, error.kind());
                }
                if errors.is_retryable() {
                    tracing::warn!(%key, error = %errors, "reconcile failed, requeueing");
                    queue.add_rate_limited(key);
                } else {
                    tracing::info!(%key, error = %errors, "reconcile failed terminally");
                    queue.forget(key);
                }
            }
        }
    }

    async fn dispatch(&self, resource: ResourceType, key: &str) -> Result<(), Errors> {
        match resource {
            ResourceType::Pod => self.reconcile_pod(key).await,
            ResourceType::Config => self.reconcile_config(key).await,
        }
    }
}
