use crate::{
    queue::{Queue, QueueMetrics, RateLimiter},
    Index, SharedIndex,
};
use pod_configmap_controller_k8s_api as k8s;
use std::sync::{atomic::AtomicBool, Arc};

pub(crate) struct Harness {
    pub index: SharedIndex,
    pub pod_queue: Queue,
    pub config_queue: Queue,
    pub gate: Arc<AtomicBool>,
}

pub(crate) fn harness() -> Harness {
    let metrics = QueueMetrics::for_tests();
    let pod_queue = Queue::new("pods", RateLimiter::default(), &metrics);
    let config_queue = Queue::new("podconfigmapconfigs", RateLimiter::default(), &metrics);
    let gate = Arc::new(AtomicBool::new(true));
    let index = Index::shared(pod_queue.clone(), config_queue.clone(), gate.clone());
    Harness {
        index,
        pod_queue,
        config_queue,
        gate,
    }
}

pub(crate) fn mk_pod(namespace: &str, name: &str, rv: &str, labels: &[(&str, &str)]) -> k8s::Pod {
    k8s::Pod {
        metadata: k8s::ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            uid: Some(format!("uid-{name}")),
            resource_version: Some(rv.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::core::v1::PodSpec {
            node_name: Some("node-a".to_string()),
            ..Default::default()
        }),
        status: Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

pub(crate) fn mk_config(
    namespace: &str,
    name: &str,
    rv: &str,
    generation: i64,
    label_keys: &[&str],
) -> k8s::PodConfigMapConfig {
    let mut config = k8s::PodConfigMapConfig::new(
        name,
        k8s::PodConfigMapConfigSpec {
            labels_to_include: label_keys.iter().map(|k| k.to_string()).collect(),
            annotations_to_include: vec![],
            pod_selector: None,
            ebpf_config: None,
        },
    );
    config.metadata.namespace = Some(namespace.to_string());
    config.metadata.resource_version = Some(rv.to_string());
    config.metadata.generation = Some(generation);
    config
}
