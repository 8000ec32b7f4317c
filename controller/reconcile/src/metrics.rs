use pod_configmap_controller_core::ErrorKind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use std::time::Duration;

/// Which reconcile loop a measurement belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceType {
    Pod,
    Config,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Operation {
    Create,
    Update,
    Delete,
    Noop,
}

/// The reconciler-side metrics surface: `configmap_operations_total`,
/// `reconciliation_duration_seconds`, `reconciliation_errors_total`, and
/// `active_configmaps`.
#[derive(Clone, Debug)]
pub struct Metrics {
    operations: Family<OperationLabels, Counter>,
    durations: Family<DurationLabels, Histogram>,
    errors: Family<ErrorLabels, Counter>,
    active: Family<ActiveLabels, Gauge>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OperationLabels {
    operation: &'static str,
    namespace: String,
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct DurationLabels {
    resource_type: &'static str,
    namespace: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ErrorLabels {
    resource_type: &'static str,
    namespace: String,
    error_type: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ActiveLabels {
    namespace: String,
    pcmc_name: String,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let operations = Family::<OperationLabels, Counter>::default();
        registry.register(
            "configmap_operations",
            "ConfigMap operations performed by the reconcilers",
            operations.clone(),
        );

        let durations = Family::<DurationLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(
                [
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]
                .into_iter(),
            )
        });
        registry.register_with_unit(
            "reconciliation_duration",
            "Time spent processing one work-queue key",
            prometheus_client::registry::Unit::Seconds,
            durations.clone(),
        );

        let errors = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "reconciliation_errors",
            "Reconciliation failures by error type",
            errors.clone(),
        );

        let active = Family::<ActiveLabels, Gauge>::default();
        registry.register(
            "active_configmaps",
            "ConfigMaps currently projected per config",
            active.clone(),
        );

        Self {
            operations,
            durations,
            errors,
            active,
        }
    }

    pub(crate) fn record_operation(&self, operation: Operation, namespace: &str, ok: bool) {
        self.operations
            .get_or_create(&OperationLabels {
                operation: operation.as_str(),
                namespace: namespace.to_string(),
                result: if ok { "success" } else { "error" },
            })
            .inc();
    }

    pub(crate) fn observe_duration(
        &self,
        resource_type: ResourceType,
        namespace: &str,
        elapsed: Duration,
    ) {
        self.durations
            .get_or_create(&DurationLabels {
                resource_type: resource_type.as_str(),
                namespace: namespace.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    pub(crate) fn record_error(
        &self,
        resource_type: ResourceType,
        namespace: &str,
        kind: ErrorKind,
    ) {
        self.errors
            .get_or_create(&ErrorLabels {
                resource_type: resource_type.as_str(),
                namespace: namespace.to_string(),
                error_type: kind.as_str(),
            })
            .inc();
    }

    pub(crate) fn set_active_configmaps(&self, namespace: &str, pcmc_name: &str, count: usize) {
        self.active
            .get_or_create(&ActiveLabels {
                namespace: namespace.to_string(),
                pcmc_name: pcmc_name.to_string(),
            })
            .set(count as i64);
    }

    pub(crate) fn forget_config(&self, namespace: &str, pcmc_name: &str) {
        self.active.remove(&ActiveLabels {
            namespace: namespace.to_string(),
            pcmc_name: pcmc_name.to_string(),
        });
    }
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Config => "podconfigmapconfig",
        }
    }
}

impl Operation {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Noop => "noop",
        }
    }
}
