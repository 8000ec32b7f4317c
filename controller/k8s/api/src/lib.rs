#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod podconfigmapconfig;

pub use self::podconfigmapconfig::{
    EbpfConfig, L4FirewallConfig, MetricsExportConfig, PodConfigMapConfig, PodConfigMapConfigSpec,
    PodConfigMapConfigStatus, SyscallMonitoringConfig,
};
pub use k8s_openapi::{
    api::{
        coordination::v1::Lease,
        core::v1::{ConfigMap, Pod},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    error::ErrorResponse,
    runtime::watcher,
    Client, Error, Resource, ResourceExt,
};

/// True when the error is a 404 from the API server.
pub fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Api(response) if response.code == 404)
}

/// True when the error is an optimistic-concurrency conflict (409); this
/// also covers AlreadyExists on create.
pub fn is_conflict(error: &Error) -> bool {
    matches!(error, Error::Api(response) if response.code == 409)
}
