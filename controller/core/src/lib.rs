//! Domain types for the pod-configmap controller.
//!
//! This crate is free of any Kubernetes client machinery so that the
//! projection logic and error taxonomy can be exercised without a cluster:
//!
//! - [`PodView`] and [`ConfigView`] are the cached, decoded views of the
//!   watched resources.
//! - [`projection`] derives the desired ConfigMap shape for a (pod, config)
//!   pair. It is a pure function, which is what makes the reconcilers'
//!   create-or-update loop idempotent.
//! - [`Error`] categorizes failures so callers can decide between requeue,
//!   skip, and abort.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod duration;
pub mod errors;
pub mod labels;
pub mod pod;
pub mod projection;

pub use self::{
    config::{
        ConfigView, EbpfView, FilterAction, FilterProtocol, FilterRule, L4FilterView,
        MetricsExportView, SyscallMonitoringView,
    },
    duration::K8sDuration,
    errors::{Error, ErrorKind, Errors, Result},
    pod::{PodPhase, PodView},
    projection::{configmap_name, project, sanitize_configmap_name, Projection},
};
