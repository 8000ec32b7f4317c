use crate::labels::Selector;
use std::time::Duration;

/// The decoded view of a `PodConfigMapConfig`, produced by the explicit
/// decode step at the cache boundary. Reconcilers only ever see this type;
/// raw wire objects never reach the projector.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigView {
    pub namespace: String,
    pub name: String,
    pub generation: i64,
    pub observed_generation: Option<i64>,
    pub labels_to_include: Vec<String>,
    pub annotations_to_include: Vec<String>,
    pub pod_selector: Option<Selector>,
    pub ebpf: Option<EbpfView>,
    pub resource_version: String,
}

/// Decoded kernel-program configuration: three independent sub-policies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EbpfView {
    pub syscall_monitoring: Option<SyscallMonitoringView>,
    pub l4_filter: Option<L4FilterView>,
    pub metrics_export: Option<MetricsExportView>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyscallMonitoringView {
    pub enabled: bool,
    pub syscall_names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L4FilterView {
    pub enabled: bool,
    pub rules: Vec<FilterRule>,
    pub default_action: FilterAction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsExportView {
    pub enabled: bool,
    pub update_interval: Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FilterRule {
    pub port: u16,
    pub protocol: FilterProtocol,
    pub action: FilterAction,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterAction {
    Allow,
    Block,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterProtocol {
    Tcp,
    Udp,
}

impl ConfigView {
    /// Whether any kernel-program sub-policy is turned on for this config.
    pub fn ebpf_enabled(&self) -> bool {
        self.ebpf.as_ref().is_some_and(EbpfView::is_enabled)
    }
}

impl EbpfView {
    pub fn is_enabled(&self) -> bool {
        self.syscall_monitoring.as_ref().is_some_and(|m| m.enabled)
            || self.l4_filter.as_ref().is_some_and(|f| f.enabled)
            || self.metrics_export.as_ref().is_some_and(|e| e.enabled)
    }
}

impl FilterAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
        }
    }
}

impl FilterProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}
