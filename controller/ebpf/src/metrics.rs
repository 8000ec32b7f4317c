use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// The kernel-plane counters from the metrics surface:
/// `ebpf_syscall_count_total`, `ebpf_l4_firewall_total`,
/// `ebpf_attached_programs`, and `ebpf_program_errors_total`.
#[derive(Clone, Debug)]
pub struct EbpfMetrics {
    syscalls: Family<SyscallLabels, Counter>,
    firewall: Family<FirewallLabels, Counter>,
    attached: Family<ProgramLabels, Gauge>,
    errors: Family<ErrorLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct SyscallLabels {
    namespace: String,
    pod_name: String,
    pid: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct FirewallLabels {
    namespace: String,
    pod_name: String,
    stat_type: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ProgramLabels {
    namespace: String,
    pod_name: String,
    program_type: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ErrorLabels {
    namespace: String,
    pod_name: String,
    program_type: &'static str,
    error_type: &'static str,
}

impl EbpfMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let syscalls = Family::<SyscallLabels, Counter>::default();
        registry.register(
            "ebpf_syscall_count",
            "Syscalls observed per tracked pid",
            syscalls.clone(),
        );

        let firewall = Family::<FirewallLabels, Counter>::default();
        registry.register(
            "ebpf_l4_firewall",
            "Packet statistics from per-pod L4 filters",
            firewall.clone(),
        );

        let attached = Family::<ProgramLabels, Gauge>::default();
        registry.register(
            "ebpf_attached_programs",
            "Kernel programs currently attached per pod",
            attached.clone(),
        );

        let errors = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "ebpf_program_errors",
            "Kernel program load, attach, and map failures",
            errors.clone(),
        );

        Self {
            syscalls,
            firewall,
            attached,
            errors,
        }
    }

    pub(crate) fn record_syscalls(&self, namespace: &str, pod_name: &str, pid: u32, count: u64) {
        self.syscalls
            .get_or_create(&SyscallLabels {
                namespace: namespace.to_string(),
                pod_name: pod_name.to_string(),
                pid: pid.to_string(),
            })
            .inc_by(count);
    }

    pub(crate) fn record_firewall(
        &self,
        namespace: &str,
        pod_name: &str,
        stat_type: &str,
        count: u64,
    ) {
        self.firewall
            .get_or_create(&FirewallLabels {
                namespace: namespace.to_string(),
                pod_name: pod_name.to_string(),
                stat_type: stat_type.to_string(),
            })
            .inc_by(count);
    }

    pub(crate) fn set_attached(
        &self,
        namespace: &str,
        pod_name: &str,
        program_type: &'static str,
        attached: bool,
    ) {
        let labels = ProgramLabels {
            namespace: namespace.to_string(),
            pod_name: pod_name.to_string(),
            program_type,
        };
        if attached {
            self.attached.get_or_create(&labels).set(1);
        } else {
            self.attached.remove(&labels);
        }
    }

    pub(crate) fn record_error(
        &self,
        namespace: &str,
        pod_name: &str,
        program_type: &'static str,
        error_type: &'static str,
    ) {
        self.errors
            .get_or_create(&ErrorLabels {
                namespace: namespace.to_string(),
                pod_name: pod_name.to_string(),
                program_type,
                error_type,
            })
            .inc();
    }
}

#[cfg(test)]
impl EbpfMetrics {
    pub(crate) fn for_tests() -> Self {
        Self {
            syscalls: Family::default(),
            firewall: Family::default(),
            attached: Family::default(),
            errors: Family::default(),
        }
    }
}
