use kube::{CustomResource, ResourceExt};
use pod_configmap_controller_core as core;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Selects pods in its namespace and describes the ConfigMap projected for
/// each of them. The wire types here are deliberately permissive (free-form
/// strings for enums and durations); [`PodConfigMapConfig::to_view`] is the
/// strict decode step that turns a raw object into the typed view the
/// reconcilers consume.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "podconfig.example.com",
    version = "v1alpha1",
    kind = "PodConfigMapConfig",
    status = "PodConfigMapConfigStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PodConfigMapConfigSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels_to_include: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations_to_include: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<core::labels::Selector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ebpf_config: Option<EbpfConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodConfigMapConfigStatus {
    #[serde(default)]
    pub observed_generation: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EbpfConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syscall_monitoring: Option<SyscallMonitoringConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l4_firewall: Option<L4FirewallConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_export: Option<MetricsExportConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyscallMonitoringConfig {
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub syscall_names: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct L4FirewallConfig {
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ports: Vec<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_ports: Vec<i32>,

    /// `"allow"` or `"block"`. Empty means allow.
    #[serde(default)]
    pub default_action: String,

    /// `"TCP"` or `"UDP"`. Rules installed from `allowedPorts` and
    /// `blockedPorts` carry this protocol; absent means TCP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsExportConfig {
    pub enabled: bool,

    /// Scrape cadence in Go duration format (`"30s"`, `"1m"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_interval: Option<String>,
}

impl PodConfigMapConfig {
    /// Decodes the raw resource into the typed view used by the
    /// reconcilers. A shape mismatch yields a Conversion error; the object
    /// is then skipped until a corrected revision arrives.
    pub fn to_view(&self) -> Result<core::ConfigView, core::Error> {
        let name = self.name_any();
        let namespace = self
            .namespace()
            .ok_or_else(|| core::Error::conversion("decode-pcmc", &name, "missing namespace"))?;
        let resource = format!("{namespace}/{name}");

        let ebpf = self
            .spec
            .ebpf_config
            .as_ref()
            .map(|cfg| decode_ebpf(cfg, &resource))
            .transpose()?;

        Ok(core::ConfigView {
            namespace,
            name,
            generation: self.metadata.generation.unwrap_or_default(),
            observed_generation: self.status.as_ref().map(|s| s.observed_generation),
            labels_to_include: self.spec.labels_to_include.clone(),
            annotations_to_include: self.spec.annotations_to_include.clone(),
            pod_selector: self.spec.pod_selector.clone(),
            ebpf,
            resource_version: self.resource_version().unwrap_or_default(),
        })
    }
}

fn decode_ebpf(config: &EbpfConfig, resource: &str) -> Result<core::EbpfView, core::Error> {
    let syscall_monitoring = config
        .syscall_monitoring
        .as_ref()
        .map(|m| core::SyscallMonitoringView {
            enabled: m.enabled,
            syscall_names: m.syscall_names.clone(),
        });

    let l4_filter = config
        .l4_firewall
        .as_ref()
        .map(|f| decode_l4_filter(f, resource))
        .transpose()?;

    let metrics_export = config
        .metrics_export
        .as_ref()
        .map(|e| decode_metrics_export(e, resource))
        .transpose()?;

    Ok(core::EbpfView {
        syscall_monitoring,
        l4_filter,
        metrics_export,
    })
}

fn decode_l4_filter(
    config: &L4FirewallConfig,
    resource: &str,
) -> Result<core::L4FilterView, core::Error> {
    let default_action = decode_action(&config.default_action, resource)?;
    let protocol = match config.protocol.as_deref() {
        None | Some("") => core::FilterProtocol::Tcp,
        Some(p) if p.eq_ignore_ascii_case("tcp") => core::FilterProtocol::Tcp,
        Some(p) if p.eq_ignore_ascii_case("udp") => core::FilterProtocol::Udp,
        Some(other) => {
            return Err(core::Error::conversion(
                "decode-pcmc",
                resource,
                format!("unknown l4Firewall protocol {other:?}"),
            ));
        }
    };

    let mut rules = Vec::with_capacity(config.allowed_ports.len() + config.blocked_ports.len());
    for (ports, action) in [
        (&config.allowed_ports, core::FilterAction::Allow),
        (&config.blocked_ports, core::FilterAction::Block),
    ] {
        for &port in ports {
            let port = u16::try_from(port).ok().filter(|p| *p != 0).ok_or_else(|| {
                core::Error::conversion(
                    "decode-pcmc",
                    resource,
                    format!("l4Firewall port {port} out of range"),
                )
            })?;
            rules.push(core::FilterRule {
                port,
                protocol,
                action,
            });
        }
    }

    Ok(core::L4FilterView {
        enabled: config.enabled,
        rules,
        default_action,
    })
}

fn decode_action(action: &str, resource: &str) -> Result<core::FilterAction, core::Error> {
    match action {
        "" | "allow" => Ok(core::FilterAction::Allow),
        "block" => Ok(core::FilterAction::Block),
        other => Err(core::Error::conversion(
            "decode-pcmc",
            resource,
            format!("unknown l4Firewall defaultAction {other:?}"),
        )),
    }
}

fn decode_metrics_export(
    config: &MetricsExportConfig,
    resource: &str,
) -> Result<core::MetricsExportView, core::Error> {
    let update_interval = match config.update_interval.as_deref() {
        None | Some("") => DEFAULT_METRICS_INTERVAL,
        Some(raw) => {
            let parsed = raw.parse::<core::K8sDuration>().map_err(|error| {
                core::Error::conversion(
                    "decode-pcmc",
                    resource,
                    format!("invalid metricsExport.updateInterval {raw:?}: {error}"),
                )
            })?;
            if parsed.is_zero() {
                DEFAULT_METRICS_INTERVAL
            } else {
                parsed.as_duration()
            }
        }
    };

    Ok(core::MetricsExportView {
        enabled: config.enabled,
        update_interval,
    })
}
