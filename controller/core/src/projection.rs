use crate::{
    config::ConfigView,
    errors::{Error, Result},
    pod::PodView,
};
use std::collections::BTreeMap;

/// Maximum length of a generated ConfigMap name (DNS-1123 subdomain).
pub const MAX_CONFIGMAP_NAME_LEN: usize = 253;

/// Label attributing a generated ConfigMap to its config.
pub const GENERATED_BY_LABEL: &str = "podconfig.example.com/generated-by-pcmc";

/// Label carrying the owning pod's UID.
pub const POD_UID_LABEL: &str = "podconfig.example.com/pod-uid";

/// The desired shape of a generated ConfigMap.
///
/// `project` is deterministic: equal inputs yield byte-identical
/// projections, so the reconciler can diff against the live object and skip
/// writes that would change nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Projection {
    pub name: String,
    pub data: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Derives the name of the ConfigMap generated for a (pod, config) pair.
pub fn configmap_name(pod_name: &str, config_name: &str) -> String {
    sanitize_configmap_name(&format!("pod-{pod_name}-from-{config_name}-cfg"))
}

/// Forces a string into DNS-1123 subdomain shape: lowercase, `[a-z0-9-]`
/// only, no leading/trailing hyphens, at most 253 characters, never empty.
/// Idempotent.
pub fn sanitize_configmap_name(name: &str) -> String {
    let mut sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    sanitized = sanitized.trim_matches('-').to_string();
    if sanitized.is_empty() {
        return "configmap".to_string();
    }

    if sanitized.len() > MAX_CONFIGMAP_NAME_LEN {
        sanitized.truncate(MAX_CONFIGMAP_NAME_LEN);
        sanitized = sanitized.trim_end_matches('-').to_string();
    }

    sanitized
}

/// Computes the desired ConfigMap for a (pod, config) pair: derived name,
/// body, and identifying labels. The selector is intentionally not consulted
/// here; matching is the reconciler's concern.
pub fn project(pod: &PodView, config: &ConfigView) -> Result<Projection> {
    let name = configmap_name(&pod.name, &config.name);

    let mut data = BTreeMap::new();
    data.insert("podName".to_string(), pod.name.clone());
    data.insert("namespace".to_string(), pod.namespace.clone());
    data.insert("nodeName".to_string(), pod.node_name.clone());
    data.insert("phase".to_string(), pod.phase.to_string());
    data.insert("pcmcName".to_string(), config.name.clone());

    for key in &config.labels_to_include {
        if let Some(value) = pod.labels.get(key) {
            data.insert(format!("label_{key}"), value.clone());
        }
    }
    for key in &config.annotations_to_include {
        if let Some(value) = pod.annotations.get(key) {
            data.insert(format!("annotation_{key}"), value.clone());
        }
    }

    // A single bad key poisons the whole projection: generating a partial
    // body would silently drop the offending entry instead of surfacing the
    // misconfiguration.
    for key in data.keys() {
        if !is_valid_data_key(key) {
            return Err(Error::validation(
                "project",
                format!("{}/{}", pod.namespace, name),
                format!("invalid ConfigMap data key {key:?}"),
            ));
        }
    }

    let mut labels = BTreeMap::new();
    labels.insert(GENERATED_BY_LABEL.to_string(), config.name.clone());
    labels.insert(POD_UID_LABEL.to_string(), pod.uid.clone());

    Ok(Projection { name, data, labels })
}

/// ConfigMap data keys must be usable as environment variable names:
/// `[A-Za-z_.][A-Za-z0-9_.]*`.
fn is_valid_data_key(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_' || first == '.') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::PodPhase;

    fn pod(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> PodView {
        PodView {
            namespace: "default".to_string(),
            name: "web-0".to_string(),
            uid: "uid-1".to_string(),
            node_name: "node-a".to_string(),
            phase: PodPhase::Running,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            resource_version: "1".to_string(),
            container_ids: vec![],
        }
    }

    fn config(labels: &[&str], annotations: &[&str]) -> ConfigView {
        ConfigView {
            namespace: "default".to_string(),
            name: "cfg".to_string(),
            generation: 1,
            observed_generation: None,
            labels_to_include: labels.iter().map(|k| k.to_string()).collect(),
            annotations_to_include: annotations.iter().map(|k| k.to_string()).collect(),
            pod_selector: None,
            ebpf: None,
            resource_version: "1".to_string(),
        }
    }

    #[test]
    fn projects_mandatory_and_requested_keys() {
        let pod = pod(&[("app", "web"), ("ver", "1")], &[("team", "infra")]);
        let config = config(&["app", "ver", "missing"], &["team"]);

        let projection = project(&pod, &config).unwrap();
        assert_eq!(projection.name, "pod-web-0-from-cfg-cfg");
        assert_eq!(projection.data["podName"], "web-0");
        assert_eq!(projection.data["namespace"], "default");
        assert_eq!(projection.data["nodeName"], "node-a");
        assert_eq!(projection.data["phase"], "Running");
        assert_eq!(projection.data["pcmcName"], "cfg");
        assert_eq!(projection.data["label_app"], "web");
        assert_eq!(projection.data["label_ver"], "1");
        assert_eq!(projection.data["annotation_team"], "infra");
        assert!(!projection.data.contains_key("label_missing"));

        assert_eq!(projection.labels[GENERATED_BY_LABEL], "cfg");
        assert_eq!(projection.labels[POD_UID_LABEL], "uid-1");
    }

    #[test]
    fn projection_is_deterministic() {
        let pod = pod(&[("app", "web")], &[]);
        let config = config(&["app"], &[]);
        assert_eq!(
            project(&pod, &config).unwrap(),
            project(&pod, &config).unwrap()
        );
    }

    #[test]
    fn duplicate_requested_keys_collapse() {
        let pod = pod(&[("app", "web")], &[]);
        let config = config(&["app", "app"], &[]);
        let projection = project(&pod, &config).unwrap();
        assert_eq!(projection.data["label_app"], "web");
    }

    #[test]
    fn bad_data_key_fails_the_whole_projection() {
        // The label exists on the pod, but its derived data key contains '/'.
        let pod = pod(&[("example.com/team", "infra"), ("app", "web")], &[]);
        let config = config(&["example.com/team", "app"], &[]);
        let err = project(&pod, &config).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err}");
    }

    #[test]
    fn sanitizes_hostile_names() {
        // Spec scenario: a pod named "Bad_Name!" still yields a valid
        // DNS-1123 subdomain.
        let name = configmap_name("Bad_Name!", "P");
        assert_eq!(name, "pod-bad-name--from-p-cfg");
        assert!(is_dns1123_subdomain(&name));
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in [
            "Bad_Name!",
            "--weird--",
            "",
            "ok-name",
            "UPPER.lower",
            &"x".repeat(400),
        ] {
            let once = sanitize_configmap_name(input);
            assert_eq!(sanitize_configmap_name(&once), once, "input {input:?}");
            assert!(once.len() <= MAX_CONFIGMAP_NAME_LEN);
            assert!(is_dns1123_subdomain(&once), "input {input:?} gave {once:?}");
        }
    }

    #[test]
    fn sanitize_substitutes_when_collapsed_to_nothing() {
        assert_eq!(sanitize_configmap_name("!!!"), "configmap");
        assert_eq!(sanitize_configmap_name(""), "configmap");
        assert_eq!(sanitize_configmap_name("---"), "configmap");
    }

    #[test]
    fn sanitize_truncates_and_retrims() {
        let long = format!("{}-{}", "a".repeat(251), "b".repeat(10));
        let out = sanitize_configmap_name(&long);
        assert!(out.len() <= MAX_CONFIGMAP_NAME_LEN);
        assert!(!out.ends_with('-'));
    }

    #[test]
    fn data_key_pattern() {
        assert!(is_valid_data_key("podName"));
        assert!(is_valid_data_key("label_app"));
        assert!(is_valid_data_key("_x"));
        assert!(is_valid_data_key(".hidden"));
        assert!(!is_valid_data_key(""));
        assert!(!is_valid_data_key("1abc"));
        assert!(!is_valid_data_key("label_app/v1"));
        assert!(!is_valid_data_key("label my-key"));
    }

    fn is_dns1123_subdomain(s: &str) -> bool {
        !s.is_empty()
            && !s.starts_with('-')
            && !s.ends_with('-')
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }
}
