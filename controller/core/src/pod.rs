use crate::errors::{Error, Result};
use crate::labels::Map;

/// The projection-relevant view of a pod, as decoded from a watch event.
///
/// Entries are cached behind an `Arc` and replaced wholesale on update, so
/// the struct is plain data with no interior mutability.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodView {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub node_name: String,
    pub phase: PodPhase,
    pub labels: Map,
    pub annotations: Map,
    pub resource_version: String,

    /// Container runtime ids, consumed only by the kernel-program
    /// coordinator.
    pub container_ids: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodView {
    /// Checks that the pod can drive ConfigMap generation. Pods that fail
    /// this check are logged and skipped without requeue.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("validate-pod", "pod", "name is empty"));
        }
        if self.namespace.is_empty() {
            return Err(Error::validation(
                "validate-pod",
                &self.name,
                "namespace is empty",
            ));
        }
        if self.phase == PodPhase::Unknown {
            return Err(Error::validation(
                "validate-pod",
                format!("{}/{}", self.namespace, self.name),
                "phase Unknown is not reconcilable",
            ));
        }
        Ok(())
    }
}

impl PodPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }

    /// Maps the free-form phase string from the API. Anything unrecognized
    /// collapses to `Unknown`, mirroring the apiserver's own convention.
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod() -> PodView {
        PodView {
            namespace: "default".to_string(),
            name: "web-0".to_string(),
            uid: "uid-1".to_string(),
            node_name: "node-a".to_string(),
            phase: PodPhase::Running,
            labels: Default::default(),
            annotations: Default::default(),
            resource_version: "1".to_string(),
            container_ids: vec![],
        }
    }

    #[test]
    fn validates_phases() {
        for phase in [
            PodPhase::Pending,
            PodPhase::Running,
            PodPhase::Succeeded,
            PodPhase::Failed,
        ] {
            let pod = PodView { phase, ..pod() };
            assert!(pod.validate().is_ok(), "{phase}");
        }

        let unknown = PodView {
            phase: PodPhase::Unknown,
            ..pod()
        };
        assert!(unknown.validate().is_err());
    }

    #[test]
    fn rejects_empty_identity() {
        let nameless = PodView {
            name: String::new(),
            ..pod()
        };
        assert!(nameless.validate().is_err());

        let unscoped = PodView {
            namespace: String::new(),
            ..pod()
        };
        assert!(unscoped.validate().is_err());
    }

    #[test]
    fn parses_phase_strings() {
        assert_eq!(PodPhase::parse("Running"), PodPhase::Running);
        assert_eq!(PodPhase::parse("Evicted"), PodPhase::Unknown);
        assert_eq!(PodPhase::parse(""), PodPhase::Unknown);
    }
}
