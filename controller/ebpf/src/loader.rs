use pod_configmap_controller_core::{FilterAction, FilterRule};
use std::collections::HashMap;

/// Loads per-pod kernel program objects.
///
/// This is the seam between the reconciliation core and whatever in-kernel
/// mechanism backs it. The [`Manager`](crate::Manager) only ever talks to
/// these traits, so the whole coordinator can be exercised without any
/// kernel support.
pub trait ProgramLoader: Send + Sync + 'static {
    fn load_syscall_counter(&self) -> Result<Box<dyn SyscallCounter>, ProgramError>;

    fn load_l4_filter(&self) -> Result<Box<dyn L4Filter>, ProgramError>;

    /// Resolves the process ids behind a pod's container runtime ids.
    /// Requires container-runtime integration; implementations without one
    /// return an empty set and syscall counts are simply absent.
    fn container_pids(&self, container_ids: &[String]) -> Vec<u32>;
}

/// A syscall-counting program attached to the sys_enter tracepoint,
/// restricted to a registered set of pids.
pub trait SyscallCounter: Send + Sync {
    fn track_pid(&mut self, pid: u32) -> Result<(), ProgramError>;

    fn forget_pid(&mut self, pid: u32) -> Result<(), ProgramError>;

    /// Drains the counts accumulated since the previous call, keyed by pid.
    fn take_counts(&mut self) -> Result<HashMap<u32, u64>, ProgramError>;
}

/// A per-pod L4 filter with an indexed rule table.
pub trait L4Filter: Send + Sync {
    /// Replaces the whole rule table. Rule order is the match order.
    fn replace_rules(
        &mut self,
        rules: &[FilterRule],
        default_action: FilterAction,
    ) -> Result<(), ProgramError>;

    /// Drains packet statistics accumulated since the previous call, keyed
    /// by category (`allowed`, `blocked`, `tcp_packets`, `udp_packets`).
    fn take_stats(&mut self) -> Result<HashMap<String, u64>, ProgramError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("failed to load program: {0}")]
    Load(String),

    #[error("failed to attach program: {0}")]
    Attach(String),

    #[error("failed to update program map: {0}")]
    Map(String),
}

impl ProgramError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Attach(_) => "attach",
            Self::Map(_) => "map",
        }
    }
}
