use crate::loader::{L4Filter, ProgramError, ProgramLoader, SyscallCounter};
use pod_configmap_controller_core::{FilterAction, FilterRule};
use std::collections::HashMap;

/// An in-memory backend for hosts without kernel program support.
///
/// Rule tables and tracked-pid sets are maintained faithfully so attach,
/// update, and detach all behave as they would against a real loader; only
/// the data path is absent, so drained counters stay at zero. Container pid
/// resolution requires runtime integration and returns nothing here.
#[derive(Clone, Debug, Default)]
pub struct UserspaceLoader;

impl ProgramLoader for UserspaceLoader {
    fn load_syscall_counter(&self) -> Result<Box<dyn SyscallCounter>, ProgramError> {
        Ok(Box::new(UserspaceSyscallCounter::default()))
    }

    fn load_l4_filter(&self) -> Result<Box<dyn L4Filter>, ProgramError> {
        Ok(Box::new(UserspaceL4Filter::default()))
    }

    fn container_pids(&self, _container_ids: &[String]) -> Vec<u32> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
struct UserspaceSyscallCounter {
    tracked: HashMap<u32, u64>,
}

impl SyscallCounter for UserspaceSyscallCounter {
    fn track_pid(&mut self, pid: u32) -> Result<(), ProgramError> {
        self.tracked.entry(pid).or_insert(0);
        Ok(())
    }

    fn forget_pid(&mut self, pid: u32) -> Result<(), ProgramError> {
        self.tracked.remove(&pid);
        Ok(())
    }

    fn take_counts(&mut self) -> Result<HashMap<u32, u64>, ProgramError> {
        let counts = self.tracked.clone();
        for count in self.tracked.values_mut() {
            *count = 0;
        }
        Ok(counts)
    }
}

#[derive(Debug)]
struct UserspaceL4Filter {
    rules: Vec<FilterRule>,
    default_action: FilterAction,
    stats: HashMap<String, u64>,
}

impl Default for UserspaceL4Filter {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_action: FilterAction::Allow,
            stats: [
                ("allowed".to_string(), 0),
                ("blocked".to_string(), 0),
                ("tcp_packets".to_string(), 0),
                ("udp_packets".to_string(), 0),
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl L4Filter for UserspaceL4Filter {
    fn replace_rules(
        &mut self,
        rules: &[FilterRule],
        default_action: FilterAction,
    ) -> Result<(), ProgramError> {
        self.rules = rules.to_vec();
        self.default_action = default_action;
        Ok(())
    }

    fn take_stats(&mut self) -> Result<HashMap<String, u64>, ProgramError> {
        let stats = self.stats.clone();
        for count in self.stats.values_mut() {
            *count = 0;
        }
        Ok(stats)
    }
}
