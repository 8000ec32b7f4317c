//! Kernel-program coordination for pods covered by a config with
//! `ebpfConfig` set.
//!
//! The [`Manager`] owns one program set per pod, attached the first time a
//! matching (pod, config) pair is reconciled and diffed on every pass after
//! that. All failures stay inside this crate: the generated ConfigMaps are
//! authoritative and the kernel plane is best-effort telemetry and
//! enforcement, so attach/update/detach errors are logged and counted but
//! never fail the owning reconcile.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod loader;
mod metrics;
mod userspace;

pub use self::{
    loader::{L4Filter, ProgramError, ProgramLoader, SyscallCounter},
    metrics::EbpfMetrics,
    userspace::UserspaceLoader,
};

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use pod_configmap_controller_core::{EbpfView, PodView};
use std::{collections::hash_map::Entry, sync::Arc, time::Duration};
use tokio::time::{self, Instant};

const SCRAPE_TICK: Duration = Duration::from_secs(5);
const DEFAULT_EXPORT_INTERVAL: Duration = Duration::from_secs(30);

pub struct Manager {
    loader: Arc<dyn ProgramLoader>,
    programs: Mutex<HashMap<String, PodProgram>>,
    metrics: EbpfMetrics,
}

struct PodProgram {
    namespace: String,
    pod_name: String,
    policy: String,
    config: EbpfView,
    container_ids: Vec<String>,
    tracked_pids: Vec<u32>,
    syscall: Option<Box<dyn SyscallCounter>>,
    filter: Option<Box<dyn L4Filter>>,
    /// None disables scraping for this pod (metricsExport.enabled=false).
    export_interval: Option<Duration>,
    last_export: Instant,
}

impl Manager {
    pub fn new(loader: Arc<dyn ProgramLoader>, metrics: EbpfMetrics) -> Arc<Self> {
        Arc::new(Self {
            loader,
            programs: Mutex::new(HashMap::default()),
            metrics,
        })
    }

    /// Attaches programs for a pod on first observation, or diffs the new
    /// config against the attached state and applies the delta.
    pub fn apply(&self, pod: &PodView, policy: &str, config: &EbpfView) {
        if !config.is_enabled() {
            self.detach_if_attributed(&pod.uid, policy);
            return;
        }
        if pod.uid.is_empty() {
            tracing::warn!(namespace = %pod.namespace, pod = %pod.name, "pod has no uid, skipping program attach");
            return;
        }

        let mut programs = self.programs.lock();
        match programs.entry(pod.uid.clone()) {
            Entry::Occupied(mut entry) => {
                let program = entry.get_mut();
                if program.config == *config && program.container_ids == pod.container_ids {
                    // Still refresh attribution: with overlapping policies
                    // the most recently reconciled one wins, matching the
                    // ConfigMap last-writer semantics.
                    program.policy = policy.to_string();
                    return;
                }
                tracing::info!(namespace = %pod.namespace, pod = %pod.name, %policy, "updating kernel programs");
                program.policy = policy.to_string();
                self.sync_program(program, pod, config);
            }
            Entry::Vacant(entry) => {
                tracing::info!(namespace = %pod.namespace, pod = %pod.name, %policy, "attaching kernel programs");
                let mut program = PodProgram {
                    namespace: pod.namespace.clone(),
                    pod_name: pod.name.clone(),
                    policy: policy.to_string(),
                    config: EbpfView::default(),
                    container_ids: Vec::new(),
                    tracked_pids: Vec::new(),
                    syscall: None,
                    filter: None,
                    export_interval: None,
                    last_export: Instant::now(),
                };
                self.sync_program(&mut program, pod, config);
                entry.insert(program);
            }
        }
    }

    /// Releases the programs attached for a pod, looked up by name because
    /// deletion events no longer carry the uid.
    pub fn detach_pod(&self, namespace: &str, pod_name: &str) {
        let removed: Vec<PodProgram> = {
            let mut programs = self.programs.lock();
            let uids: Vec<String> = programs
                .iter()
                .filter(|(_, p)| p.namespace == namespace && p.pod_name == pod_name)
                .map(|(uid, _)| uid.clone())
                .collect();
            uids.into_iter()
                .filter_map(|uid| programs.remove(&uid))
                .collect()
        };
        for program in removed {
            self.release(program);
        }
    }

    /// Releases every program that was attached on behalf of a policy.
    pub fn detach_policy(&self, namespace: &str, policy: &str) {
        let removed: Vec<PodProgram> = {
            let mut programs = self.programs.lock();
            let uids: Vec<String> = programs
                .iter()
                .filter(|(_, p)| p.namespace == namespace && p.policy == policy)
                .map(|(uid, _)| uid.clone())
                .collect();
            uids.into_iter()
                .filter_map(|uid| programs.remove(&uid))
                .collect()
        };
        for program in removed {
            self.release(program);
        }
    }

    pub fn attached(&self) -> usize {
        self.programs.lock().len()
    }

    /// Scrapes counters on a fixed tick, honoring each pod's export
    /// interval, until shutdown; then detaches everything.
    pub async fn run(self: Arc<Self>, shutdown: drain::Watch) {
        let mut tick = time::interval(SCRAPE_TICK);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let release = tokio::select! {
            release = shutdown.signaled() => release,
            _ = async {
                loop {
                    tick.tick().await;
                    self.scrape_due();
                }
            } => unreachable!("scrape loop never returns"),
        };

        tracing::info!("shutting down, detaching kernel programs");
        self.detach_all();
        drop(release);
    }

    fn detach_if_attributed(&self, uid: &str, policy: &str) {
        let removed = {
            let mut programs = self.programs.lock();
            let attributed = programs.get(uid).is_some_and(|p| p.policy == policy);
            if attributed {
                programs.remove(uid)
            } else {
                None
            }
        };
        if let Some(program) = removed {
            self.release(program);
        }
    }

    fn detach_all(&self) {
        let programs: Vec<PodProgram> = {
            let mut map = self.programs.lock();
            map.drain().map(|(_, p)| p).collect()
        };
        for program in programs {
            self.release(program);
        }
    }

    /// Brings a program's attached state in line with the decoded config.
    fn sync_program(&self, program: &mut PodProgram, pod: &PodView, config: &EbpfView) {
        let (namespace, pod_name) = (pod.namespace.as_str(), pod.name.as_str());

        // Syscall monitoring.
        let monitor = config
            .syscall_monitoring
            .as_ref()
            .is_some_and(|m| m.enabled);
        if monitor && program.syscall.is_none() {
            match self.loader.load_syscall_counter() {
                Ok(counter) => {
                    program.syscall = Some(counter);
                    self.metrics
                        .set_attached(namespace, pod_name, "syscall_counter", true);
                }
                Err(error) => {
                    tracing::warn!(%namespace, pod = %pod_name, %error, "failed to load syscall counter");
                    self.metrics.record_error(
                        namespace,
                        pod_name,
                        "syscall_counter",
                        error.kind(),
                    );
                }
            }
        } else if !monitor && program.syscall.take().is_some() {
            self.metrics
                .set_attached(namespace, pod_name, "syscall_counter", false);
        }

        // Re-register pids whenever the container set changed.
        let pids = self.loader.container_pids(&pod.container_ids);
        if let Some(counter) = program.syscall.as_mut() {
            for pid in &program.tracked_pids {
                if !pids.contains(pid) {
                    if let Err(error) = counter.forget_pid(*pid) {
                        tracing::warn!(%namespace, pod = %pod_name, pid, %error, "failed to drop tracked pid");
                    }
                }
            }
            for pid in &pids {
                if let Err(error) = counter.track_pid(*pid) {
                    tracing::warn!(%namespace, pod = %pod_name, pid, %error, "failed to track pid");
                    self.metrics
                        .record_error(namespace, pod_name, "syscall_counter", error.kind());
                }
            }
        }
        program.tracked_pids = pids;

        // L4 filter.
        let filter_config = config.l4_filter.as_ref().filter(|f| f.enabled);
        match filter_config {
            Some(filter_config) => {
                if program.filter.is_none() {
                    match self.loader.load_l4_filter() {
                        Ok(filter) => {
                            program.filter = Some(filter);
                            self.metrics
                                .set_attached(namespace, pod_name, "l4_filter", true);
                        }
                        Err(error) => {
                            tracing::warn!(%namespace, pod = %pod_name, %error, "failed to load l4 filter");
                            self.metrics
                                .record_error(namespace, pod_name, "l4_filter", error.kind());
                        }
                    }
                }
                if let Some(filter) = program.filter.as_mut() {
                    if let Err(error) =
                        filter.replace_rules(&filter_config.rules, filter_config.default_action)
                    {
                        tracing::warn!(%namespace, pod = %pod_name, %error, "failed to install filter rules");
                        self.metrics
                            .record_error(namespace, pod_name, "l4_filter", error.kind());
                    }
                }
            }
            None => {
                if program.filter.take().is_some() {
                    self.metrics
                        .set_attached(namespace, pod_name, "l4_filter", false);
                }
            }
        }

        program.export_interval = match config.metrics_export.as_ref() {
            Some(export) if !export.enabled => None,
            Some(export) => Some(export.update_interval),
            None => Some(DEFAULT_EXPORT_INTERVAL),
        };
        program.config = config.clone();
        program.container_ids = pod.container_ids.clone();
    }

    fn release(&self, program: PodProgram) {
        let PodProgram {
            namespace,
            pod_name,
            syscall,
            filter,
            ..
        } = program;
        if syscall.is_some() {
            self.metrics
                .set_attached(&namespace, &pod_name, "syscall_counter", false);
        }
        if filter.is_some() {
            self.metrics
                .set_attached(&namespace, &pod_name, "l4_filter", false);
        }
        tracing::info!(%namespace, pod = %pod_name, "detached kernel programs");
    }

    fn scrape_due(&self) {
        let now = Instant::now();
        let mut programs = self.programs.lock();
        for program in programs.values_mut() {
            let Some(interval) = program.export_interval else {
                continue;
            };
            if now.duration_since(program.last_export) < interval {
                continue;
            }
            program.last_export = now;

            if let Some(counter) = program.syscall.as_mut() {
                match counter.take_counts() {
                    Ok(counts) => {
                        for (pid, count) in counts {
                            self.metrics.record_syscalls(
                                &program.namespace,
                                &program.pod_name,
                                pid,
                                count,
                            );
                        }
                    }
                    Err(error) => {
                        tracing::warn!(namespace = %program.namespace, pod = %program.pod_name, %error, "failed to drain syscall counts");
                        self.metrics.record_error(
                            &program.namespace,
                            &program.pod_name,
                            "syscall_counter",
                            error.kind(),
                        );
                    }
                }
            }

            if let Some(filter) = program.filter.as_mut() {
                match filter.take_stats() {
                    Ok(stats) => {
                        for (stat_type, count) in stats {
                            self.metrics.record_firewall(
                                &program.namespace,
                                &program.pod_name,
                                &stat_type,
                                count,
                            );
                        }
                    }
                    Err(error) => {
                        tracing::warn!(namespace = %program.namespace, pod = %program.pod_name, %error, "failed to drain filter stats");
                        self.metrics.record_error(
                            &program.namespace,
                            &program.pod_name,
                            "l4_filter",
                            error.kind(),
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pod_configmap_controller_core::{
        FilterAction, FilterProtocol, FilterRule, L4FilterView, MetricsExportView, PodPhase,
        SyscallMonitoringView,
    };
    use std::collections::HashMap as StdHashMap;

    /// Records loader activity so tests can observe attach/update behavior.
    #[derive(Clone, Default)]
    struct TestLoader {
        state: Arc<Mutex<TestState>>,
    }

    #[derive(Default)]
    struct TestState {
        counters_loaded: usize,
        filters_loaded: usize,
        tracked: Vec<u32>,
        rules: Vec<FilterRule>,
        pids: Vec<u32>,
        pending_counts: StdHashMap<u32, u64>,
    }

    struct TestCounter(Arc<Mutex<TestState>>);
    struct TestFilter(Arc<Mutex<TestState>>);

    impl ProgramLoader for TestLoader {
        fn load_syscall_counter(&self) -> Result<Box<dyn SyscallCounter>, ProgramError> {
            self.state.lock().counters_loaded += 1;
            Ok(Box::new(TestCounter(self.state.clone())))
        }

        fn load_l4_filter(&self) -> Result<Box<dyn L4Filter>, ProgramError> {
            self.state.lock().filters_loaded += 1;
            Ok(Box::new(TestFilter(self.state.clone())))
        }

        fn container_pids(&self, _container_ids: &[String]) -> Vec<u32> {
            self.state.lock().pids.clone()
        }
    }

    impl SyscallCounter for TestCounter {
        fn track_pid(&mut self, pid: u32) -> Result<(), ProgramError> {
            let mut state = self.0.lock();
            if !state.tracked.contains(&pid) {
                state.tracked.push(pid);
            }
            Ok(())
        }

        fn forget_pid(&mut self, pid: u32) -> Result<(), ProgramError> {
            self.0.lock().tracked.retain(|p| *p != pid);
            Ok(())
        }

        fn take_counts(&mut self) -> Result<StdHashMap<u32, u64>, ProgramError> {
            Ok(std::mem::take(&mut self.0.lock().pending_counts))
        }
    }

    impl L4Filter for TestFilter {
        fn replace_rules(
            &mut self,
            rules: &[FilterRule],
            _default_action: FilterAction,
        ) -> Result<(), ProgramError> {
            self.0.lock().rules = rules.to_vec();
            Ok(())
        }

        fn take_stats(&mut self) -> Result<StdHashMap<String, u64>, ProgramError> {
            Ok(StdHashMap::new())
        }
    }

    fn pod(uid: &str) -> PodView {
        PodView {
            namespace: "default".to_string(),
            name: format!("pod-{uid}"),
            uid: uid.to_string(),
            node_name: "node-a".to_string(),
            phase: PodPhase::Running,
            labels: Default::default(),
            annotations: Default::default(),
            resource_version: "1".to_string(),
            container_ids: vec!["containerd://abc".to_string()],
        }
    }

    fn full_config(ports: &[u16]) -> EbpfView {
        EbpfView {
            syscall_monitoring: Some(SyscallMonitoringView {
                enabled: true,
                syscall_names: vec![],
            }),
            l4_filter: Some(L4FilterView {
                enabled: true,
                rules: ports
                    .iter()
                    .map(|&port| FilterRule {
                        port,
                        protocol: FilterProtocol::Tcp,
                        action: FilterAction::Block,
                    })
                    .collect(),
                default_action: FilterAction::Allow,
            }),
            metrics_export: Some(MetricsExportView {
                enabled: true,
                update_interval: Duration::from_secs(30),
            }),
        }
    }

    #[tokio::test]
    async fn attaches_once_and_updates_in_place() {
        let loader = TestLoader::default();
        loader.state.lock().pids = vec![42];
        let manager = Manager::new(Arc::new(loader.clone()), EbpfMetrics::for_tests());

        manager.apply(&pod("u1"), "cfg", &full_config(&[22]));
        assert_eq!(manager.attached(), 1);
        {
            let state = loader.state.lock();
            assert_eq!(state.counters_loaded, 1);
            assert_eq!(state.filters_loaded, 1);
            assert_eq!(state.tracked, vec![42]);
            assert_eq!(state.rules.len(), 1);
            assert_eq!(state.rules[0].port, 22);
        }

        // Same config: nothing is reloaded.
        manager.apply(&pod("u1"), "cfg", &full_config(&[22]));
        assert_eq!(loader.state.lock().counters_loaded, 1);

        // Changed rules are replaced on the existing program.
        manager.apply(&pod("u1"), "cfg", &full_config(&[22, 8080]));
        let state = loader.state.lock();
        assert_eq!(state.filters_loaded, 1);
        assert_eq!(state.rules.len(), 2);
    }

    #[tokio::test]
    async fn disabled_config_detaches() {
        let loader = TestLoader::default();
        let manager = Manager::new(Arc::new(loader), EbpfMetrics::for_tests());

        manager.apply(&pod("u1"), "cfg", &full_config(&[]));
        assert_eq!(manager.attached(), 1);

        manager.apply(&pod("u1"), "cfg", &EbpfView::default());
        assert_eq!(manager.attached(), 0);
    }

    #[tokio::test]
    async fn detaches_by_pod_and_by_policy() {
        let loader = TestLoader::default();
        let manager = Manager::new(Arc::new(loader), EbpfMetrics::for_tests());

        manager.apply(&pod("u1"), "cfg-a", &full_config(&[]));
        manager.apply(&pod("u2"), "cfg-a", &full_config(&[]));
        manager.apply(&pod("u3"), "cfg-b", &full_config(&[]));
        assert_eq!(manager.attached(), 3);

        manager.detach_pod("default", "pod-u1");
        assert_eq!(manager.attached(), 2);

        manager.detach_policy("default", "cfg-a");
        assert_eq!(manager.attached(), 1);

        manager.detach_policy("default", "cfg-b");
        assert_eq!(manager.attached(), 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn scrape_honors_export_interval() {
        let loader = TestLoader::default();
        loader.state.lock().pids = vec![42];
        let manager = Manager::new(Arc::new(loader.clone()), EbpfMetrics::for_tests());
        manager.apply(&pod("u1"), "cfg", &full_config(&[]));

        loader.state.lock().pending_counts.insert(42, 7);

        // Not due yet: the pending counts remain undrained.
        manager.scrape_due();
        assert_eq!(loader.state.lock().pending_counts.get(&42), Some(&7));

        time::advance(Duration::from_secs(31)).await;
        manager.scrape_due();
        assert!(loader.state.lock().pending_counts.is_empty());
    }
}
