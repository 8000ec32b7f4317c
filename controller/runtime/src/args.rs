use crate::lease;
use anyhow::{bail, Result};
use clap::Parser;
use pod_configmap_controller_core::{Error, K8sDuration};
use pod_configmap_controller_ebpf as ebpf;
use pod_configmap_controller_k8s_api::{self as k8s, watcher};
use pod_configmap_controller_k8s_index::{Index, Queue, QueueMetrics, RateLimiter, SharedIndex};
use pod_configmap_controller_k8s_status as status;
use pod_configmap_controller_reconcile as reconcile;
use prometheus_client::registry::Registry;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, time};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "pod-configmap-controller",
    about = "Generates a ConfigMap per (pod, PodConfigMapConfig) pair and keeps it in sync"
)]
pub struct Args {
    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: kubert::LogFilter,

    #[clap(long, env = "LOG_FORMAT", default_value = "plain")]
    log_format: kubert::LogFormat,

    /// Forces debug-level logging regardless of LOG_LEVEL.
    #[clap(long, env = "DEBUG", default_value_t = false, action = clap::ArgAction::Set)]
    debug: bool,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    /// Admin server (readiness and /metrics). METRICS_ADDR overrides the
    /// bind address.
    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, env = "LEADER_ELECTION_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    leader_election_enabled: bool,

    #[clap(long, env = "LEADER_ELECTION_LEASE_DURATION", default_value = "15s")]
    leader_election_lease_duration: K8sDuration,

    #[clap(long, env = "LEADER_ELECTION_RENEW_DEADLINE", default_value = "10s")]
    leader_election_renew_deadline: K8sDuration,

    #[clap(long, env = "LEADER_ELECTION_RETRY_PERIOD", default_value = "2s")]
    leader_election_retry_period: K8sDuration,

    #[clap(
        long,
        env = "LEADER_ELECTION_LOCK_NAME",
        default_value = "podconfigmap-controller-lock"
    )]
    leader_election_lock_name: String,

    /// Defaults to POD_NAMESPACE, then "default".
    #[clap(long, env = "LEADER_ELECTION_LOCK_NAMESPACE")]
    leader_election_lock_namespace: Option<String>,

    /// Cadence of the full re-enqueue pass that repairs out-of-band drift.
    #[clap(long, env = "CONTROLLER_RESYNC_PERIOD", default_value = "10m")]
    resync_period: K8sDuration,

    #[clap(long, env = "CONTROLLER_POD_WORKERS", default_value_t = 1)]
    pod_workers: usize,

    #[clap(long, env = "CONTROLLER_PCMC_WORKERS", default_value_t = 1)]
    pcmc_workers: usize,

    /// Attempts for the in-line conflict-retry loop of one pair sync.
    #[clap(long, env = "CONTROLLER_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    #[clap(long, env = "CONTROLLER_RECONCILIATION_TIMEOUT", default_value = "30s")]
    reconciliation_timeout: K8sDuration,
}

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    /// Checks the startup settings before any cluster traffic happens. A
    /// violation is a Configuration error and is fatal.
    fn validate(&self) -> Result<(), Error> {
        if self.leader_election_enabled {
            if self.leader_election_lease_duration.is_zero()
                || self.leader_election_renew_deadline.is_zero()
                || self.leader_election_retry_period.is_zero()
            {
                return Err(Error::configuration(
                    "leader election durations must be positive",
                ));
            }
            if self.leader_election_renew_deadline >= self.leader_election_lease_duration {
                return Err(Error::configuration(
                    "leader election renew deadline must be less than the lease duration",
                ));
            }
            if self.leader_election_lock_name.is_empty() {
                return Err(Error::configuration(
                    "leader election lock name must not be empty",
                ));
            }
        }
        if self.resync_period.is_zero() {
            return Err(Error::configuration("resync period must be positive"));
        }
        if self.pod_workers == 0 || self.pcmc_workers == 0 {
            return Err(Error::configuration("worker counts must be positive"));
        }
        if self.reconciliation_timeout.is_zero() {
            return Err(Error::configuration(
                "reconciliation timeout must be positive",
            ));
        }
        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        self.validate()?;

        let Self {
            log_level,
            log_format,
            debug,
            client,
            mut admin,
            leader_election_enabled,
            leader_election_lease_duration,
            leader_election_renew_deadline,
            leader_election_retry_period,
            leader_election_lock_name,
            leader_election_lock_namespace,
            resync_period,
            pod_workers,
            pcmc_workers,
            max_retries,
            reconciliation_timeout,
        } = self;

        let lease_duration = leader_election_lease_duration.as_duration();
        let renew_deadline = leader_election_renew_deadline.as_duration();
        let retry_period = leader_election_retry_period.as_duration();

        let log_level = if debug {
            "debug".parse().unwrap_or(log_level)
        } else {
            log_level
        };
        if let Ok(addr) = std::env::var("METRICS_ADDR") {
            admin.admin_addr = addr
                .parse()
                .map_err(|error| Error::configuration(format!("invalid METRICS_ADDR: {error}")))?;
        }

        let mut prom = <Registry>::default();
        let queue_metrics = QueueMetrics::register(&mut prom);
        let reconcile_metrics = reconcile::Metrics::register(&mut prom);
        let status_metrics = status::StatusMetrics::register(&mut prom);
        let ebpf_metrics = ebpf::EbpfMetrics::register(&mut prom);

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let pod_queue = Queue::new("pods", RateLimiter::default(), &queue_metrics);
        let config_queue = Queue::new(
            "podconfigmapconfigs",
            RateLimiter::default(),
            &queue_metrics,
        );
        let gate = Arc::new(AtomicBool::new(false));
        let index = Index::shared(pod_queue.clone(), config_queue.clone(), gate.clone());

        // Watches start immediately so followers hold warm caches and can
        // take over without a cold list.
        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let configs = runtime.watch_all::<k8s::PodConfigMapConfig>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), configs)
                .instrument(info_span!("podconfigmapconfigs")),
        );

        let identity = election_identity();
        let lock_namespace = leader_election_lock_namespace
            .or_else(|| std::env::var("POD_NAMESPACE").ok())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| "default".to_string());

        let ebpf_manager = ebpf::Manager::new(
            Arc::new(ebpf::UserspaceLoader::default()),
            ebpf_metrics,
        );
        tokio::spawn(
            ebpf_manager
                .clone()
                .run(runtime.shutdown_handle())
                .instrument(info_span!("ebpf")),
        );

        let status_writer = Arc::new(status::Writer::new(runtime.client(), status_metrics));
        let reconciler = reconcile::Reconciler::new(
            runtime.client(),
            index.clone(),
            pod_queue.clone(),
            config_queue.clone(),
            status_writer,
            ebpf_manager,
            reconcile_metrics,
            reconcile::Settings {
                max_retries,
                timeout: reconciliation_timeout.as_duration(),
            },
        );
        for _ in 0..pod_workers {
            tokio::spawn(
                reconciler
                    .clone()
                    .run_pod_worker()
                    .instrument(info_span!("pod-worker")),
            );
        }
        for _ in 0..pcmc_workers {
            tokio::spawn(
                reconciler
                    .clone()
                    .run_config_worker()
                    .instrument(info_span!("pcmc-worker")),
            );
        }

        if leader_election_enabled {
            let claims = lease::init(
                &runtime,
                &leader_election_lock_name,
                &lock_namespace,
                &identity,
                lease_duration,
                // kubert renews once the remaining validity drops below the
                // grace period, which corresponds to the renew deadline
                // measured from acquisition.
                lease_duration.saturating_sub(renew_deadline).max(retry_period),
            )
            .await?;
            tokio::spawn(
                follow_claims(claims, identity, gate.clone(), index.clone())
                    .instrument(info_span!("lease")),
            );
        } else {
            info!("leader election disabled, reconciling unconditionally");
            gate.store(true, Ordering::Release);
        }

        tokio::spawn(resync(index, gate, resync_period.as_duration()));

        // Block on the shutdown signal; the admin server keeps serving
        // readiness and metrics until then.
        let result = runtime.run().await;
        pod_queue.shut_down();
        config_queue.shut_down();
        if result.is_err() {
            bail!("aborted");
        }
        Ok(())
    }
}

/// `POD_NAME` when running in-cluster, otherwise the hostname.
fn election_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Tracks the election. On acquisition the enqueue gate opens and the whole
/// cache is replayed onto the queues; on loss the process exits so the
/// supervisor restarts it into a clean follower (all state is rebuilt from
/// the cluster).
async fn follow_claims(
    mut claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    identity: String,
    gate: Arc<AtomicBool>,
    index: SharedIndex,
) {
    let mut was_leader = false;
    loop {
        let is_leader = claims.borrow_and_update().is_current_for(&identity);
        if is_leader && !was_leader {
            info!(%identity, "leadership acquired, starting reconciliation");
            gate.store(true, Ordering::Release);
            index.read().enqueue_all();
        } else if !is_leader && was_leader {
            info!(%identity, "leadership lost, exiting");
            std::process::exit(0);
        }
        was_leader = is_leader;

        if claims.changed().await.is_err() {
            // The claim task must outlive the process: without renewal the
            // lease lapses and a new leader may start writing while this
            // replica still holds open queues.
            let error = Error::internal("lease claim channel closed");
            tracing::error!(%error, "exiting");
            std::process::exit(1);
        }
    }
}

/// Periodically replays the cache onto the queues, standing in for the
/// informer resync of client-go and repairing ConfigMaps modified out of
/// band.
async fn resync(index: SharedIndex, gate: Arc<AtomicBool>, period: Duration) {
    let mut tick = time::interval(period);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the initial watch events already
    // cover that pass.
    tick.tick().await;
    loop {
        tick.tick().await;
        if gate.load(Ordering::Acquire) {
            tracing::debug!("resync: re-enqueueing all cached objects");
            index.read().enqueue_all();
        }
    }
}
