use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use rusqlite::Connection;

use crate::{
    config,
    db::{self, DatabaseSession},
    dump::DumpCollector,
    endpoint::Endpoint,
    error::LimiterError,
    firewall::{self, FirewallBackend, SyncPlan},
    tracker::{PeerLimitSettings, SessionTracker},
};

/// Floor on the post-iteration sleep so a slow tick can't spin the loop.
const MIN_SLEEP: Duration = Duration::from_millis(100);

/// Rolling counters, refreshed once per tick.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub last_iteration: Option<Duration>,
    pub rules_updated: usize,
    pub peers_over_limit: usize,
}

/// The composed control loop: dump collection, session tracking, snapshot
/// persistence and firewall reconciliation, one tick at a time on a single
/// thread.
pub struct PeerLimiterDaemon {
    poll_interval: Duration,
    collector: DumpCollector,
    conn: Connection,
    tracker: SessionTracker,
    backend: Option<Box<dyn FirewallBackend>>,
    known_interfaces: HashSet<String>,
    running: Arc<AtomicBool>,
    metrics: Metrics,
}

impl PeerLimiterDaemon {
    /// Open the shared database, pick a firewall backend and install the
    /// shutdown handler. Any failure here aborts startup; failures after
    /// this point only cost ticks.
    pub fn new(poll_interval: Duration) -> Result<Self, LimiterError> {
        let database = config::database_path("wgdashboard")?;
        log::debug!("opening shared database at {}", database.display());
        let conn = db::open(&database)?;

        let backend = firewall::detect();
        if let Some(backend) = &backend {
            log::info!("enforcing with the {} backend", backend.name());
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

        Ok(Self {
            poll_interval,
            collector: DumpCollector,
            conn,
            tracker: SessionTracker::new(),
            backend,
            known_interfaces: HashSet::new(),
            running,
            metrics: Metrics::default(),
        })
    }

    /// Run until SIGINT or SIGTERM flips the running flag. The tick in
    /// flight always completes, and installed firewall rules stay in place
    /// on exit so a restart never opens the fleet.
    pub fn run(&mut self) {
        log::info!("starting WireGuard limiter daemon");
        while self.running.load(Ordering::SeqCst) {
            let start = Instant::now();
            if let Err(e) = self.iteration() {
                log::error!("iteration failed: {e}");
            }
            let elapsed = start.elapsed();
            self.metrics.last_iteration = Some(elapsed);
            log::debug!(
                "tick took {elapsed:.1?}; {} firewall updates, {} peers over limit",
                self.metrics.rules_updated,
                self.metrics.peers_over_limit,
            );
            thread::sleep(self.poll_interval.saturating_sub(elapsed).max(MIN_SLEEP));
        }
        log::info!("limiter daemon stopped");
    }

    fn iteration(&mut self) -> Result<(), LimiterError> {
        let dump = self.collector.collect()?;
        let now = Utc::now();
        let mut plans = BTreeMap::new();
        let mut over_limit = 0;

        for (interface, info) in &dump {
            let mut plan = SyncPlan::new(info.listen_port);
            for peer in &info.peers {
                let settings =
                    match db::settings::get_peer_settings(&self.conn, interface, &peer.public_key) {
                        Ok(settings) => settings,
                        Err(e) => {
                            log::warn!(
                                "using default limits for {} on {interface}: {e}",
                                peer.public_key
                            );
                            PeerLimitSettings::default()
                        },
                    };

                self.tracker.observe(
                    interface,
                    &peer.public_key,
                    Some(&peer.endpoint),
                    peer.latest_handshake,
                    peer.rx_bytes,
                    peer.tx_bytes,
                    &settings,
                    now,
                );
                let active = self
                    .tracker
                    .active_sessions(interface, &peer.public_key, &settings, now);
                let allowed = self
                    .tracker
                    .allowed_sessions(interface, &peer.public_key, &settings, now);

                if matches!(settings.max_concurrent, Some(max) if active.len() > max as usize) {
                    over_limit += 1;
                }

                // Every active session lands in the state table for operator
                // review; only the allowed ones make it into the plan.
                let allowed_endpoints: HashSet<&str> =
                    allowed.iter().map(|s| s.endpoint.as_str()).collect();
                let mut records = Vec::with_capacity(active.len());
                for session in &active {
                    let is_allowed = allowed_endpoints.contains(session.endpoint.as_str());
                    if is_allowed {
                        if let Ok(endpoint) = session.endpoint.parse::<Endpoint>() {
                            plan.insert(&endpoint);
                        }
                    }
                    records.push(DatabaseSession::from_session(
                        interface,
                        &peer.public_key,
                        session,
                        is_allowed,
                        now,
                    ));
                }
                if let Err(e) = DatabaseSession::upsert_sessions(
                    &mut self.conn,
                    interface,
                    &peer.public_key,
                    &records,
                ) {
                    log::warn!(
                        "failed to persist sessions for {} on {interface}: {e}",
                        peer.public_key
                    );
                }
            }
            plans.insert(interface.clone(), plan);
        }

        self.forget_vanished_interfaces(&plans);
        self.metrics.peers_over_limit = over_limit;
        self.metrics.rules_updated = match &mut self.backend {
            Some(backend) => backend.sync(&plans),
            None => 0,
        };
        Ok(())
    }

    /// Interfaces can disappear between ticks (wg-quick down, reboots of a
    /// single tunnel). Their persisted rows and backend bookkeeping go with
    /// them; in-memory sessions are left for TTL expiry.
    fn forget_vanished_interfaces(&mut self, plans: &BTreeMap<String, SyncPlan>) {
        let vanished: Vec<String> = self
            .known_interfaces
            .iter()
            .filter(|interface| !plans.contains_key(*interface))
            .cloned()
            .collect();
        for interface in vanished {
            log::info!("interface {interface} vanished from the dump; purging its state");
            if let Err(e) = DatabaseSession::purge_interface(&self.conn, &interface) {
                log::warn!("failed to purge state for {interface}: {e}");
            }
            if let Some(backend) = &mut self.backend {
                backend.forget_interface(&interface);
            }
            self.known_interfaces.remove(&interface);
        }
        self.known_interfaces.extend(plans.keys().cloned());
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
