//! Engine runtime: wires the store, schedulers and leader election together
//! and drives the periodic loops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::delivery::{DeliveryExecutor, Mailer, SmtpMailer};
use crate::error::{DatabaseError, Result};
use crate::funnels::FunnelStepScheduler;
use crate::leader::{SchedulerLeaderElector, SchedulerMode};
use crate::sending::SendRateLimiter;
use crate::store::{Database, LibSqlBackend};
use crate::suppression::SuppressionRegistry;
use crate::tick::TickReport;
use crate::transmissions::TransmissionScheduler;
use crate::variation::{CopyVariator, create_variator};

pub struct Engine {
    db: Arc<dyn Database>,
    registry: SuppressionRegistry,
    limiter: SendRateLimiter,
    executor: Arc<DeliveryExecutor>,
    funnels: Arc<FunnelStepScheduler>,
    transmissions: Arc<TransmissionScheduler>,
    elector: Arc<SchedulerLeaderElector>,
    config: EngineConfig,
    stop: Arc<watch::Sender<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine over explicit collaborators.
    pub fn new(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        mailer: Arc<dyn Mailer>,
        variator: Option<Arc<dyn CopyVariator>>,
        config: EngineConfig,
    ) -> Self {
        let registry = SuppressionRegistry::new(Arc::clone(&db), Arc::clone(&clock));
        let limiter = SendRateLimiter::new(Arc::clone(&db), Arc::clone(&clock));

        let mut executor = DeliveryExecutor::new(Arc::clone(&db), mailer, Arc::clone(&clock))
            .with_send_timeout(config.delivery.send_timeout)
            .with_max_attempts(config.delivery.max_attempts);
        if let Some(variator) = variator {
            let timeout = config
                .variation
                .as_ref()
                .map(|v| v.timeout)
                .unwrap_or(Duration::from_secs(20));
            executor = executor.with_variator(variator, timeout);
        }
        let executor = Arc::new(executor);

        let funnels = Arc::new(FunnelStepScheduler::new(
            Arc::clone(&db),
            Arc::clone(&clock),
            registry.clone(),
            limiter.clone(),
            Arc::clone(&executor),
            config.funnel.clone(),
        ));
        let transmissions = Arc::new(TransmissionScheduler::new(
            Arc::clone(&db),
            Arc::clone(&clock),
            registry.clone(),
            limiter.clone(),
            Arc::clone(&executor),
            config.transmission.clone(),
        ));

        let ttl = chrono::Duration::from_std(config.leader.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let elector = Arc::new(SchedulerLeaderElector::new(
            Arc::clone(&db),
            clock,
            config.scheduler_mode,
            &config.leader.lease_name,
            ttl,
        ));

        let (stop, _) = watch::channel(false);
        Self {
            db,
            registry,
            limiter,
            executor,
            funnels,
            transmissions,
            elector,
            config,
            stop: Arc::new(stop),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Open the configured database and build the SMTP mailer and, when an
    /// LLM key is configured, the copy variator.
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
        info!(path = %config.db_path.display(), "Database opened");

        let mailer: Arc<dyn Mailer> = Arc::new(SmtpMailer::new(config.delivery.send_timeout));
        let variator = match &config.variation {
            Some(variation) => Some(create_variator(variation)?),
            None => {
                info!("Copy variation disabled (no LLM API key)");
                None
            }
        };

        Ok(Self::new(db, Arc::new(SystemClock), mailer, variator, config))
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn registry(&self) -> &SuppressionRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &SendRateLimiter {
        &self.limiter
    }

    pub fn executor(&self) -> &Arc<DeliveryExecutor> {
        &self.executor
    }

    pub fn funnels(&self) -> &Arc<FunnelStepScheduler> {
        &self.funnels
    }

    pub fn transmissions(&self) -> &Arc<TransmissionScheduler> {
        &self.transmissions
    }

    pub fn elector(&self) -> &Arc<SchedulerLeaderElector> {
        &self.elector
    }

    /// Ask for leadership and, if granted, spawn both scheduler loops and
    /// the lease heartbeat. Returns whether the loops are running.
    ///
    /// Safe to call repeatedly: a running engine is left alone, and one whose
    /// loops stopped (lease lost) asks for leadership again. A store error
    /// during the election leaves the instance passive rather than failing.
    pub async fn start(&self) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            if !*self.stop.borrow() && tasks.iter().all(|t| !t.is_finished()) {
                debug!("Engine already started");
                return Ok(true);
            }
            self.stop.send_replace(true);
            reap(tasks.drain(..).collect()).await;
            debug!("Stopped scheduler loops reaped");
        }

        match self.elector.try_acquire_leadership().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(mode = %self.elector.mode(), "Schedulers not started on this instance");
                return Ok(false);
            }
            Err(e) => {
                warn!(error = %e, "Leader election failed, staying passive");
                return Ok(false);
            }
        }

        self.stop.send_replace(false);

        let funnels = Arc::clone(&self.funnels);
        tasks.push(spawn_ticker(
            "funnel",
            self.config.funnel.tick_interval,
            self.stop.subscribe(),
            move || {
                let funnels = Arc::clone(&funnels);
                async move { funnels.tick().await }
            },
        ));

        let transmissions = Arc::clone(&self.transmissions);
        tasks.push(spawn_ticker(
            "transmission",
            self.config.transmission.tick_interval,
            self.stop.subscribe(),
            move || {
                let transmissions = Arc::clone(&transmissions);
                async move { transmissions.tick().await }
            },
        ));

        if self.elector.mode() == SchedulerMode::Leader {
            tasks.push(spawn_heartbeat(
                Arc::clone(&self.elector),
                Arc::clone(&self.stop),
            ));
        }

        info!(
            funnel_tick_secs = self.config.funnel.tick_interval.as_secs(),
            transmission_tick_secs = self.config.transmission.tick_interval.as_secs(),
            "Schedulers started"
        );
        Ok(true)
    }

    /// Whether the scheduler loops are currently running.
    pub async fn is_running(&self) -> bool {
        let tasks = self.tasks.lock().await;
        !*self.stop.borrow() && tasks.iter().any(|t| !t.is_finished())
    }

    /// Stop the loops, wait for in-flight ticks to finish and release the lease.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop.send_replace(true);
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        reap(handles).await;
        self.elector.release().await?;
        info!("Engine stopped");
        Ok(())
    }
}

/// Wait for stopped loops to exit.
async fn reap(handles: Vec<JoinHandle<()>>) {
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
    }
}

/// Run `tick` every `period` until `stop` flips. A tick that overruns the
/// period delays the next one instead of bursting to catch up.
fn spawn_ticker<F, Fut>(
    label: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<TickReport, DatabaseError>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*stop.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    match tick().await {
                        Ok(report) if report.overlapped => {
                            debug!(scheduler = label, "Tick overlapped a running tick");
                        }
                        Ok(_) => {}
                        Err(e) => error!(scheduler = label, error = %e, "Scheduler tick failed"),
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(scheduler = label, "Scheduler loop stopped");
    })
}

/// Renew the lease every `ttl / 3`. Losing it stops every loop.
fn spawn_heartbeat(
    elector: Arc<SchedulerLeaderElector>,
    stop: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
    let mut stopped = stop.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(elector.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        while !*stopped.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = elector.renew().await {
                        error!(error = %e, "Lease renewal failed, stopping schedulers");
                        stop.send_replace(true);
                        break;
                    }
                }
                changed = stopped.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::delivery::OutboundEmail;
    use crate::error::MailerError;
    use crate::sending::SendingAccount;

    #[derive(Debug, Default)]
    struct NullMailer;

    #[async_trait]
    impl Mailer for NullMailer {
        async fn send(&self, _: &OutboundEmail, _: &SendingAccount) -> std::result::Result<(), MailerError> {
            Ok(())
        }
    }

    fn config(mode: SchedulerMode) -> EngineConfig {
        let mut config = EngineConfig {
            scheduler_mode: mode,
            ..EngineConfig::default()
        };
        config.funnel.tick_interval = Duration::from_millis(20);
        config.transmission.tick_interval = Duration::from_millis(20);
        config
    }

    async fn engine(mode: SchedulerMode, db: Arc<dyn Database>) -> Engine {
        Engine::new(
            db,
            Arc::new(ManualClock::new(Utc::now())),
            Arc::new(NullMailer),
            None,
            config(mode),
        )
    }

    /// Poll `cond` for up to two seconds.
    async fn eventually<F, Fut>(mut cond: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if cond().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn disabled_mode_never_starts() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let engine = engine(SchedulerMode::Disabled, db).await;
        assert!(!engine.start().await.unwrap());
        assert!(!engine.is_running().await);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn only_one_leader_runs_schedulers() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let first = engine(SchedulerMode::Leader, Arc::clone(&db)).await;
        let second = engine(SchedulerMode::Leader, Arc::clone(&db)).await;

        assert!(first.start().await.unwrap());
        assert!(first.is_running().await);
        assert!(!second.start().await.unwrap());

        first.shutdown().await.unwrap();
        assert!(!first.is_running().await);
        assert!(db.get_lease("outreach-schedulers").await.unwrap().is_none());

        assert!(second.start().await.unwrap());
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn lost_lease_stops_loops_and_start_asks_again() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock = ManualClock::new(Utc::now());
        let mut cfg = config(SchedulerMode::Leader);
        cfg.leader.lease_ttl = Duration::from_millis(300);
        let engine = Engine::new(
            Arc::clone(&db),
            Arc::new(clock.clone()),
            Arc::new(NullMailer),
            None,
            cfg,
        );
        let rival = SchedulerLeaderElector::new(
            Arc::clone(&db),
            Arc::new(clock.clone()),
            SchedulerMode::Leader,
            "outreach-schedulers",
            chrono::Duration::seconds(30),
        )
        .with_holder_id("rival");

        assert!(engine.start().await.unwrap());
        assert!(engine.is_running().await);

        // The engine's lease expires and the rival takes it; the next
        // heartbeat notices and stops the loops. A heartbeat can land between
        // the advance and the rival's attempt, so keep expiring until it wins.
        let mut taken = false;
        for _ in 0..10 {
            clock.advance(chrono::Duration::seconds(1));
            if rival.try_acquire_leadership().await.unwrap() {
                taken = true;
                break;
            }
        }
        assert!(taken);
        let engine_ref = &engine;
        assert!(eventually(|| async move { !engine_ref.is_running().await }).await);

        assert!(!engine.start().await.unwrap());
        assert!(!engine.is_running().await);
        assert!(engine.tasks.lock().await.is_empty());

        assert!(rival.release().await.unwrap());
        assert!(engine.start().await.unwrap());
        assert!(engine.is_running().await);
        let lease = db.get_lease("outreach-schedulers").await.unwrap().unwrap();
        assert_eq!(lease.holder, engine.elector().holder_id());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn election_store_error_leaves_instance_passive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());

        let raw = libsql::Builder::new_local(&path).build().await.unwrap();
        raw.connect()
            .unwrap()
            .execute("DROP TABLE scheduler_leases", ())
            .await
            .unwrap();

        let engine = engine(SchedulerMode::Leader, db).await;
        assert!(!engine.start().await.unwrap());
        assert!(!engine.is_running().await);
        assert!(engine.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn start_twice_keeps_one_set_of_loops() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let engine = engine(SchedulerMode::Enabled, db).await;
        assert!(engine.start().await.unwrap());
        assert!(engine.start().await.unwrap());
        assert_eq!(engine.tasks.lock().await.len(), 2);
        engine.shutdown().await.unwrap();
    }
}
