//! Scheduler leader election.
//!
//! Only the leader runs the periodic schedulers. The lock is a lease row in
//! the shared database: taken when absent or expired, renewed by a heartbeat,
//! released on shutdown. A crashed leader's lease expires after `ttl` and the
//! next instance to ask takes over.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::LeaderError;
use crate::store::Database;

/// A row of `scheduler_leases`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Startup-time selector for whether this process runs the schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerMode {
    /// Run only while holding the lease.
    #[default]
    Leader,
    /// Always run; the operator guarantees a single instance.
    Enabled,
    /// Never run.
    Disabled,
}

impl std::fmt::Display for SchedulerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerMode::Leader => write!(f, "leader"),
            SchedulerMode::Enabled => write!(f, "enabled"),
            SchedulerMode::Disabled => write!(f, "disabled"),
        }
    }
}

impl FromStr for SchedulerMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "leader" => Ok(SchedulerMode::Leader),
            "enabled" => Ok(SchedulerMode::Enabled),
            "disabled" => Ok(SchedulerMode::Disabled),
            other => Err(format!(
                "unknown scheduler mode: {other} (expected leader, enabled or disabled)"
            )),
        }
    }
}

/// Decides whether this process may run the schedulers.
pub struct SchedulerLeaderElector {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    mode: SchedulerMode,
    lease_name: String,
    holder_id: String,
    ttl: Duration,
    held: AtomicBool,
}

impl SchedulerLeaderElector {
    pub fn new(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        mode: SchedulerMode,
        lease_name: &str,
        ttl: Duration,
    ) -> Self {
        Self {
            db,
            clock,
            mode,
            lease_name: lease_name.to_string(),
            holder_id: default_holder_id(),
            ttl,
            held: AtomicBool::new(false),
        }
    }

    /// Override the holder id (tests run several electors in one process).
    pub fn with_holder_id(mut self, holder_id: &str) -> Self {
        self.holder_id = holder_id.to_string();
        self
    }

    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Whether the last acquire or renew succeeded.
    pub fn is_leader(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// How often the lease should be renewed.
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        (self.ttl / 3).to_std().unwrap_or(std::time::Duration::from_secs(1))
    }

    /// Ask for leadership. Losing to another holder is `Ok(false)`, not an error.
    pub async fn try_acquire_leadership(&self) -> Result<bool, LeaderError> {
        let granted = match self.mode {
            SchedulerMode::Disabled => {
                info!("Schedulers disabled by configuration");
                false
            }
            SchedulerMode::Enabled => {
                info!("Schedulers enabled without coordination");
                true
            }
            SchedulerMode::Leader => {
                let won = self
                    .db
                    .try_acquire_lease(&self.lease_name, &self.holder_id, self.clock.now(), self.ttl)
                    .await?;
                if won {
                    info!(lease = %self.lease_name, holder = %self.holder_id, "Scheduler leadership acquired");
                } else {
                    let current = self.db.get_lease(&self.lease_name).await?;
                    debug!(
                        lease = %self.lease_name,
                        holder = current.as_ref().map(|l| l.holder.as_str()).unwrap_or("unknown"),
                        "Another instance holds scheduler leadership"
                    );
                }
                won
            }
        };
        self.held.store(granted, Ordering::SeqCst);
        Ok(granted)
    }

    /// Extend the lease. Fails with `LeaseLost` if another holder took it.
    pub async fn renew(&self) -> Result<(), LeaderError> {
        if self.mode != SchedulerMode::Leader {
            return Ok(());
        }
        let renewed = self
            .db
            .try_acquire_lease(&self.lease_name, &self.holder_id, self.clock.now(), self.ttl)
            .await?;
        if renewed {
            debug!(lease = %self.lease_name, "Lease renewed");
            Ok(())
        } else {
            self.held.store(false, Ordering::SeqCst);
            warn!(lease = %self.lease_name, holder = %self.holder_id, "Lease lost");
            Err(LeaderError::LeaseLost {
                name: self.lease_name.clone(),
            })
        }
    }

    /// Give up the lease so another instance can take over without waiting
    /// for expiry.
    pub async fn release(&self) -> Result<bool, LeaderError> {
        self.held.store(false, Ordering::SeqCst);
        if self.mode != SchedulerMode::Leader {
            return Ok(false);
        }
        let released = self
            .db
            .release_lease(&self.lease_name, &self.holder_id)
            .await?;
        if released {
            info!(lease = %self.lease_name, "Scheduler leadership released");
        }
        Ok(released)
    }
}

/// `hostname-pid-shortuuid`.
fn default_holder_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LibSqlBackend;

    async fn setup() -> (Arc<dyn Database>, ManualClock) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock = ManualClock::new(Utc::now());
        (db, clock)
    }

    fn elector(db: &Arc<dyn Database>, clock: &ManualClock, mode: SchedulerMode, holder: &str) -> SchedulerLeaderElector {
        SchedulerLeaderElector::new(
            Arc::clone(db),
            Arc::new(clock.clone()),
            mode,
            "schedulers",
            Duration::seconds(30),
        )
        .with_holder_id(holder)
    }

    #[tokio::test]
    async fn second_instance_does_not_lead() {
        let (db, clock) = setup().await;
        let a = elector(&db, &clock, SchedulerMode::Leader, "a");
        let b = elector(&db, &clock, SchedulerMode::Leader, "b");

        assert!(a.try_acquire_leadership().await.unwrap());
        assert!(!b.try_acquire_leadership().await.unwrap());
        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn expired_lease_fails_open() {
        let (db, clock) = setup().await;
        let a = elector(&db, &clock, SchedulerMode::Leader, "a");
        let b = elector(&db, &clock, SchedulerMode::Leader, "b");
        assert!(a.try_acquire_leadership().await.unwrap());

        // a stops renewing (crash); b takes over once the ttl passes.
        clock.advance(Duration::seconds(31));
        assert!(b.try_acquire_leadership().await.unwrap());

        let err = a.renew().await.unwrap_err();
        assert!(matches!(err, LeaderError::LeaseLost { .. }));
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn heartbeat_keeps_lease() {
        let (db, clock) = setup().await;
        let a = elector(&db, &clock, SchedulerMode::Leader, "a");
        let b = elector(&db, &clock, SchedulerMode::Leader, "b");
        assert!(a.try_acquire_leadership().await.unwrap());

        for _ in 0..5 {
            clock.advance(Duration::seconds(10));
            a.renew().await.unwrap();
            assert!(!b.try_acquire_leadership().await.unwrap());
        }
    }

    #[tokio::test]
    async fn release_hands_over() {
        let (db, clock) = setup().await;
        let a = elector(&db, &clock, SchedulerMode::Leader, "a");
        let b = elector(&db, &clock, SchedulerMode::Leader, "b");
        assert!(a.try_acquire_leadership().await.unwrap());
        assert!(a.release().await.unwrap());
        assert!(b.try_acquire_leadership().await.unwrap());
    }

    #[tokio::test]
    async fn enabled_and_disabled_skip_the_lease() {
        let (db, clock) = setup().await;
        let on = elector(&db, &clock, SchedulerMode::Enabled, "on");
        let off = elector(&db, &clock, SchedulerMode::Disabled, "off");
        assert!(on.try_acquire_leadership().await.unwrap());
        assert!(!off.try_acquire_leadership().await.unwrap());
        assert!(db.get_lease("schedulers").await.unwrap().is_none());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("Leader".parse::<SchedulerMode>().unwrap(), SchedulerMode::Leader);
        assert_eq!(" enabled ".parse::<SchedulerMode>().unwrap(), SchedulerMode::Enabled);
        assert_eq!("disabled".parse::<SchedulerMode>().unwrap(), SchedulerMode::Disabled);
        assert!("sometimes".parse::<SchedulerMode>().is_err());
    }

    #[test]
    fn holder_id_has_pid() {
        let id = default_holder_id();
        assert!(id.contains(&std::process::id().to_string()));
    }
}
