//! Send slot acquisition shared by both schedulers.

use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::sending::account::{SendingAccount, SlotDenied};
use crate::store::Database;

/// Result of asking for a send slot.
#[derive(Debug, Clone)]
pub enum SendSlot {
    Allowed(SendingAccount),
    Denied(SlotDenied),
}

impl SendSlot {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SendSlot::Allowed(_))
    }

    pub fn account(&self) -> Option<&SendingAccount> {
        match self {
            SendSlot::Allowed(account) => Some(account),
            SendSlot::Denied(_) => None,
        }
    }
}

/// Daily cap, minimum interval and account rotation in one atomic acquire.
///
/// The store serialises the read-modify-write of the config row, so the
/// funnel and transmission loops can call this concurrently.
#[derive(Clone)]
pub struct SendRateLimiter {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
}

impl SendRateLimiter {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub async fn acquire_send_slot(&self) -> Result<SendSlot, DatabaseError> {
        let slot = self.db.acquire_send_slot(self.clock.now()).await?;
        match &slot {
            SendSlot::Allowed(account) => {
                debug!(account = %account.name, "Send slot granted")
            }
            SendSlot::Denied(reason) => debug!(%reason, "Send slot denied"),
        }
        Ok(slot)
    }
}
