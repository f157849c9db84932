//! Sending accounts, daily limits and account rotation.

pub mod account;
pub mod limiter;

pub use account::{SendingAccount, SendingConfig, SendingSettings, SlotDenied};
pub use limiter::{SendRateLimiter, SendSlot};
