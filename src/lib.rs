//! Outreach engine: funnel and broadcast email scheduling over libSQL.

pub mod clock;
pub mod config;
pub mod content;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod funnels;
pub mod immediate;
pub mod leader;
pub mod leads;
pub mod sending;
pub mod store;
pub mod suppression;
pub mod tick;
pub mod transmissions;
pub mod variation;

pub use engine::Engine;
pub use error::{Error, Result};
