//! Transmissions: one-off broadcast campaigns.

pub mod model;
pub mod scheduler;

pub use model::{
    Audience, PendingRecipient, RecipientState, SendOrder, Transmission, TransmissionMode,
    TransmissionRecipient, TransmissionStatus,
};
pub use scheduler::TransmissionScheduler;
