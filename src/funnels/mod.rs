//! Funnels: ordered, delayed steps sent to enrolled leads.

pub mod model;
pub mod scheduler;

pub use model::{
    Advance, DelayUnit, DueEnrollment, EnrollmentStatus, Funnel, FunnelEnrollment, FunnelStep,
};
pub use scheduler::FunnelStepScheduler;
