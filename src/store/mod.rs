//! Persistence layer: libSQL-backed storage for leads, funnels, transmissions,
//! sending state, suppressions and scheduler leases.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, FailureKind, LaunchResult};
