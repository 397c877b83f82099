//! Persistence layer: libSQL-backed sender throttle history.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ThrottleRecord, ThrottleStore, normalize_sender};
