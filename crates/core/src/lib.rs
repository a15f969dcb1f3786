//! ldapsync core library.
//!
//! Synchronizes users and groups from an LDAP directory into a SQL
//! destination using the LDAP content synchronization operation
//! (RFC 4533): protocol controls, the directory watcher that turns raw
//! responses into events, the reconciler that applies those events,
//! the trace recorder, configuration and persistence.

pub mod config;
pub mod db;
pub mod errors;
pub mod ldap;
pub mod models;
pub mod schema;
pub mod store;
pub mod sync_engine;
pub mod trace;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use ldap::{DirectoryModel, Flavor, LdapDirectory, RefreshMode, Watcher};
pub use models::{Cookie, Event, SyncId};
pub use store::{Destination, MemoryDestination, StateStore};
pub use sync_engine::{synchronize, watch, Reconciler, SyncOptions, SyncSummary};
