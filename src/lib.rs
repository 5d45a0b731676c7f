//! Main library entry point for pg-cutover.
//!
//! Moves a Postgres schema from one server to another with pglogical
//! replication, then carries over what replication does not: sequences,
//! tables without a primary key, deferred constraints and indexes.

pub mod args;
pub mod config;
pub mod db;
pub mod dump;
pub mod error;
pub mod fanout;
pub mod logging;
pub mod login;
pub mod orchestrator;
pub mod preflight;
pub mod replication;
pub mod rows;
pub mod schema_diff;
pub mod sequences;
pub mod status;
pub mod table;
pub mod validate;

pub use error::{CutoverError, Result};
pub use orchestrator::MigrationOrchestrator;
pub use table::*;
