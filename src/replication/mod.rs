//! Control-plane calls against the pglogical extension.
//!
//! Setup steps are idempotent: a step whose object already exists reports
//! [`SetupOutcome::AlreadyExists`] instead of failing, and teardown steps
//! whose object is already gone report [`TeardownOutcome::Missing`].

pub mod node;
pub mod role;
pub mod set;
pub mod status;
pub mod subscription;

pub use node::{configure_node, drop_node};
pub use role::{
    configure_role_and_extension, drop_extension, grant_replication_access,
    revoke_replication_access,
};
pub use set::{configure_replication_set, drop_replication_set};
pub use status::{LinkDiagnostics, LinkState, LinkStatus, ReplicationStates};
pub use subscription::{configure_subscription, drop_subscription};

use crate::error::Result;
use postgres::error::SqlState;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Name of the replication set holding the migrated tables.
pub const REPLICATION_SET: &str = "cutover";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownOutcome {
    Dropped,
    Missing,
}

/// The two replication links of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Source provides, destination subscribes.
    Forward,
    /// Destination provides, source subscribes. Armed at cutover.
    Reverse,
}

impl Direction {
    pub fn subscription_name(&self) -> &'static str {
        match self {
            Direction::Forward => "cutover_src_to_dst",
            Direction::Reverse => "cutover_dst_to_src",
        }
    }

    /// Node registered on the subscribing side of this link.
    pub fn subscriber_node(&self) -> &'static str {
        match self {
            Direction::Forward => DST_NODE,
            Direction::Reverse => SRC_NODE,
        }
    }

    /// Initial copy only happens on the forward link.
    pub fn synchronizes_data(&self) -> bool {
        matches!(self, Direction::Forward)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "src→dst"),
            Direction::Reverse => write!(f, "dst→src"),
        }
    }
}

pub const SRC_NODE: &str = "cutover_src";
pub const DST_NODE: &str = "cutover_dst";

/// Whether `err` reports that the object being created is already there.
/// A unique violation is not one of those: it means the data disagrees with
/// the object, not that the object exists.
pub fn is_already_exists(err: &postgres::Error) -> bool {
    let Some(db) = err.as_db_error() else {
        return false;
    };
    let code = db.code();
    code == &SqlState::DUPLICATE_OBJECT
        || code == &SqlState::DUPLICATE_TABLE
        || code == &SqlState::DUPLICATE_SCHEMA
        || db.message().contains("already exists")
        || db.message().contains("existing subscription")
}

/// Whether `err` reports an existing relation, and nothing else. Used for
/// `CREATE INDEX`, where any other failure must surface.
pub fn is_existing_relation(err: &postgres::Error) -> bool {
    err.as_db_error().is_some_and(|db| {
        db.code() == &SqlState::DUPLICATE_TABLE || db.code() == &SqlState::DUPLICATE_OBJECT
    })
}

/// Whether `err` is a unique violation. pglogical reports a table already
/// in a replication set this way.
pub fn is_unique_violation(err: &postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

/// Whether `err` reports that the object being dropped or queried is not there.
pub fn is_missing(err: &postgres::Error) -> bool {
    let Some(db) = err.as_db_error() else {
        return false;
    };
    let code = db.code();
    code == &SqlState::UNDEFINED_OBJECT
        || code == &SqlState::UNDEFINED_FUNCTION
        || code == &SqlState::UNDEFINED_TABLE
        || code == &SqlState::INVALID_SCHEMA_NAME
        || db.message().contains("does not exist")
        || db.message().contains("not found")
}

/// Map the result of a create-style call to an outcome.
pub(crate) fn setup_outcome(
    result: std::result::Result<(), postgres::Error>,
    what: &str,
) -> Result<SetupOutcome> {
    setup_outcome_when(result, what, is_already_exists)
}

/// Like [`setup_outcome`], with `exists` deciding which errors mean the
/// object is already there.
pub(crate) fn setup_outcome_when(
    result: std::result::Result<(), postgres::Error>,
    what: &str,
    exists: fn(&postgres::Error) -> bool,
) -> Result<SetupOutcome> {
    match result {
        Ok(()) => Ok(SetupOutcome::Created),
        Err(e) if exists(&e) => {
            debug!("{what} already exists");
            Ok(SetupOutcome::AlreadyExists)
        }
        Err(e) => Err(e.into()),
    }
}

/// pglogical drop functions called with `ifexists` report a missing object
/// as `false` or a zero oid.
pub(crate) fn dropped(result: &str) -> bool {
    !matches!(result, "0" | "f" | "false")
}

/// Map the result of a drop-style call to an outcome.
pub(crate) fn teardown_outcome(
    result: std::result::Result<(), postgres::Error>,
    what: &str,
) -> Result<TeardownOutcome> {
    match result {
        Ok(()) => Ok(TeardownOutcome::Dropped),
        Err(e) if is_missing(&e) => {
            debug!("{what} was already gone");
            Ok(TeardownOutcome::Missing)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_have_distinct_names_and_copy_policy() {
        assert_ne!(
            Direction::Forward.subscription_name(),
            Direction::Reverse.subscription_name()
        );
        assert!(Direction::Forward.synchronizes_data());
        assert!(!Direction::Reverse.synchronizes_data());
        assert_eq!(Direction::Forward.subscriber_node(), DST_NODE);
        assert_eq!(Direction::Reverse.to_string(), "dst→src");
    }

    #[test]
    fn ifexists_results_decode() {
        assert!(dropped("t"));
        assert!(dropped("16423"));
        assert!(!dropped("f"));
        assert!(!dropped("0"));
    }
}
