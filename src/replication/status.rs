//! Replication link state, derived fresh from the control plane on every call.
//!
//! Each direction is its own small state machine:
//! `unconfigured → initializing → replicating → down`. Nothing here is
//! cached; callers re-resolve whenever they need a decision.

use super::{Direction, is_missing};
use crate::db::PgVersion;
use crate::error::Result;
use crate::logging::PairLog;
use crate::rows::{TextRow, query_text};
use crate::table::quote_literal;
use postgres::GenericClient;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    /// No subscription exists for the direction.
    Unconfigured,
    /// Initial copy still running.
    Initializing,
    /// Only incremental changes are being applied.
    Replicating,
    /// Apply has stopped. Needs an operator to reset or reconfigure.
    Down,
}

impl LinkStatus {
    /// Map pglogical's textual subscription status. `None` means no
    /// subscription row. Statuses outside the known set (`disabled`,
    /// `unknown`) are treated as not applying changes.
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw {
            None => LinkStatus::Unconfigured,
            Some("initializing") | Some("synchronizing") => LinkStatus::Initializing,
            Some("replicating") => LinkStatus::Replicating,
            Some(_) => LinkStatus::Down,
        }
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self, LinkStatus::Unconfigured)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkStatus::Unconfigured => "unconfigured",
            LinkStatus::Initializing => "initializing",
            LinkStatus::Replicating => "replicating",
            LinkStatus::Down => "down",
        };
        f.write_str(s)
    }
}

/// Supplementary facts gathered when a link is down, scoped to that link's
/// subscription and stripped of connection strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkDiagnostics {
    pub subscription_status: Vec<TextRow>,
    pub subscription: Vec<TextRow>,
    pub sync_status: Vec<TextRow>,
}

impl LinkDiagnostics {
    pub fn is_empty(&self) -> bool {
        self.subscription_status.is_empty()
            && self.subscription.is_empty()
            && self.sync_status.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkState {
    pub direction: Direction,
    pub status: LinkStatus,
    /// Status text as reported by pglogical, when a subscription exists.
    pub raw_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<LinkDiagnostics>,
}

impl LinkState {
    pub fn new(direction: Direction, raw_status: Option<String>) -> Self {
        LinkState {
            direction,
            status: LinkStatus::from_raw(raw_status.as_deref()),
            raw_status,
            diagnostics: None,
        }
    }
}

/// Both directions of a pair, side by side. The two statuses are independent;
/// combinations like forward-unconfigured with reverse-replicating are real
/// states after cutover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplicationStates {
    pub forward: LinkStatus,
    pub reverse: LinkStatus,
}

impl ReplicationStates {
    /// Writes may move to the destination: forward is streaming and nothing
    /// replicates back yet.
    pub fn ready_for_cutover(&self) -> bool {
        self.forward == LinkStatus::Replicating && !self.reverse.is_configured()
    }

    /// Reverse replication is set up, i.e. cutover has started.
    pub fn reverse_armed(&self) -> bool {
        self.reverse.is_configured()
    }

    pub fn any_down(&self) -> bool {
        self.forward == LinkStatus::Down || self.reverse == LinkStatus::Down
    }
}

/// Resolve the state of `direction` on the database that subscribes for it.
pub fn resolve_link<C: GenericClient>(
    client: &mut C,
    direction: Direction,
    log: &PairLog,
) -> Result<LinkState> {
    let _span = log.enter();
    let name = direction.subscription_name();
    let raw = match client.query_opt(
        "SELECT status::text FROM pglogical.show_subscription_status() WHERE subscription_name::text = $1",
        &[&name],
    ) {
        Ok(row) => row.map(|r| r.get::<_, String>(0)),
        // no extension or no function: nothing configured yet
        Err(e) if is_missing(&e) => None,
        Err(e) => return Err(e.into()),
    };

    let mut state = LinkState::new(direction, raw);
    if state.status == LinkStatus::Down {
        let diagnostics = collect_diagnostics(client, direction);
        warn!(
            "{direction} link is down ({}): {}",
            state.raw_status.as_deref().unwrap_or("?"),
            serde_json::to_string(&diagnostics).unwrap_or_default()
        );
        state.diagnostics = Some(diagnostics);
    }
    Ok(state)
}

/// Best effort: a query that fails contributes no rows.
fn collect_diagnostics<C: GenericClient>(client: &mut C, direction: Direction) -> LinkDiagnostics {
    let name = quote_literal(direction.subscription_name());
    let mut fetch = |sql: String| -> Vec<TextRow> {
        match query_text(client, &sql) {
            Ok(rows) => rows.into_iter().map(TextRow::without_credentials).collect(),
            Err(e) => {
                debug!("Diagnostic query failed: {e}");
                Vec::new()
            }
        }
    };
    LinkDiagnostics {
        subscription_status: fetch(format!(
            "SELECT * FROM pglogical.show_subscription_status({name})"
        )),
        subscription: fetch(format!(
            "SELECT sub_name, sub_enabled, sub_slot_name, sub_replication_sets, sub_forward_origins
             FROM pglogical.subscription WHERE sub_name = {name}"
        )),
        sync_status: fetch(format!(
            "SELECT s.sync_kind, s.sync_nspname, s.sync_relname, s.sync_status, s.sync_statuslsn
             FROM pglogical.local_sync_status s
             JOIN pglogical.subscription sub ON sub.sub_id = s.sync_subid
             WHERE sub.sub_name = {name}"
        )),
    }
}

/// Replication lag of one link, in bytes of WAL, measured on the provider.
/// `None` when the provider has no walsender for the link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LagMetrics {
    pub sent: Option<i64>,
    pub write: Option<i64>,
    pub flush: Option<i64>,
    pub replay: Option<i64>,
}

pub fn lag_query(version: PgVersion) -> &'static str {
    if version.uses_xlog_names() {
        "SELECT pg_xlog_location_diff(pg_current_xlog_location(), sent_location)::bigint,
                pg_xlog_location_diff(pg_current_xlog_location(), write_location)::bigint,
                pg_xlog_location_diff(pg_current_xlog_location(), flush_location)::bigint,
                pg_xlog_location_diff(pg_current_xlog_location(), replay_location)::bigint
         FROM pg_stat_replication WHERE application_name = $1"
    } else {
        "SELECT pg_wal_lsn_diff(pg_current_wal_lsn(), sent_lsn)::bigint,
                pg_wal_lsn_diff(pg_current_wal_lsn(), write_lsn)::bigint,
                pg_wal_lsn_diff(pg_current_wal_lsn(), flush_lsn)::bigint,
                pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn)::bigint
         FROM pg_stat_replication WHERE application_name = $1"
    }
}

/// Lag of `direction`, queried on its provider.
pub fn link_lag<C: GenericClient>(
    client: &mut C,
    direction: Direction,
    version: PgVersion,
) -> Result<LagMetrics> {
    let row = client.query_opt(lag_query(version), &[&direction.subscription_name()])?;
    Ok(row
        .map(|r| LagMetrics {
            sent: r.get(0),
            write: r.get(1),
            flush: r.get(2),
            replay: r.get(3),
        })
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_statuses_map_to_states() {
        assert_eq!(LinkStatus::from_raw(None), LinkStatus::Unconfigured);
        assert_eq!(
            LinkStatus::from_raw(Some("initializing")),
            LinkStatus::Initializing
        );
        assert_eq!(
            LinkStatus::from_raw(Some("replicating")),
            LinkStatus::Replicating
        );
        assert_eq!(LinkStatus::from_raw(Some("down")), LinkStatus::Down);
        assert_eq!(LinkStatus::from_raw(Some("disabled")), LinkStatus::Down);
    }

    #[test]
    fn directions_are_independent() {
        let before_cutover = ReplicationStates {
            forward: LinkStatus::Replicating,
            reverse: LinkStatus::Unconfigured,
        };
        let after_cutover = ReplicationStates {
            forward: LinkStatus::Unconfigured,
            reverse: LinkStatus::Replicating,
        };
        assert_ne!(before_cutover, after_cutover);
        assert!(before_cutover.ready_for_cutover());
        assert!(!before_cutover.reverse_armed());
        assert!(!after_cutover.ready_for_cutover());
        assert!(after_cutover.reverse_armed());
    }

    #[test]
    fn link_state_keeps_raw_status() {
        let state = LinkState::new(Direction::Reverse, Some("down".into()));
        assert_eq!(state.status, LinkStatus::Down);
        assert_eq!(state.raw_status.as_deref(), Some("down"));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["direction"], "reverse");
        assert_eq!(json["status"], "down");
        assert!(json.get("diagnostics").is_none());
    }

    #[test]
    fn lag_query_follows_server_version() {
        assert!(lag_query(PgVersion::from_version_num(90624)).contains("pg_xlog_location_diff"));
        assert!(lag_query(PgVersion::from_version_num(140005)).contains("pg_wal_lsn_diff"));
    }
}
