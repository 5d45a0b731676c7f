//! Phase sequencing for one database pair.
//!
//! Every phase opens the pools it needs and drops them when it returns,
//! whether it succeeded or not. Independent work runs through [`join2`] and
//! [`join_all`]; work that depends on an earlier step waits for it.

use crate::config::{Credential, PairConfig, User};
use crate::db::{PgPool, connect_pool, detect_pg_version};
use crate::dump::{self, ArtifactStore, SchemaArtifacts};
use crate::error::{CutoverError, Result};
use crate::fanout::{Task, join2, join_all, task};
use crate::logging::PairLog;
use crate::login::{disable_logins, enable_logins, login_users};
use crate::preflight::{self, PrecheckInfo, ProbeResult};
use crate::replication::status::{ReplicationStates, link_lag, resolve_link};
use crate::replication::{
    DST_NODE, Direction, SRC_NODE, SetupOutcome, configure_node, configure_replication_set,
    configure_role_and_extension, configure_subscription, drop_extension, drop_node,
    drop_replication_set, drop_subscription, grant_replication_access, revoke_replication_access,
};
use crate::schema_diff::{self, SchemaComparison};
use crate::sequences::{SequenceSyncReport, sync_sequences};
use crate::status::{DatasetSize, InitializationProgress, StatusReport, dataset_size};
use crate::table::{Table, TableKeys, analyze_table_pkeys};
use crate::validate::{SampleStrategy, ValidationReport, validate_data};
use itertools::Itertools;
use postgres::GenericClient;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rows sampled per validation pass.
pub const VALIDATION_SAMPLE: u32 = 100;

const TEARDOWN_PAUSE: Duration = Duration::from_secs(15);

/// Refuse to truncate a destination that holds more data than the source;
/// that usually means writes already moved there.
pub fn check_reset_failsafe(source: &DatasetSize, destination: &DatasetSize) -> Result<()> {
    if destination.bytes > source.bytes {
        return Err(CutoverError::config(format!(
            "destination dataset ({}) is larger than source ({}), refusing to reset",
            destination.pretty, source.pretty
        )));
    }
    Ok(())
}

/// Arming reverse replication needs forward streaming first; re-arming an
/// armed reverse link is allowed. Nothing proceeds while a link is down.
pub fn check_back_replication_gate(states: ReplicationStates) -> Result<()> {
    if states.any_down() {
        return Err(CutoverError::config(format!(
            "replication is down (forward {}, reverse {})",
            states.forward, states.reverse
        )));
    }
    if !states.ready_for_cutover() && !states.reverse_armed() {
        return Err(CutoverError::config(format!(
            "forward replication is {}, not replicating",
            states.forward
        )));
    }
    Ok(())
}

/// One step of [`MigrationOrchestrator::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStep {
    CheckFailsafe,
    DropSubscriptions,
    /// Re-dump the source schema so the index and constraint artifacts
    /// exist even in a workspace that never dumped it.
    RefreshArtifacts,
    Truncate,
    RemoveIndexes,
    RemoveConstraints,
}

/// Nothing is dropped or truncated before the failsafe passes.
pub const RESET_STEPS: [ResetStep; 6] = [
    ResetStep::CheckFailsafe,
    ResetStep::DropSubscriptions,
    ResetStep::RefreshArtifacts,
    ResetStep::Truncate,
    ResetStep::RemoveIndexes,
    ResetStep::RemoveConstraints,
];

pub struct MigrationOrchestrator {
    pub config: PairConfig,
    pub store: ArtifactStore,
    pub root: PathBuf,
    pub log: PairLog,
    teardown_pause: Duration,
}

impl MigrationOrchestrator {
    pub fn new(config: PairConfig, root: &Path) -> Self {
        let log = PairLog::new(&config.db, &config.dc);
        MigrationOrchestrator {
            config,
            store: ArtifactStore::new(root),
            root: root.to_path_buf(),
            log,
            teardown_pause: TEARDOWN_PAUSE,
        }
    }

    /// Pause between teardown steps, giving pglogical workers time to exit.
    pub fn with_teardown_pause(mut self, pause: Duration) -> Self {
        self.teardown_pause = pause;
        self
    }

    fn schema(&self) -> &str {
        &self.config.schema_name
    }

    fn src_pool(&self, credential: Credential) -> Result<PgPool> {
        connect_pool(self.config.src()?, credential, false)
    }

    fn dst_pool(&self, credential: Credential) -> Result<PgPool> {
        connect_pool(self.config.dst()?, credential, false)
    }

    /// Tables in scope, with their primary keys. No table in scope is a
    /// configuration error.
    fn target_keys<C: GenericClient>(&self, client: &mut C) -> Result<TableKeys> {
        let keys = analyze_table_pkeys(client, self.schema())?.scoped(&self.config.tables);
        if keys.all_tables().is_empty() {
            return Err(CutoverError::config(format!(
                "no tables in schema {} match {:?}",
                self.schema(),
                self.config.tables
            )));
        }
        Ok(keys)
    }

    pub fn check_connectivity(&self) -> Result<Vec<ProbeResult>> {
        preflight::check_connectivity(&self.config, &self.log)
    }

    pub fn precheck(&self) -> Result<Vec<PrecheckInfo>> {
        let sides = [("src", self.config.src.as_ref()), ("dst", self.config.dst.as_ref())];
        let tasks: Vec<Task<'_, PrecheckInfo>> = sides
            .into_iter()
            .filter_map(|(side, db)| db.map(|db| (side, db)))
            .map(|(side, db)| {
                task(move || {
                    let pool = connect_pool(db, Credential::Root, false)?;
                    preflight::precheck(&mut *pool.get()?, &self.config, side, db, &self.log)
                })
            })
            .collect();
        join_all(tasks)
    }

    /// Configure forward replication: role, grants and node on both sides,
    /// the replication set on the source, and the destination's subscription.
    /// With `with_schema` the source schema is dumped and its base loaded
    /// into the destination first.
    pub fn setup(&self, with_schema: bool) -> Result<()> {
        let log = self.log.child("setup");
        let (src, dst) = (self.config.src()?, self.config.dst()?);
        let src_root = self.src_pool(Credential::Root)?;
        let tables = self.target_keys(&mut *src_root.get()?)?.pkey_tables();
        if tables.is_empty() {
            return Err(CutoverError::config(
                "no tables with a primary key to replicate",
            ));
        }

        let src_log = log.child("src");
        configure_role_and_extension(&mut *src_root.get()?, src, &src_log)?;
        grant_replication_access(
            &mut *self.src_pool(Credential::Owner)?.get()?,
            self.schema(),
            &src.pglogical_user.name,
            &self.config.tables,
            &src_log,
        )?;

        let dst_log = log.child("dst");
        join2(
            || -> Result<()> {
                if with_schema {
                    dump::dump_source_schema(&self.config, &self.store, &log)?;
                    dump::apply_base_schema(&self.config, &self.store, &log)?;
                }
                let dst_root = self.dst_pool(Credential::Root)?;
                configure_role_and_extension(&mut *dst_root.get()?, dst, &dst_log)?;
                grant_replication_access(
                    &mut *self.dst_pool(Credential::Owner)?.get()?,
                    self.schema(),
                    &dst.pglogical_user.name,
                    &self.config.tables,
                    &dst_log,
                )?;
                configure_node(
                    &mut *dst_root.get()?,
                    DST_NODE,
                    &dst.dsn(Credential::Replication),
                    &dst_log,
                )?;
                Ok(())
            },
            || -> Result<()> {
                let mut conn = src_root.get()?;
                configure_node(&mut *conn, SRC_NODE, &src.dsn(Credential::Replication), &src_log)?;
                configure_replication_set(&mut *conn, self.schema(), &tables, &src_log)?;
                Ok(())
            },
        )?;

        let outcome = configure_subscription(
            &mut *self.dst_pool(Credential::Root)?.get()?,
            Direction::Forward,
            &src.dsn(Credential::Replication),
            &dst_log,
        )?;
        log.in_scope(|| info!("Forward replication configured ({outcome:?})"));
        Ok(())
    }

    /// Arm replication from the destination back to the source, for cutover.
    /// Refused unless forward replication is streaming or the reverse link
    /// is already armed, and while either link is down.
    pub fn setup_back_replication(&self) -> Result<SetupOutcome> {
        let log = self.log.child("setup-back");
        let dst = self.config.dst()?;
        let src_root = self.src_pool(Credential::Root)?;
        let dst_root = self.dst_pool(Credential::Root)?;
        let (forward, reverse) = join2(
            || resolve_link(&mut *dst_root.get()?, Direction::Forward, &log),
            || resolve_link(&mut *src_root.get()?, Direction::Reverse, &log),
        )?;
        check_back_replication_gate(ReplicationStates {
            forward: forward.status,
            reverse: reverse.status,
        })?;

        let tables = self.target_keys(&mut *src_root.get()?)?.pkey_tables();
        configure_replication_set(
            &mut *dst_root.get()?,
            self.schema(),
            &tables,
            &log.child("dst"),
        )?;
        let outcome = configure_subscription(
            &mut *src_root.get()?,
            Direction::Reverse,
            &dst.dsn(Credential::Replication),
            &log.child("src"),
        )?;
        Ok(outcome)
    }

    /// Resolve both link states, forward lag and dataset sizes.
    pub fn status(&self) -> Result<StatusReport> {
        let log = self.log.child("status");
        let src_pool = self.src_pool(Credential::Root)?;
        let dst_pool = self.dst_pool(Credential::Root)?;
        let tables = self.target_keys(&mut *src_pool.get()?)?.all_tables();
        let ((reverse, lag, src_size), (forward, dst_size)) = join2(
            || {
                let mut conn = src_pool.get()?;
                let version = detect_pg_version(&mut *conn)?;
                let reverse = resolve_link(&mut *conn, Direction::Reverse, &log.child("src"))?;
                let lag = link_lag(&mut *conn, Direction::Forward, version)?;
                let size = dataset_size(&mut *conn, self.schema(), &tables)?;
                Ok((reverse, lag, size))
            },
            || {
                let mut conn = dst_pool.get()?;
                let forward = resolve_link(&mut *conn, Direction::Forward, &log.child("dst"))?;
                let size = dataset_size(&mut *conn, self.schema(), &tables)?;
                Ok((forward, size))
            },
        )?;
        Ok(StatusReport {
            db: self.config.db.clone(),
            dc: self.config.dc.clone(),
            forward,
            reverse,
            lag,
            progress: Some(InitializationProgress::new(src_size, dst_size)),
        })
    }

    pub fn dump_schema(&self) -> Result<SchemaArtifacts> {
        dump::dump_source_schema(&self.config, &self.store, &self.log)
    }

    pub fn load_schema(&self) -> Result<()> {
        dump::apply_base_schema(&self.config, &self.store, &self.log)
    }

    pub fn load_constraints(&self) -> Result<usize> {
        dump::apply_not_valid_constraints(&self.config, &self.store, &self.log)
    }

    pub fn remove_constraints(&self) -> Result<usize> {
        dump::remove_not_valid_constraints(&self.config, &self.store, &self.log)
    }

    pub fn dump_destination_constraints(&self) -> Result<usize> {
        dump::dump_destination_not_valid_constraints(&self.config, &self.store, &self.log)
    }

    /// Create deferred indexes, then refresh planner statistics.
    pub fn create_indexes(&self) -> Result<Vec<(String, SetupOutcome)>> {
        let outcomes = dump::create_indexes(&self.config, &self.store, &self.log)?;
        self.analyze()?;
        Ok(outcomes)
    }

    pub fn remove_indexes(&self) -> Result<usize> {
        dump::remove_indexes(&self.config, &self.store, &self.log)
    }

    pub fn compare_schema(&self, fold_deferred: bool) -> Result<SchemaComparison> {
        schema_diff::compare_schema(&self.config, fold_deferred, &self.log)
    }

    pub fn dump_tables(&self, tables: &[String]) -> Result<Vec<String>> {
        dump::dump_tables(&self.config, &self.store, tables, &self.log)
    }

    pub fn load_tables(&self, tables: &[String]) -> Result<Vec<String>> {
        dump::load_tables(&self.config, &self.store, tables, &self.log)
    }

    /// ANALYZE the destination tables in scope, without a statement timeout.
    pub fn analyze(&self) -> Result<()> {
        let log = self.log.child("analyze");
        let pool = connect_pool(self.config.dst()?, Credential::Owner, true)?;
        let mut conn = pool.get()?;
        if self.config.tables.is_empty() {
            conn.batch_execute("ANALYZE")?;
        } else {
            for table in &self.config.tables {
                conn.batch_execute(&format!(
                    "ANALYZE {}",
                    Table::new(self.schema(), table).quoted()
                ))?;
            }
        }
        log.in_scope(|| info!("Analyzed destination"));
        Ok(())
    }

    pub fn sync_sequences(&self, stride: u64) -> Result<SequenceSyncReport> {
        let src_pool = self.src_pool(Credential::Root)?;
        let dst_pool = self.dst_pool(Credential::Root)?;
        sync_sequences(
            &mut *src_pool.get()?,
            &mut *dst_pool.get()?,
            self.schema(),
            &self.config.sequences,
            stride,
            &self.log,
        )
    }

    /// Sample-compare source and destination. Each call uses its own sessions.
    pub fn validate(&self, strategy: SampleStrategy) -> Result<ValidationReport> {
        let src_pool = self.src_pool(Credential::Root)?;
        let dst_pool = self.dst_pool(Credential::Root)?;
        validate_data(
            &mut *src_pool.get()?,
            &mut *dst_pool.get()?,
            self.schema(),
            &self.config.tables,
            strategy,
            &self.log,
        )
    }

    /// Bring over what replication does not carry, after writes stopped on
    /// the source: sequences and tables without a primary key, then deferred
    /// constraints and indexes, then verification.
    pub fn sync(&self, stride: u64, no_schema: bool) -> Result<()> {
        let log = self.log.child("sync");
        join2(
            || self.sync_sequences(stride),
            || {
                self.dump_tables(&[])?;
                self.load_tables(&[])
            },
        )?;
        if !no_schema {
            join2(
                || self.load_constraints(),
                || dump::create_indexes(&self.config, &self.store, &self.log),
            )?;
        }
        join_all(vec![
            task(|| self.validate(SampleStrategy::First(VALIDATION_SAMPLE)).map(|_| ())),
            task(|| self.validate(SampleStrategy::Latest(VALIDATION_SAMPLE)).map(|_| ())),
            task(|| self.analyze()),
        ])?;
        log.in_scope(|| info!("Sync complete"));
        Ok(())
    }

    pub fn teardown_back_replication(&self) -> Result<()> {
        let log = self.log.child("teardown-back");
        drop_subscription(
            &mut *self.src_pool(Credential::Root)?.get()?,
            Direction::Reverse,
            &log,
        )?;
        Ok(())
    }

    pub fn teardown_forward_replication(&self) -> Result<()> {
        let log = self.log.child("teardown-forward");
        drop_subscription(
            &mut *self.dst_pool(Credential::Root)?.get()?,
            Direction::Forward,
            &log,
        )?;
        Ok(())
    }

    /// Remove all replication objects from both sides. With `full` the
    /// replication role's grants, the role and the extension go as well.
    pub fn teardown(&self, full: bool) -> Result<()> {
        let log = self.log.child("teardown");
        let (src, dst) = (self.config.src()?, self.config.dst()?);
        let src_root = self.src_pool(Credential::Root)?;
        let dst_root = self.dst_pool(Credential::Root)?;
        let (src_log, dst_log) = (log.child("src"), log.child("dst"));

        join2(
            || drop_subscription(&mut *src_root.get()?, Direction::Reverse, &src_log),
            || drop_subscription(&mut *dst_root.get()?, Direction::Forward, &dst_log),
        )?;
        join2(
            || drop_replication_set(&mut *src_root.get()?, &src_log),
            || drop_replication_set(&mut *dst_root.get()?, &dst_log),
        )?;
        thread::sleep(self.teardown_pause);
        join2(
            || drop_node(&mut *src_root.get()?, SRC_NODE, &src_log),
            || drop_node(&mut *dst_root.get()?, DST_NODE, &dst_log),
        )?;
        if !full {
            return Ok(());
        }

        thread::sleep(self.teardown_pause);
        join2(
            || {
                revoke_replication_access(
                    &mut *self.src_pool(Credential::Owner)?.get()?,
                    self.schema(),
                    &src.pglogical_user.name,
                    &src_log,
                )
            },
            || {
                revoke_replication_access(
                    &mut *self.dst_pool(Credential::Owner)?.get()?,
                    self.schema(),
                    &dst.pglogical_user.name,
                    &dst_log,
                )
            },
        )?;
        join2(
            || drop_extension(&mut *src_root.get()?, &src.pglogical_user.name, &src_log),
            || drop_extension(&mut *dst_root.get()?, &dst.pglogical_user.name, &dst_log),
        )?;
        log.in_scope(|| info!("Teardown complete"));
        Ok(())
    }

    /// Put the destination back to an empty, replication-free state so setup
    /// can run again. Runs [`RESET_STEPS`] in order.
    pub fn reset(&self) -> Result<()> {
        let log = self.log.child("reset");
        let src_root = self.src_pool(Credential::Root)?;
        let dst_root = self.dst_pool(Credential::Root)?;
        let mut tables = Vec::new();
        for step in RESET_STEPS {
            log.in_scope(|| debug!("Reset step {step:?}"));
            match step {
                ResetStep::CheckFailsafe => {
                    tables = self.target_keys(&mut *dst_root.get()?)?.all_tables();
                    let (src_size, dst_size) = join2(
                        || dataset_size(&mut *src_root.get()?, self.schema(), &tables),
                        || dataset_size(&mut *dst_root.get()?, self.schema(), &tables),
                    )?;
                    check_reset_failsafe(&src_size, &dst_size)?;
                }
                ResetStep::DropSubscriptions => {
                    join2(
                        || drop_subscription(&mut *dst_root.get()?, Direction::Forward, &log),
                        || drop_subscription(&mut *src_root.get()?, Direction::Reverse, &log),
                    )?;
                }
                ResetStep::RefreshArtifacts => {
                    dump::dump_source_schema(&self.config, &self.store, &log)?;
                }
                ResetStep::Truncate => self.truncate_destination(&tables, &log)?,
                ResetStep::RemoveIndexes => {
                    self.remove_indexes()?;
                }
                ResetStep::RemoveConstraints => {
                    self.remove_constraints()?;
                }
            }
        }
        Ok(())
    }

    fn truncate_destination(&self, tables: &[String], log: &PairLog) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let list = tables
            .iter()
            .map(|t| Table::new(self.schema(), t).quoted())
            .join(", ");
        let owner = self.dst_pool(Credential::Owner)?;
        let mut conn = owner.get()?;
        let mut tx = conn.transaction()?;
        tx.batch_execute("SET LOCAL lock_timeout = '5s'")?;
        tx.batch_execute(&format!("TRUNCATE {list}"))?;
        tx.commit()?;
        log.in_scope(|| info!("Truncated {} destination tables", tables.len()));
        Ok(())
    }

    /// Lock application roles out of the source. The affected roles are
    /// recorded in the cached config first.
    pub fn revoke_logins(&mut self) -> Result<Vec<String>> {
        let log = self.log.child("revoke-logins");
        let src = self.config.src()?.clone();
        let pool = connect_pool(&src, Credential::Root, false)?;
        let mut conn = pool.get()?;
        let found = login_users(&mut *conn, &src)?;

        let mut users: Vec<User> = src.other_users.clone().unwrap_or_default();
        for name in &found {
            if !users.iter().any(|u| &u.name == name) {
                users.push(User::new(name, None));
            }
        }
        if let Some(src) = self.config.src.as_mut() {
            src.other_users = Some(users.clone());
        }
        self.config.save(&self.root, &log)?;

        disable_logins(&mut *conn, &users, &log)?;
        Ok(users.into_iter().map(|u| u.name).collect())
    }

    /// Give back logins taken by [`MigrationOrchestrator::revoke_logins`].
    pub fn restore_logins(&self) -> Result<usize> {
        let log = self.log.child("restore-logins");
        let src = self.config.src()?;
        let users = src.other_users.clone().unwrap_or_default();
        if users.is_empty() {
            log.in_scope(|| warn!("No revoked logins recorded for this pair"));
            return Ok(0);
        }
        let pool = connect_pool(src, Credential::Root, false)?;
        enable_logins(&mut *pool.get()?, &users, &log)?;
        Ok(users.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::LinkStatus;

    fn size(bytes: i64) -> DatasetSize {
        DatasetSize {
            bytes,
            pretty: format!("{bytes} bytes"),
        }
    }

    #[test]
    fn failsafe_trips_when_destination_is_larger() {
        check_reset_failsafe(&size(100), &size(100)).unwrap();
        check_reset_failsafe(&size(100), &size(10)).unwrap();
        let err = check_reset_failsafe(&size(100), &size(101)).unwrap_err();
        assert!(err.is_config());
    }

    fn states(forward: LinkStatus, reverse: LinkStatus) -> ReplicationStates {
        ReplicationStates { forward, reverse }
    }

    #[test]
    fn back_replication_needs_forward_streaming() {
        use LinkStatus::*;
        check_back_replication_gate(states(Replicating, Unconfigured)).unwrap();
        check_back_replication_gate(states(Replicating, Initializing)).unwrap();
        check_back_replication_gate(states(Unconfigured, Replicating)).unwrap();
        assert!(check_back_replication_gate(states(Initializing, Unconfigured)).unwrap_err().is_config());
        assert!(check_back_replication_gate(states(Unconfigured, Unconfigured)).unwrap_err().is_config());
        let err = check_back_replication_gate(states(Replicating, Down)).unwrap_err();
        assert!(err.to_string().contains("down"));
    }

    #[test]
    fn reset_checks_failsafe_before_destroying_anything() {
        let position = |step| RESET_STEPS.iter().position(|s| *s == step).unwrap();
        assert_eq!(RESET_STEPS[0], ResetStep::CheckFailsafe);
        assert!(position(ResetStep::CheckFailsafe) < position(ResetStep::DropSubscriptions));
        assert!(position(ResetStep::CheckFailsafe) < position(ResetStep::Truncate));
        assert!(position(ResetStep::RefreshArtifacts) < position(ResetStep::RemoveIndexes));
        assert!(position(ResetStep::RefreshArtifacts) < position(ResetStep::RemoveConstraints));
    }

    #[test]
    fn missing_side_is_a_config_error() {
        let mut config = crate::config::tests::sample_pair();
        config.dst = None;
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = MigrationOrchestrator::new(config, dir.path());
        assert!(orchestrator.load_constraints().is_ok());
        assert!(orchestrator.teardown_forward_replication().unwrap_err().is_config());
    }
}
