//! Schema and table-data transfer between the two sides of a pair.
//!
//! The source schema is dumped once and split into artifacts; later phases
//! read the artifacts back from disk, so a retry resumes from what was
//! already written.

pub mod artifacts;
pub mod classify;
pub mod splitter;
pub mod subprocess;

pub use artifacts::ArtifactStore;
pub use classify::{ArtifactKind, SchemaArtifacts, classify};
pub use splitter::{DumpStatement, StatementSplitter, split_statements};

use crate::config::{Credential, PairConfig};
use crate::db::connect_pool;
use crate::error::Result;
use crate::fanout::{Task, join_all, task};
use crate::logging::PairLog;
use crate::replication::{SetupOutcome, is_existing_relation, setup_outcome_when};
use crate::table::{Table, analyze_table_pkeys, quote_ident};
use postgres::GenericClient;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{info, warn};

static INDEX_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*CREATE\s+(?:UNIQUE\s+)?INDEX\s+(?:CONCURRENTLY\s+)?(?:IF\s+NOT\s+EXISTS\s+)?(?P<name>[^\s(]+)\s+ON\s",
    )
    .expect("valid regex")
});

static ADDED_CONSTRAINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*ALTER\s+TABLE\s+(?:ONLY\s+)?(?P<table>\S+)\s+ADD\s+CONSTRAINT\s+(?P<name>\S+)\s",
    )
    .expect("valid regex")
});

/// Name of the index a `CREATE INDEX` statement creates, as written in the dump.
pub fn index_name(statement: &DumpStatement) -> Option<String> {
    INDEX_NAME
        .captures(statement.text())
        .map(|c| c["name"].to_string())
}

/// Table and constraint name of an `ALTER TABLE .. ADD CONSTRAINT` statement.
pub fn added_constraint(statement: &DumpStatement) -> Option<(String, String)> {
    ADDED_CONSTRAINT
        .captures(statement.text())
        .map(|c| (c["table"].to_string(), c["name"].to_string()))
}

/// Whether a possibly qualified, possibly quoted table from a dump is one of `targets`.
fn in_scope(dump_table: &str, targets: &[String]) -> bool {
    if targets.is_empty() {
        return true;
    }
    let bare = dump_table.rsplit('.').next().unwrap_or(dump_table).replace('"', "");
    targets.iter().any(|t| t.eq_ignore_ascii_case(&bare))
}

/// Dump the source schema, classify it and write all artifacts.
pub fn dump_source_schema(
    config: &PairConfig,
    store: &ArtifactStore,
    log: &PairLog,
) -> Result<SchemaArtifacts> {
    let log = log.child("dump-schema");
    let src = config.src()?;
    let dump = log.in_scope(|| {
        info!("Dumping source schema {}", config.schema_name);
        subprocess::dump_schema(&src.dsn(Credential::Root), &config.schema_name)
    })?;
    let artifacts = classify(split_statements(&dump));
    store.write_schema(&config.id(), &artifacts)?;

    let _span = log.enter();
    for statement in &artifacts.fk_required {
        info!(
            "Keeping FK-required index in base schema: {}",
            statement.text().trim_end()
        );
    }
    info!(
        "Wrote schema artifacts: {} base, {} not valid, {} indexes",
        artifacts.base.len(),
        artifacts.only_invalid.len(),
        artifacts.only_indexes.len()
    );
    Ok(artifacts)
}

fn apply_artifact(
    config: &PairConfig,
    store: &ArtifactStore,
    kind: ArtifactKind,
    log: &PairLog,
) -> Result<()> {
    let _span = log.enter();
    let dst = config.dst()?;
    let file = store.schema_file(&config.id(), kind);
    info!("Applying {kind} to destination");
    let output = subprocess::apply_script(&dst.dsn(Credential::Owner), &file.to_string_lossy())?;
    for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
        warn!("psql: {line}");
    }
    Ok(())
}

/// Load the base artifact (everything but deferred indexes and NOT VALID
/// constraints) into the destination.
pub fn apply_base_schema(config: &PairConfig, store: &ArtifactStore, log: &PairLog) -> Result<()> {
    apply_artifact(config, store, ArtifactKind::Base, &log.child("load-schema"))
}

/// Load the NOT VALID constraints, inside a single transaction.
pub fn apply_not_valid_constraints(
    config: &PairConfig,
    store: &ArtifactStore,
    log: &PairLog,
) -> Result<usize> {
    let log = log.child("load-constraints");
    let _span = log.enter();
    let statements = store.read_statements(&config.id(), ArtifactKind::OnlyInvalid)?;
    if statements.is_empty() {
        info!("No NOT VALID constraints to load");
        return Ok(0);
    }
    let pool = connect_pool(config.dst()?, Credential::Owner, false)?;
    let mut conn = pool.get()?;
    let mut tx = conn.transaction()?;
    let mut loaded = 0;
    for statement in &statements {
        let (table, name) = added_constraint(statement).unwrap_or_default();
        if !in_scope(&table, &config.tables) {
            continue;
        }
        // a constraint with this name already there means an earlier run got this far
        let exists = tx
            .query_opt(
                "SELECT 1 FROM pg_constraint c
                 JOIN pg_namespace n ON n.oid = c.connamespace
                 WHERE n.nspname = $1 AND c.conname = $2",
                &[&config.schema_name, &name.replace('"', "")],
            )?
            .is_some();
        if exists {
            info!("Constraint {name} already exists");
            continue;
        }
        tx.batch_execute(statement.text())?;
        loaded += 1;
    }
    tx.commit()?;
    info!("Loaded {loaded} NOT VALID constraints");
    Ok(loaded)
}

/// Run one `CREATE INDEX` statement. Only an index that is already there is
/// tolerated; a unique index the data violates is an error.
pub fn create_index<C: GenericClient>(
    client: &mut C,
    statement: &DumpStatement,
) -> Result<(String, SetupOutcome)> {
    let name = index_name(statement).unwrap_or_else(|| "<unnamed>".to_string());
    info!("Creating index {name}");
    let outcome = setup_outcome_when(
        client.batch_execute(statement.text()),
        &format!("index {name}"),
        is_existing_relation,
    )?;
    Ok((name, outcome))
}

/// Create every deferred index, one statement at a time, with the statement
/// timeout disabled. Indexes that already exist are skipped.
pub fn create_indexes(
    config: &PairConfig,
    store: &ArtifactStore,
    log: &PairLog,
) -> Result<Vec<(String, SetupOutcome)>> {
    let log = log.child("create-indexes");
    let _span = log.enter();
    let statements = store.read_statements(&config.id(), ArtifactKind::OnlyIndexes)?;
    let pool = connect_pool(config.dst()?, Credential::Owner, true)?;
    let mut conn = pool.get()?;
    let mut outcomes = Vec::new();
    for statement in &statements {
        outcomes.push(create_index(&mut *conn, statement)?);
    }
    info!("Processed {} indexes", outcomes.len());
    Ok(outcomes)
}

/// Drop every deferred index named in the artifact from the destination.
pub fn remove_indexes(config: &PairConfig, store: &ArtifactStore, log: &PairLog) -> Result<usize> {
    let log = log.child("remove-indexes");
    let _span = log.enter();
    let names: Vec<String> = store
        .read_statements(&config.id(), ArtifactKind::OnlyIndexes)?
        .iter()
        .filter_map(index_name)
        .collect();
    if names.is_empty() {
        info!("No indexes to remove");
        return Ok(0);
    }
    let pool = connect_pool(config.dst()?, Credential::Owner, true)?;
    let mut conn = pool.get()?;
    let schema = quote_ident(&config.schema_name);
    for name in &names {
        conn.batch_execute(&format!("DROP INDEX IF EXISTS {schema}.{name}"))?;
    }
    info!("Removed {} indexes", names.len());
    Ok(names.len())
}

/// Drop the NOT VALID constraints named in the artifact, in one transaction.
pub fn remove_not_valid_constraints(
    config: &PairConfig,
    store: &ArtifactStore,
    log: &PairLog,
) -> Result<usize> {
    let log = log.child("remove-constraints");
    let _span = log.enter();
    let targets: Vec<(String, String)> = store
        .read_statements(&config.id(), ArtifactKind::OnlyInvalid)?
        .iter()
        .filter_map(added_constraint)
        .filter(|(table, _)| in_scope(table, &config.tables))
        .collect();
    if targets.is_empty() {
        info!("No NOT VALID constraints to remove");
        return Ok(0);
    }
    let pool = connect_pool(config.dst()?, Credential::Owner, false)?;
    let mut conn = pool.get()?;
    let mut tx = conn.transaction()?;
    for (table, name) in &targets {
        tx.batch_execute(&format!("ALTER TABLE {table} DROP CONSTRAINT IF EXISTS {name}"))?;
    }
    tx.commit()?;
    info!("Removed {} NOT VALID constraints", targets.len());
    Ok(targets.len())
}

/// Rebuild the NOT VALID artifact from the destination's current schema, for
/// destinations whose schema was loaded outside this tool.
pub fn dump_destination_not_valid_constraints(
    config: &PairConfig,
    store: &ArtifactStore,
    log: &PairLog,
) -> Result<usize> {
    let log = log.child("dump-constraints");
    let _span = log.enter();
    let dst = config.dst()?;
    let dump = subprocess::dump_schema(&dst.dsn(Credential::Root), &config.schema_name)?;
    let constraints: Vec<DumpStatement> = split_statements(&dump)
        .into_iter()
        .filter(classify::is_not_valid)
        .filter(|s| {
            added_constraint(s).is_none_or(|(table, _)| in_scope(&table, &config.tables))
        })
        .collect();
    store.write_artifact(&config.id(), ArtifactKind::OnlyInvalid, &constraints)?;
    info!("Dumped {} NOT VALID constraints from destination", constraints.len());
    Ok(constraints.len())
}

/// Dump the data of `tables` from the source, one `pg_dump` per table, all
/// concurrently. With no tables given, every table without a primary key in
/// scope is dumped, since those are not carried by replication.
pub fn dump_tables(
    config: &PairConfig,
    store: &ArtifactStore,
    tables: &[String],
    log: &PairLog,
) -> Result<Vec<String>> {
    let log = log.child("dump-tables");
    let src = config.src()?;
    let tables = if tables.is_empty() {
        let pool = connect_pool(src, Credential::Root, false)?;
        analyze_table_pkeys(&mut *pool.get()?, &config.schema_name)?
            .scoped(&config.tables)
            .without_pkey
    } else {
        tables.to_vec()
    };
    if tables.is_empty() {
        log.in_scope(|| info!("No tables to dump"));
        return Ok(tables);
    }

    let dir = store.prepare_table_dir(&config.id())?;
    let dsn = src.dsn(Credential::Root);
    let tasks: Vec<Task<'_, ()>> = tables
        .iter()
        .map(|table| {
            let file = dir.join(format!("{table}.dump"));
            let dsn = &dsn;
            let log = &log;
            task(move || {
                let qualified = Table::new(&config.schema_name, table).quoted();
                log.in_scope(|| info!("Dumping {qualified}"));
                subprocess::dump_table_data(dsn, &qualified, &file.to_string_lossy())
            })
        })
        .collect();
    join_all(tasks)?;
    log.in_scope(|| info!("Dumped {} tables", tables.len()));
    Ok(tables)
}

/// Restore dumped table data into the destination, concurrently. Only empty
/// tables are loaded, so repeating a load is harmless. With no tables given,
/// every dump file on disk is loaded.
pub fn load_tables(
    config: &PairConfig,
    store: &ArtifactStore,
    tables: &[String],
    log: &PairLog,
) -> Result<Vec<String>> {
    let log = log.child("load-tables");
    let dst = config.dst()?;
    let id = config.id();
    let tables = if tables.is_empty() {
        store.dumped_tables(&id)?
    } else {
        tables.to_vec()
    };
    if tables.is_empty() {
        log.in_scope(|| info!("No table dumps to load"));
        return Ok(tables);
    }

    let pool = connect_pool(dst, Credential::Root, false)?;
    let dsn = dst.dsn(Credential::Owner);
    let tasks: Vec<Task<'_, Option<String>>> = tables
        .iter()
        .map(|table| {
            let (pool, dsn, log, file) = (&pool, &dsn, &log, store.table_file(&id, table));
            task(move || {
                let target = Table::new(&config.schema_name, table);
                if !target.is_empty(&mut *pool.get()?)? {
                    log.in_scope(|| warn!("{target} is not empty, not loading it"));
                    return Ok(None);
                }
                log.in_scope(|| info!("Loading {target}"));
                subprocess::restore_table_data(dsn, &file.to_string_lossy())?;
                Ok(Some(table.clone()))
            })
        })
        .collect();
    let loaded: Vec<String> = join_all(tasks)?.into_iter().flatten().collect();
    log.in_scope(|| info!("Loaded {} of {} tables", loaded.len(), tables.len()));
    Ok(loaded)
}
