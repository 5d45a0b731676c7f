//! Checks run before a migration: reachability of every credential and the
//! server facts replication depends on.

use crate::config::{Credential, DbConfig, PairConfig};
use crate::error::{CutoverError, Result};
use crate::fanout::{Task, join_all, task};
use crate::logging::PairLog;
use crate::table::analyze_table_pkeys;
use postgres::GenericClient;
use r2d2_postgres::postgres::NoTls;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const SETTINGS: [&str; 7] = [
    "wal_level",
    "max_replication_slots",
    "max_worker_processes",
    "max_wal_senders",
    "shared_preload_libraries",
    "track_commit_timestamp",
    "rds.logical_replication",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub side: String,
    pub credential: String,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.side, self.credential)
    }
}

/// Connect with `credential` and run a trivial query. Failures are part of
/// the result, never an error.
pub fn probe(db: &DbConfig, side: &str, credential: Credential) -> ProbeResult {
    let attempt = || -> Result<()> {
        let mut config = db.pg_config(credential)?;
        config.connect_timeout(PROBE_TIMEOUT);
        let mut client = config.connect(NoTls)?;
        client.simple_query("SELECT 1")?;
        Ok(())
    };
    ProbeResult {
        side: side.to_string(),
        credential: credential.to_string(),
        error: attempt().err().map(|e| e.to_string()),
    }
}

/// Probe every configured side with every credential, concurrently. All
/// probes finish before the verdict; any failure fails the check.
pub fn check_connectivity(config: &PairConfig, log: &PairLog) -> Result<Vec<ProbeResult>> {
    let log = log.child("connectivity");
    let sides: Vec<(&str, &DbConfig)> = [("src", config.src.as_ref()), ("dst", config.dst.as_ref())]
        .into_iter()
        .filter_map(|(side, db)| db.map(|db| (side, db)))
        .collect();
    let tasks: Vec<Task<'_, ProbeResult>> = sides
        .iter()
        .flat_map(|&(side, db)| {
            [Credential::Root, Credential::Owner, Credential::Replication]
                .into_iter()
                .map(move |credential| task(move || Ok(probe(db, side, credential))))
        })
        .collect();
    let results = join_all(tasks)?;

    let _span = log.enter();
    let failed: Vec<String> = results
        .iter()
        .filter(|r| !r.ok())
        .map(|r| {
            error!("{} failed: {}", r.label(), r.error.as_deref().unwrap_or(""));
            r.label()
        })
        .collect();
    if !failed.is_empty() {
        return Err(CutoverError::Connectivity(failed));
    }
    info!("All {} connectivity probes passed", results.len());
    Ok(results)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleFacts {
    pub name: String,
    pub exists: bool,
    pub superuser: bool,
    pub replication: bool,
    pub create_role: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrecheckInfo {
    pub side: String,
    pub server_version: String,
    pub settings: BTreeMap<String, String>,
    pub tables: Vec<String>,
    pub tables_without_pkey: Vec<String>,
    pub sequences: Vec<String>,
    pub roles: Vec<RoleFacts>,
    pub extensions: Vec<String>,
    pub problems: Vec<String>,
}

fn role_facts<C: GenericClient>(client: &mut C, name: &str) -> Result<RoleFacts> {
    let row = client.query_opt(
        "SELECT rolsuper, rolreplication, rolcreaterole FROM pg_roles WHERE rolname = $1",
        &[&name],
    )?;
    Ok(match row {
        Some(row) => RoleFacts {
            name: name.to_string(),
            exists: true,
            superuser: row.get(0),
            replication: row.get(1),
            create_role: row.get(2),
        },
        None => RoleFacts {
            name: name.to_string(),
            exists: false,
            superuser: false,
            replication: false,
            create_role: false,
        },
    })
}

/// Things that would stop replication from being set up on this side.
pub fn find_problems(info: &PrecheckInfo) -> Vec<String> {
    let mut problems = Vec::new();
    let setting = |name: &str| info.settings.get(name).map(String::as_str).unwrap_or("");
    if setting("wal_level") != "logical" {
        problems.push(format!("wal_level is `{}`, not `logical`", setting("wal_level")));
    }
    if !setting("shared_preload_libraries")
        .split(',')
        .any(|lib| lib.trim() == "pglogical")
    {
        problems.push("pglogical is not in shared_preload_libraries".to_string());
    }
    if info.tables.is_empty() {
        problems.push("no tables in scope".to_string());
    }
    if let Some(root) = info.roles.first() {
        if !root.superuser && !root.create_role {
            problems.push(format!("{} cannot create roles", root.name));
        }
    }
    problems
}

/// Gather server, scope and role facts for one side.
pub fn precheck<C: GenericClient>(
    client: &mut C,
    config: &PairConfig,
    side: &str,
    db: &DbConfig,
    log: &PairLog,
) -> Result<PrecheckInfo> {
    let log = log.child("precheck").child(side);
    let _span = log.enter();
    let server_version: String = client.query_one("SHOW server_version", &[])?.get(0);
    let names: Vec<String> = SETTINGS.iter().map(|s| s.to_string()).collect();
    let settings = client
        .query(
            "SELECT name, COALESCE(current_setting(name, true), 'Not Applicable')
             FROM unnest($1::text[]) AS name",
            &[&names],
        )?
        .iter()
        .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
        .collect();

    let keys = analyze_table_pkeys(client, &config.schema_name)?.scoped(&config.tables);
    let sequences = client
        .query(
            "SELECT c.relname::text FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE c.relkind = 'S' AND n.nspname = $1 ORDER BY 1",
            &[&config.schema_name],
        )?
        .iter()
        .map(|row| row.get::<_, String>(0))
        .filter(|s| {
            config.sequences.is_empty() || config.sequences.iter().any(|t| t.eq_ignore_ascii_case(s))
        })
        .collect();
    let extensions = client
        .query("SELECT extname::text FROM pg_extension ORDER BY 1", &[])?
        .iter()
        .map(|row| row.get::<_, String>(0))
        .collect();
    let mut roles = Vec::new();
    for credential in [Credential::Root, Credential::Owner, Credential::Replication] {
        roles.push(role_facts(client, &db.user(credential).name)?);
    }

    let mut info = PrecheckInfo {
        side: side.to_string(),
        server_version,
        settings,
        tables: keys.all_tables(),
        tables_without_pkey: keys.without_pkey.clone(),
        sequences,
        roles,
        extensions,
        problems: Vec::new(),
    };
    info.problems = find_problems(&info);
    for problem in &info.problems {
        warn!("{problem}");
    }
    info!(
        "Postgres {} with {} tables in scope ({} without primary key)",
        info.server_version,
        info.tables.len(),
        info.tables_without_pkey.len()
    );
    Ok(info)
}
