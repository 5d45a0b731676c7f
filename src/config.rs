//! Configuration for one source/destination database pair.
//!
//! A pair is identified by datacenter and database name. Its resolved
//! configuration is cached as JSON under `configs/{dc}/{db}/config.json`;
//! anything missing from the cache is filled in by a [`ConfigResolver`]
//! chosen from the pair's `remote-configs/{dc}/{db}/config.json` definition.

pub mod resolver;

pub use resolver::{ConfigResolver, FileResolver, ResolverRegistry};

use crate::error::{CutoverError, Result};
use crate::logging::PairLog;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Datacenter/database identity of a migration pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairId {
    pub dc: String,
    pub db: String,
}

impl PairId {
    pub fn new(dc: &str, db: &str) -> Self {
        PairId {
            dc: dc.to_string(),
            db: db.to_string(),
        }
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dc, self.db)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pw: Option<String>,
}

impl User {
    pub fn new(name: &str, pw: Option<&str>) -> Self {
        User {
            name: name.to_string(),
            pw: pw.map(str::to_string),
        }
    }
}

/// Which of the three credential triples to connect with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Credential {
    /// Superuser used for control-plane and catalog work.
    Root,
    /// Owner of the migrated schema.
    Owner,
    /// Role the replication extension logs in as.
    Replication,
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Root => write!(f, "root"),
            Credential::Owner => write!(f, "owner"),
            Credential::Replication => write!(f, "replication"),
        }
    }
}

/// Connection coordinates of one Postgres instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DbConfig {
    pub host: String,
    pub ip: String,
    pub db: String,
    pub port: String,
    pub root_user: User,
    pub owner_user: User,
    pub pglogical_user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_users: Option<Vec<User>>,
}

impl DbConfig {
    pub fn user(&self, credential: Credential) -> &User {
        match credential {
            Credential::Root => &self.root_user,
            Credential::Owner => &self.owner_user,
            Credential::Replication => &self.pglogical_user,
        }
    }

    /// libpq key/value connection string, as accepted by psql, pg_dump and
    /// the replication extension's `dsn` arguments.
    pub fn dsn(&self, credential: Credential) -> String {
        let user = self.user(credential);
        let mut dsn = format!(
            "hostaddr={} port={} dbname={} user={}",
            quote_conninfo(&self.ip),
            quote_conninfo(&self.port),
            quote_conninfo(&self.db),
            quote_conninfo(&user.name),
        );
        if let Some(pw) = &user.pw {
            dsn.push_str(&format!(" password={}", quote_conninfo(pw)));
        }
        dsn
    }

    /// Same as [`DbConfig::dsn`] with the statement timeout disabled for the session.
    pub fn dsn_without_statement_timeout(&self, credential: Credential) -> String {
        format!("{} options='-c statement_timeout=0'", self.dsn(credential))
    }

    pub fn pg_config(&self, credential: Credential) -> Result<postgres::Config> {
        let port: u16 = self
            .port
            .parse()
            .map_err(|_| CutoverError::config(format!("invalid port `{}`", self.port)))?;
        let user = self.user(credential);
        let mut config = postgres::Config::new();
        config
            .host(&self.ip)
            .port(port)
            .dbname(&self.db)
            .user(&user.name);
        if let Some(pw) = &user.pw {
            config.password(pw);
        }
        Ok(config)
    }

    fn validate(&self, side: &str) -> Result<()> {
        for (field, value) in [
            ("host", &self.host),
            ("ip", &self.ip),
            ("db", &self.db),
            ("port", &self.port),
        ] {
            if value.is_empty() {
                return Err(CutoverError::config(format!("{side}.{field} is empty")));
            }
        }
        for credential in [Credential::Root, Credential::Owner, Credential::Replication] {
            let user = self.user(credential);
            if user.name.is_empty() || user.pw.as_deref().unwrap_or("").is_empty() {
                return Err(CutoverError::config(format!(
                    "{side} {credential} user needs a name and a password"
                )));
            }
        }
        Ok(())
    }
}

fn default_schema() -> String {
    "public".to_string()
}

/// A migration to perform: one source and one destination database.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PairConfig {
    pub db: String,
    pub dc: String,
    #[serde(default = "default_schema")]
    pub schema_name: String,
    #[serde(default)]
    pub src: Option<DbConfig>,
    #[serde(default)]
    pub dst: Option<DbConfig>,
    /// Restrict the migration to these tables. Empty means every table in the schema.
    #[serde(default)]
    pub tables: Vec<String>,
    /// Restrict sequence sync to these sequences. Empty means every sequence in the schema.
    #[serde(default)]
    pub sequences: Vec<String>,
}

impl PairConfig {
    pub fn id(&self) -> PairId {
        PairId::new(&self.dc, &self.db)
    }

    pub fn src(&self) -> Result<&DbConfig> {
        self.src
            .as_ref()
            .ok_or_else(|| CutoverError::config(format!("{} has no source config", self.id())))
    }

    pub fn dst(&self) -> Result<&DbConfig> {
        self.dst.as_ref().ok_or_else(|| {
            CutoverError::config(format!("{} has no destination config", self.id()))
        })
    }

    /// Whether the migration targets a subset of tables.
    pub fn is_scoped(&self) -> bool {
        !self.tables.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.db.is_empty() || self.dc.is_empty() {
            return Err(CutoverError::config("db and dc must not be empty"));
        }
        if self.schema_name.is_empty() {
            return Err(CutoverError::config("schema_name must not be empty"));
        }
        if let Some(src) = &self.src {
            src.validate("src")?;
        }
        if let Some(dst) = &self.dst {
            dst.validate("dst")?;
        }
        Ok(())
    }

    /// Read the cached config for `id`. A missing or unparseable file yields `None`.
    pub fn load(root: &Path, id: &PairId, log: &PairLog) -> Result<Option<Self>> {
        let _span = log.enter();
        let path = config_file(root, id);
        debug!("Trying to load cached config from {}", path.display());
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No cached config available");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<PairConfig>(&raw) {
            Ok(config) => {
                info!("Found cached config.");
                Ok(Some(config))
            }
            Err(e) => {
                info!("Cached config was not a valid pair config: {e}");
                Ok(None)
            }
        }
    }

    pub fn save(&self, root: &Path, log: &PairLog) -> Result<()> {
        let _span = log.enter();
        let path = config_file(root, &self.id());
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!("Cached config to disk.");
        Ok(())
    }
}

pub fn config_dir(root: &Path, id: &PairId) -> PathBuf {
    root.join("configs").join(&id.dc).join(&id.db)
}

pub fn config_file(root: &Path, id: &PairId) -> PathBuf {
    config_dir(root, id).join("config.json")
}

pub fn remote_config_file(root: &Path, id: &PairId) -> PathBuf {
    root.join("remote-configs")
        .join(&id.dc)
        .join(&id.db)
        .join("config.json")
}

/// Get the configuration for one pair, preferring the cache and resolving
/// whichever side is missing. The merged result is cached again.
pub fn get_config(
    root: &Path,
    id: &PairId,
    registry: &ResolverRegistry,
    skip_src: bool,
    skip_dst: bool,
) -> Result<PairConfig> {
    let log = PairLog::new(&id.db, &id.dc).child("config");
    let cached = PairConfig::load(root, id, &log)?;

    let config = match cached {
        Some(config)
            if (config.src.is_some() || skip_src) && (config.dst.is_some() || skip_dst) =>
        {
            config.validate()?;
            return Ok(config);
        }
        Some(mut config) if config.src.is_some() || config.dst.is_some() => {
            if config.src.is_none() && !skip_src {
                log.in_scope(|| info!("Cached config did not include source info, resolving..."));
                config.src = registry
                    .resolve(root, id, false, true, &log)?
                    .and_then(|c| c.src);
                if config.src.is_none() {
                    let _span = log.enter();
                    error!("Could not resolve missing source info!");
                    return Err(CutoverError::config(format!("no source config for {id}")));
                }
            }
            if config.dst.is_none() && !skip_dst {
                log.in_scope(|| info!("Cached config did not include target info, resolving..."));
                config.dst = registry
                    .resolve(root, id, true, false, &log)?
                    .and_then(|c| c.dst);
                if config.dst.is_none() {
                    let _span = log.enter();
                    error!("Could not resolve missing target info!");
                    return Err(CutoverError::config(format!(
                        "no destination config for {id}"
                    )));
                }
            }
            config
        }
        _ => {
            let _span = log.enter();
            info!("Resolving remote configuration...");
            registry
                .resolve(root, id, skip_src, skip_dst, &log)?
                .ok_or_else(|| {
                    CutoverError::config(format!("no configuration could be retrieved for {id}"))
                })?
        }
    };

    config.validate()?;
    config.save(root, &log)?;
    Ok(config)
}

/// Database names with a cached or remote config in `dc`.
pub fn available_pairs(root: &Path, dc: &str) -> Result<BTreeSet<String>> {
    let mut found = BTreeSet::new();
    for base in ["configs", "remote-configs"] {
        let dc_dir = root.join(base).join(dc);
        if !dc_dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&dc_dir)? {
            let entry = entry?;
            if entry.path().join("config.json").is_file() {
                found.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    Ok(found)
}

/// Quote a libpq conninfo value when it contains spaces, quotes or backslashes.
fn quote_conninfo(value: &str) -> String {
    if !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\')
    {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_db(ip: &str) -> DbConfig {
        DbConfig {
            host: "db.internal".into(),
            ip: ip.into(),
            db: "orders".into(),
            port: "5432".into(),
            root_user: User::new("postgres", Some("rootpw")),
            owner_user: User::new("owner", Some("owner pw")),
            pglogical_user: User::new("pglogical", Some("replpw")),
            other_users: None,
        }
    }

    pub(crate) fn sample_pair() -> PairConfig {
        PairConfig {
            db: "orders".into(),
            dc: "use1".into(),
            schema_name: "public".into(),
            src: Some(sample_db("10.0.0.1")),
            dst: Some(sample_db("10.0.0.2")),
            tables: vec![],
            sequences: vec![],
        }
    }

    #[test]
    fn dsn_quotes_values_with_spaces() {
        let db = sample_db("10.0.0.1");
        assert_eq!(
            db.dsn(Credential::Owner),
            "hostaddr=10.0.0.1 port=5432 dbname=orders user=owner password='owner pw'"
        );
        assert!(
            db.dsn_without_statement_timeout(Credential::Root)
                .ends_with("options='-c statement_timeout=0'")
        );
    }

    #[test]
    fn pg_config_rejects_bad_port() {
        let mut db = sample_db("10.0.0.1");
        db.port = "54x".into();
        assert!(db.pg_config(Credential::Root).unwrap_err().is_config());
    }

    #[test]
    fn schema_name_defaults_to_public() {
        let json = r#"{"db": "orders", "dc": "use1"}"#;
        let config: PairConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.schema_name, "public");
        assert!(config.tables.is_empty());
        assert!(config.src().is_err());
    }

    #[test]
    fn validate_requires_passwords() {
        let mut config = sample_pair();
        config.validate().unwrap();
        config.src.as_mut().unwrap().pglogical_user.pw = None;
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn save_then_load_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_pair();
        let log = PairLog::new("orders", "use1");
        config.save(dir.path(), &log).unwrap();
        let loaded = PairConfig::load(dir.path(), &config.id(), &log).unwrap();
        assert_eq!(loaded, Some(config));

        let pairs = available_pairs(dir.path(), "use1").unwrap();
        assert!(pairs.contains("orders"));
        assert!(available_pairs(dir.path(), "euw1").unwrap().is_empty());
    }

    #[test]
    fn get_config_prefers_complete_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_pair();
        config
            .save(dir.path(), &PairLog::new("orders", "use1"))
            .unwrap();
        let registry = ResolverRegistry::new();
        let got = get_config(dir.path(), &config.id(), &registry, false, false).unwrap();
        assert_eq!(got, config);
    }
}
