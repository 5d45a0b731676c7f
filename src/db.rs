//! Connection pools and server facts.

use crate::config::{Credential, DbConfig};
use crate::error::Result;
use postgres::GenericClient;
use r2d2::Pool;
use r2d2_postgres::{PostgresConnectionManager, postgres::NoTls as R2d2NoTls};
use std::time::Duration;

pub type PgPool = Pool<PostgresConnectionManager<R2d2NoTls>>;

/// Build a pool for one side and credential. With `no_statement_timeout`
/// every session runs with `statement_timeout=0`, for long DDL and ANALYZE.
/// Pools close their connections when dropped.
pub fn connect_pool(
    db: &DbConfig,
    credential: Credential,
    no_statement_timeout: bool,
) -> Result<PgPool> {
    let mut config = db.pg_config(credential)?;
    if no_statement_timeout {
        config.options("-c statement_timeout=0");
    }
    let manager = PostgresConnectionManager::new(config, R2d2NoTls);
    let pool = Pool::builder()
        .max_size(8)
        .min_idle(Some(0))
        .connection_timeout(Duration::from_secs(30))
        .build(manager)?;
    Ok(pool)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PgVersion {
    pub major: u32,
    pub minor: u32,
}

impl PgVersion {
    /// Decode `server_version_num`, e.g. `90624` or `130014`.
    pub fn from_version_num(version_num: i32) -> Self {
        PgVersion {
            major: (version_num / 10000) as u32,
            minor: ((version_num / 100) % 100) as u32,
        }
    }

    /// 9.x servers name their WAL functions `xlog` instead of `wal`.
    pub fn uses_xlog_names(&self) -> bool {
        self.major < 10
    }
}

pub fn detect_pg_version<C: GenericClient>(client: &mut C) -> Result<PgVersion> {
    let row = client.query_one("SHOW server_version_num", &[])?;
    let raw: String = row.get(0);
    let version_num: i32 = raw.trim().parse().map_err(|_| {
        crate::error::CutoverError::config(format!("unexpected server_version_num `{raw}`"))
    })?;
    Ok(PgVersion::from_version_num(version_num))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_old_and_new_version_numbers() {
        let v96 = PgVersion::from_version_num(90624);
        assert_eq!(v96, PgVersion { major: 9, minor: 6 });
        assert!(v96.uses_xlog_names());

        let v13 = PgVersion::from_version_num(130014);
        assert_eq!(v13.major, 13);
        assert!(!v13.uses_xlog_names());
    }
}
