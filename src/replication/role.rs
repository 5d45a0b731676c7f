// Replication role, extension and grants.

use super::{SetupOutcome, TeardownOutcome, setup_outcome, teardown_outcome};
use crate::config::DbConfig;
use crate::error::Result;
use crate::logging::PairLog;
use crate::table::{quote_ident, quote_literal};
use postgres::GenericClient;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSetup {
    pub role: SetupOutcome,
    pub extension: SetupOutcome,
    pub rds: bool,
}

/// Whether the instance is a managed RDS server, detected by its admin role.
pub fn is_rds<C: GenericClient>(client: &mut C) -> Result<bool> {
    let row = client.query_opt("SELECT 1 FROM pg_roles WHERE rolname = 'rdsadmin'", &[])?;
    Ok(row.is_some())
}

/// Create the replication role and the pglogical extension. Run as root.
pub fn configure_role_and_extension<C: GenericClient>(
    client: &mut C,
    db: &DbConfig,
    log: &PairLog,
) -> Result<RoleSetup> {
    let _span = log.enter();
    let repl = &db.pglogical_user;
    let repl_ident = quote_ident(&repl.name);

    let role = setup_outcome(
        client.batch_execute(&format!(
            "CREATE USER {repl_ident} WITH LOGIN REPLICATION PASSWORD {}",
            quote_literal(repl.pw.as_deref().unwrap_or_default())
        )),
        &format!("role {}", repl.name),
    )?;

    let rds = is_rds(client)?;
    if rds {
        client.batch_execute(&format!(
            "GRANT rds_superuser TO {repl_ident}; GRANT rds_replication TO {repl_ident}"
        ))?;
    } else {
        client.batch_execute(&format!("ALTER USER {repl_ident} WITH SUPERUSER"))?;
    }

    let extension = setup_outcome(
        client.batch_execute("CREATE EXTENSION pglogical"),
        "extension pglogical",
    )?;
    client.batch_execute(&format!(
        "GRANT USAGE ON SCHEMA pglogical TO {}",
        quote_ident(&db.owner_user.name)
    ))?;

    info!(
        "Replication role {} ({role:?}), extension ({extension:?}), rds={rds}",
        repl.name
    );
    Ok(RoleSetup {
        role,
        extension,
        rds,
    })
}

/// Give the replication role access to the migrated tables and every
/// sequence of the schema. Run as the schema owner.
pub fn grant_replication_access<C: GenericClient>(
    client: &mut C,
    schema: &str,
    repl_user: &str,
    tables: &[String],
    log: &PairLog,
) -> Result<()> {
    let _span = log.enter();
    let schema_ident = quote_ident(schema);
    let repl_ident = quote_ident(repl_user);

    let mut sql = format!("GRANT USAGE ON SCHEMA {schema_ident} TO {repl_ident};\n");
    if tables.is_empty() {
        sql.push_str(&format!(
            "GRANT ALL ON ALL TABLES IN SCHEMA {schema_ident} TO {repl_ident};\n"
        ));
    } else {
        for table in tables {
            sql.push_str(&format!(
                "GRANT ALL ON TABLE {schema_ident}.{} TO {repl_ident};\n",
                quote_ident(table)
            ));
        }
    }
    sql.push_str(&format!(
        "GRANT ALL ON ALL SEQUENCES IN SCHEMA {schema_ident} TO {repl_ident};"
    ));
    client.batch_execute(&sql)?;
    info!("Granted {repl_user} access to {schema}");
    Ok(())
}

/// Take back what [`grant_replication_access`] gave. Run as the schema owner.
pub fn revoke_replication_access<C: GenericClient>(
    client: &mut C,
    schema: &str,
    repl_user: &str,
    log: &PairLog,
) -> Result<TeardownOutcome> {
    let _span = log.enter();
    let schema_ident = quote_ident(schema);
    let repl_ident = quote_ident(repl_user);
    let outcome = teardown_outcome(
        client.batch_execute(&format!(
            "REVOKE ALL ON ALL TABLES IN SCHEMA {schema_ident} FROM {repl_ident};
             REVOKE ALL ON ALL SEQUENCES IN SCHEMA {schema_ident} FROM {repl_ident};
             REVOKE USAGE ON SCHEMA {schema_ident} FROM {repl_ident};"
        )),
        &format!("role {repl_user}"),
    )?;
    info!("Revoked {repl_user} access to {schema} ({outcome:?})");
    Ok(outcome)
}

/// Drop the pglogical extension and the replication role. Run as root.
pub fn drop_extension<C: GenericClient>(
    client: &mut C,
    repl_user: &str,
    log: &PairLog,
) -> Result<()> {
    let _span = log.enter();
    client.batch_execute("DROP EXTENSION IF EXISTS pglogical CASCADE")?;
    client.batch_execute(&format!("DROP ROLE IF EXISTS {}", quote_ident(repl_user)))?;
    info!("Dropped pglogical extension and role {repl_user}");
    Ok(())
}
