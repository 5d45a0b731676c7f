// Blocking application logins on the source around cutover.

use crate::config::{Credential, DbConfig, User};
use crate::error::Result;
use crate::logging::PairLog;
use crate::table::quote_ident;
use postgres::GenericClient;
use tracing::info;

/// Roles never locked out: replication, administration and monitoring.
pub const NO_DISABLE: [&str; 9] = [
    "pglogical",
    "postgres",
    "rdsadmin",
    "vividcortexsu",
    "vividcortex",
    "fivetran",
    "datadog",
    "rdsrepladmin",
    "monitoring",
];

/// Login roles that would be locked out: everything that can log in except
/// the configured credentials, the fixed list above and built-in `pg_` roles.
pub fn login_users<C: GenericClient>(client: &mut C, db: &DbConfig) -> Result<Vec<String>> {
    let configured: Vec<&str> = [Credential::Root, Credential::Owner, Credential::Replication]
        .iter()
        .map(|c| db.user(*c).name.as_str())
        .collect();
    let users = client
        .query(
            "SELECT rolname::text FROM pg_roles
             WHERE rolcanlogin AND rolname !~ '^pg_'
             ORDER BY 1",
            &[],
        )?
        .iter()
        .map(|row| row.get::<_, String>(0))
        .filter(|name| !NO_DISABLE.contains(&name.as_str()) && !configured.contains(&name.as_str()))
        .collect();
    Ok(users)
}

fn set_login<C: GenericClient>(client: &mut C, users: &[User], login: bool) -> Result<()> {
    let mut tx = client.transaction()?;
    let option = if login { "LOGIN" } else { "NOLOGIN" };
    for user in users {
        tx.batch_execute(&format!("ALTER ROLE {} WITH {option}", quote_ident(&user.name)))?;
    }
    tx.commit()?;
    Ok(())
}

/// `ALTER ROLE .. NOLOGIN` for every user, all or nothing.
pub fn disable_logins<C: GenericClient>(
    client: &mut C,
    users: &[User],
    log: &PairLog,
) -> Result<()> {
    let _span = log.enter();
    set_login(client, users, false)?;
    info!("Disabled login for {} users", users.len());
    Ok(())
}

pub fn enable_logins<C: GenericClient>(
    client: &mut C,
    users: &[User],
    log: &PairLog,
) -> Result<()> {
    let _span = log.enter();
    set_login(client, users, true)?;
    info!("Restored login for {} users", users.len());
    Ok(())
}
