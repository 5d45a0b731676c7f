// pglogical nodes.

use super::{SetupOutcome, TeardownOutcome, dropped, setup_outcome, teardown_outcome};
use crate::error::Result;
use crate::logging::PairLog;
use postgres::GenericClient;
use tracing::info;

/// Register this database as node `name`, reachable by peers at `dsn`.
pub fn configure_node<C: GenericClient>(
    client: &mut C,
    name: &str,
    dsn: &str,
    log: &PairLog,
) -> Result<SetupOutcome> {
    let _span = log.enter();
    let outcome = setup_outcome(
        client
            .query(
                "SELECT pglogical.create_node(node_name := $1, dsn := $2)",
                &[&name, &dsn],
            )
            .map(|_| ()),
        &format!("node {name}"),
    )?;
    info!("Configured node {name} ({outcome:?})");
    Ok(outcome)
}

pub fn drop_node<C: GenericClient>(
    client: &mut C,
    name: &str,
    log: &PairLog,
) -> Result<TeardownOutcome> {
    let _span = log.enter();
    let result = client.query_one(
        "SELECT pglogical.drop_node(node_name := $1, ifexists := true)::text",
        &[&name],
    );
    let outcome = match result {
        Ok(row) if !dropped(&row.get::<_, String>(0)) => TeardownOutcome::Missing,
        Ok(_) => TeardownOutcome::Dropped,
        Err(e) => teardown_outcome(Err(e), &format!("node {name}"))?,
    };
    info!("Dropped node {name} ({outcome:?})");
    Ok(outcome)
}
