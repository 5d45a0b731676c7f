// Subscriptions: one per replication direction.

use super::{
    Direction, REPLICATION_SET, SetupOutcome, TeardownOutcome, dropped, setup_outcome,
    teardown_outcome,
};
use crate::error::Result;
use crate::logging::PairLog;
use postgres::GenericClient;
use tracing::info;

/// Subscribe the connected database to `provider_dsn` for `direction`.
/// Structure is never synchronized and no foreign origins are forwarded.
pub fn configure_subscription<C: GenericClient>(
    client: &mut C,
    direction: Direction,
    provider_dsn: &str,
    log: &PairLog,
) -> Result<SetupOutcome> {
    let _span = log.enter();
    let name = direction.subscription_name();
    let outcome = setup_outcome(
        client
            .query(
                "SELECT pglogical.create_subscription(
                     subscription_name := $1,
                     provider_dsn := $2,
                     replication_sets := ARRAY[$3::text],
                     synchronize_structure := false,
                     synchronize_data := $4,
                     forward_origins := '{}'::text[])",
                &[
                    &name,
                    &provider_dsn,
                    &REPLICATION_SET,
                    &direction.synchronizes_data(),
                ],
            )
            .map(|_| ()),
        &format!("subscription {name}"),
    )?;
    info!("Configured {direction} subscription {name} ({outcome:?})");
    Ok(outcome)
}

pub fn drop_subscription<C: GenericClient>(
    client: &mut C,
    direction: Direction,
    log: &PairLog,
) -> Result<TeardownOutcome> {
    let _span = log.enter();
    let name = direction.subscription_name();
    let result = client.query_one(
        "SELECT pglogical.drop_subscription(subscription_name := $1, ifexists := true)::text",
        &[&name],
    );
    let outcome = match result {
        Ok(row) if !dropped(&row.get::<_, String>(0)) => TeardownOutcome::Missing,
        Ok(_) => TeardownOutcome::Dropped,
        Err(e) => teardown_outcome(Err(e), &format!("subscription {name}"))?,
    };
    info!("Dropped {direction} subscription {name} ({outcome:?})");
    Ok(outcome)
}
