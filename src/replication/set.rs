// The replication set carrying the migrated tables.

use super::{
    REPLICATION_SET, SetupOutcome, TeardownOutcome, dropped, is_already_exists,
    is_unique_violation, setup_outcome_when, teardown_outcome,
};
use crate::error::Result;
use crate::logging::PairLog;
use crate::table::Table;
use postgres::GenericClient;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSetup {
    pub set: SetupOutcome,
    pub added: Vec<String>,
    pub already_present: Vec<String>,
}

/// pglogical catalogs report duplicate sets and set members as unique violations.
fn already_in_catalog(err: &postgres::Error) -> bool {
    is_already_exists(err) || is_unique_violation(err)
}

/// Create the replication set and add `tables` of `schema` to it.
pub fn configure_replication_set<C: GenericClient>(
    client: &mut C,
    schema: &str,
    tables: &[String],
    log: &PairLog,
) -> Result<SetSetup> {
    let _span = log.enter();
    let set = setup_outcome_when(
        client
            .query(
                "SELECT pglogical.create_replication_set(set_name := $1)",
                &[&REPLICATION_SET],
            )
            .map(|_| ()),
        &format!("replication set {REPLICATION_SET}"),
        already_in_catalog,
    )?;

    let mut setup = SetSetup {
        set,
        added: Vec::new(),
        already_present: Vec::new(),
    };
    for table in tables {
        let relation = Table::new(schema, table).quoted();
        let outcome = setup_outcome_when(
            client
                .query(
                    "SELECT pglogical.replication_set_add_table(set_name := $1, relation := $2::text::regclass, synchronize_data := true)",
                    &[&REPLICATION_SET, &relation],
                )
                .map(|_| ()),
            &format!("{relation} in {REPLICATION_SET}"),
            already_in_catalog,
        )?;
        match outcome {
            SetupOutcome::Created => setup.added.push(table.clone()),
            SetupOutcome::AlreadyExists => setup.already_present.push(table.clone()),
        }
    }
    debug!("Tables already in set: {:?}", setup.already_present);
    info!(
        "Replication set {REPLICATION_SET} ({:?}) with {} new tables",
        setup.set,
        setup.added.len()
    );
    Ok(setup)
}

pub fn drop_replication_set<C: GenericClient>(
    client: &mut C,
    log: &PairLog,
) -> Result<TeardownOutcome> {
    let _span = log.enter();
    let result = client.query_one(
        "SELECT pglogical.drop_replication_set(set_name := $1, ifexists := true)::text",
        &[&REPLICATION_SET],
    );
    let outcome = match result {
        Ok(row) if !dropped(&row.get::<_, String>(0)) => TeardownOutcome::Missing,
        Ok(_) => TeardownOutcome::Dropped,
        Err(e) => teardown_outcome(Err(e), &format!("replication set {REPLICATION_SET}"))?,
    };
    info!("Dropped replication set {REPLICATION_SET} ({outcome:?})");
    Ok(outcome)
}
