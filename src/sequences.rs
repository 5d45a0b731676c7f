//! Sequence reconciliation.
//!
//! Logical replication does not carry sequence values, so before writes move
//! to the destination its sequences are brought forward. A sequence feeding a
//! primary-key default is set from the data itself; any other sequence takes
//! the source value plus an optional stride, and never moves backwards.

use crate::error::{CutoverError, Result};
use crate::logging::PairLog;
use crate::table::{Table, quote_ident};
use postgres::GenericClient;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SequenceKind {
    /// Default source of a primary-key column. `max_pk` is read from the destination.
    PkBacked {
        table: String,
        column: String,
        max_pk: Option<i64>,
    },
    FreeStanding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceState {
    pub name: String,
    pub schema: String,
    pub kind: SequenceKind,
    pub source_value: Option<i64>,
    pub destination_value: Option<i64>,
    pub stride: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum SequenceDecision {
    Set { value: i64 },
    /// PK-backed sequence of an empty table.
    LeaveEmptyTable,
    /// Free-standing sequence the source does not have.
    LeaveMissingOnSource,
    /// Free-standing sequence the destination does not have.
    LeaveMissingOnDestination,
    /// Applying the source value would move the destination backwards.
    LeaveWouldRegress { candidate: i64, current: i64 },
}

impl SequenceState {
    pub fn decide(&self) -> SequenceDecision {
        match &self.kind {
            SequenceKind::PkBacked { max_pk: Some(max), .. } => SequenceDecision::Set { value: *max },
            SequenceKind::PkBacked { max_pk: None, .. } => SequenceDecision::LeaveEmptyTable,
            SequenceKind::FreeStanding => {
                let Some(source) = self.source_value else {
                    return SequenceDecision::LeaveMissingOnSource;
                };
                let Some(current) = self.destination_value else {
                    return SequenceDecision::LeaveMissingOnDestination;
                };
                let candidate = source.saturating_add(self.stride);
                if candidate >= current {
                    SequenceDecision::Set { value: candidate }
                } else {
                    SequenceDecision::LeaveWouldRegress { candidate, current }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceSyncReport {
    pub sequences: Vec<(SequenceState, SequenceDecision)>,
}

impl SequenceSyncReport {
    pub fn is_noop(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn applied(&self) -> usize {
        self.sequences
            .iter()
            .filter(|(_, d)| matches!(d, SequenceDecision::Set { .. }))
            .count()
    }
}

/// Primary-key column a sequence feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkColumn {
    pub table: String,
    pub column: String,
}

fn wanted(name: &str, targets: &[String]) -> bool {
    targets.is_empty() || targets.iter().any(|t| t.eq_ignore_ascii_case(name))
}

/// Sequences of `schema` that back a primary-key column, through a column
/// default calling `nextval` or an identity column.
pub fn pk_backed_sequences<C: GenericClient>(
    client: &mut C,
    schema: &str,
    targets: &[String],
) -> Result<BTreeMap<String, PkColumn>> {
    let rows = client.query(
        "SELECT s.relname::text, t.relname::text, a.attname::text
         FROM pg_attrdef ad
         JOIN pg_depend d ON d.classid = 'pg_attrdef'::regclass
                         AND d.objid = ad.oid
                         AND d.refclassid = 'pg_class'::regclass
         JOIN pg_class s ON s.oid = d.refobjid AND s.relkind = 'S'
         JOIN pg_class t ON t.oid = ad.adrelid
         JOIN pg_namespace n ON n.oid = t.relnamespace
         JOIN pg_attribute a ON a.attrelid = ad.adrelid AND a.attnum = ad.adnum
         JOIN pg_index i ON i.indrelid = t.oid AND i.indisprimary AND a.attnum = ANY(i.indkey)
         WHERE n.nspname = $1
         UNION
         SELECT s.relname::text, t.relname::text, a.attname::text
         FROM pg_depend d
         JOIN pg_class s ON s.oid = d.objid AND s.relkind = 'S'
         JOIN pg_class t ON t.oid = d.refobjid
         JOIN pg_namespace n ON n.oid = t.relnamespace
         JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = d.refobjsubid
         JOIN pg_index i ON i.indrelid = t.oid AND i.indisprimary AND a.attnum = ANY(i.indkey)
         WHERE d.classid = 'pg_class'::regclass
           AND d.refclassid = 'pg_class'::regclass
           AND d.deptype = 'i'
           AND n.nspname = $1
         ORDER BY 1",
        &[&schema],
    )?;
    let mut found = BTreeMap::new();
    for row in &rows {
        let name: String = row.get(0);
        if !wanted(&name, targets) {
            continue;
        }
        found.entry(name).or_insert(PkColumn {
            table: row.get(1),
            column: row.get(2),
        });
    }
    Ok(found)
}

/// Current `last_value` of every sequence in `schema` (restricted to `targets`).
pub fn sequence_values<C: GenericClient>(
    client: &mut C,
    schema: &str,
    targets: &[String],
) -> Result<BTreeMap<String, i64>> {
    let names: Vec<String> = client
        .query(
            "SELECT c.relname::text FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE c.relkind = 'S' AND n.nspname = $1
             ORDER BY 1",
            &[&schema],
        )?
        .iter()
        .map(|row| row.get::<_, String>(0))
        .filter(|name| wanted(name, targets))
        .collect();
    let mut values = BTreeMap::new();
    for name in names {
        let row = client.query_one(
            &format!(
                "SELECT last_value FROM {}",
                Table::new(schema, &name).quoted()
            ),
            &[],
        )?;
        values.insert(name, row.get::<_, i64>(0));
    }
    Ok(values)
}

/// Reconcile destination sequences against the source.
///
/// Fails with a configuration error when `targets` names sequences and none
/// of them exist. All writes to the destination happen in one transaction.
pub fn sync_sequences<S: GenericClient, D: GenericClient>(
    src: &mut S,
    dst: &mut D,
    schema: &str,
    targets: &[String],
    stride: u64,
    log: &PairLog,
) -> Result<SequenceSyncReport> {
    let log = log.child("sequences");
    let _span = log.enter();
    let stride = i64::try_from(stride)
        .map_err(|_| CutoverError::config(format!("sequence stride {stride} is too large")))?;

    let pk_backed = pk_backed_sequences(dst, schema, targets)?;
    let mut source_values = sequence_values(src, schema, targets)?;
    if !targets.is_empty() && pk_backed.is_empty() && source_values.is_empty() {
        return Err(CutoverError::config(format!(
            "none of the sequences {targets:?} exist in schema {schema}"
        )));
    }
    for name in pk_backed.keys() {
        source_values.remove(name);
    }
    if pk_backed.is_empty() && source_values.is_empty() {
        info!("No sequences to sync.");
        return Ok(SequenceSyncReport {
            sequences: Vec::new(),
        });
    }

    let mut tx = dst.transaction()?;
    let destination_values = sequence_values(&mut tx, schema, targets)?;
    let mut report = SequenceSyncReport {
        sequences: Vec::new(),
    };

    for (name, pk) in &pk_backed {
        let max_pk: Option<i64> = tx
            .query_one(
                &format!(
                    "SELECT max({})::bigint FROM {}",
                    quote_ident(&pk.column),
                    Table::new(schema, &pk.table).quoted()
                ),
                &[],
            )?
            .get(0);
        let state = SequenceState {
            name: name.clone(),
            schema: schema.to_string(),
            kind: SequenceKind::PkBacked {
                table: pk.table.clone(),
                column: pk.column.clone(),
                max_pk,
            },
            source_value: None,
            destination_value: destination_values.get(name).copied(),
            stride: 0,
        };
        report.sequences.push((state, SequenceDecision::LeaveEmptyTable));
    }
    for (name, source_value) in &source_values {
        let state = SequenceState {
            name: name.clone(),
            schema: schema.to_string(),
            kind: SequenceKind::FreeStanding,
            source_value: Some(*source_value),
            destination_value: destination_values.get(name).copied(),
            stride,
        };
        report.sequences.push((state, SequenceDecision::LeaveEmptyTable));
    }

    for (state, decision) in report.sequences.iter_mut() {
        *decision = state.decide();
        match *decision {
            SequenceDecision::Set { value } => {
                let regclass = Table::new(schema, &state.name).quoted();
                tx.execute(
                    "SELECT setval($1::text::regclass, $2, true)",
                    &[&regclass, &value],
                )?;
                debug!("Set {} to {value}", state.name);
            }
            SequenceDecision::LeaveWouldRegress { candidate, current } => {
                warn!(
                    "Not moving {} back from {current} to {candidate}",
                    state.name
                );
            }
            other => debug!("Leaving {} alone: {other:?}", state.name),
        }
    }
    tx.commit()?;
    info!(
        "Synced {} of {} sequences",
        report.applied(),
        report.sequences.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_standing(source: i64, destination: i64, stride: i64) -> SequenceState {
        SequenceState {
            name: "invoice_numbers".into(),
            schema: "public".into(),
            kind: SequenceKind::FreeStanding,
            source_value: Some(source),
            destination_value: Some(destination),
            stride,
        }
    }

    #[test]
    fn free_standing_never_regresses() {
        assert_eq!(
            free_standing(300, 500, 0).decide(),
            SequenceDecision::LeaveWouldRegress {
                candidate: 300,
                current: 500
            }
        );
    }

    #[test]
    fn stride_past_destination_advances() {
        assert_eq!(
            free_standing(300, 500, 250).decide(),
            SequenceDecision::Set { value: 550 }
        );
        assert_eq!(
            free_standing(500, 500, 0).decide(),
            SequenceDecision::Set { value: 500 }
        );
    }

    #[test]
    fn pk_backed_follows_data_even_downwards() {
        let state = SequenceState {
            name: "orders_id_seq".into(),
            schema: "public".into(),
            kind: SequenceKind::PkBacked {
                table: "orders".into(),
                column: "id".into(),
                max_pk: Some(42),
            },
            source_value: None,
            destination_value: Some(1_000),
            stride: 0,
        };
        assert_eq!(state.decide(), SequenceDecision::Set { value: 42 });

        let empty = SequenceState {
            kind: SequenceKind::PkBacked {
                table: "orders".into(),
                column: "id".into(),
                max_pk: None,
            },
            ..state
        };
        assert_eq!(empty.decide(), SequenceDecision::LeaveEmptyTable);
    }

    #[test]
    fn missing_sides_are_left_alone() {
        let mut state = free_standing(10, 5, 0);
        state.source_value = None;
        assert_eq!(state.decide(), SequenceDecision::LeaveMissingOnSource);
        let mut state = free_standing(10, 5, 0);
        state.destination_value = None;
        assert_eq!(state.decide(), SequenceDecision::LeaveMissingOnDestination);
    }

    #[test]
    fn stride_saturates() {
        assert_eq!(
            free_standing(i64::MAX - 1, 0, 10).decide(),
            SequenceDecision::Set { value: i64::MAX }
        );
    }
}
