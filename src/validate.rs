//! Sampled row comparison between source and destination.
//!
//! A first-pass sample on the source only picks primary keys. Both sides are
//! then queried for exactly that key set, ordered by primary key, so the two
//! row lists cover the same rows no matter how `LIMIT` resolves ties.

use crate::error::{CutoverError, Result};
use crate::logging::PairLog;
use crate::rows::{TextRow, query_text};
use crate::table::{Table, analyze_table_pkeys, quote_ident, quote_literal};
use itertools::Itertools;
use postgres::GenericClient;
use serde::Serialize;
use tracing::{debug, info};

/// How the first-pass sample is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStrategy {
    /// Lowest primary keys.
    First(u32),
    /// Highest primary keys.
    Latest(u32),
}

impl SampleStrategy {
    pub fn sample_query(&self, table: &Table, pkey: &[String]) -> String {
        let (direction, limit) = match self {
            SampleStrategy::First(n) => ("ASC", n),
            SampleStrategy::Latest(n) => ("DESC", n),
        };
        let order = pkey
            .iter()
            .map(|c| format!("{} {direction}", quote_ident(c)))
            .join(", ");
        format!(
            "SELECT {} FROM {} ORDER BY {order} LIMIT {limit}",
            column_list(pkey),
            table.quoted()
        )
    }
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).join(", ")
}

/// Query for the rows whose primary key is one of `keys`, ordered by primary key.
pub fn anchored_query(table: &Table, pkey: &[String], keys: &[Vec<String>]) -> String {
    let tuple = |values: &[String]| -> String {
        let literals = values.iter().map(|v| quote_literal(v)).join(", ");
        if values.len() == 1 {
            literals
        } else {
            format!("({literals})")
        }
    };
    let lhs = if pkey.len() == 1 {
        quote_ident(&pkey[0])
    } else {
        format!("({})", column_list(pkey))
    };
    let key_set = keys.iter().map(|k| tuple(k)).join(", ");
    format!(
        "SELECT * FROM {} WHERE {lhs} IN ({key_set}) ORDER BY {}",
        table.quoted(),
        column_list(pkey)
    )
}

/// Assert that the anchored source and destination rows are identical.
pub fn compare_rows(table: &str, source: &[TextRow], destination: &[TextRow]) -> Result<()> {
    if source.len() != destination.len() {
        return Err(CutoverError::integrity(
            table,
            format!(
                "row count differs: source has {}, destination has {}",
                source.len(),
                destination.len()
            ),
        ));
    }
    for (s, d) in source.iter().zip(destination) {
        if s.columns != d.columns || s.values != d.values {
            return Err(CutoverError::integrity(
                table,
                format!(
                    "rows differ:\n  source:      {:?}\n  destination: {:?}",
                    s.values, d.values
                ),
            ));
        }
    }
    Ok(())
}

/// One table's anchored comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationSample {
    pub table: String,
    pub primary_key: Vec<String>,
    pub key_values: Vec<Vec<String>>,
    pub source_rows: usize,
    pub destination_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub samples: Vec<ValidationSample>,
}

/// Primary keys of the first-pass sample, in the order the strategy draws them.
pub fn sample_keys<C: GenericClient>(
    src: &mut C,
    table: &Table,
    pkey: &[String],
    strategy: SampleStrategy,
) -> Result<Vec<Vec<String>>> {
    let sample = query_text(src, &strategy.sample_query(table, pkey))?;
    Ok(sample
        .iter()
        .map(|row| {
            row.values
                .iter()
                .map(|v| v.clone().unwrap_or_default())
                .collect()
        })
        .collect())
}

/// Compare the rows with primary key in `key_values` on both sides. The
/// sessions must already have float display normalized.
pub fn compare_sample<S: GenericClient, D: GenericClient>(
    src: &mut S,
    dst: &mut D,
    table: &Table,
    pkey: &[String],
    key_values: Vec<Vec<String>>,
) -> Result<ValidationSample> {
    let name = table.to_string();
    if key_values.is_empty() {
        if !table.is_empty(dst)? {
            return Err(CutoverError::integrity(
                &name,
                "source is empty but destination has rows",
            ));
        }
        return Ok(ValidationSample {
            table: name,
            primary_key: pkey.to_vec(),
            key_values,
            source_rows: 0,
            destination_rows: 0,
        });
    }

    let anchored = anchored_query(table, pkey, &key_values);
    let source_rows = query_text(src, &anchored)?;
    let destination_rows = query_text(dst, &anchored)?;
    compare_rows(&name, &source_rows, &destination_rows)?;
    debug!("{name}: {} rows match", source_rows.len());
    Ok(ValidationSample {
        table: name,
        primary_key: pkey.to_vec(),
        key_values,
        source_rows: source_rows.len(),
        destination_rows: destination_rows.len(),
    })
}

fn extra_float_digits<C: GenericClient>(client: &mut C) -> Result<i32> {
    let raw: String = client.query_one("SHOW extra_float_digits", &[])?.get(0);
    Ok(raw.trim().parse().unwrap_or(1))
}

fn set_extra_float_digits<C: GenericClient>(client: &mut C, digits: i32) -> Result<()> {
    client.batch_execute(&format!("SET extra_float_digits TO {digits}"))?;
    Ok(())
}

/// The outcome of `result`, whose error wins over a failed `cleanup`.
fn after_cleanup<T>(result: Result<T>, cleanup: Result<()>) -> Result<T> {
    let value = result?;
    cleanup?;
    Ok(value)
}

/// Compare a sample of every primary-keyed table in `schema` (restricted to
/// `tables` when given). Comparing zero tables is an error.
///
/// Keys are sampled at the session's own float precision, so float keys
/// round-trip into the anchored query. Rows are compared with
/// `extra_float_digits` at 0 on both sides.
pub fn validate_data<S: GenericClient, D: GenericClient>(
    src: &mut S,
    dst: &mut D,
    schema: &str,
    tables: &[String],
    strategy: SampleStrategy,
    log: &PairLog,
) -> Result<ValidationReport> {
    let log = log.child("validate");
    let _span = log.enter();
    let keys = analyze_table_pkeys(src, schema)?.scoped(tables);
    if keys.with_pkey.is_empty() {
        return Err(CutoverError::config(format!(
            "no tables with a primary key to validate in {schema}"
        )));
    }
    let mut sampled = Vec::new();
    for (table, pkey) in &keys.with_pkey {
        let table = Table::new(schema, table);
        let key_values = sample_keys(src, &table, pkey, strategy)?;
        sampled.push((table, pkey, key_values));
    }

    let src_digits = extra_float_digits(src)?;
    let dst_digits = extra_float_digits(dst)?;
    set_extra_float_digits(src, 0)?;
    let result = set_extra_float_digits(dst, 0).and_then(|()| compare_all(src, dst, sampled));
    let restored =
        set_extra_float_digits(src, src_digits).and(set_extra_float_digits(dst, dst_digits));

    let report = after_cleanup(result, restored)?;
    info!(
        "Validated {} tables with {strategy:?}",
        report.samples.len()
    );
    Ok(report)
}

fn compare_all<S: GenericClient, D: GenericClient>(
    src: &mut S,
    dst: &mut D,
    sampled: Vec<(Table, &Vec<String>, Vec<Vec<String>>)>,
) -> Result<ValidationReport> {
    let mut samples = Vec::new();
    for (table, pkey, key_values) in sampled {
        samples.push(compare_sample(src, dst, &table, pkey, key_values)?);
    }
    Ok(ValidationReport { samples })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[Option<&str>]) -> TextRow {
        TextRow::new(
            (0..values.len()).map(|i| format!("c{i}")).collect(),
            values.iter().map(|v| v.map(str::to_string)).collect(),
        )
    }

    #[test]
    fn sample_queries_order_by_primary_key() {
        let table = Table::new("public", "orders");
        let pkey = vec!["id".to_string()];
        assert_eq!(
            SampleStrategy::First(100).sample_query(&table, &pkey),
            "SELECT \"id\" FROM \"public\".\"orders\" ORDER BY \"id\" ASC LIMIT 100"
        );
        assert!(
            SampleStrategy::Latest(100)
                .sample_query(&table, &pkey)
                .ends_with("ORDER BY \"id\" DESC LIMIT 100")
        );
    }

    #[test]
    fn anchored_query_uses_exact_key_set() {
        let table = Table::new("public", "orders");
        let single = anchored_query(&table, &["id".into()], &[vec!["1".into()], vec!["2".into()]]);
        assert_eq!(
            single,
            "SELECT * FROM \"public\".\"orders\" WHERE \"id\" IN ('1', '2') ORDER BY \"id\""
        );
        let composite = anchored_query(
            &table,
            &["tenant".into(), "id".into()],
            &[vec!["a'b".into(), "7".into()]],
        );
        assert!(composite.contains("WHERE (\"tenant\", \"id\") IN (('a''b', '7'))"));
        assert!(composite.ends_with("ORDER BY \"tenant\", \"id\""));
    }

    #[test]
    fn identical_rows_pass() {
        let rows = vec![row(&[Some("1"), Some("x")]), row(&[Some("2"), None])];
        compare_rows("orders", &rows, &rows.clone()).unwrap();
    }

    #[test]
    fn nan_matches_only_nan() {
        let nan = vec![row(&[Some("1"), Some("NaN")])];
        compare_rows("orders", &nan, &nan.clone()).unwrap();
        let null = vec![row(&[Some("1"), None])];
        let err = compare_rows("orders", &nan, &null).unwrap_err();
        assert!(matches!(err, CutoverError::DataIntegrity { .. }));
    }

    #[test]
    fn sample_error_wins_over_cleanup_error() {
        let err = after_cleanup::<()>(
            Err(CutoverError::integrity("orders", "rows differ")),
            Err(CutoverError::config("could not restore")),
        )
        .unwrap_err();
        assert!(matches!(err, CutoverError::DataIntegrity { .. }));

        let err = after_cleanup(Ok(1), Err(CutoverError::config("could not restore"))).unwrap_err();
        assert!(err.is_config());
        assert_eq!(after_cleanup(Ok(1), Ok(())).unwrap(), 1);
    }

    #[test]
    fn count_and_content_mismatches_fail() {
        let src = vec![row(&[Some("1"), Some("x")])];
        let err = compare_rows("orders", &src, &[]).unwrap_err();
        assert!(matches!(err, CutoverError::DataIntegrity { .. }));
        assert!(err.to_string().contains("row count differs"));

        let dst = vec![row(&[Some("1"), Some("y")])];
        let err = compare_rows("orders", &src, &dst).unwrap_err();
        assert!(err.to_string().contains("rows differ"));
    }
}
