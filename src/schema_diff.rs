//! Compare the schema of both sides of a pair.
//!
//! Each dump is normalized on its own: noise lines go, and with `fold_deferred`
//! whole `NOT VALID` and index-creation statements go too, so a destination
//! that has not had its deferred artifacts applied yet still compares equal.

use crate::config::{Credential, PairConfig};
use crate::dump::classify::{is_index_creation, is_not_valid};
use crate::dump::splitter::{DumpStatement, split_statements};
use crate::dump::subprocess;
use crate::error::Result;
use crate::fanout::join2;
use crate::logging::PairLog;
use serde::Serialize;
use similar::TextDiff;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SchemaComparison {
    Match,
    Mismatch { diff: String },
    /// The pair migrates a subset of tables, so schemas are expected to differ.
    Skipped,
}

fn is_noise_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.starts_with("--")
        || trimmed.starts_with("\\restrict")
        || trimmed.starts_with("\\unrestrict")
        || line.contains("GRANT ")
        || line.contains("REVOKE ")
        || line.contains("EXTENSION ")
}

/// Normalized, comparable text of a schema dump.
pub fn filter_schema(dump: &str, fold_deferred: bool) -> String {
    let kept: Vec<&str> = dump.lines().filter(|l| !is_noise_line(l)).collect();
    if !fold_deferred {
        return kept.join("\n");
    }
    split_statements(&kept.join("\n"))
        .iter()
        .filter(|s| !is_not_valid(s) && !is_index_creation(s))
        .map(DumpStatement::text)
        .collect::<String>()
        .trim_end_matches('\n')
        .to_string()
}

/// Compare two already-fetched dumps.
pub fn compare_dumps(source: &str, destination: &str, fold_deferred: bool) -> SchemaComparison {
    let source = filter_schema(source, fold_deferred);
    let destination = filter_schema(destination, fold_deferred);
    if source == destination {
        return SchemaComparison::Match;
    }
    let diff = TextDiff::from_lines(&source, &destination)
        .unified_diff()
        .context_radius(3)
        .header("source", "destination")
        .to_string();
    SchemaComparison::Mismatch { diff }
}

/// Dump both sides concurrently and compare them.
pub fn compare_schema(
    config: &PairConfig,
    fold_deferred: bool,
    log: &PairLog,
) -> Result<SchemaComparison> {
    let log = log.child("compare-schema");
    let _span = log.enter();
    if config.is_scoped() {
        info!("Pair migrates a subset of tables, skipping schema comparison");
        return Ok(SchemaComparison::Skipped);
    }
    let (src, dst) = (config.src()?, config.dst()?);
    let schema = &config.schema_name;
    let (source, destination) = join2(
        || subprocess::dump_schema(&src.dsn(Credential::Root), schema),
        || subprocess::dump_schema(&dst.dsn(Credential::Root), schema),
    )?;
    let comparison = compare_dumps(&source, &destination, fold_deferred);
    match &comparison {
        SchemaComparison::Match => info!("Schemas match"),
        SchemaComparison::Mismatch { diff } => warn!("Schemas differ:\n{diff}"),
        SchemaComparison::Skipped => {}
    }
    Ok(comparison)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
--
-- PostgreSQL database dump
--
\\restrict abc123

SET statement_timeout = 0;
CREATE TABLE public.users (
    id bigint NOT NULL
);
GRANT SELECT ON TABLE public.users TO reporting;
CREATE INDEX users_id_idx ON public.users USING btree (id);
ALTER TABLE public.users
    ADD CONSTRAINT users_id_check CHECK ((id > 0)) NOT VALID;
\\unrestrict abc123
";

    const DESTINATION: &str = "\
-- Dumped from database version 15.4

SET statement_timeout = 0;
CREATE TABLE public.users (
    id bigint NOT NULL
);
";

    #[test]
    fn noise_lines_are_dropped() {
        let filtered = filter_schema(SOURCE, false);
        assert!(!filtered.contains("GRANT"));
        assert!(!filtered.contains("restrict"));
        assert!(!filtered.contains("--"));
        assert!(filtered.starts_with("SET statement_timeout = 0;"));
    }

    #[test]
    fn folding_ignores_deferred_statements() {
        assert_eq!(
            compare_dumps(SOURCE, DESTINATION, true),
            SchemaComparison::Match
        );
    }

    #[test]
    fn mismatch_carries_unified_diff() {
        match compare_dumps(SOURCE, DESTINATION, false) {
            SchemaComparison::Mismatch { diff } => {
                assert!(diff.contains("--- source"));
                assert!(diff.contains("+++ destination"));
                assert!(diff.contains("-CREATE INDEX users_id_idx"));
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn identical_dumps_match_without_folding() {
        assert_eq!(
            compare_dumps(DESTINATION, DESTINATION, false),
            SchemaComparison::Match
        );
    }

    #[test]
    fn scoped_pairs_are_skipped() {
        let mut config = crate::config::tests::sample_pair();
        config.tables = vec!["users".into()];
        let log = PairLog::new("orders", "use1");
        assert_eq!(
            compare_schema(&config, false, &log).unwrap(),
            SchemaComparison::Skipped
        );
    }
}
