//! Partition a schema dump into the artifacts loaded at different phases.
//!
//! The base artifact is applied before replication starts and must not carry
//! anything that slows initial copy down (secondary indexes) or that cannot
//! hold until data is present (`NOT VALID` constraints). The exception is a
//! unique index that a foreign key depends on: Postgres refuses the FK without
//! it, so such an index stays in the base artifact.

use super::splitter::DumpStatement;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

static NOISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:EXTENSION|GRANT|REVOKE)\s").expect("valid regex"));

static INDEX_CREATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*CREATE\s+(?:UNIQUE\s+)?INDEX\b").expect("valid regex")
});

static FOREIGN_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bFOREIGN\s+KEY\b").expect("valid regex"));

static REFERENCES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bREFERENCES\s+(?P<table>[^\s(]+)\s*\((?P<cols>[^)]*)\)")
        .expect("valid regex")
});

static OWNING_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:ALTER|CREATE)\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:ONLY\s+)?(?P<table>[^\s(]+)",
    )
    .expect("valid regex")
});

static UNIQUE_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*CREATE\s+UNIQUE\s+INDEX\s+(?:CONCURRENTLY\s+)?(?:IF\s+NOT\s+EXISTS\s+)?(?:[^\s(]+\s+)?ON\s+(?:ONLY\s+)?(?P<table>[^\s(]+)(?:\s+USING\s+\w+)?\s*\((?P<cols>[^)]*)\)",
    )
    .expect("valid regex")
});

static WHERE_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").expect("valid regex"));

/// The four schema artifacts written per pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Every statement, unmodified.
    Raw,
    /// Tables, types, functions and FK-required unique indexes.
    Base,
    /// Constraints declared `NOT VALID`.
    OnlyInvalid,
    /// Index creation not needed by any foreign key.
    OnlyIndexes,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Raw,
        ArtifactKind::Base,
        ArtifactKind::OnlyInvalid,
        ArtifactKind::OnlyIndexes,
    ];

    pub fn file_stem(&self) -> &'static str {
        match self {
            ArtifactKind::Raw => "raw",
            ArtifactKind::Base => "no-invalid-no-index",
            ArtifactKind::OnlyInvalid => "only-invalid",
            ArtifactKind::OnlyIndexes => "only-indexes",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Referenced side of a foreign key: normalized table name and sorted,
/// normalized column list.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReferencedKey {
    pub table: String,
    pub columns: Vec<String>,
}

impl ReferencedKey {
    fn new(table: &str, columns: &str) -> Self {
        let mut columns: Vec<String> = columns
            .split(',')
            .map(normalize_ident)
            .filter(|c| !c.is_empty())
            .collect();
        columns.sort();
        ReferencedKey {
            table: normalize_ident(table),
            columns,
        }
    }
}

/// A foreign key found in the dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FkReference {
    pub owning_table: Option<String>,
    pub referenced: ReferencedKey,
}

/// A dump partitioned into its artifacts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaArtifacts {
    pub raw: Vec<DumpStatement>,
    pub base: Vec<DumpStatement>,
    pub only_invalid: Vec<DumpStatement>,
    pub only_indexes: Vec<DumpStatement>,
    /// Unique indexes kept in `base` because a foreign key needs them.
    pub fk_required: Vec<DumpStatement>,
}

impl SchemaArtifacts {
    pub fn get(&self, kind: ArtifactKind) -> &[DumpStatement] {
        match kind {
            ArtifactKind::Raw => &self.raw,
            ArtifactKind::Base => &self.base,
            ArtifactKind::OnlyInvalid => &self.only_invalid,
            ArtifactKind::OnlyIndexes => &self.only_indexes,
        }
    }

    /// The artifact as a loadable SQL script.
    pub fn render(&self, kind: ArtifactKind) -> String {
        render(self.get(kind))
    }
}

pub fn render(statements: &[DumpStatement]) -> String {
    statements.iter().map(DumpStatement::text).collect()
}

fn normalize_ident(raw: &str) -> String {
    raw.trim().replace('"', "").to_lowercase()
}

/// Grants, revokes and extension management never travel with the schema.
pub fn is_noise(statement: &DumpStatement) -> bool {
    NOISE.is_match(statement.text())
}

pub fn is_not_valid(statement: &DumpStatement) -> bool {
    statement.contains("NOT VALID")
}

pub fn is_index_creation(statement: &DumpStatement) -> bool {
    INDEX_CREATION.is_match(statement.text())
}

/// Every foreign key declared anywhere in the dump.
pub fn foreign_key_references(statements: &[DumpStatement]) -> Vec<FkReference> {
    let mut found = Vec::new();
    for statement in statements {
        let text = statement.text();
        if !FOREIGN_KEY.is_match(text) {
            continue;
        }
        let owning_table = OWNING_TABLE
            .captures(text)
            .map(|c| normalize_ident(&c["table"]));
        for caps in REFERENCES.captures_iter(text) {
            found.push(FkReference {
                owning_table: owning_table.clone(),
                referenced: ReferencedKey::new(&caps["table"], &caps["cols"]),
            });
        }
    }
    found
}

/// Table and columns of a non-partial unique index, or `None` for anything else.
pub fn unique_index_key(statement: &DumpStatement) -> Option<ReferencedKey> {
    let text = statement.text();
    let caps = UNIQUE_INDEX.captures(text)?;
    let end = caps.get(0).map_or(text.len(), |m| m.end());
    if WHERE_CLAUSE.is_match(&text[end..]) {
        return None;
    }
    Some(ReferencedKey::new(&caps["table"], &caps["cols"]))
}

/// Partition `statements` into the schema artifacts.
pub fn classify(statements: Vec<DumpStatement>) -> SchemaArtifacts {
    let referenced: HashSet<ReferencedKey> = foreign_key_references(&statements)
        .into_iter()
        .map(|fk| fk.referenced)
        .collect();

    let mut artifacts = SchemaArtifacts::default();
    for statement in statements {
        if !is_noise(&statement) {
            if is_not_valid(&statement) {
                artifacts.only_invalid.push(statement.clone());
            } else if is_index_creation(&statement) {
                let required = unique_index_key(&statement)
                    .is_some_and(|key| referenced.contains(&key));
                if required {
                    artifacts.fk_required.push(statement.clone());
                    artifacts.base.push(statement.clone());
                } else {
                    artifacts.only_indexes.push(statement.clone());
                }
            } else {
                artifacts.base.push(statement.clone());
            }
        }
        artifacts.raw.push(statement);
    }
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::splitter::split_statements;

    const DUMP: &str = "\
CREATE EXTENSION IF NOT EXISTS pglogical WITH SCHEMA pglogical;
CREATE TABLE public.parent (
    id bigint NOT NULL,
    code text
);
CREATE TABLE public.child (
    id bigint NOT NULL,
    parent_code text
);
ALTER TABLE ONLY public.parent ADD CONSTRAINT parent_pkey PRIMARY KEY (id);
CREATE UNIQUE INDEX parent_code_key ON public.parent USING btree (code);
CREATE UNIQUE INDEX parent_code_active ON public.parent USING btree (code) WHERE (id > 0);
CREATE INDEX child_parent_code_idx ON public.child USING btree (parent_code);
ALTER TABLE ONLY public.child
    ADD CONSTRAINT child_parent_fk FOREIGN KEY (parent_code) REFERENCES public.parent(code);
ALTER TABLE public.child
    ADD CONSTRAINT child_id_positive CHECK ((id > 0)) NOT VALID;
GRANT SELECT ON TABLE public.parent TO reporting;
REVOKE ALL ON SCHEMA public FROM PUBLIC;
";

    fn texts(statements: &[DumpStatement]) -> Vec<String> {
        statements.iter().map(|s| s.text().to_string()).collect()
    }

    #[test]
    fn fk_required_unique_index_stays_in_base() {
        let artifacts = classify(split_statements(DUMP));
        let base = render(&artifacts.base);
        assert!(base.contains("CREATE UNIQUE INDEX parent_code_key"));
        assert!(base.contains("FOREIGN KEY (parent_code) REFERENCES public.parent(code)"));
        assert_eq!(artifacts.fk_required.len(), 1);
        assert!(artifacts.fk_required[0].contains("parent_code_key"));
    }

    #[test]
    fn partial_and_plain_indexes_are_deferred() {
        let artifacts = classify(split_statements(DUMP));
        let indexes = texts(&artifacts.only_indexes);
        assert_eq!(indexes.len(), 2);
        assert!(indexes[0].contains("parent_code_active"));
        assert!(indexes[1].contains("child_parent_code_idx"));
        assert!(!render(&artifacts.base).contains("parent_code_active"));
    }

    #[test]
    fn not_valid_constraints_are_isolated() {
        let artifacts = classify(split_statements(DUMP));
        assert_eq!(artifacts.only_invalid.len(), 1);
        assert!(artifacts.only_invalid[0].contains("child_id_positive"));
        assert!(!render(&artifacts.base).contains("NOT VALID"));
    }

    #[test]
    fn noise_only_lands_in_raw() {
        let statements = split_statements(DUMP);
        let total = statements.len();
        let artifacts = classify(statements);
        assert_eq!(artifacts.raw.len(), total);
        for kind in [
            ArtifactKind::Base,
            ArtifactKind::OnlyInvalid,
            ArtifactKind::OnlyIndexes,
        ] {
            let script = artifacts.render(kind);
            assert!(!script.contains("GRANT "), "{kind} carries a grant");
            assert!(!script.contains("REVOKE "), "{kind} carries a revoke");
            assert!(!script.contains("EXTENSION "), "{kind} carries an extension");
        }
        assert!(artifacts.render(ArtifactKind::Raw).contains("GRANT SELECT"));
    }

    #[test]
    fn every_non_noise_statement_lands_in_exactly_one_partition() {
        let artifacts = classify(split_statements(DUMP));
        let non_noise = artifacts.raw.iter().filter(|s| !is_noise(s)).count();
        assert_eq!(
            artifacts.base.len() + artifacts.only_invalid.len() + artifacts.only_indexes.len(),
            non_noise
        );
    }

    #[test]
    fn fk_matching_ignores_quoting_case_and_column_order() {
        let dump = "\
CREATE UNIQUE INDEX \"Pair_Key\" ON public.\"Accounts\" USING btree (\"Region\", id);
ALTER TABLE ONLY public.ledger ADD CONSTRAINT ledger_fk FOREIGN KEY (a, b) REFERENCES public.accounts(id, region);
";
        let artifacts = classify(split_statements(dump));
        assert_eq!(artifacts.fk_required.len(), 1);
        assert!(artifacts.only_indexes.is_empty());
    }

    #[test]
    fn fk_to_other_table_does_not_pull_index_into_base() {
        let dump = "\
CREATE UNIQUE INDEX users_email_key ON public.users USING btree (email);
ALTER TABLE ONLY public.orders ADD CONSTRAINT orders_fk FOREIGN KEY (email) REFERENCES public.customers(email);
";
        let artifacts = classify(split_statements(dump));
        assert!(artifacts.fk_required.is_empty());
        assert_eq!(artifacts.only_indexes.len(), 1);
    }

    #[test]
    fn finds_references_with_owning_table() {
        let statements = split_statements(
            "ALTER TABLE ONLY public.child\n    ADD CONSTRAINT c_fk FOREIGN KEY (p) REFERENCES public.parent(code);\n",
        );
        let refs = foreign_key_references(&statements);
        assert_eq!(
            refs,
            vec![FkReference {
                owning_table: Some("public.child".into()),
                referenced: ReferencedKey {
                    table: "public.parent".into(),
                    columns: vec!["code".into()],
                },
            }]
        );
    }

    #[test]
    fn unique_index_key_parses_unnamed_and_concurrent_forms() {
        let unnamed = DumpStatement::from("CREATE UNIQUE INDEX ON public.t (b, a);");
        assert_eq!(
            unique_index_key(&unnamed),
            Some(ReferencedKey {
                table: "public.t".into(),
                columns: vec!["a".into(), "b".into()],
            })
        );
        let concurrent =
            DumpStatement::from("CREATE UNIQUE INDEX CONCURRENTLY t_a ON ONLY public.t USING btree (a);");
        assert!(unique_index_key(&concurrent).is_some());
        let plain = DumpStatement::from("CREATE INDEX t_a ON public.t USING btree (a);");
        assert!(unique_index_key(&plain).is_none());
    }
}
