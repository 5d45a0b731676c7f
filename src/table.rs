// src/table.rs
// Table identity and primary-key discovery shared by setup, sync and validation.

use crate::error::Result;
use postgres::GenericClient;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Table {
    pub schema: Option<String>,
    pub name: String,
}

impl FromStr for Table {
    type Err = Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some((schema, name)) = s.split_once('.') {
            Ok(Table {
                schema: Some(schema.to_string()),
                name: name.to_string(),
            })
        } else {
            Ok(Table {
                schema: None,
                name: s.to_string(),
            })
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Table {
    pub fn new(schema: &str, name: &str) -> Self {
        Table {
            schema: Some(schema.to_string()),
            name: name.to_string(),
        }
    }

    /// Identifier-quoted form, safe for mixed-case names: `"schema"."name"`.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }

    pub fn is_empty<C: GenericClient>(&self, client: &mut C) -> Result<bool> {
        let rows = client.query(&format!("SELECT 1 FROM {} LIMIT 1", self.quoted()), &[])?;
        Ok(rows.is_empty())
    }

    pub fn get_columns<C: GenericClient>(&self, client: &mut C) -> Result<Vec<String>> {
        let rows = client.query(
            "SELECT column_name::text FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
            &[&self.schema.as_deref().unwrap_or("public"), &self.name],
        )?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }
}

/// Quote an identifier the way Postgres' `quote_ident` does for arbitrary names.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Tables of one schema split by whether they have a primary key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableKeys {
    /// Primary-key columns per table, in ordinal position order.
    pub with_pkey: BTreeMap<String, Vec<String>>,
    pub without_pkey: Vec<String>,
}

impl TableKeys {
    pub fn pkey_tables(&self) -> Vec<String> {
        self.with_pkey.keys().cloned().collect()
    }

    pub fn all_tables(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .with_pkey
            .keys()
            .chain(self.without_pkey.iter())
            .cloned()
            .collect();
        all.sort();
        all
    }

    /// Restrict to `targets` when non-empty. Catalog names are lowercase
    /// unless quoted, so targets match case-insensitively.
    pub fn scoped(&self, targets: &[String]) -> TableKeys {
        if targets.is_empty() {
            return self.clone();
        }
        let wanted = |t: &String| targets.iter().any(|w| w.eq_ignore_ascii_case(t));
        TableKeys {
            with_pkey: self
                .with_pkey
                .iter()
                .filter(|(t, _)| wanted(*t))
                .map(|(t, cols)| (t.clone(), cols.clone()))
                .collect(),
            without_pkey: self
                .without_pkey
                .iter()
                .filter(|t| wanted(*t))
                .cloned()
                .collect(),
        }
    }
}

/// Discover every table in `schema` and its primary-key columns.
pub fn analyze_table_pkeys<C: GenericClient>(client: &mut C, schema: &str) -> Result<TableKeys> {
    let pkey_rows = client.query(
        "SELECT kcu.table_name::text,
                kcu.column_name::text
         FROM information_schema.table_constraints tco
         JOIN information_schema.key_column_usage kcu
           ON kcu.constraint_name = tco.constraint_name
          AND kcu.constraint_schema = tco.constraint_schema
         WHERE tco.constraint_type = 'PRIMARY KEY'
           AND kcu.table_schema = $1
         ORDER BY kcu.table_name, kcu.ordinal_position",
        &[&schema],
    )?;
    let mut keys = TableKeys::default();
    for row in &pkey_rows {
        keys.with_pkey
            .entry(row.get::<_, String>(0))
            .or_default()
            .push(row.get(1));
    }

    let table_rows = client.query(
        "SELECT table_name::text
         FROM information_schema.tables
         WHERE table_schema = $1
           AND table_type = 'BASE TABLE'
           AND table_name != 'pg_stat_statements'
         ORDER BY 1",
        &[&schema],
    )?;
    keys.without_pkey = table_rows
        .iter()
        .map(|row| row.get::<_, String>(0))
        .filter(|t| !keys.with_pkey.contains_key(t))
        .collect();
    Ok(keys)
}
