//! On-disk layout of schema artifacts and per-table data dumps.

use super::classify::{ArtifactKind, SchemaArtifacts, render};
use super::splitter::{DumpStatement, split_statements};
use crate::config::PairId;
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Root of `schemas/{dc}/{db}/{kind}.sql` and `tables/{dc}/{db}/{table}.dump`.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: &Path) -> Self {
        ArtifactStore {
            root: root.to_path_buf(),
        }
    }

    pub fn schema_dir(&self, id: &PairId) -> PathBuf {
        self.root.join("schemas").join(&id.dc).join(&id.db)
    }

    pub fn schema_file(&self, id: &PairId, kind: ArtifactKind) -> PathBuf {
        self.schema_dir(id).join(format!("{}.sql", kind.file_stem()))
    }

    pub fn table_dir(&self, id: &PairId) -> PathBuf {
        self.root.join("tables").join(&id.dc).join(&id.db)
    }

    pub fn table_file(&self, id: &PairId, table: &str) -> PathBuf {
        self.table_dir(id).join(format!("{table}.dump"))
    }

    /// Write all four artifacts, replacing earlier ones.
    pub fn write_schema(&self, id: &PairId, artifacts: &SchemaArtifacts) -> Result<()> {
        fs::create_dir_all(self.schema_dir(id))?;
        for kind in ArtifactKind::ALL {
            fs::write(self.schema_file(id, kind), artifacts.render(kind))?;
        }
        Ok(())
    }

    /// Replace a single artifact.
    pub fn write_artifact(
        &self,
        id: &PairId,
        kind: ArtifactKind,
        statements: &[DumpStatement],
    ) -> Result<()> {
        fs::create_dir_all(self.schema_dir(id))?;
        fs::write(self.schema_file(id, kind), render(statements))?;
        Ok(())
    }

    /// Statements of one artifact. A missing artifact reads as empty.
    pub fn read_statements(&self, id: &PairId, kind: ArtifactKind) -> Result<Vec<DumpStatement>> {
        match fs::read_to_string(self.schema_file(id, kind)) {
            Ok(script) => Ok(split_statements(&script)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn prepare_table_dir(&self, id: &PairId) -> Result<PathBuf> {
        let dir = self.table_dir(id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Tables that currently have a data dump on disk, sorted.
    pub fn dumped_tables(&self, id: &PairId) -> Result<Vec<String>> {
        let dir = self.table_dir(id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut tables = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "dump") {
                if let Some(stem) = path.file_stem() {
                    tables.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        tables.sort();
        Ok(tables)
    }
}
