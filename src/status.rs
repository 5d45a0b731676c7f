//! Per-pair status record handed to whatever presents it.

use crate::error::Result;
use crate::replication::status::{LagMetrics, LinkState, LinkStatus, ReplicationStates};
use postgres::GenericClient;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetSize {
    pub bytes: i64,
    pub pretty: String,
}

/// Total on-disk size of `tables` in `schema`, indexes and toast included.
pub fn dataset_size<C: GenericClient>(
    client: &mut C,
    schema: &str,
    tables: &[String],
) -> Result<DatasetSize> {
    let row = client.query_one(
        "SELECT COALESCE(sum(pg_total_relation_size(c.oid)), 0)::bigint,
                pg_size_pretty(COALESCE(sum(pg_total_relation_size(c.oid)), 0)::bigint)
         FROM pg_class c
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1
           AND c.relkind IN ('r', 'p')
           AND c.relname::text = ANY($2)",
        &[&schema, &tables],
    )?;
    Ok(DatasetSize {
        bytes: row.get(0),
        pretty: row.get(1),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitializationProgress {
    pub source: DatasetSize,
    pub destination: DatasetSize,
    /// Destination size as a share of source size, one decimal.
    pub percent: f64,
}

impl InitializationProgress {
    pub fn new(source: DatasetSize, destination: DatasetSize) -> Self {
        let percent = match (source.bytes, destination.bytes) {
            (0, 0) => 0.0,
            (0, _) => 100.0,
            (src, dst) => (dst as f64 / src as f64 * 1000.0).round() / 10.0,
        };
        InitializationProgress {
            source,
            destination,
            percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub db: String,
    pub dc: String,
    pub forward: LinkState,
    pub reverse: LinkState,
    /// Forward lag measured on the source.
    pub lag: LagMetrics,
    pub progress: Option<InitializationProgress>,
}

impl StatusReport {
    pub fn states(&self) -> ReplicationStates {
        ReplicationStates {
            forward: self.forward.status,
            reverse: self.reverse.status,
        }
    }

    /// Whether dataset size and progress are worth showing. Once forward is
    /// streaming, or once only the reverse link is left, they say nothing
    /// useful; the link states themselves are always reported.
    pub fn shows_progress(&self) -> bool {
        let states = self.states();
        match states.forward {
            LinkStatus::Replicating => false,
            LinkStatus::Unconfigured => states.reverse != LinkStatus::Replicating,
            _ => true,
        }
    }
}
