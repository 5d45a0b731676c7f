//! Tracing setup and the per-pair log handle threaded through every phase.

use tracing::Span;
use tracing::span::Entered;
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins over `level` when set.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
    Ok(())
}

/// Log handle for one database pair. Built once per pair and passed down
/// explicitly; `child` narrows it to a phase and side such as `sync.dst`.
#[derive(Clone, Debug)]
pub struct PairLog {
    db: String,
    dc: String,
    kind: String,
    span: Span,
}

impl PairLog {
    pub fn new(db: &str, dc: &str) -> Self {
        let span = tracing::info_span!("pair", db = %db, dc = %dc);
        PairLog {
            db: db.to_string(),
            dc: dc.to_string(),
            kind: String::new(),
            span,
        }
    }

    pub fn child(&self, kind: &str) -> Self {
        let kind = if self.kind.is_empty() {
            kind.to_string()
        } else {
            format!("{}.{}", self.kind, kind)
        };
        let span = tracing::info_span!(parent: &self.span, "phase", kind = %kind);
        PairLog {
            db: self.db.clone(),
            dc: self.dc.clone(),
            kind,
            span,
        }
    }

    /// Enter the handle's span for the rest of the caller's scope.
    pub fn enter(&self) -> Entered<'_> {
        self.span.enter()
    }

    pub fn in_scope<F: FnOnce() -> T, T>(&self, f: F) -> T {
        self.span.in_scope(f)
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn dc(&self) -> &str {
        &self.dc
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_kinds_nest_with_dots() {
        let log = PairLog::new("orders", "use1");
        let dst = log.child("sync").child("dst");
        assert_eq!(dst.kind(), "sync.dst");
        assert_eq!(dst.db(), "orders");
        assert_eq!(dst.dc(), "use1");
        assert_eq!(log.kind(), "");
    }
}
