//! Remote configuration resolvers.
//!
//! A pair's `remote-configs/{dc}/{db}/config.json` names a resolver by its
//! registered identifier; the rest of the JSON object is handed to that
//! resolver untouched.

use super::{PairConfig, PairId, remote_config_file};
use crate::error::{CutoverError, Result};
use crate::logging::PairLog;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Something that can produce a [`PairConfig`] for a pair from its definition.
pub trait ConfigResolver: Send + Sync {
    /// Resolve the config. `Ok(None)` means the resolver had nothing for this pair.
    fn resolve(
        &self,
        id: &PairId,
        definition: &Map<String, Value>,
        skip_src: bool,
        skip_dst: bool,
    ) -> Result<Option<PairConfig>>;
}

#[derive(Deserialize, Debug)]
struct RemoteDefinition {
    resolver: String,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

/// Reads a complete pair config from the JSON file named by `path` in the definition.
/// Relative paths are taken relative to the workspace root.
pub struct FileResolver {
    root: PathBuf,
}

impl FileResolver {
    pub fn new(root: &Path) -> Self {
        FileResolver {
            root: root.to_path_buf(),
        }
    }
}

impl ConfigResolver for FileResolver {
    fn resolve(
        &self,
        id: &PairId,
        definition: &Map<String, Value>,
        skip_src: bool,
        skip_dst: bool,
    ) -> Result<Option<PairConfig>> {
        let path = definition
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| CutoverError::Resolver {
                resolver: "file".to_string(),
                message: format!("definition for {id} has no `path`"),
            })?;
        let raw = match fs::read_to_string(self.root.join(path)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut config: PairConfig = serde_json::from_str(&raw)?;
        if skip_src {
            config.src = None;
        }
        if skip_dst {
            config.dst = None;
        }
        Ok(Some(config))
    }
}

/// Registry of resolvers keyed by the identifier used in remote definitions.
/// Populated at startup; lookups never load code dynamically.
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Box<dyn ConfigResolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `file` resolver rooted at `root`.
    pub fn with_defaults(root: &Path) -> Self {
        let mut registry = Self::new();
        registry.register("file", FileResolver::new(root));
        registry
    }

    pub fn register(&mut self, name: &str, resolver: impl ConfigResolver + 'static) {
        self.resolvers.insert(name.to_string(), Box::new(resolver));
    }

    /// Look up the pair's remote definition and run the resolver it names.
    /// Missing definitions and resolver failures are logged and yield `Ok(None)`,
    /// so a caller can decide whether the absence is fatal.
    pub fn resolve(
        &self,
        root: &Path,
        id: &PairId,
        skip_src: bool,
        skip_dst: bool,
        log: &PairLog,
    ) -> Result<Option<PairConfig>> {
        let log = log.child("remote-config");
        let _span = log.enter();
        let path = remote_config_file(root, id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!("No remote config definition exists at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let definition: RemoteDefinition = match serde_json::from_str(&raw) {
            Ok(definition) => definition,
            Err(e) => {
                error!(
                    "Remote config definition in {} was not valid: {e}",
                    path.display()
                );
                return Ok(None);
            }
        };
        let Some(resolver) = self.resolvers.get(&definition.resolver) else {
            error!("No config resolver registered as `{}`", definition.resolver);
            return Ok(None);
        };
        match resolver.resolve(id, &definition.rest, skip_src, skip_dst) {
            Ok(Some(config)) => {
                info!(
                    "Successfully resolved remote configuration for {id} using {}",
                    definition.resolver
                );
                Ok(Some(config))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                error!("Failed to resolve remote configuration for {id}: {e}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_pair;
    use crate::config::get_config;

    fn write_definition(root: &Path, id: &PairId, json: &str) {
        let path = remote_config_file(root, id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, json).unwrap();
    }

    #[test]
    fn file_resolver_fills_uncached_pair_and_caches_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_pair();
        let id = config.id();
        fs::write(
            dir.path().join("orders.json"),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();
        write_definition(
            dir.path(),
            &id,
            r#"{"resolver": "file", "path": "orders.json"}"#,
        );

        let registry = ResolverRegistry::with_defaults(dir.path());
        let got = get_config(dir.path(), &id, &registry, false, false).unwrap();
        assert_eq!(got, config);
        assert!(crate::config::config_file(dir.path(), &id).is_file());
    }

    #[test]
    fn unknown_resolver_resolves_to_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let id = PairId::new("use1", "orders");
        write_definition(dir.path(), &id, r#"{"resolver": "vault"}"#);
        let registry = ResolverRegistry::with_defaults(dir.path());
        let log = PairLog::new("orders", "use1");
        let got = registry
            .resolve(dir.path(), &id, false, false, &log)
            .unwrap();
        assert!(got.is_none());
        assert!(
            get_config(dir.path(), &id, &registry, false, false)
                .unwrap_err()
                .is_config()
        );
    }

    #[test]
    fn skip_flags_strip_sides() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_pair();
        fs::write(
            dir.path().join("c.json"),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();
        let mut definition = Map::new();
        definition.insert("path".into(), Value::String("c.json".into()));
        let got = FileResolver::new(dir.path())
            .resolve(&config.id(), &definition, true, false)
            .unwrap()
            .unwrap();
        assert!(got.src.is_none());
        assert!(got.dst.is_some());
    }
}
