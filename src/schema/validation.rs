// =============================================================================
// Validation Service — memoized schema existence checks
// =============================================================================
//
// Hot paths (every orchestrated run, every walker strategy) check that the
// names they were handed actually exist. The check hits the registry once per
// (kind, name) and remembers the answer, so repeated runs don't keep
// re-walking the maps.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::ConfigError;
use crate::schema::registry::{SchemaKind, SchemaRegistry};

pub struct ValidationService {
    registry: Arc<SchemaRegistry>,
    seen: RwLock<HashSet<(SchemaKind, String)>>,
}

impl ValidationService {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            seen: RwLock::new(HashSet::new()),
        }
    }

    /// Check that a schema of `kind` named `name` exists. Validated names are
    /// memoized; a name only hits the registry once.
    pub fn validate(&self, kind: SchemaKind, name: &str) -> Result<(), ConfigError> {
        if self.seen.read().contains(&(kind, name.to_string())) {
            return Ok(());
        }
        if !self.registry.contains(kind, name) {
            return Err(ConfigError::UnknownName {
                kind: kind.as_str(),
                name: name.to_string(),
            });
        }
        debug!(kind = kind.as_str(), name, "schema name validated");
        self.seen.write().insert((kind, name.to_string()));
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
