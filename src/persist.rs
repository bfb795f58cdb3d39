// =============================================================================
// Persistence — crash-safe signal storage behind a minimal capability set
// =============================================================================
//
// Only live mode persists. Two record kinds exist per (symbol, strategy):
// the *pending* signal under monitoring and the *scheduled* signal awaiting
// activation. Writes are atomic (tmp sibling + rename) so a crash mid-write
// never corrupts the previous record.
// =============================================================================

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PersistenceError;
use crate::signal::Signal;

/// Version stamped into every persisted record.
pub const PERSIST_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    PERSIST_SCHEMA_VERSION
}

/// The two persisted record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// An activated position under TP/SL/time monitoring.
    Pending,
    /// A scheduled signal awaiting its entry price.
    Scheduled,
}

impl SignalKind {
    /// File-name prefix for this kind.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Pending => "signal",
            Self::Scheduled => "schedule",
        }
    }
}

/// On-disk envelope around a [`Signal`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSignal {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    #[serde(flatten)]
    signal: Signal,
}

/// Stable-storage capability set the live orchestrator depends on.
///
/// Contract: writes are atomic; `has_value` returns true only after a
/// successful `write_value`; reads return a complete record or fail.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn wait_for_init(&self) -> Result<(), PersistenceError>;

    async fn has_value(
        &self,
        kind: SignalKind,
        symbol: &str,
        strategy_name: &str,
    ) -> Result<bool, PersistenceError>;

    async fn read_value(
        &self,
        kind: SignalKind,
        symbol: &str,
        strategy_name: &str,
    ) -> Result<Option<Signal>, PersistenceError>;

    async fn write_value(
        &self,
        kind: SignalKind,
        symbol: &str,
        strategy_name: &str,
        signal: &Signal,
    ) -> Result<(), PersistenceError>;

    async fn delete_value(
        &self,
        kind: SignalKind,
        symbol: &str,
        strategy_name: &str,
    ) -> Result<(), PersistenceError>;
}

// =============================================================================
// FilePersistence — one JSON file per (kind, symbol, strategy)
// =============================================================================

pub struct FilePersistence {
    root: PathBuf,
}

impl FilePersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: SignalKind, symbol: &str, strategy_name: &str) -> PathBuf {
        self.root
            .join(format!("{}-{}-{}.json", kind.prefix(), symbol, strategy_name))
    }
}

fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        op,
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl PersistenceAdapter for FilePersistence {
    async fn wait_for_init(&self) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error("create_dir", &self.root, e))?;
        info!(root = %self.root.display(), "persistence ready");
        Ok(())
    }

    async fn has_value(
        &self,
        kind: SignalKind,
        symbol: &str,
        strategy_name: &str,
    ) -> Result<bool, PersistenceError> {
        let path = self.record_path(kind, symbol, strategy_name);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error("stat", &path, e))
    }

    async fn read_value(
        &self,
        kind: SignalKind,
        symbol: &str,
        strategy_name: &str,
    ) -> Result<Option<Signal>, PersistenceError> {
        let path = self.record_path(kind, symbol, strategy_name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read", &path, e)),
        };
        let record: PersistedSignal =
            serde_json::from_str(&content).map_err(|source| PersistenceError::Corrupt {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Some(record.signal))
    }

    async fn write_value(
        &self,
        kind: SignalKind,
        symbol: &str,
        strategy_name: &str,
        signal: &Signal,
    ) -> Result<(), PersistenceError> {
        let path = self.record_path(kind, symbol, strategy_name);
        let record = PersistedSignal {
            schema_version: PERSIST_SCHEMA_VERSION,
            signal: signal.clone(),
        };
        let content =
            serde_json::to_string_pretty(&record).map_err(|source| PersistenceError::Encode {
                path: path.display().to_string(),
                source,
            })?;

        // Atomic write: tmp sibling first, then rename over the target.
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content)
            .await
            .map_err(|e| io_error("write", &tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| io_error("rename", &path, e))?;

        debug!(path = %path.display(), id = %signal.id, "signal persisted");
        Ok(())
    }

    async fn delete_value(
        &self,
        kind: SignalKind,
        symbol: &str,
        strategy_name: &str,
    ) -> Result<(), PersistenceError> {
        let path = self.record_path(kind, symbol, strategy_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "signal record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete", &path, e)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
