//! Persistent storage backend for contactlink.
//!
//! This module provides durable, crash-safe storage with:
//! - Write-Ahead Logging (WAL) for crash recovery
//! - File locking for single-process ownership of a directory
//! - CRC32 checksums for corruption detection
//! - A compacted snapshot for fast startup
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  PersistentContactStore                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐                    │
//! │  │ WriteAheadLog   │  │ SnapshotFile    │                    │
//! │  │ (contacts.wal)  │  │ (contacts.snap) │                    │
//! │  └────────┬────────┘  └────────┬────────┘                    │
//! │           │                    │                             │
//! │           └──────────┬─────────┘                             │
//! │                      ↓                                       │
//! │           ┌─────────────────────┐                            │
//! │           │   FileLock (.lock)  │                            │
//! │           └─────────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod snapshot;
mod store;
mod wal;

pub use file_lock::FileLock;
pub use snapshot::{SnapshotFile, SnapshotHeader};
pub use store::{CompactionResult, PersistentContactStore};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::error::{LinkResult, ValidationError};

/// Configuration for persistent storage.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// Maximum WAL size before automatic compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every commit (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: Self::DEFAULT_MAX_WAL_SIZE,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    /// Default WAL size limit (64 MiB).
    pub const DEFAULT_MAX_WAL_SIZE: u64 = 64 * 1024 * 1024;

    const MIN_WAL_SIZE: u64 = 4 * 1024; // 4 KiB minimum to avoid degenerate compaction loops

    /// Check the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

/// Open or create a persistent contact database at the given path.
///
/// # Arguments
/// * `path` - Directory to store the database files
/// * `config` - Optional configuration (uses defaults if None)
///
/// # Errors
/// - If the configuration is invalid
/// - If the path cannot be created or accessed
/// - If another process holds the lock
/// - If the snapshot is corrupt or replayed rows are inconsistent
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use contactlink::storage::persistent::open_database;
/// use contactlink::IdentityResolver;
///
/// let store = open_database("./contacts.db", None)?;
/// let resolver = IdentityResolver::new(Arc::new(store));
/// # Ok::<(), contactlink::LinkError>(())
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> LinkResult<PersistentContactStore> {
    let cfg = config.unwrap_or_default().validate()?;
    Ok(PersistentContactStore::open(path.as_ref(), cfg)?)
}
