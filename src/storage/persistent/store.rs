//! Durable contact store.
//!
//! Wraps:
//! - An in-memory [`ContactTable`] for reads and transaction overlays
//! - A [`WriteAheadLog`] receiving one record per committed transaction
//! - A [`SnapshotFile`] holding the table as of the last compaction

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use chrono::Utc;

use crate::contact::{Contact, ContactId, NewContact};
use crate::storage::table::{apply_rows, ContactTable, StagedWrites};
use crate::storage::traits::{ContactStore, ContactTransaction, StorageError};

use super::file_lock::FileLock;
use super::snapshot::SnapshotFile;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

/// File name of the WAL inside the database directory.
pub const WAL_FILE_NAME: &str = "contacts.wal";

fn io_err(context: &str, e: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {e}"))
}

/// Contact store persisted to a directory.
///
/// The directory is locked for the lifetime of the store. Reads are served
/// from memory; a commit is durable once its WAL record is written.
#[derive(Debug)]
pub struct PersistentContactStore {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    snapshot: SnapshotFile,
    config: PersistentConfig,
    state: RwLock<ContactTable>,
}

impl PersistentContactStore {
    /// Open or create a database directory.
    ///
    /// Loads the snapshot, then replays the WAL on top of it.
    ///
    /// # Errors
    /// - `ConnectionError` if another process holds the directory lock
    /// - `BackendError` on I/O failure or a corrupt snapshot
    /// - `Integrity` if replayed rows are inconsistent
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)
            .map_err(|e| io_err("failed to create database directory", &e))?;

        let lock = FileLock::acquire(dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                StorageError::ConnectionError(format!("{}: {e}", dir.display()))
            } else {
                io_err("failed to acquire lock", &e)
            }
        })?;

        let snapshot = SnapshotFile::open(dir).map_err(|e| io_err("failed to open snapshot", &e))?;
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE_NAME), config.sync_on_write)
            .map_err(|e| io_err("failed to open WAL", &e))?;

        let mut table = ContactTable::from_contacts(
            snapshot
                .load()
                .map_err(|e| io_err("failed to load snapshot", &e))?,
        )?;
        let replayed = Self::replay_wal(&wal, &mut table)?;

        tracing::info!(
            dir = %dir.display(),
            contacts = table.len(),
            replayed,
            "opened contact database"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            snapshot,
            config,
            state: RwLock::new(table),
        })
    }

    /// Replay WAL commits onto the snapshot table.
    ///
    /// Commits before the last checkpoint are already in the snapshot and are
    /// skipped. Rows are upserted, so a commit that reached the snapshot
    /// without a checkpoint (crash mid-compaction) replays harmlessly.
    fn replay_wal(wal: &WriteAheadLog, table: &mut ContactTable) -> Result<usize, StorageError> {
        let mut pending: Vec<(Vec<Contact>, Vec<Contact>)> = Vec::new();

        for entry in wal.iter().map_err(|e| io_err("failed to iterate WAL", &e))? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "stopping WAL replay at corrupt record");
                    break;
                }
            };
            match entry.kind {
                WalEntryKind::Commit { inserts, updates } => pending.push((inserts, updates)),
                WalEntryKind::Checkpoint { up_to_sequence } => {
                    tracing::debug!(up_to_sequence, "WAL checkpoint; earlier commits are in the snapshot");
                    pending.clear();
                }
            }
        }

        let count = pending.len();
        for (inserts, updates) in pending {
            for contact in inserts.into_iter().chain(updates) {
                table.upsert(contact)?;
            }
        }
        Ok(count)
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, ContactTable> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Directory holding the database files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of committed contacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_table().len()
    }

    /// Returns true if no contact has been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current WAL size in bytes.
    ///
    /// # Errors
    /// `BackendError` if the WAL cannot be stat'ed.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        self.wal.size_bytes().map_err(|e| io_err("failed to stat WAL", &e))
    }

    /// Write the full table to the snapshot and truncate the WAL.
    ///
    /// Blocks new transactions while running. If it fails partway through,
    /// the WAL still holds every commit and is replayed on next open.
    ///
    /// # Errors
    /// `BackendError` on any I/O failure.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let table = self.state.write().unwrap_or_else(PoisonError::into_inner);
        self.compact_locked(&table)
    }

    fn compact_locked(&self, table: &ContactTable) -> Result<CompactionResult, StorageError> {
        let current_seq = self
            .wal
            .current_sequence()
            .map_err(|e| io_err("failed to read WAL sequence", &e))?;
        let wal_size_before = self.wal_size()?;
        if current_seq == 0 {
            return Ok(CompactionResult {
                contacts_compacted: 0,
                commits_folded: 0,
                snapshot_path: None,
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let contacts: Vec<Contact> = table.contacts().cloned().collect();
        let header = self
            .snapshot
            .write(&contacts)
            .map_err(|e| io_err("failed to write snapshot", &e))?;

        self.wal
            .append(WalEntryKind::Checkpoint {
                up_to_sequence: current_seq,
            })
            .map_err(|e| io_err("failed to write checkpoint", &e))?;
        self.wal
            .truncate()
            .map_err(|e| io_err("failed to truncate WAL", &e))?;

        let wal_size_after = self.wal_size()?;
        tracing::info!(
            contacts = header.contact_count,
            commits = current_seq,
            wal_size_before,
            wal_size_after,
            "compacted contact database"
        );

        Ok(CompactionResult {
            contacts_compacted: header.contact_count,
            commits_folded: current_seq,
            snapshot_path: Some(self.snapshot.path().to_path_buf()),
            wal_size_before,
            wal_size_after,
        })
    }

    fn maybe_compact(&self, table: &ContactTable) {
        let size = match self.wal.size_bytes() {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(error = %e, "failed to stat WAL; skipping compaction check");
                return;
            }
        };
        if size <= self.config.max_wal_size {
            return;
        }
        if let Err(e) = self.compact_locked(table) {
            tracing::warn!(error = %e, wal_size = size, "automatic compaction failed");
        }
    }
}

impl ContactStore for PersistentContactStore {
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError> {
        let table = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let staged = StagedWrites::new(&table);
        Ok(Box::new(PersistentTransaction {
            store: self,
            table,
            staged,
        }))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        Ok(self.read_table().get(id).cloned())
    }

    fn snapshot(&self) -> Result<Vec<Contact>, StorageError> {
        Ok(self.read_table().contacts().cloned().collect())
    }
}

struct PersistentTransaction<'a> {
    store: &'a PersistentContactStore,
    table: RwLockWriteGuard<'a, ContactTable>,
    staged: StagedWrites,
}

impl ContactTransaction for PersistentTransaction<'_> {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        Ok(self.staged.find_by_email_or_phone(&self.table, email, phone_number))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        Ok(self.staged.get(&self.table, id))
    }

    fn find_linked(&self, primary: ContactId) -> Result<Vec<Contact>, StorageError> {
        Ok(self.staged.find_linked(&self.table, primary))
    }

    fn insert(&mut self, draft: NewContact) -> Result<Contact, StorageError> {
        Ok(self.staged.insert(draft, Utc::now()))
    }

    fn update(&mut self, contact: Contact) -> Result<(), StorageError> {
        self.staged.update(&self.table, contact)
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let PersistentTransaction {
            store,
            mut table,
            staged,
        } = *self;
        if staged.is_empty() {
            return Ok(());
        }

        let (inserts, updates) = staged.parts();
        store
            .wal
            .append(WalEntryKind::Commit {
                inserts: inserts.clone(),
                updates: updates.clone(),
            })
            .map_err(|e| io_err("WAL write failed", &e))?;

        apply_rows(&mut table, inserts, updates)?;
        store.maybe_compact(&table);
        Ok(())
    }
}

/// Result of a compaction operation.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Contacts written to the snapshot.
    pub contacts_compacted: u64,
    /// WAL commits folded into the snapshot.
    pub commits_folded: u64,
    /// Path to the snapshot (if one was written).
    pub snapshot_path: Option<PathBuf>,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::storage::traits::with_transaction;

    fn config() -> PersistentConfig {
        PersistentConfig {
            sync_on_write: false,
            ..PersistentConfig::default()
        }
    }

    fn insert_primary(store: &PersistentContactStore, email: &str) -> Contact {
        with_transaction::<_, StorageError, _>(store, |tx| {
            tx.insert(NewContact::primary(Some(email.to_string()), None))
        })
        .unwrap()
    }

    #[test]
    fn test_open_write_and_reopen() {
        let dir = tempdir().unwrap();
        let c = {
            let store = PersistentContactStore::open(dir.path(), config()).unwrap();
            insert_primary(&store, "a@x.com")
        };

        let store = PersistentContactStore::open(dir.path(), config()).unwrap();
        assert_eq!(store.get(c.id).unwrap(), Some(c));
    }

    #[test]
    fn test_rolled_back_transaction_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = PersistentContactStore::open(dir.path(), config()).unwrap();
        let before = store.wal_size().unwrap();
        {
            let mut tx = store.begin().unwrap();
            tx.insert(NewContact::primary(Some("a@x.com".into()), None)).unwrap();
        }
        assert_eq!(store.wal_size().unwrap(), before);
        assert!(store.is_empty());
    }

    #[test]
    fn test_compaction_writes_snapshot_and_truncates_wal() {
        let dir = tempdir().unwrap();
        let store = PersistentContactStore::open(dir.path(), config()).unwrap();
        for i in 0..10 {
            insert_primary(&store, &format!("user{i}@x.com"));
        }

        let result = store.compact().unwrap();
        assert_eq!(result.contacts_compacted, 10);
        assert_eq!(result.commits_folded, 10);
        assert!(result.snapshot_path.is_some());
        assert!(result.wal_size_after < result.wal_size_before);
    }

    #[test]
    fn test_compaction_of_empty_wal_is_a_no_op() {
        let dir = tempdir().unwrap();
        let store = PersistentContactStore::open(dir.path(), config()).unwrap();
        let result = store.compact().unwrap();
        assert_eq!(result.contacts_compacted, 0);
        assert!(result.snapshot_path.is_none());
    }

    #[test]
    fn test_updates_survive_compaction_and_reopen() {
        let dir = tempdir().unwrap();
        let (a, b) = {
            let store = PersistentContactStore::open(dir.path(), config()).unwrap();
            let a = insert_primary(&store, "a@x.com");
            let b = insert_primary(&store, "b@x.com");
            store.compact().unwrap();

            with_transaction::<_, StorageError, _>(&store, |tx| {
                let mut demoted = tx.get(b.id)?.ok_or(StorageError::ContactNotFound(b.id))?;
                demoted.link_to(a.id, Utc::now());
                tx.update(demoted)
            })
            .unwrap();
            (a, b)
        };

        let store = PersistentContactStore::open(dir.path(), config()).unwrap();
        let b = store.get(b.id).unwrap().unwrap();
        assert_eq!(b.linked_id, Some(a.id));
        assert!(!b.is_primary());

        // Ids continue after the highest recovered id.
        let c = insert_primary(&store, "c@x.com");
        assert_eq!(c.id, ContactId::new(3));
    }

    #[test]
    fn test_replay_onto_snapshot_without_checkpoint() {
        let dir = tempdir().unwrap();
        {
            let store = PersistentContactStore::open(dir.path(), config()).unwrap();
            insert_primary(&store, "a@x.com");
            // Simulate a crash after the snapshot rename but before truncation.
            let contacts = store.snapshot().unwrap();
            store.snapshot.write(&contacts).unwrap();
        }

        let store = PersistentContactStore::open(dir.path(), config()).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_auto_compaction_when_wal_exceeds_limit() {
        let dir = tempdir().unwrap();
        let cfg = PersistentConfig {
            max_wal_size: 4 * 1024,
            sync_on_write: false,
        };
        let store = PersistentContactStore::open(dir.path(), cfg.clone()).unwrap();
        for i in 0..64 {
            insert_primary(&store, &format!("user{i}@example.com"));
        }

        assert!(store.wal_size().unwrap() <= cfg.max_wal_size);
        assert!(dir.path().join(super::super::snapshot::SNAPSHOT_FILE_NAME).exists());
        drop(store);

        let store = PersistentContactStore::open(dir.path(), cfg).unwrap();
        assert_eq!(store.len(), 64);
    }

    #[test]
    fn test_second_open_is_refused() {
        let dir = tempdir().unwrap();
        let _store = PersistentContactStore::open(dir.path(), config()).unwrap();
        let err = PersistentContactStore::open(dir.path(), config()).unwrap_err();
        assert!(matches!(err, StorageError::ConnectionError(_)));
    }
}
