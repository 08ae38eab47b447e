//! Write-Ahead Log (WAL) for crash recovery.
//!
//! Every committed transaction is appended as a single record holding all of
//! its inserted and updated rows. A record torn by a crash fails its checksum
//! (or comes up short) and is discarded as a whole on replay, so a transaction
//! is either fully recovered or not at all.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::Contact;

use super::codec;

/// Length of the file header (magic + version).
const HEADER_LEN: u64 = 5;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The operation being logged.
    pub kind: WalEntryKind,
}

/// The type of WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// Rows written by one committed transaction.
    Commit {
        /// Newly inserted contacts, ascending by id.
        inserts: Vec<Contact>,
        /// Full post-commit state of updated contacts, ascending by id.
        updates: Vec<Contact>,
    },

    /// Checkpoint marker: every entry up to this sequence is in the snapshot.
    Checkpoint {
        /// Last sequence folded into the snapshot.
        up_to_sequence: u64,
    },
}

fn poisoned(context: &'static str) -> std::io::Error {
    std::io::Error::new(ErrorKind::Other, format!("poisoned lock: {context}"))
}

/// Write-Ahead Log for crash recovery.
///
/// Thread-safe via internal mutex.
#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalWriter>,
    sync_on_write: bool,
}

#[derive(Debug)]
struct WalWriter {
    file: BufWriter<File>,
    sequence: u64,
    /// Set when a failed append could not be rolled back; appends are refused.
    broken: bool,
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// An existing log is scanned to find the last valid sequence. Bytes after
    /// the last valid record (a torn write) are cut off so new records are
    /// never appended behind garbage.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let sequence = if file.metadata()?.len() >= HEADER_LEN {
            let (last, valid_len) = Self::scan(path)?;
            if valid_len < file.metadata()?.len() {
                tracing::warn!(
                    path = %path.display(),
                    valid_len,
                    "discarding torn WAL tail"
                );
                file.set_len(valid_len)?;
                if sync_on_write {
                    file.sync_all()?;
                }
            }
            last
        } else {
            let mut file = file;
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalWriter {
                file: BufWriter::new(file),
                sequence,
                broken: false,
            }),
            sync_on_write,
        })
    }

    fn lock(&self, context: &'static str) -> IoResult<MutexGuard<'_, WalWriter>> {
        self.inner.lock().map_err(|_| poisoned(context))
    }

    /// Append an entry to the WAL.
    ///
    /// Returns the sequence number assigned to this entry. The sequence only
    /// advances once the record is flushed (and synced, if configured).
    ///
    /// A failed append leaves no trace: the file is cut back to its previous
    /// length and unflushed bytes are discarded, so a later append cannot
    /// complete a record whose transaction was reported as failed. If that
    /// rollback fails too, the log refuses further appends until reopened.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut inner = self.lock("wal.append")?;
        if inner.broken {
            return Err(std::io::Error::new(
                ErrorKind::Other,
                "WAL is unusable after a failed append; reopen the database",
            ));
        }

        let candidate = inner.sequence + 1;
        let entry = WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            kind,
        };
        let encoded = codec::encode(&entry)?;
        let start = inner.file.get_ref().metadata()?.len();

        if let Err(e) = self.write_record(&mut inner, &encoded) {
            match self.rewind(&mut inner, start) {
                Ok(()) => tracing::warn!(error = %e, len = start, "WAL append failed; record discarded"),
                Err(rewind_err) => {
                    inner.broken = true;
                    tracing::error!(
                        error = %e,
                        rewind_error = %rewind_err,
                        "WAL append failed and could not be rolled back"
                    );
                }
            }
            return Err(e);
        }

        inner.sequence = candidate;
        Ok(candidate)
    }

    fn write_record(&self, inner: &mut WalWriter, encoded: &[u8]) -> IoResult<()> {
        inner.file.write_all(encoded)?;
        inner.file.flush()?;
        if self.sync_on_write {
            inner.file.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Drop buffered bytes and cut the file back to `len`.
    fn rewind(&self, inner: &mut WalWriter, len: u64) -> IoResult<()> {
        let fresh = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut inner.file, BufWriter::new(fresh));
        // into_parts hands back the buffer instead of flushing it on drop.
        let (_file, _unflushed) = stale.into_parts();

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len)?;
        if self.sync_on_write {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Iterate over all entries in the WAL.
    ///
    /// Used during recovery to replay commits.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Get the current sequence number.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock("wal.sequence")?.sequence)
    }

    /// Get the WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate the WAL after a checkpoint (compaction).
    ///
    /// Only call this once the snapshot covering every entry is durable.
    pub fn truncate(&self) -> IoResult<()> {
        let mut inner = self.lock("wal.truncate")?;
        inner.file.flush()?;

        {
            let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
            codec::write_header(&mut file)?;
            if self.sync_on_write {
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new().append(true).open(&self.path)?;
        inner.file = BufWriter::new(file);
        inner.sequence = 0;
        inner.broken = false;
        Ok(())
    }

    /// Returns (last valid sequence, byte length of the valid prefix).
    fn scan(path: &Path) -> IoResult<(u64, u64)> {
        let mut iter = WalIterator::new(path)?;
        let mut last_seq = 0;
        let mut valid_len = iter.position()?;

        while let Some(entry) = iter.next() {
            match entry {
                Ok(entry) => {
                    last_seq = entry.sequence;
                    valid_len = iter.position()?;
                }
                Err(e) => {
                    tracing::warn!(
                        sequence = last_seq + 1,
                        error = %e,
                        "WAL corruption detected; replay stops here"
                    );
                    break;
                }
            }
        }

        Ok((last_seq, valid_len))
    }
}

/// Iterator over WAL entries.
///
/// Ends cleanly at end of file or at a truncated trailing record; yields an
/// error for a record that fails validation.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let _version = codec::read_header(&mut reader)?;

        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::contact::{ContactId, NewContact};

    fn commit_of(id: i64, email: &str) -> WalEntryKind {
        let contact = NewContact::primary(Some(email.to_string()), None)
            .into_contact(ContactId::new(id), Utc::now());
        WalEntryKind::Commit {
            inserts: vec![contact],
            updates: Vec::new(),
        }
    }

    #[test]
    fn test_wal_append_and_iterate() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        wal.append(commit_of(1, "a@x.com")).unwrap();
        wal.append(commit_of(2, "b@x.com")).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        drop(wal);

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().collect();
        assert_eq!(entries.len(), 2);

        let first = entries[0].as_ref().unwrap();
        assert_eq!(first.sequence, 1);
        assert!(matches!(&first.kind, WalEntryKind::Commit { inserts, .. } if inserts.len() == 1));
    }

    #[test]
    fn test_wal_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("persist.wal");

        {
            let wal = WriteAheadLog::open(&wal_path, true).unwrap();
            wal.append(commit_of(1, "a@x.com")).unwrap();
        }

        let wal = WriteAheadLog::open(&wal_path, true).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 1);
        assert_eq!(wal.iter().unwrap().count(), 1);
    }

    #[test]
    fn test_torn_tail_is_cut_on_open() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("torn.wal");

        {
            let wal = WriteAheadLog::open(&wal_path, false).unwrap();
            wal.append(commit_of(1, "a@x.com")).unwrap();
            wal.append(commit_of(2, "b@x.com")).unwrap();
        }
        let full = std::fs::metadata(&wal_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
        file.set_len(full - 3).unwrap();
        drop(file);

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 1);

        // A record appended after recovery must be readable.
        wal.append(commit_of(3, "c@x.com")).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().map(Result::unwrap).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn test_truncate_resets_log() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("trunc.wal");

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        wal.append(commit_of(1, "a@x.com")).unwrap();
        wal.truncate().unwrap();

        assert_eq!(wal.current_sequence().unwrap(), 0);
        assert_eq!(wal.size_bytes().unwrap(), HEADER_LEN);
        assert_eq!(wal.iter().unwrap().count(), 0);

        wal.append(commit_of(2, "b@x.com")).unwrap();
        assert_eq!(wal.iter().unwrap().count(), 1);
    }

    #[test]
    fn test_failed_append_leaves_no_partial_record() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("failed.wal");

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        wal.append(commit_of(1, "a@x.com")).unwrap();
        let size = wal.size_bytes().unwrap();

        // A read-only handle makes the flush fail with the record still buffered.
        {
            let mut inner = wal.inner.lock().unwrap();
            inner.file = BufWriter::new(File::open(&wal_path).unwrap());
        }
        assert!(wal.append(commit_of(2, "b@x.com")).is_err());
        assert_eq!(wal.current_sequence().unwrap(), 1);
        assert_eq!(wal.size_bytes().unwrap(), size);

        wal.append(commit_of(2, "c@x.com")).unwrap();
        drop(wal);

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().map(Result::unwrap).collect();
        assert_eq!(entries.len(), 2);
        match &entries[1].kind {
            WalEntryKind::Commit { inserts, .. } => {
                assert_eq!(inserts[0].email.as_deref(), Some("c@x.com"));
            }
            WalEntryKind::Checkpoint { .. } => panic!("expected a commit"),
        }
    }
}
