//! Compacted snapshot of the contact table.
//!
//! A snapshot holds every committed contact as of a WAL sequence. It is
//! rewritten in full on compaction using the write-to-temp-then-rename
//! pattern, so readers only ever see the previous or the new snapshot.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [SnapshotHeader: codec record]
//! [Vec<Contact>: codec record]
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::Contact;

use super::codec;

/// File name of the snapshot inside the database directory.
pub const SNAPSHOT_FILE_NAME: &str = "contacts.snap";

/// Snapshot file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Number of contacts in the snapshot.
    pub contact_count: u64,
    /// Highest contact id in the snapshot (0 when empty).
    pub last_id: i64,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}

/// Reads and writes the snapshot file of one database directory.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    /// Snapshot handle for `dir`. Stale temp files from an interrupted
    /// compaction are removed.
    pub fn open(dir: &Path) -> IoResult<Self> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let stale = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(SNAPSHOT_FILE_NAME) && n.ends_with(".tmp"));
            if stale {
                tracing::debug!(path = %path.display(), "removing stale snapshot temp file");
                let _ = fs::remove_file(&path);
            }
        }

        Ok(Self {
            path: dir.join(SNAPSHOT_FILE_NAME),
        })
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if a snapshot has been written.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the snapshot. A missing file reads as empty.
    pub fn load(&self) -> IoResult<Vec<Contact>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);

        let _version = codec::read_header(&mut reader)?;
        let header: SnapshotHeader = codec::decode(&mut reader)?;
        let contacts: Vec<Contact> = codec::decode(&mut reader)?;

        if contacts.len() as u64 != header.contact_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "snapshot header lists {} contacts, body has {}",
                    header.contact_count,
                    contacts.len()
                ),
            ));
        }
        Ok(contacts)
    }

    /// Write `contacts` as the new snapshot (flush, fsync, rename).
    ///
    /// After this returns successfully the snapshot is durable. On error the
    /// previous snapshot is untouched.
    pub fn write(&self, contacts: &[Contact]) -> IoResult<SnapshotHeader> {
        let writer = SnapshotWriter::new(&self.path)?;
        writer.finish(contacts)
    }
}

/// Temp file that becomes the snapshot on `finish`, or is removed on drop.
struct SnapshotWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: BufWriter<File>,
}

impl SnapshotWriter {
    fn new(final_path: &Path) -> IoResult<Self> {
        let temp_path = final_path.with_extension(format!("snap.{}.tmp", std::process::id()));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path: final_path.to_path_buf(),
            writer,
        })
    }

    fn finish(mut self, contacts: &[Contact]) -> IoResult<SnapshotHeader> {
        let header = SnapshotHeader {
            contact_count: contacts.len() as u64,
            last_id: contacts.iter().map(|c| c.id.get()).max().unwrap_or(0),
            created_at: Utc::now(),
        };
        self.writer.write_all(&codec::encode(&header)?)?;
        self.writer.write_all(&codec::encode(&contacts)?)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        if let Some(temp_path) = self.temp_path.take() {
            fs::rename(&temp_path, &self.final_path)?;
        }
        if let Some(dir) = self.final_path.parent() {
            sync_dir(dir);
        }
        Ok(header)
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if let Some(ref temp_path) = self.temp_path {
            let _ = fs::remove_file(temp_path);
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to sync database directory");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
