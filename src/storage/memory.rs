//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of the storage
//! traits. It is intended for embedded usage, tests, and as a reference
//! implementation.

use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use chrono::Utc;

use crate::contact::{Contact, ContactId, NewContact};
use crate::storage::table::{ContactTable, StagedWrites};
use crate::storage::traits::{ContactStore, ContactTransaction, StorageError};

/// Thread-safe in-memory contact store.
///
/// A transaction holds the table's write lock until it commits or is dropped,
/// which serializes read-modify-write cycles. The table is only mutated by an
/// all-or-nothing apply on commit, so a lock poisoned by a panicking caller
/// still guards a consistent table and is recovered rather than reported.
#[derive(Debug, Default)]
pub struct InMemoryContactStore {
    state: RwLock<ContactTable>,
}

impl InMemoryContactStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store preloaded with existing rows (ids and timestamps kept).
    ///
    /// # Errors
    /// `DuplicateKey` or `Integrity` when the rows are inconsistent.
    pub fn from_contacts(contacts: impl IntoIterator<Item = Contact>) -> Result<Self, StorageError> {
        Ok(Self {
            state: RwLock::new(ContactTable::from_contacts(contacts)?),
        })
    }

    /// Number of committed contacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no contact has been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContactStore for InMemoryContactStore {
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError> {
        let table = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let staged = StagedWrites::new(&table);
        Ok(Box::new(InMemoryTransaction { table, staged }))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(table.get(id).cloned())
    }

    fn snapshot(&self) -> Result<Vec<Contact>, StorageError> {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(table.contacts().cloned().collect())
    }
}

struct InMemoryTransaction<'a> {
    table: RwLockWriteGuard<'a, ContactTable>,
    staged: StagedWrites,
}

impl ContactTransaction for InMemoryTransaction<'_> {
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
        let InMemoryTransaction { mut table, staged } = *self;
        if staged.is_empty() {
            return Ok(());
        }
        staged.apply(&mut table)
    }
}
