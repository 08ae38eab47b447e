//! Abstract storage traits for contactlink.
//!
//! These traits define the contract that storage backends must implement.
//! By using traits, we enable:
//! - In-memory backends for testing and embedded use
//! - Persistent backends for production
//! - Fault-injecting wrappers in tests

use thiserror::Error;

use crate::contact::{Contact, ContactId, NewContact};

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Contact not found.
    #[error("Contact not found: {0}")]
    ContactNotFound(ContactId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Stored links violate a cluster invariant.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// A concurrent writer touched the same rows; the transaction was rolled back.
    #[error("Serialization conflict: {0}")]
    SerializationConflict(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// A contact store with transactional writes.
///
/// # Safety Considerations
/// - A transaction must hold whatever lock keeps concurrent transactions from
///   deciding on the same rows (the bundled backends lock the whole table)
/// - Writes staged in a transaction are invisible to other readers until commit
/// - Dropping a transaction without committing discards its writes
pub trait ContactStore: Send + Sync {
    /// Open a read-modify-write transaction.
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError>;

    /// Get a committed contact by id (soft-deleted contacts included).
    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError>;

    /// Every committed contact, ascending by id (soft-deleted contacts included).
    fn snapshot(&self) -> Result<Vec<Contact>, StorageError>;
}

/// An open transaction against a [`ContactStore`].
pub trait ContactTransaction {
    /// Find non-deleted contacts whose email equals `email` OR whose phone
    /// number equals `phone_number`. A `None` input disables that side of the
    /// predicate. Results are ascending by id.
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError>;

    /// Get a contact by id, including writes staged in this transaction.
    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError>;

    /// Non-deleted contacts whose `linked_id` equals `primary`, ascending by id.
    fn find_linked(&self, primary: ContactId) -> Result<Vec<Contact>, StorageError>;

    /// Insert a new contact; the store assigns the id and timestamps.
    fn insert(&mut self, draft: NewContact) -> Result<Contact, StorageError>;

    /// Persist the mutable fields of an existing contact.
    fn update(&mut self, contact: Contact) -> Result<(), StorageError>;

    /// Publish every staged write at once.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Run `f` inside a transaction on `store`.
///
/// The transaction commits when `f` returns `Ok` and is rolled back (dropped
/// uncommitted) when `f` returns `Err` or panics.
///
/// # Errors
/// Whatever `f` returns, or the storage error raised by `begin`/`commit`.
pub fn with_transaction<T, E, F>(store: &dyn ContactStore, f: F) -> Result<T, E>
where
    E: From<StorageError>,
    F: FnOnce(&mut dyn ContactTransaction) -> Result<T, E>,
{
    let mut tx = store.begin()?;
    let value = f(tx.as_mut())?;
    tx.commit()?;
    Ok(value)
}
