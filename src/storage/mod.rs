//! Storage backends for contactlink.
//!
//! The resolver only talks to the [`ContactStore`] and [`ContactTransaction`]
//! traits. Two backends are bundled:
//! - [`InMemoryContactStore`] for embedding and tests
//! - [`persistent::PersistentContactStore`] (feature `persistent`) for durable storage

mod memory;
mod table;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryContactStore;
pub use traits::{with_transaction, ContactStore, ContactTransaction, StorageError};
