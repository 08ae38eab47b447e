//! # contactlink - Identity reconciliation for contact submissions
//!
//! contactlink links every (email, phone number) submission it sees into an
//! identity cluster: one primary contact plus any number of secondary contacts
//! that share an email or phone number with the cluster.
//!
//! ## Core Concepts
//!
//! - **Contact**: a stored submission, either primary or secondary
//! - **Cluster**: a primary and every contact linked to it
//! - **Merge**: when a submission bridges several clusters, the oldest primary
//!   survives and the others become its secondaries
//! - **ClusterView**: the consolidated answer returned to callers
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use contactlink::{IdentityResolver, InMemoryContactStore};
//!
//! let resolver = IdentityResolver::new(Arc::new(InMemoryContactStore::new()));
//!
//! let a = resolver.resolve(Some("doc@hillvalley.edu"), None)?;
//! let b = resolver.resolve(None, Some("5551234567"))?;
//!
//! // Bridges both clusters: the older primary survives.
//! let merged = resolver.resolve(Some("doc@hillvalley.edu"), Some("5551234567"))?;
//! assert_eq!(merged.primary_contact_id, a.primary_contact_id);
//! assert_eq!(merged.secondary_contact_ids, vec![b.primary_contact_id]);
//! # Ok::<(), contactlink::LinkError>(())
//! ```
//!
//! ## Features
//!
//! - `persistent`: durable WAL + snapshot backend ([`storage::persistent`])
//! - `server`: axum HTTP transport, configuration and the `contactlink-server` binary

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod contact;
pub mod error;
pub mod linking;
pub mod request;
pub mod resolver;
pub mod storage;

#[cfg(feature = "server")]
pub mod config;
#[cfg(feature = "server")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use cluster::ClusterView;
pub use contact::{Contact, ContactId, LinkPrecedence, NewContact};
pub use error::{LinkError, LinkResult, ValidationError};
pub use linking::{Cluster, LinkCommand, LinkPlan};
pub use request::{IdentifyRequest, RequestPolicy, Submission};
pub use resolver::{CancelFlag, IdentityResolver};
pub use storage::{
    with_transaction, ContactStore, ContactTransaction, InMemoryContactStore, StorageError,
};
