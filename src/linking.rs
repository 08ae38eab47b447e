//! The linking decision.
//!
//! Given a submission and the clusters its identifiers touch, [`plan`] works
//! out which cluster survives and which rows must be inserted or relinked. It
//! never touches storage; the resolver applies the resulting [`LinkCommand`]s
//! inside a transaction.

use std::collections::BTreeSet;

use crate::contact::{Contact, ContactId, NewContact};
use crate::request::Submission;

/// A cluster root together with every live contact linked to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// The primary contact.
    pub root: Contact,
    /// Secondaries linked to `root`, ascending by id.
    pub members: Vec<Contact>,
}

impl Cluster {
    /// Creates a cluster. The root is removed from `members` if present.
    #[must_use]
    pub fn new(root: Contact, mut members: Vec<Contact>) -> Self {
        members.retain(|c| c.id != root.id);
        members.sort_by_key(|c| c.id);
        Self { root, members }
    }

    /// The root followed by its members.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        std::iter::once(&self.root).chain(self.members.iter())
    }

    /// Returns true if any contact in the cluster carries `email`.
    #[must_use]
    pub fn knows_email(&self, email: &str) -> bool {
        self.contacts().any(|c| c.has_email(email))
    }

    /// Returns true if any contact in the cluster carries `phone_number`.
    #[must_use]
    pub fn knows_phone_number(&self, phone_number: &str) -> bool {
        self.contacts().any(|c| c.has_phone_number(phone_number))
    }
}

/// A single write the resolver performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Insert a new contact.
    Insert(NewContact),
    /// Make `id` a secondary of `linked_id`: demotes a former root, or
    /// repoints one of its secondaries.
    Demote {
        /// Contact to relink.
        id: ContactId,
        /// Surviving primary.
        linked_id: ContactId,
    },
}

/// The outcome of [`plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPlan {
    /// Primary of the cluster the submission ends up in.
    pub survivor: ContactId,
    /// Writes to apply, in order: relinks first, then inserts.
    pub commands: Vec<LinkCommand>,
}

impl LinkPlan {
    /// Returns true if nothing needs to be written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Returns true if the plan folds other clusters into the survivor.
    #[must_use]
    pub fn is_merge(&self) -> bool {
        self.commands
            .iter()
            .any(|c| matches!(c, LinkCommand::Demote { .. }))
    }

    /// Number of rows the plan inserts.
    #[must_use]
    pub fn insert_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, LinkCommand::Insert(_)))
            .count()
    }
}

/// Decide how `submission` links into the `clusters` it matched.
///
/// Returns `None` when no cluster matched; the caller then starts a new
/// identity. Otherwise:
/// - The oldest root (by `created_at`, then id) survives.
/// - Every other root, and every secondary of those roots, is relinked to the
///   survivor.
/// - Each submitted value not yet present anywhere in the merged clusters gets
///   its own secondary row: the email row first, then the phone row.
#[must_use]
pub fn plan(submission: &Submission, clusters: &[Cluster]) -> Option<LinkPlan> {
    let survivor = clusters.iter().min_by_key(|c| c.root.seniority())?;
    let survivor_id = survivor.root.id;

    let mut commands = Vec::new();

    let mut relinked: BTreeSet<ContactId> = BTreeSet::new();
    let mut absorbed: Vec<&Cluster> = clusters
        .iter()
        .filter(|c| c.root.id != survivor_id)
        .collect();
    absorbed.sort_by_key(|c| c.root.id);
    for cluster in absorbed {
        for contact in cluster.contacts() {
            if relinked.insert(contact.id) {
                commands.push(LinkCommand::Demote {
                    id: contact.id,
                    linked_id: survivor_id,
                });
            }
        }
    }

    if let Some(email) = submission.email() {
        if !clusters.iter().any(|c| c.knows_email(email)) {
            commands.push(LinkCommand::Insert(NewContact::secondary_email(survivor_id, email)));
        }
    }
    if let Some(phone_number) = submission.phone_number() {
        if !clusters.iter().any(|c| c.knows_phone_number(phone_number)) {
            commands.push(LinkCommand::Insert(NewContact::secondary_phone_number(
                survivor_id,
                phone_number,
            )));
        }
    }

    Some(LinkPlan {
        survivor: survivor_id,
        commands,
    })
}
