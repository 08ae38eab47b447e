//! Identity resolution against a contact store.
//!
//! [`IdentityResolver`] runs one transaction per submission: it finds the
//! contacts sharing an identifier, loads their clusters, asks
//! [`linking::plan`] what to write, applies the plan and reads back the
//! surviving cluster before committing.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::cluster::ClusterView;
use crate::contact::{Contact, ContactId, NewContact};
use crate::error::{LinkError, LinkResult};
use crate::linking::{self, Cluster, LinkCommand, LinkPlan};
use crate::request::Submission;
use crate::storage::{ContactStore, ContactTransaction, StorageError};

/// Attempts per submission; a serialization conflict is retried once.
const MAX_ATTEMPTS: u32 = 2;

/// Shared cancellation flag for an in-flight resolution.
///
/// Checked right before commit: once set, the transaction is rolled back and
/// the resolver returns [`LinkError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that is not set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Links submissions into identity clusters.
///
/// Stateless between calls; clone it or share it behind an `Arc`.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn ContactStore>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver").finish_non_exhaustive()
    }
}

impl IdentityResolver {
    /// Creates a resolver over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Resolve an (email, phone number) submission.
    ///
    /// Inputs are trimmed and empty values dropped; at least one must remain.
    ///
    /// # Errors
    /// - `Validation(MissingIdentifier)` without touching the store
    /// - `Storage` if the transaction failed (it was rolled back)
    pub fn resolve(&self, email: Option<&str>, phone_number: Option<&str>) -> LinkResult<ClusterView> {
        self.resolve_cancellable(email, phone_number, &CancelFlag::new())
    }

    /// Like [`resolve`](Self::resolve), rolling back with
    /// [`LinkError::Cancelled`] if `cancel` is set before commit.
    ///
    /// # Errors
    /// See [`resolve`](Self::resolve); additionally `Cancelled`.
    pub fn resolve_cancellable(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
        cancel: &CancelFlag,
    ) -> LinkResult<ClusterView> {
        let submission = Submission::new(email, phone_number)?;
        self.resolve_submission(&submission, cancel)
    }

    /// Resolve an already normalized submission.
    ///
    /// # Errors
    /// `Storage` or `Cancelled`; the transaction is rolled back in both cases.
    pub fn resolve_submission(&self, submission: &Submission, cancel: &CancelFlag) -> LinkResult<ClusterView> {
        let mut attempt = 1;
        loop {
            match self.attempt(submission, cancel) {
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "serialization conflict; retrying");
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "identify rolled back");
                    return Err(e);
                }
                Ok(view) => return Ok(view),
            }
        }
    }

    fn attempt(&self, submission: &Submission, cancel: &CancelFlag) -> LinkResult<ClusterView> {
        let mut tx = self.store.begin()?;
        let view = link(tx.as_mut(), submission)?;

        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        tx.commit()?;
        Ok(view)
    }
}

/// Link `submission` inside `tx` and return the resulting cluster view.
fn link(tx: &mut dyn ContactTransaction, submission: &Submission) -> LinkResult<ClusterView> {
    let matched = tx.find_by_email_or_phone(submission.email(), submission.phone_number())?;

    if matched.is_empty() {
        let created = tx.insert(NewContact::primary(
            submission.email().map(str::to_string),
            submission.phone_number().map(str::to_string),
        ))?;
        tracing::info!(contact_id = %created.id, "created new identity");
        return Ok(ClusterView::assemble(&created, &[]));
    }

    let clusters = load_clusters(&*tx, &matched)?;
    let plan = linking::plan(submission, &clusters)
        .ok_or_else(|| LinkError::internal("matched contacts produced no cluster"))?;
    tracing::debug!(
        survivor = %plan.survivor,
        clusters = clusters.len(),
        commands = plan.commands.len(),
        "planned link"
    );

    apply(tx, &plan)?;
    if plan.is_merge() {
        let absorbed: Vec<i64> = clusters
            .iter()
            .map(|c| c.root.id)
            .filter(|id| *id != plan.survivor)
            .map(ContactId::get)
            .collect();
        tracing::info!(survivor = %plan.survivor, ?absorbed, "merged identity clusters");
    }

    let primary = tx
        .get(plan.survivor)?
        .ok_or(StorageError::ContactNotFound(plan.survivor))?;
    let members = tx.find_linked(plan.survivor)?;
    Ok(ClusterView::assemble(&primary, &members))
}

/// Load the cluster of every distinct root among `matched`.
///
/// A secondary must link, in one hop, to an existing primary.
fn load_clusters(tx: &dyn ContactTransaction, matched: &[Contact]) -> LinkResult<Vec<Cluster>> {
    let mut roots: BTreeSet<ContactId> = BTreeSet::new();
    for contact in matched {
        if contact.is_primary() {
            roots.insert(contact.id);
        } else {
            let root = contact.linked_id.ok_or_else(|| {
                StorageError::Integrity(format!("secondary contact {} has no linked_id", contact.id))
            })?;
            roots.insert(root);
        }
    }

    let mut clusters = Vec::with_capacity(roots.len());
    for root_id in roots {
        let root = tx
            .get(root_id)?
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| {
                StorageError::Integrity(format!(
                    "contact {root_id} is linked to but does not exist or was deleted"
                ))
            })?;
        if !root.is_primary() {
            return Err(StorageError::Integrity(format!(
                "contact {root_id} is linked to but is itself secondary (linked to {})",
                root.root_id()
            ))
            .into());
        }
        let members = tx.find_linked(root_id)?;
        clusters.push(Cluster::new(root, members));
    }
    Ok(clusters)
}

fn apply(tx: &mut dyn ContactTransaction, plan: &LinkPlan) -> LinkResult<()> {
    let now = Utc::now();
    for command in &plan.commands {
        match command {
            LinkCommand::Insert(draft) => {
                let created = tx.insert(draft.clone())?;
                tracing::info!(
                    contact_id = %created.id,
                    primary = %plan.survivor,
                    "added secondary contact"
                );
            }
            LinkCommand::Demote { id, linked_id } => {
                let mut contact = tx.get(*id)?.ok_or(StorageError::ContactNotFound(*id))?;
                contact.link_to(*linked_id, now);
                tx.update(contact)?;
            }
        }
    }
    Ok(())
}
