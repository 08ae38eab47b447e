//! Consolidated view of an identity cluster.

use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId};

/// Everything known about one person: the primary plus what its secondaries add.
///
/// Ordering is deterministic: the primary's email/phone come first, followed by
/// the values contributed by secondaries in ascending id order, without repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    /// Id of the cluster primary.
    pub primary_contact_id: ContactId,
    /// Distinct emails across the cluster.
    pub emails: Vec<String>,
    /// Distinct phone numbers across the cluster.
    pub phone_numbers: Vec<String>,
    /// Ids of every secondary member, ascending.
    pub secondary_contact_ids: Vec<ContactId>,
}

impl ClusterView {
    /// Builds the view from a primary and its members.
    ///
    /// `members` may include the primary itself and may be in any order;
    /// soft-deleted contacts are skipped.
    #[must_use]
    pub fn assemble(primary: &Contact, members: &[Contact]) -> Self {
        let mut secondaries: Vec<&Contact> = members
            .iter()
            .filter(|c| c.id != primary.id && !c.is_deleted())
            .collect();
        secondaries.sort_by_key(|c| c.id);

        let mut emails: Vec<String> = Vec::new();
        let mut phone_numbers: Vec<String> = Vec::new();
        for contact in std::iter::once(primary).chain(secondaries.iter().copied()) {
            push_distinct(&mut emails, contact.email.as_deref());
            push_distinct(&mut phone_numbers, contact.phone_number.as_deref());
        }

        Self {
            primary_contact_id: primary.id,
            emails,
            phone_numbers,
            secondary_contact_ids: secondaries.iter().map(|c| c.id).collect(),
        }
    }

    /// Number of contacts in the cluster.
    #[must_use]
    pub fn len(&self) -> usize {
        self.secondary_contact_ids.len() + 1
    }

    /// Always false; a cluster has at least its primary.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

fn push_distinct(out: &mut Vec<String>, value: Option<&str>) {
    let Some(value) = value else {
        return;
    };
    if value.is_empty() || out.iter().any(|v| v == value) {
        return;
    }
    out.push(value.to_string());
}
