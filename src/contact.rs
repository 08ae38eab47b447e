//! Contact records and identity links.
//!
//! A contact is one submitted (email, phone) observation. Contacts that share
//! an identifier form a cluster with exactly one primary; every other member
//! is a secondary whose `linked_id` points straight at that primary.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned contact identifier.
///
/// Ids are strictly increasing in insertion order, so ordering by id is
/// ordering by insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(i64);

impl ContactId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns the id following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ContactId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl From<ContactId> for i64 {
    fn from(id: ContactId) -> Self {
        id.0
    }
}

/// Position of a contact within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    /// Root of a cluster.
    Primary,
    /// Linked to a primary.
    Secondary,
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// A stored contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Unique id, assigned by the store.
    pub id: ContactId,
    /// Submitted email, if any.
    pub email: Option<String>,
    /// Submitted phone number, if any.
    pub phone_number: Option<String>,
    /// The cluster primary, set iff this contact is secondary.
    pub linked_id: Option<ContactId>,
    /// Primary or secondary.
    pub link_precedence: LinkPrecedence,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// Returns true if this contact is the root of its cluster.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Returns true if this contact has been soft-deleted.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Id of the cluster root: the contact itself when primary, otherwise its link.
    #[must_use]
    pub fn root_id(&self) -> ContactId {
        match self.link_precedence {
            LinkPrecedence::Primary => self.id,
            LinkPrecedence::Secondary => self.linked_id.unwrap_or(self.id),
        }
    }

    /// Returns true if the contact carries this exact email.
    #[must_use]
    pub fn has_email(&self, email: &str) -> bool {
        self.email.as_deref() == Some(email)
    }

    /// Returns true if the contact carries this exact phone number.
    #[must_use]
    pub fn has_phone_number(&self, phone_number: &str) -> bool {
        self.phone_number.as_deref() == Some(phone_number)
    }

    /// Links this contact under `primary`, refreshing `updated_at`.
    ///
    /// Used both to demote a former primary and to repoint one of its
    /// secondaries after a merge.
    pub fn link_to(&mut self, primary: ContactId, now: DateTime<Utc>) {
        self.link_precedence = LinkPrecedence::Secondary;
        self.linked_id = Some(primary);
        self.updated_at = now;
    }

    /// Marks the contact as soft-deleted.
    pub fn soft_delete(&mut self, now: DateTime<Utc>) {
        self.deleted_at = Some(now);
        self.updated_at = now;
    }

    /// Ordering key for choosing a merge survivor: oldest first, then lowest id.
    #[must_use]
    pub fn seniority(&self) -> (DateTime<Utc>, ContactId) {
        (self.created_at, self.id)
    }
}

/// Insert draft for a contact; the store fills in the id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContact {
    /// Email to record.
    pub email: Option<String>,
    /// Phone number to record.
    pub phone_number: Option<String>,
    /// Cluster primary for secondaries.
    pub linked_id: Option<ContactId>,
    /// Primary or secondary.
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    /// Draft for the root of a brand new cluster.
    #[must_use]
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    /// Draft for a secondary carrying only a new email.
    #[must_use]
    pub fn secondary_email(primary: ContactId, email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            phone_number: None,
            linked_id: Some(primary),
            link_precedence: LinkPrecedence::Secondary,
        }
    }

    /// Draft for a secondary carrying only a new phone number.
    #[must_use]
    pub fn secondary_phone_number(primary: ContactId, phone_number: impl Into<String>) -> Self {
        Self {
            email: None,
            phone_number: Some(phone_number.into()),
            linked_id: Some(primary),
            link_precedence: LinkPrecedence::Secondary,
        }
    }

    /// Materializes the draft with store-assigned fields.
    #[must_use]
    pub fn into_contact(self, id: ContactId, now: DateTime<Utc>) -> Contact {
        Contact {
            id,
            email: self.email,
            phone_number: self.phone_number,
            linked_id: self.linked_id,
            link_precedence: self.link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}
