//! Indexed contact table and per-transaction write overlay.
//!
//! Both bundled backends keep the committed table in memory behind a lock. A
//! transaction never mutates the table directly: it stages inserts and updates
//! in a [`StagedWrites`] overlay that reads through to the table, and the
//! overlay is applied in one step on commit.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::contact::{Contact, ContactId, NewContact};
use crate::storage::traits::StorageError;

fn index_add(index: &mut HashMap<String, BTreeSet<ContactId>>, key: Option<&str>, id: ContactId) {
    if let Some(key) = key {
        index.entry(key.to_string()).or_default().insert(id);
    }
}

fn index_remove(index: &mut HashMap<String, BTreeSet<ContactId>>, key: Option<&str>, id: ContactId) {
    let Some(key) = key else {
        return;
    };
    if let Some(set) = index.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

fn check_immutable_fields(prev: &Contact, next: &Contact) -> Result<(), StorageError> {
    if prev.email != next.email
        || prev.phone_number != next.phone_number
        || prev.created_at != next.created_at
    {
        return Err(StorageError::Integrity(format!(
            "contact {} may only change its link, updated_at or deleted_at",
            prev.id
        )));
    }
    Ok(())
}

/// Committed contacts with lookup indexes.
#[derive(Debug, Default, Clone)]
pub(crate) struct ContactTable {
    by_id: BTreeMap<ContactId, Contact>,
    by_email: HashMap<String, BTreeSet<ContactId>>,
    by_phone: HashMap<String, BTreeSet<ContactId>>,
    by_link: HashMap<ContactId, BTreeSet<ContactId>>,
    last_id: i64,
}

impl ContactTable {
    /// Rebuild a table (and its indexes) from stored rows.
    pub(crate) fn from_contacts(
        contacts: impl IntoIterator<Item = Contact>,
    ) -> Result<Self, StorageError> {
        let mut table = Self::default();
        for contact in contacts {
            table.insert(contact)?;
        }
        Ok(table)
    }

    pub(crate) fn get(&self, id: ContactId) -> Option<&Contact> {
        self.by_id.get(&id)
    }

    pub(crate) fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.by_id.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Id the next inserted contact receives.
    pub(crate) fn next_id(&self) -> ContactId {
        ContactId::new(self.last_id).next()
    }

    pub(crate) fn insert(&mut self, contact: Contact) -> Result<(), StorageError> {
        if self.by_id.contains_key(&contact.id) {
            return Err(StorageError::DuplicateKey(contact.id.to_string()));
        }
        if contact.id.get() <= 0 {
            return Err(StorageError::Integrity(format!(
                "contact id must be positive (got {})",
                contact.id
            )));
        }

        index_add(&mut self.by_email, contact.email.as_deref(), contact.id);
        index_add(&mut self.by_phone, contact.phone_number.as_deref(), contact.id);
        if let Some(link) = contact.linked_id {
            self.by_link.entry(link).or_default().insert(contact.id);
        }
        self.last_id = self.last_id.max(contact.id.get());
        self.by_id.insert(contact.id, contact);
        Ok(())
    }

    /// Replace an existing row, keeping the link index in step.
    pub(crate) fn replace(&mut self, contact: Contact) -> Result<(), StorageError> {
        let prev = self
            .by_id
            .get(&contact.id)
            .ok_or(StorageError::ContactNotFound(contact.id))?;
        check_immutable_fields(prev, &contact)?;

        if prev.linked_id != contact.linked_id {
            if let Some(old) = prev.linked_id {
                if let Some(set) = self.by_link.get_mut(&old) {
                    set.remove(&contact.id);
                    if set.is_empty() {
                        self.by_link.remove(&old);
                    }
                }
            }
            if let Some(new) = contact.linked_id {
                self.by_link.entry(new).or_default().insert(contact.id);
            }
        }

        self.by_id.insert(contact.id, contact);
        Ok(())
    }

    /// Insert a row or overwrite the stored copy. Used by WAL replay, where a
    /// commit may already be reflected in the snapshot it is replayed onto.
    pub(crate) fn upsert(&mut self, contact: Contact) -> Result<(), StorageError> {
        if self.by_id.contains_key(&contact.id) {
            self.replace(contact)
        } else {
            self.insert(contact)
        }
    }

    /// Remove a row entirely. Only used to undo a failed apply.
    fn remove(&mut self, id: ContactId) {
        let Some(prev) = self.by_id.remove(&id) else {
            return;
        };
        index_remove(&mut self.by_email, prev.email.as_deref(), id);
        index_remove(&mut self.by_phone, prev.phone_number.as_deref(), id);
        if let Some(link) = prev.linked_id {
            if let Some(set) = self.by_link.get_mut(&link) {
                set.remove(&id);
                if set.is_empty() {
                    self.by_link.remove(&link);
                }
            }
        }
    }

    fn ids_matching(&self, email: Option<&str>, phone_number: Option<&str>) -> BTreeSet<ContactId> {
        let mut ids = BTreeSet::new();
        if let Some(set) = email.and_then(|e| self.by_email.get(e)) {
            ids.extend(set.iter().copied());
        }
        if let Some(set) = phone_number.and_then(|p| self.by_phone.get(p)) {
            ids.extend(set.iter().copied());
        }
        ids
    }

    fn ids_linked(&self, primary: ContactId) -> BTreeSet<ContactId> {
        self.by_link.get(&primary).cloned().unwrap_or_default()
    }
}

fn matches_identifier(contact: &Contact, email: Option<&str>, phone_number: Option<&str>) -> bool {
    email.is_some_and(|e| contact.has_email(e))
        || phone_number.is_some_and(|p| contact.has_phone_number(p))
}

/// Writes staged by one transaction.
#[derive(Debug)]
pub(crate) struct StagedWrites {
    inserted: BTreeMap<ContactId, Contact>,
    updated: BTreeMap<ContactId, Contact>,
    next_id: ContactId,
}

impl StagedWrites {
    pub(crate) fn new(base: &ContactTable) -> Self {
        Self {
            inserted: BTreeMap::new(),
            updated: BTreeMap::new(),
            next_id: base.next_id(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty()
    }

    /// Current view of a contact: staged state first, then the table.
    pub(crate) fn get(&self, base: &ContactTable, id: ContactId) -> Option<Contact> {
        self.inserted
            .get(&id)
            .or_else(|| self.updated.get(&id))
            .or_else(|| base.get(id))
            .cloned()
    }

    fn staged(&self) -> impl Iterator<Item = &Contact> {
        self.inserted.values().chain(self.updated.values())
    }

    fn collect_live(&self, base: &ContactTable, ids: BTreeSet<ContactId>) -> Vec<Contact> {
        ids.into_iter()
            .filter_map(|id| self.get(base, id))
            .filter(|c| !c.is_deleted())
            .collect()
    }

    pub(crate) fn find_by_email_or_phone(
        &self,
        base: &ContactTable,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Vec<Contact> {
        let mut ids = base.ids_matching(email, phone_number);
        ids.extend(
            self.staged()
                .filter(|c| matches_identifier(c, email, phone_number))
                .map(|c| c.id),
        );
        self.collect_live(base, ids)
    }

    pub(crate) fn find_linked(&self, base: &ContactTable, primary: ContactId) -> Vec<Contact> {
        let mut ids = base.ids_linked(primary);
        ids.extend(
            self.staged()
                .filter(|c| c.linked_id == Some(primary))
                .map(|c| c.id),
        );
        // A staged repoint moves a contact out of its old cluster.
        self.collect_live(base, ids)
            .into_iter()
            .filter(|c| c.linked_id == Some(primary))
            .collect()
    }

    pub(crate) fn insert(&mut self, draft: NewContact, now: DateTime<Utc>) -> Contact {
        let id = self.next_id;
        self.next_id = id.next();
        let contact = draft.into_contact(id, now);
        self.inserted.insert(id, contact.clone());
        contact
    }

    pub(crate) fn update(&mut self, base: &ContactTable, contact: Contact) -> Result<(), StorageError> {
        let prev = self
            .get(base, contact.id)
            .ok_or(StorageError::ContactNotFound(contact.id))?;
        check_immutable_fields(&prev, &contact)?;

        if let Some(staged) = self.inserted.get_mut(&contact.id) {
            *staged = contact;
        } else {
            self.updated.insert(contact.id, contact);
        }
        Ok(())
    }

    /// Staged rows as (inserts, updates), each ascending by id.
    pub(crate) fn parts(&self) -> (Vec<Contact>, Vec<Contact>) {
        (
            self.inserted.values().cloned().collect(),
            self.updated.values().cloned().collect(),
        )
    }

    /// Apply staged writes to the table. On error the table is left as it was.
    pub(crate) fn apply(self, base: &mut ContactTable) -> Result<(), StorageError> {
        let (inserts, updates) = (self.inserted, self.updated);
        apply_rows(
            base,
            inserts.into_values().collect(),
            updates.into_values().collect(),
        )
    }
}

/// Apply committed rows to a table, all or nothing.
pub(crate) fn apply_rows(
    base: &mut ContactTable,
    inserts: Vec<Contact>,
    updates: Vec<Contact>,
) -> Result<(), StorageError> {
    let mut applied_inserts: Vec<ContactId> = Vec::with_capacity(inserts.len());
    let mut previous: Vec<Contact> = Vec::with_capacity(updates.len());

    let result = (|| -> Result<(), StorageError> {
        for contact in inserts {
            let id = contact.id;
            base.insert(contact)?;
            applied_inserts.push(id);
        }
        for contact in updates {
            let prev = base
                .get(contact.id)
                .cloned()
                .ok_or(StorageError::ContactNotFound(contact.id))?;
            base.replace(contact)?;
            previous.push(prev);
        }
        Ok(())
    })();

    if result.is_err() {
        for prev in previous.into_iter().rev() {
            let id = prev.id;
            if let Err(e) = base.replace(prev) {
                debug_assert!(false, "restoring contact {id} failed: {e}");
                tracing::error!(contact_id = %id, error = %e, "failed to restore contact during rollback");
            }
        }
        for id in applied_inserts {
            base.remove(id);
        }
        base.last_id = base.by_id.keys().next_back().map_or(0, |id| id.get());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn seeded() -> ContactTable {
        let p = NewContact::primary(Some("a@x.com".into()), Some("111".into()))
            .into_contact(ContactId::new(1), now());
        let s = NewContact::secondary_phone_number(ContactId::new(1), "222")
            .into_contact(ContactId::new(2), now());
        ContactTable::from_contacts([p, s]).unwrap()
    }

    #[test]
    fn table_indexes_email_phone_and_links() {
        let table = seeded();
        assert_eq!(table.len(), 2);
        assert_eq!(table.next_id(), ContactId::new(3));
        assert_eq!(table.ids_matching(Some("a@x.com"), None).len(), 1);
        assert_eq!(table.ids_matching(Some("a@x.com"), Some("222")).len(), 2);
        assert_eq!(table.ids_matching(None, Some("999")).len(), 0);
        assert_eq!(table.ids_linked(ContactId::new(1)).len(), 1);
    }

    #[test]
    fn table_rejects_duplicate_ids() {
        let mut table = seeded();
        let dup = NewContact::primary(None, Some("333".into())).into_contact(ContactId::new(2), now());
        assert!(matches!(table.insert(dup), Err(StorageError::DuplicateKey(_))));
    }

    #[test]
    fn replace_rejects_changes_to_immutable_fields() {
        let mut table = seeded();
        let mut c = table.get(ContactId::new(1)).cloned().unwrap();
        c.email = Some("other@x.com".into());
        assert!(matches!(table.replace(c), Err(StorageError::Integrity(_))));
    }

    #[test]
    fn upsert_inserts_or_overwrites() {
        let mut table = seeded();
        let mut moved = table.get(ContactId::new(2)).cloned().unwrap();
        moved.soft_delete(now());
        table.upsert(moved).unwrap();
        assert!(table.get(ContactId::new(2)).unwrap().is_deleted());

        let fresh = NewContact::primary(None, Some("333".into())).into_contact(ContactId::new(7), now());
        table.upsert(fresh).unwrap();
        assert_eq!(table.next_id(), ContactId::new(8));
    }

    #[test]
    fn staged_writes_are_visible_through_overlay_only() {
        let table = seeded();
        let mut staged = StagedWrites::new(&table);

        let c = staged.insert(
            NewContact::secondary_email(ContactId::new(1), "b@x.com"),
            now(),
        );
        assert_eq!(c.id, ContactId::new(3));

        let found = staged.find_by_email_or_phone(&table, Some("b@x.com"), None);
        assert_eq!(found.len(), 1);
        assert!(table.ids_matching(Some("b@x.com"), None).is_empty());
        assert_eq!(staged.find_linked(&table, ContactId::new(1)).len(), 2);
    }

    #[test]
    fn staged_repoint_moves_contact_between_clusters() {
        let mut table = seeded();
        let other = NewContact::primary(Some("z@x.com".into()), None).into_contact(ContactId::new(5), now());
        table.insert(other).unwrap();

        let mut staged = StagedWrites::new(&table);
        let mut moved = table.get(ContactId::new(2)).cloned().unwrap();
        moved.link_to(ContactId::new(5), now());
        staged.update(&table, moved).unwrap();

        assert!(staged.find_linked(&table, ContactId::new(1)).is_empty());
        assert_eq!(staged.find_linked(&table, ContactId::new(5)).len(), 1);

        staged.apply(&mut table).unwrap();
        assert!(table.ids_linked(ContactId::new(1)).is_empty());
        assert_eq!(table.ids_linked(ContactId::new(5)).len(), 1);
    }

    #[test]
    fn soft_deleted_rows_are_not_matched() {
        let table = seeded();
        let mut staged = StagedWrites::new(&table);
        let mut c = table.get(ContactId::new(2)).cloned().unwrap();
        c.soft_delete(now());
        staged.update(&table, c).unwrap();

        assert!(staged.find_by_email_or_phone(&table, None, Some("222")).is_empty());
        assert!(staged.get(&table, ContactId::new(2)).unwrap().is_deleted());
    }

    #[test]
    fn failed_apply_leaves_table_untouched() {
        let mut table = seeded();
        let before: Vec<Contact> = table.contacts().cloned().collect();

        let fresh = NewContact::primary(Some("n@x.com".into()), None).into_contact(ContactId::new(3), now());
        let missing = NewContact::primary(None, Some("404".into())).into_contact(ContactId::new(99), now());
        let err = apply_rows(&mut table, vec![fresh], vec![missing]).unwrap_err();
        assert!(matches!(err, StorageError::ContactNotFound(_)));

        let after: Vec<Contact> = table.contacts().cloned().collect();
        assert_eq!(before, after);
        assert_eq!(table.next_id(), ContactId::new(3));
        assert!(table.ids_matching(Some("n@x.com"), None).is_empty());
    }

    #[test]
    fn failed_apply_restores_replaced_rows() {
        let mut table = seeded();
        let before: Vec<Contact> = table.contacts().cloned().collect();

        let target = NewContact::primary(Some("t@x.com".into()), None).into_contact(ContactId::new(3), now());
        let mut moved = table.get(ContactId::new(2)).cloned().unwrap();
        moved.link_to(ContactId::new(3), now());
        let missing = NewContact::primary(None, Some("404".into())).into_contact(ContactId::new(99), now());

        let err = apply_rows(&mut table, vec![target], vec![moved, missing]).unwrap_err();
        assert!(matches!(err, StorageError::ContactNotFound(_)));

        let after: Vec<Contact> = table.contacts().cloned().collect();
        assert_eq!(before, after);
        assert_eq!(table.ids_linked(ContactId::new(1)).len(), 1);
        assert!(table.ids_linked(ContactId::new(3)).is_empty());
    }
}
