//! Bounded list of contacts kept sorted by XOR distance to an owner id.
//!
//! This is the working set of an iterative lookup: each entry tracks whether a
//! lookup RPC was attempted (`contacted`) and whether it succeeded (`active`).
//! Operations on ids that are not present are silent no-ops, since a contact may
//! be evicted between being selected for a probe and being marked.

use std::cmp::Ordering;

use crate::identity::{distance_cmp, Contact, NodeId};

/// Default bound on the number of entries.
pub const DEFAULT_MAX_CONTACTS: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactEntry {
    pub contact: Contact,
    pub distance: [u8; 32],
    pub contacted: bool,
    pub active: bool,
}

#[derive(Clone, Debug)]
pub struct SortedContactList {
    owner: NodeId,
    max_size: usize,
    entries: Vec<ContactEntry>,
}

impl SortedContactList {
    pub fn new(owner: NodeId, max_size: usize) -> Self {
        Self {
            owner,
            max_size: max_size.max(1),
            entries: Vec::with_capacity(max_size + 1),
        }
    }

    pub fn owner(&self) -> &NodeId {
        &self.owner
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.position(id).is_some()
    }

    /// Insert a contact at its sorted position.
    ///
    /// Returns `true` if the contact is present after the call because it was
    /// inserted. Contacts already present (by id), the owner itself, and contacts
    /// farther than every entry of a full list are left out.
    pub fn add_contact(&mut self, contact: Contact) -> bool {
        if contact.id == self.owner || self.contains(&contact.id) {
            return false;
        }
        let distance = contact.distance_to(&self.owner);
        // Entries at an equal distance keep their place ahead of the newcomer.
        let index = self
            .entries
            .partition_point(|e| distance_cmp(&e.distance, &distance) != Ordering::Greater);
        if index >= self.max_size {
            return false;
        }
        self.entries.insert(
            index,
            ContactEntry {
                contact,
                distance,
                contacted: false,
                active: false,
            },
        );
        self.entries.truncate(self.max_size);
        true
    }

    /// Apply [`add_contact`](Self::add_contact) to each contact in order.
    pub fn add_contacts<I>(&mut self, contacts: I)
    where
        I: IntoIterator<Item = Contact>,
    {
        for contact in contacts {
            self.add_contact(contact);
        }
    }

    /// Replace the address of an entry that is already present.
    pub fn update_contact(&mut self, contact: Contact) {
        if let Some(idx) = self.position(&contact.id) {
            self.entries[idx].contact = contact;
        }
    }

    /// Drop an entry. Absent ids are ignored.
    pub fn remove_contact(&mut self, id: &NodeId) -> bool {
        match self.position(id) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Up to `limit` entries not yet contacted, closest first.
    pub fn get_uncontacted_contacts(&self, limit: usize) -> Vec<Contact> {
        self.entries
            .iter()
            .filter(|e| !e.contacted)
            .take(limit)
            .map(|e| e.contact.clone())
            .collect()
    }

    pub fn set_contacted(&mut self, id: &NodeId) {
        if let Some(idx) = self.position(id) {
            self.entries[idx].contacted = true;
        }
    }

    pub fn set_active(&mut self, id: &NodeId) {
        if let Some(idx) = self.position(id) {
            self.entries[idx].active = true;
        }
    }

    /// Id of the closest entry, or `None` when the list is empty.
    pub fn get_closest_contact_id(&self) -> Option<NodeId> {
        self.entries.first().map(|e| e.contact.id)
    }

    pub fn get_active_contacts(&self) -> Vec<Contact> {
        self.entries
            .iter()
            .filter(|e| e.active)
            .map(|e| e.contact.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.active).count()
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.entries.iter().map(|e| e.contact.clone()).collect()
    }

    pub fn entries(&self) -> &[ContactEntry] {
        &self.entries
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| &e.contact.id == id)
    }
}
