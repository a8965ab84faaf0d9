// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of OpenEthereum.

// OpenEthereum is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// OpenEthereum is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with OpenEthereum.  If not, see <http://www.gnu.org/licenses/>.

//! Update records and the singly-linked list callers assemble them into.

use parity_bytes::Bytes;

use crate::nibbles::Nibbles;

/// One requested change. `value: None` with no nested updates deletes the
/// key; `incarnation` discards any existing subtree at the key before the
/// nested updates are applied (contract redeployment semantics). Nested
/// update keys are relative to this record's key.
pub struct Update {
    pub key: Nibbles,
    pub value: Option<Bytes>,
    pub incarnation: bool,
    pub nested: UpdateList,
    /// Version recorded as the write version of the touched leaves.
    pub version: u64,
}

impl Update {
    /// Insert or overwrite `key` with `value`.
    pub fn insert(key: Nibbles, value: Bytes, version: u64) -> Update {
        Update {
            key,
            value: Some(value),
            incarnation: false,
            nested: UpdateList::new(),
            version,
        }
    }

    /// Remove `key` and anything beneath it.
    pub fn delete(key: Nibbles, version: u64) -> Update {
        Update {
            key,
            value: None,
            incarnation: false,
            nested: UpdateList::new(),
            version,
        }
    }
}

struct UpdateEntry {
    update: Update,
    next: Option<Box<UpdateEntry>>,
}

/// A singly-linked list of updates, assembled front-to-back without
/// random access.
#[derive(Default)]
pub struct UpdateList {
    head: Option<Box<UpdateEntry>>,
    len: usize,
}

impl UpdateList {
    pub fn new() -> UpdateList {
        UpdateList { head: None, len: 0 }
    }

    pub fn push_front(&mut self, update: Update) {
        self.head = Some(Box::new(UpdateEntry {
            update,
            next: self.head.take(),
        }));
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Drain into a vector, preserving list order.
    pub fn into_vec(mut self) -> Vec<Update> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head.take();
        while let Some(mut entry) = cursor {
            cursor = entry.next.take();
            out.push(entry.update);
        }
        out
    }
}

impl FromIterator<Update> for UpdateList {
    fn from_iter<I: IntoIterator<Item = Update>>(iter: I) -> UpdateList {
        let mut updates: Vec<Update> = iter.into_iter().collect();
        let mut list = UpdateList::new();
        while let Some(update) = updates.pop() {
            list.push_front(update);
        }
        list
    }
}

impl Drop for UpdateList {
    fn drop(&mut self) {
        // drop iteratively; a long chain of boxes must not recurse
        let mut cursor = self.head.take();
        while let Some(mut entry) = cursor {
            cursor = entry.next.take();
        }
    }
}
