// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    collections::HashMap,
    hash::Hash,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Arbitrary size chosen to pre-allocate the hashmap, so that small programs never rehash.
const DEFAULT_SIZE: usize = 64;

/// First external id handed out.
const FIRST_ID: u64 = 1;

//======================================================================================================================
// Structures
//======================================================================================================================

/// This data structure maps stable external ids onto internal ids that may be recycled, such as slab offsets. External
/// ids are allocated from a monotonic counter and are never handed out twice by the same map, so a stale external id
/// can never alias a newer entry that happens to reuse the same internal slot.
pub struct IdMap<E: Eq + Hash + From<u64> + Into<u64> + Copy, I: Copy> {
    /// Map between external and internal ids.
    ids: HashMap<E, I>,
    /// Next external id to hand out.
    next_id: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<E: Eq + Hash + From<u64> + Into<u64> + Copy, I: Copy> IdMap<E, I> {
    /// Retrieve the internal id mapped to this external id, if any.
    pub fn get(&self, external_id: &E) -> Option<I> {
        self.ids.get(external_id).copied()
    }

    /// Remove a mapping. If the mapping exists, then return the internal id mapped to the external id.
    pub fn remove(&mut self, external_id: &E) -> Option<I> {
        self.ids.remove(external_id)
    }

    /// Generate a new external id and map it to `internal_id`.
    pub fn insert_with_new_id(&mut self, internal_id: I) -> E {
        let external_id: E = E::from(self.next_id);
        self.next_id += 1;
        if self.ids.insert(external_id, internal_id).is_some() {
            panic!("should not have a previous mapping with this id");
        }
        external_id
    }

    /// Ensures that `additional` more mappings fit without rehashing.
    pub fn reserve(&mut self, additional: usize) {
        self.ids.reserve(additional);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// A default implementation for the external to internal id map.
impl<E: Eq + Hash + From<u64> + Into<u64> + Copy, I: Copy> Default for IdMap<E, I> {
    fn default() -> Self {
        Self {
            ids: HashMap::<E, I>::with_capacity(DEFAULT_SIZE),
            next_id: FIRST_ID,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
