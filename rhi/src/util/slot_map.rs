use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::RhiError;

/// Represents a slot map structure
///
/// A slot map hands out keys which map to internal indices which themselves map to the
/// underlying data. Data is stored densely, erasing swaps the last element into the hole.
///
/// Every key carries the generation of the index it was created with. Erasing bumps the
/// generation, so keys to erased data are rejected instead of aliasing whatever reuses the index.
///
/// # Performance
/// get/erase/insert are O(1) operations, except when inserting must grow the storage.
#[derive(Debug)]
pub struct SlotMap<T> {
    /// Internal slots that act as a "pointer" between data and external keys
    indices: Vec<Slot<T>>,

    /// Holds the underlying data
    data: Vec<T>,

    /// Maps a data index back to the index in `indices` that points at it
    erase: Vec<usize>,

    /// Free indices, reused in FIFO order
    free_queue: std::collections::VecDeque<usize>,
}

impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotMap<T> {
    pub fn new() -> Self {
        Self {
            indices: Vec::new(),
            data: Vec::new(),
            erase: Vec::new(),
            free_queue: Default::default(),
        }
    }

    /// Create a new slot map with a certain capacity
    pub fn new_with_capacity(capacity: usize) -> Self {
        Self {
            indices: Vec::with_capacity(capacity),
            data: Vec::with_capacity(capacity),
            erase: Vec::with_capacity(capacity),
            free_queue: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns [`Ok`] if the slot is valid
    pub fn validate_slot(&self, slot: &Slot<T>) -> Result<(), RhiError> {
        match self.indices.get(slot.index) {
            Some(index) if index.generation == slot.generation => Ok(()),
            _ => Err(RhiError::InvalidHandle),
        }
    }

    /// Insert new data into the slot map
    pub fn insert(&mut self, data: T) -> Slot<T> {
        let slot_index = match self.free_queue.pop_front() {
            Some(index) => index,
            None => {
                self.indices.push(Slot::new(0, 0));
                self.indices.len() - 1
            }
        };
        self.data.push(data);
        self.erase.push(slot_index);

        let indirection = &mut self.indices[slot_index];
        indirection.index = self.data.len() - 1;
        Slot::new(slot_index, indirection.generation)
    }

    /// Erase data from the slot map, returning it.
    pub fn erase(&mut self, slot: Slot<T>) -> Result<T, RhiError> {
        self.validate_slot(&slot)?;
        let indirection = &mut self.indices[slot.index];
        indirection.generation += 1;
        let data_index = indirection.index;

        let removed = self.data.swap_remove(data_index);
        self.erase.swap_remove(data_index);
        if let Some(&moved_slot) = self.erase.get(data_index) {
            // the previous last element now lives in the hole
            self.indices[moved_slot].index = data_index;
        }
        self.free_queue.push_back(slot.index);
        Ok(removed)
    }

    /// Retrieve the data that maps to the slot directly
    pub fn get(&self, slot: &Slot<T>) -> Result<&T, RhiError> {
        self.validate_slot(slot)?;
        Ok(&self.data[self.indices[slot.index].index])
    }

    pub fn get_mut(&mut self, slot: &Slot<T>) -> Result<&mut T, RhiError> {
        self.validate_slot(slot)?;
        let data_index = self.indices[slot.index].index;
        Ok(&mut self.data[data_index])
    }

    /// Iterate over all the stored data in storage order
    pub fn iter_data(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    /// Consume the map, keeping only the data
    pub fn into_data(self) -> Vec<T> {
        self.data
    }
}

/// Generation checked key into a [`SlotMap`]
pub struct Slot<T> {
    index: usize,
    generation: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Slot<T> {
    fn new(index: usize, generation: u64) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T> Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Slot<T> {}

impl<T> Hash for Slot<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slot<T> {}
