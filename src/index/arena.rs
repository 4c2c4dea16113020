// src/index/arena.rs

//! Named slots with stable keys
//!
//! Each slot is its own `Arc<Mutex<T>>`, so a caller can clone the slot
//! while holding the arena's lock, lock the slot, and then release the
//! arena. Keys are never reused while a name maps to them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) type Slot<T> = Arc<Mutex<T>>;

/// Lock a mutex, recovering the data from a poisoned lock
///
/// Cache state is always left consistent between statements, so a panic
/// elsewhere does not invalidate it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub(crate) struct Arena<T> {
    keys: BTreeMap<String, usize>,
    slots: Vec<Option<Slot<T>>>,
    free: Vec<usize>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            keys: BTreeMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T: Default> Arena<T> {
    pub fn get(&self, name: &str) -> Option<Slot<T>> {
        let key = *self.keys.get(name)?;
        self.slots.get(key).and_then(Clone::clone)
    }

    pub fn get_or_insert(&mut self, name: &str) -> Slot<T> {
        if let Some(slot) = self.get(name) {
            return slot;
        }

        let slot = Arc::new(Mutex::new(T::default()));
        let key = match self.free.pop() {
            Some(key) => {
                self.slots[key] = Some(Arc::clone(&slot));
                key
            }
            None => {
                self.slots.push(Some(Arc::clone(&slot)));
                self.slots.len() - 1
            }
        };
        self.keys.insert(name.to_string(), key);
        slot
    }

    pub fn remove(&mut self, name: &str) {
        if let Some(key) = self.keys.remove(name) {
            self.slots[key] = None;
            self.free.push(key);
        }
    }

    /// Names in ascending order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}
