//! Copy-on-write list.
//!
//! Readers take a snapshot (`Arc<Vec<T>>`) and iterate without holding any
//! lock. Writers build a new vector and publish it; concurrent writers are
//! expected to be serialized by their owner's own mutex.

use std::sync::Arc;

use parking_lot::RwLock;

pub struct CowList<T> {
    current: RwLock<Arc<Vec<T>>>,
}

impl<T: Clone> CowList<T> {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.current.read().clone()
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, item: T) {
        self.update(|items| items.push(item));
    }

    /// Remove the first item matching `pred`. Returns whether one was found.
    pub fn remove_first(&self, pred: impl Fn(&T) -> bool) -> bool {
        let mut found = false;
        self.update(|items| {
            if let Some(pos) = items.iter().position(&pred) {
                items.remove(pos);
                found = true;
            }
        });
        found
    }

    pub fn contains(&self, pred: impl Fn(&T) -> bool) -> bool {
        self.current.read().iter().any(pred)
    }

    /// Replace the published list with an edited copy.
    pub fn update(&self, edit: impl FnOnce(&mut Vec<T>)) {
        let mut guard = self.current.write();
        let mut next = Vec::clone(&guard);
        edit(&mut next);
        *guard = Arc::new(next);
    }
}

impl<T: Clone> Default for CowList<T> {
    fn default() -> Self {
        Self::new()
    }
}
