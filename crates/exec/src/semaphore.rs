use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashSet;

/// In-process set of image keys with an operation in flight.
///
/// Acquisition never blocks: a held key means someone else is already on it.
#[derive(Debug, Clone, Default)]
pub struct SemaphoreSet {
    held: Arc<Mutex<FxHashSet<String>>>,
}

impl SemaphoreSet {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, FxHashSet<String>> { self.held.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Returns a permit that releases the key when dropped, or `None` if held.
    pub fn try_acquire(&self, key: &str) -> Option<ImagePermit> {
        if self.lock().insert(key.to_string()) {
            Some(ImagePermit { set: self.clone(), key: key.to_string(), released: false })
        } else {
            None
        }
    }

    pub fn is_held(&self, key: &str) -> bool { self.lock().contains(key) }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Proof of holding one key of a [`SemaphoreSet`].
#[derive(Debug)]
pub struct ImagePermit {
    set: SemaphoreSet,
    key: String,
    released: bool,
}

impl ImagePermit {
    pub fn key(&self) -> &str { &self.key }

    pub fn release(mut self) { self.release_inner(); }

    fn release_inner(&mut self) {
        if !self.released {
            self.set.lock().remove(&self.key);
            self.released = true;
        }
    }
}

impl Drop for ImagePermit {
    fn drop(&mut self) { self.release_inner(); }
}
