//! Shared writable cells used as decoding targets and result holders.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A cloneable handle to a lock-protected value.
///
/// Every clone points at the same value. Requests decode their bodies into a
/// `Slot`, and [`ApiRequest`](crate::ApiRequest) hooks read and update the
/// slot they are bound to.
///
/// # Examples
///
/// ```
/// use callweave::Slot;
///
/// let slot = Slot::new(1);
/// let handle = slot.clone();
/// handle.update(|n| *n += 1);
/// assert_eq!(slot.get(), 2);
/// ```
pub struct Slot<T>(Arc<Mutex<T>>);

impl<T> Slot<T> {
    /// Creates a slot holding `value`.
    pub fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    /// Replaces the held value.
    pub fn set(&self, value: T) {
        *self.0.lock() = value;
    }

    /// Runs `f` with exclusive access to the held value.
    pub fn update<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        f(&mut self.0.lock())
    }

    /// Returns `true` if both handles point at the same value.
    pub fn ptr_eq(&self, other: &Slot<T>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: Clone> Slot<T> {
    /// Returns a clone of the held value.
    pub fn get(&self) -> T {
        self.0.lock().clone()
    }
}

impl<T: Default> Slot<T> {
    /// Takes the held value, leaving the default in its place.
    pub fn take(&self) -> T {
        std::mem::take(&mut *self.0.lock())
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Default> Default for Slot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&*self.0.lock()).finish()
    }
}
