//! The weak-reference broker.
//!
//! A broker is created lazily for each object that ever gets a weak
//! reference. It is itself a managed object: the tracked object holds one
//! reference to it and every [`WeakP`](crate::WeakP) holds another, so the
//! broker outlives the object it tracks whenever weak handles are still
//! around.

use std::{fmt, ptr::NonNull};

use parking_lot::Mutex;

use crate::base::{Base, Object};

pub struct WeakState
{
    target: Mutex<Option<NonNull<Base>>>,
}

// The target pointer is only dereferenced under the mutex, and only while the
// tracked object has not committed to deletion.
unsafe impl Send for WeakState {}
unsafe impl Sync for WeakState {}

impl Object for WeakState {}

impl WeakState
{
    pub(crate) fn new(target: NonNull<Base>) -> Self
    {
        WeakState {
            target: Mutex::new(Some(target)),
        }
    }

    /// Takes a new strong reference to the target, if it still exists.
    ///
    /// The returned header pointer owns one unit of the target's strong count.
    /// A target whose count already dropped to zero is treated as gone even
    /// if its deletion has not been committed yet.
    pub(crate) fn try_promote(&self) -> Option<NonNull<Base>>
    {
        let target = self.target.lock();
        let base = (*target)?;
        if unsafe { base.as_ref() }.try_add_ref() {
            Some(base)
        } else {
            None
        }
    }

    /// True as long as the tracked object has not been invalidated.
    pub fn is_target_alive(&self) -> bool { self.target.lock().is_some() }

    /// Commits the tracked object to deletion.
    ///
    /// Returns `false` without touching anything if the object got a new
    /// strong reference in the meantime.
    pub(crate) fn invalidate(&self, base: &Base) -> bool
    {
        let mut target = self.target.lock();
        if base.ref_count() > 0 {
            return false;
        }
        *target = None;
        true
    }
}

impl fmt::Debug for WeakState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("WeakState")
            .field("target", &*self.target.lock())
            .finish()
    }
}
