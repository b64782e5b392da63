//! # Intrusive reference counting
//!
//! Every managed value lives in a heap block whose first field is a [`Base`]
//! header. The header carries the atomic strong count, the lazily created
//! weak-reference broker and a type-erased deletion entry point, so the
//! reference counting machinery works without knowing the concrete type.

use std::{
    fmt, mem,
    ptr::{self, NonNull},
    sync::atomic::{fence, AtomicI32, AtomicPtr, Ordering},
};

use crate::{pointers::P, weak_state::WeakState};

/// Subtracted from the reference count while an object is being deleted.
///
/// Stray `add_ref`/`release_ref` pairs made from within a destructor move the
/// count around `-DELETE_THIS_REF_COUNT_DELTA` and can never reach the
/// "just hit zero" transition a second time.
pub const DELETE_THIS_REF_COUNT_DELTA: i32 = 0x4000_0000;

/// Types that can be managed by [`P`].
///
/// The only hook is [`delete_this`](Object::delete_this), which runs once the
/// strong count has reached zero and all weak references have been
/// invalidated. The default implementation simply drops the value.
pub trait Object: Sized + 'static
{
    /// Called when the last strong reference is gone.
    ///
    /// Dropping `dying` frees the object. An implementation may instead call
    /// [`Dying::revive`] to cancel the deletion, e.g. to put the object into a
    /// recycle pool. Weak references that existed before stay invalid either
    /// way.
    fn delete_this(dying: Dying<Self>) { drop(dying) }
}

/// Reference counting header placed in front of every managed value.
pub struct Base
{
    ref_count: AtomicI32,
    weak_state: AtomicPtr<Managed<WeakState>>,
    delete: unsafe fn(NonNull<Base>),
}

impl Base
{
    fn new(delete: unsafe fn(NonNull<Base>)) -> Self
    {
        Base {
            ref_count: AtomicI32::new(1),
            weak_state: AtomicPtr::new(ptr::null_mut()),
            delete,
        }
    }

    /// Increases the strong count by one.
    ///
    /// Normally only called by [`P`]. Calling it without a matching
    /// [`release_ref`](Base::release_ref) leaks the object.
    pub fn add_ref(&self) { self.ref_count.fetch_add(1, Ordering::Relaxed); }

    /// Decreases the strong count by one and runs the deletion path on the
    /// calling thread if this was the last reference.
    ///
    /// # Safety
    ///
    /// `this` must point to the header of a live managed block and the caller
    /// must own one unit of its strong count, which is consumed.
    pub unsafe fn release_ref(this: NonNull<Base>)
    {
        if unsafe { this.as_ref() }.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        unsafe { Self::ref_count_reached_zero(this) }
    }

    /// Current strong count. Other threads may change it at any moment.
    pub fn ref_count(&self) -> i32 { self.ref_count.load(Ordering::Acquire) }

    /// True while the object is being deleted because its count reached zero.
    pub fn is_being_deleted(&self) -> bool { self.ref_count() < 0 }

    /// Increments the count only if the object is still alive.
    pub(crate) fn try_add_ref(&self) -> bool
    {
        let mut current = self.ref_count.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the weak-reference broker, creating it on first use.
    ///
    /// Returns `None` when the object is already being deleted.
    ///
    /// The broker keeps `this` as its back pointer and promotion turns it into
    /// a strong handle, so it has to point at the whole block, not just the
    /// header.
    pub(crate) fn weak_state(this: NonNull<Base>) -> Option<P<WeakState>>
    {
        let base = unsafe { this.as_ref() };
        if base.ref_count() <= 0 {
            return None;
        }

        if let Some(existing) = NonNull::new(base.weak_state.load(Ordering::Acquire)) {
            // the slot keeps its own reference for as long as we are alive
            return Some(unsafe { P::retain_raw(existing) });
        }

        let fresh = P::new(WeakState::new(this));
        match base.weak_state.compare_exchange(
            ptr::null_mut(),
            P::as_raw(&fresh).as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::trace!(target: "objcore", object = ?this, "weak state created");
                let handle = fresh.clone();
                // ownership of `fresh`'s reference moves into the slot
                let _ = P::into_raw(fresh);
                Some(handle)
            }
            Err(winner) => {
                drop(fresh);
                Some(unsafe { P::retain_raw(NonNull::new_unchecked(winner)) })
            }
        }
    }

    unsafe fn ref_count_reached_zero(this: NonNull<Base>)
    {
        let base = unsafe { this.as_ref() };

        if let Some(state) = NonNull::new(base.weak_state.load(Ordering::Acquire)) {
            let broker = unsafe { &state.as_ref().value };

            // Weak handles can only be promoted while the broker lock is free,
            // so the recheck below is final.
            if !broker.invalidate(base) {
                tracing::trace!(target: "objcore", object = ?this, "deletion aborted, object was revived");
                return;
            }

            base.weak_state.store(ptr::null_mut(), Ordering::Release);
            // outstanding weak handles keep the broker alive on their own
            unsafe { Base::release_ref(state.cast::<Base>()) };
        }

        base.ref_count.fetch_sub(DELETE_THIS_REF_COUNT_DELTA, Ordering::AcqRel);
        let delete = base.delete;
        unsafe { delete(this) }
    }
}

impl Drop for Base
{
    fn drop(&mut self)
    {
        debug_assert!(
            self.weak_state.get_mut().is_null(),
            "managed object dropped while its weak state is still attached"
        );
    }
}

impl fmt::Debug for Base
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Base")
            .field("ref_count", &self.ref_count())
            .field("weak_state", &self.weak_state.load(Ordering::Relaxed))
            .finish()
    }
}

/// Heap block holding a managed value.
///
/// `#[repr(C)]` keeps the header at offset zero, so a pointer to the header
/// is also a pointer to the block.
#[repr(C)]
pub(crate) struct Managed<T: 'static>
{
    pub(crate) base: Base,
    pub(crate) value: T,
}

impl<T: Object> Managed<T>
{
    pub(crate) fn allocate(value: T) -> NonNull<Managed<T>>
    {
        let block = Box::new(Managed {
            base: Base::new(Self::delete_entry),
            value,
        });
        NonNull::from(Box::leak(block))
    }

    unsafe fn delete_entry(base: NonNull<Base>)
    {
        T::delete_this(Dying {
            ptr: base.cast::<Managed<T>>(),
        })
    }
}

/// An object whose strong count has reached zero.
///
/// Only ever handed to [`Object::delete_this`]. Dropping it frees the object,
/// [`revive`](Dying::revive) turns it back into a strong handle.
pub struct Dying<T: Object>
{
    ptr: NonNull<Managed<T>>,
}

impl<T: Object> Dying<T>
{
    /// Cancels the deletion and returns a fresh strong reference.
    ///
    /// The caller has to keep the returned handle somewhere, otherwise the
    /// object goes through deletion again as soon as it is dropped.
    pub fn revive(self) -> P<T>
    {
        let ptr = self.ptr;
        mem::forget(self);
        let base = unsafe { &ptr.as_ref().base };
        base.ref_count
            .fetch_add(DELETE_THIS_REF_COUNT_DELTA + 1, Ordering::AcqRel);
        tracing::trace!(target: "objcore", object = ?ptr, "object revived during deletion");
        unsafe { P::from_raw(ptr) }
    }

    /// Hands out an extra strong reference while deletion is in progress.
    ///
    /// The count stays negative, so dropping the handle again does not restart
    /// deletion.
    ///
    /// # Safety
    ///
    /// The handle and every clone of it must be gone before `delete_this`
    /// returns, unless the object is revived.
    pub unsafe fn stray_handle(&self) -> P<T> { unsafe { P::retain_raw(self.ptr) } }

    pub fn base(&self) -> &Base { unsafe { &self.ptr.as_ref().base } }
}

impl<T: Object> std::ops::Deref for Dying<T>
{
    type Target = T;

    fn deref(&self) -> &T { unsafe { &self.ptr.as_ref().value } }
}

impl<T: Object> Drop for Dying<T>
{
    fn drop(&mut self) { drop(unsafe { Box::from_raw(self.ptr.as_ptr()) }) }
}

impl<T: Object + fmt::Debug> fmt::Debug for Dying<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_tuple("Dying").field(&**self).finish()
    }
}
