use std::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    ops::Deref,
    ptr::NonNull,
};

use crate::{
    base::{Base, Managed, Object},
    weak_state::WeakState,
};

/// Strong handle to a managed object.
///
/// All clones of a `P` share one object; it lives as long as the longest
/// living clone. Cloning increments the object's strong count, dropping
/// decrements it, moving leaves it untouched.
///
/// The object is created with [`P::new`], which is the only way to put a
/// value under reference counting.
#[repr(transparent)]
pub struct P<T: Object>
{
    ptr: NonNull<Managed<T>>,
    _marker: PhantomData<Managed<T>>,
}

unsafe impl<T: Object + Send + Sync> Send for P<T> {}
unsafe impl<T: Object + Send + Sync> Sync for P<T> {}

impl<T: Object> P<T>
{
    /// Moves `value` onto the managed heap. The new object has a strong
    /// count of one, owned by the returned handle.
    pub fn new(value: T) -> Self
    {
        P {
            ptr: Managed::allocate(value),
            _marker: PhantomData,
        }
    }

    pub fn base(this: &Self) -> &Base { &this.block().base }

    pub fn ref_count(this: &Self) -> i32 { Self::base(this).ref_count() }

    /// True if both handles refer to the same object.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool { this.ptr == other.ptr }

    /// Returns the object's weak-reference broker, creating it on first use.
    pub fn weak_state(this: &Self) -> Option<P<WeakState>> { Base::weak_state(this.ptr.cast()) }

    /// Produces a weak handle to the same object.
    pub fn downgrade(this: &Self) -> WeakP<T> { WeakP::new(this) }

    pub(crate) fn as_raw(this: &Self) -> NonNull<Managed<T>> { this.ptr }

    pub(crate) fn into_raw(this: Self) -> NonNull<Managed<T>>
    {
        let ptr = this.ptr;
        std::mem::forget(this);
        ptr
    }

    /// Adopts a strong reference that has already been counted.
    pub(crate) unsafe fn from_raw(ptr: NonNull<Managed<T>>) -> Self
    {
        P {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Counts a new strong reference and wraps it.
    pub(crate) unsafe fn retain_raw(ptr: NonNull<Managed<T>>) -> Self
    {
        unsafe { ptr.as_ref() }.base.add_ref();
        unsafe { Self::from_raw(ptr) }
    }

    fn block(&self) -> &Managed<T> { unsafe { self.ptr.as_ref() } }
}

impl<T: Object> Clone for P<T>
{
    fn clone(&self) -> Self { unsafe { Self::retain_raw(self.ptr) } }
}

impl<T: Object> Drop for P<T>
{
    fn drop(&mut self) { unsafe { Base::release_ref(self.ptr.cast::<Base>()) } }
}

impl<T: Object> Deref for P<T>
{
    type Target = T;

    fn deref(&self) -> &T { &self.block().value }
}

impl<T: Object> AsRef<T> for P<T>
{
    fn as_ref(&self) -> &T { self }
}

impl<T: Object> PartialEq for P<T>
{
    fn eq(&self, other: &Self) -> bool { P::ptr_eq(self, other) }
}

impl<T: Object> Eq for P<T> {}

impl<T: Object> Hash for P<T>
{
    fn hash<H: Hasher>(&self, state: &mut H) { self.ptr.hash(state) }
}

impl<T: Object + fmt::Debug> fmt::Debug for P<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(&**self, f) }
}

impl<T: Object> fmt::Pointer for P<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Pointer::fmt(&self.ptr, f) }
}

/// Weak handle to a managed object.
///
/// A `WeakP` points at the object's broker, never at the object itself, and
/// does not keep the object alive. It cannot be dereferenced; use
/// [`to_strong`](WeakP::to_strong) to get a temporary strong handle.
pub struct WeakP<T: Object>
{
    state: Option<P<WeakState>>,
    _marker: PhantomData<P<T>>,
}

impl<T: Object> WeakP<T>
{
    pub fn new(target: &P<T>) -> Self
    {
        WeakP {
            state: P::weak_state(target),
            _marker: PhantomData,
        }
    }

    /// A weak handle that never resolves.
    pub fn null() -> Self
    {
        WeakP {
            state: None,
            _marker: PhantomData,
        }
    }

    /// Returns a strong handle if the object still exists.
    pub fn to_strong(&self) -> Option<P<T>>
    {
        let base = self.state.as_ref()?.try_promote()?;
        Some(unsafe { P::from_raw(base.cast::<Managed<T>>()) })
    }

    /// True for handles created with [`WeakP::null`] or from an object that
    /// was already being deleted.
    pub fn is_null(&self) -> bool { self.state.is_none() }

    /// True if both handles track the same object, alive or not.
    pub fn ptr_eq(&self, other: &Self) -> bool
    {
        match (&self.state, &other.state) {
            (Some(a), Some(b)) => P::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: Object> Clone for WeakP<T>
{
    fn clone(&self) -> Self
    {
        WeakP {
            state: self.state.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Object> Default for WeakP<T>
{
    fn default() -> Self { Self::null() }
}

impl<T: Object> From<&P<T>> for WeakP<T>
{
    fn from(it: &P<T>) -> Self { Self::new(it) }
}

impl<T: Object> fmt::Debug for WeakP<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("WeakP")
            .field("state", &self.state.as_ref().map(|s| P::as_raw(s)))
            .finish()
    }
}
