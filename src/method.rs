//! Callables bound to a managed object.
//!
//! A strong method keeps its object alive for as long as the callable exists.
//! A weak method does not; once the object is gone, calling it yields
//! [`Error::DanglingFunction`], which notifiers and the main dispatcher treat
//! as "remove me" rather than as a failure.

use crate::{
    base::Object,
    error::Error,
    pointers::{WeakP, P},
};

/// Binds `method` to `target`, holding a strong reference.
pub fn strong_method<T, A, R, F>(target: P<T>, method: F) -> impl Fn(&A) -> R + Send + Sync
where
    T: Object + Send + Sync,
    F: Fn(&T, &A) -> R + Send + Sync,
{
    move |args: &A| method(&target, args)
}

/// Binds `method` to `target` without keeping it alive.
pub fn weak_method<T, A, R, F>(target: &P<T>, method: F) -> impl Fn(&A) -> Result<R, Error> + Send + Sync
where
    T: Object + Send + Sync,
    F: Fn(&T, &A) -> Result<R, Error> + Send + Sync,
{
    let target = WeakP::new(target);
    move |args: &A| {
        let strong = target.to_strong().ok_or(Error::DanglingFunction)?;
        method(&strong, args)
    }
}
