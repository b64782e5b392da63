
//! Intrusive reference counting with weak references, plus a thread-aware
//! notification layer built on top of it.
//!
//! Objects are allocated with [`P::new`], which places them behind a header
//! holding an atomic strong count. [`P`] is the strong handle; [`WeakP`] is a
//! weak handle that goes through a small, lazily created broker object and can
//! be turned back into a strong handle for as long as the object exists.
//!
//! An object whose count reaches zero goes through [`Object::delete_this`],
//! which may cancel the deletion with [`Dying::revive`], e.g. to return the
//! object to a pool.
//!
//! On top of that sit [`Notifier`] (multicast callbacks, delivered right away
//! or posted to the main context), [`OneShotNotifier`] and [`Property`].
//! Posted work runs on a [`MainQueue`], the single context that serializes it.
//!
//! ```
//! use objcore::{Object, P, WeakP};
//!
//! struct Window { title: String }
//! impl Object for Window {}
//!
//! let window = P::new(Window { title: "main".into() });
//! let weak = WeakP::new(&window);
//! assert_eq!(weak.to_strong().map(|w| w.title.clone()), Some("main".into()));
//!
//! drop(window);
//! assert!(weak.to_strong().is_none());
//! ```
//!

pub mod base;
pub mod dispatcher;
pub mod error;
pub mod method;
pub mod notifier;
pub mod one_shot;
pub mod pointers;
pub mod property;
pub(crate) mod subscribers;
pub mod weak_state;


pub use base::{Base, Dying, Object, DELETE_THIS_REF_COUNT_DELTA};
pub use dispatcher::{
    async_call_from_main, async_call_from_main_when_idle, call_from_main, main_dispatcher, CallResult, Dispatcher,
    MainDispatcher, MainQueue, Priority, Task,
};
#[cfg(feature = "global")]
pub use dispatcher::{install_main_dispatcher, uninstall_main_dispatcher};
pub use error::{programming_error, BoxError, Error};
pub use method::{strong_method, weak_method};
pub use notifier::{Notifier, Outcome, Subscription};
pub use one_shot::OneShotNotifier;
pub use pointers::{WeakP, P};
pub use property::Property;
pub use subscribers::SubscriptionId;
pub use weak_state::WeakState;
