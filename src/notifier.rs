//! # Multicast notifiers
//!
//! A [`Notifier`] calls a set of subscribers with the same arguments, either
//! right away on the calling thread ([`Notifier::notify`]) or later on the
//! main context (`post_notification`, called on the `P<Notifier<A>>` handle).
//!
//! ```
//! use objcore::{Notifier, MainQueue};
//!
//! let queue = MainQueue::new();
//! let clicked = Notifier::<u32>::with_dispatcher(queue.dispatcher());
//! let subscription = clicked.subscribe(|count: &u32| println!("clicked {count} times"));
//!
//! clicked.post_notification(2).unwrap();
//! queue.run_pending().unwrap();
//!
//! subscription.unsubscribe();
//! ```

use std::{fmt, ops::AddAssign, sync::Arc};

use parking_lot::Mutex;

use crate::{
    base::Object,
    dispatcher::{self, Dispatcher, Priority},
    error::Error,
    pointers::{WeakP, P},
    subscribers::{self, Callback, SubscriberMap, SubscriptionId},
};

/// What a subscriber may return.
///
/// Plain closures return `()`. Weak methods and anything else that can fail
/// return `Result<(), Error>`.
pub trait Outcome
{
    fn into_result(self) -> Result<(), Error>;
}

impl Outcome for ()
{
    fn into_result(self) -> Result<(), Error> { Ok(()) }
}

impl Outcome for Result<(), Error>
{
    fn into_result(self) -> Result<(), Error> { self }
}

pub(crate) fn callback<A, R, F>(func: F) -> Callback<A>
where
    F: Fn(&A) -> R + Send + Sync + 'static,
    R: Outcome,
{
    Arc::new(move |args: &A| func(args).into_result())
}

pub(crate) fn paramless_callback<A, R, F>(func: F) -> Callback<A>
where
    F: Fn() -> R + Send + Sync + 'static,
    R: Outcome,
{
    Arc::new(move |_: &A| func().into_result())
}

/// Resolves the dispatcher for deferred calls: the bound one, or else the
/// process-wide one.
pub(crate) fn resolve_dispatcher(bound: &Option<Arc<dyn Dispatcher>>) -> Result<Arc<dyn Dispatcher>, Error>
{
    bound
        .clone()
        .or_else(dispatcher::main_dispatcher)
        .ok_or(Error::NoDispatcher)
}

/// Something a [`Subscription`] can be removed from.
pub(crate) trait SubscriptionSource: Send + Sync
{
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Control object for one subscription.
///
/// Dropping it does not unsubscribe; only [`unsubscribe`](Self::unsubscribe)
/// does. Once the notifier is gone, unsubscribing does nothing.
pub struct Subscription
{
    id: SubscriptionId,
    source: Box<dyn SubscriptionSource>,
}

impl Object for Subscription {}

impl Subscription
{
    pub(crate) fn new(id: SubscriptionId, source: Box<dyn SubscriptionSource>) -> P<Self>
    {
        P::new(Subscription { id, source })
    }

    pub fn id(&self) -> SubscriptionId { self.id }

    /// Removes the subscriber. It is not called by any dispatch that reaches
    /// it after this returns; a call already in progress is not interrupted.
    pub fn unsubscribe(&self) { self.source.unsubscribe(self.id) }
}

impl fmt::Debug for Subscription
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Multicast notifier with arguments of type `A`.
///
/// Only ever lives behind a [`P`], which is what its constructors return.
/// Subscribing and posting are methods of that handle.
pub struct Notifier<A: 'static>
{
    subscribers: Mutex<SubscriberMap<A>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl<A: 'static> Object for Notifier<A> {}

impl<A: 'static> Notifier<A>
{
    /// A notifier posting to the process-wide main dispatcher.
    pub fn new() -> P<Self> { Self::create(None) }

    /// A notifier posting to `dispatcher`.
    pub fn with_dispatcher(dispatcher: Arc<dyn Dispatcher>) -> P<Self> { Self::create(Some(dispatcher)) }

    fn create(dispatcher: Option<Arc<dyn Dispatcher>>) -> P<Self>
    {
        P::new(Notifier {
            subscribers: Mutex::new(SubscriberMap::new()),
            dispatcher,
        })
    }

    /// Adds a subscriber without a control object. Typically used with weak
    /// methods, which remove themselves once their target is gone.
    pub fn subscribe_detached<R, F>(&self, func: F) -> SubscriptionId
    where
        F: Fn(&A) -> R + Send + Sync + 'static,
        R: Outcome,
    {
        self.subscribers.lock().insert(callback(func))
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId)
    {
        let removed = self.subscribers.lock().remove(id);
        drop(removed);
    }

    /// Removes every subscriber. Dispatches in progress stop before calling
    /// anyone else.
    pub fn unsubscribe_all(&self)
    {
        let removed = self.subscribers.lock().clear();
        drop(removed);
    }

    pub fn subscriber_count(&self) -> usize { self.subscribers.lock().len() }

    /// Calls every subscriber on the calling thread.
    ///
    /// Subscribers added while this runs are not called. The first error
    /// other than [`Error::DanglingFunction`] ends the dispatch and is
    /// returned.
    pub fn notify(&self, args: &A) -> Result<(), Error> { subscribers::dispatch(&self.subscribers, args) }
}

// Operations that hand out references to the notifier itself need the
// managed handle, not just the value.
impl<A: 'static> P<Notifier<A>>
{
    fn control(&self, id: SubscriptionId) -> P<Subscription>
    {
        Subscription::new(id, Box::new(P::downgrade(self)))
    }

    /// Adds a subscriber. The returned control object can remove it again.
    pub fn subscribe<R, F>(&self, func: F) -> P<Subscription>
    where
        F: Fn(&A) -> R + Send + Sync + 'static,
        R: Outcome,
    {
        let id = self.subscribers.lock().insert(callback(func));
        self.control(id)
    }

    /// Adds a subscriber that ignores the notification arguments.
    pub fn subscribe_paramless<R, F>(&self, func: F) -> P<Subscription>
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Outcome,
    {
        let id = self.subscribers.lock().insert(paramless_callback(func));
        self.control(id)
    }

    /// Schedules a [`notify`](Notifier::notify) with `args` on the main
    /// context. The pending call keeps the notifier alive.
    ///
    /// May be called from any thread. Posts from different threads are
    /// delivered in the order in which they were made.
    pub fn post_notification(&self, args: A) -> Result<(), Error>
    where
        A: Send,
    {
        let dispatcher = resolve_dispatcher(&self.dispatcher)?;
        let this = self.clone();
        dispatcher.enqueue(Box::new(move || this.notify(&args)), Priority::Normal)
    }
}

impl<A: 'static> SubscriptionSource for WeakP<Notifier<A>>
{
    fn unsubscribe(&self, id: SubscriptionId)
    {
        if let Some(notifier) = self.to_strong() {
            notifier.unsubscribe(id);
        }
    }
}

impl<A, R, F> AddAssign<F> for P<Notifier<A>>
where
    A: 'static,
    F: Fn(&A) -> R + Send + Sync + 'static,
    R: Outcome,
{
    fn add_assign(&mut self, func: F) { self.subscribe_detached(func); }
}

impl<A: 'static> fmt::Debug for Notifier<A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Notifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
