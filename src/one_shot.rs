//! Notifier for events that happen at most once, such as "finished loading".
//!
//! After the event has been posted, every subscriber added later is still
//! called with the same arguments, on the main context. Each subscriber is
//! called exactly once and then dropped.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{
    base::Object,
    dispatcher::{Dispatcher, Priority},
    error::{programming_error, Error},
    notifier::{callback, paramless_callback, resolve_dispatcher, Outcome, Subscription, SubscriptionSource},
    pointers::{WeakP, P},
    subscribers::{self, SubscriberMap, SubscriptionId, Subscribers},
};

struct OneShotState<A>
{
    subscribers: SubscriberMap<A>,
    args: Option<Arc<A>>,
    delivery_pending: bool,
}

impl<A> Subscribers<A> for OneShotState<A>
{
    const ONE_SHOT: bool = true;

    fn map(&mut self) -> &mut SubscriberMap<A> { &mut self.subscribers }

    fn dispatch_finished(&mut self, _completed: bool)
    {
        // subscribers left over after a failure are picked up by the delivery
        // the next subscription schedules
        self.delivery_pending = false;
    }
}

pub struct OneShotNotifier<A: 'static>
{
    state: Mutex<OneShotState<A>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl<A: 'static> Object for OneShotNotifier<A> {}

impl<A: Send + Sync + 'static> OneShotNotifier<A>
{
    pub fn new() -> P<Self> { Self::create(None) }

    pub fn with_dispatcher(dispatcher: Arc<dyn Dispatcher>) -> P<Self> { Self::create(Some(dispatcher)) }

    fn create(dispatcher: Option<Arc<dyn Dispatcher>>) -> P<Self>
    {
        P::new(OneShotNotifier {
            state: Mutex::new(OneShotState {
                subscribers: SubscriberMap::new(),
                args: None,
                delivery_pending: false,
            }),
            dispatcher,
        })
    }

    pub fn was_posted(&self) -> bool { self.state.lock().args.is_some() }

    pub fn unsubscribe_all(&self)
    {
        let removed = self.state.lock().subscribers.clear();
        drop(removed);
    }

    pub fn subscriber_count(&self) -> usize { self.state.lock().subscribers.len() }

    fn deliver(&self) -> Result<(), Error>
    {
        let args = self.state.lock().args.clone();
        match args {
            Some(args) => subscribers::dispatch(&self.state, &*args),
            None => Ok(()),
        }
    }
}

impl<A: Send + Sync + 'static> P<OneShotNotifier<A>>
{
    /// Adds a subscriber. If the event was already posted the subscriber is
    /// scheduled right away.
    pub fn subscribe<R, F>(&self, func: F) -> Result<P<Subscription>, Error>
    where
        F: Fn(&A) -> R + Send + Sync + 'static,
        R: Outcome,
    {
        let id = self.insert(callback(func))?;
        Ok(Subscription::new(id, Box::new(P::downgrade(self))))
    }

    pub fn subscribe_paramless<R, F>(&self, func: F) -> Result<P<Subscription>, Error>
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Outcome,
    {
        let id = self.insert(paramless_callback(func))?;
        Ok(Subscription::new(id, Box::new(P::downgrade(self))))
    }

    pub fn subscribe_detached<R, F>(&self, func: F) -> Result<SubscriptionId, Error>
    where
        F: Fn(&A) -> R + Send + Sync + 'static,
        R: Outcome,
    {
        self.insert(callback(func))
    }

    fn insert(&self, callback: subscribers::Callback<A>) -> Result<SubscriptionId, Error>
    {
        let mut state = self.state.lock();
        let id = state.subscribers.insert(callback);
        // a pending delivery picks up new subscribers on its own
        if state.args.is_some() && !state.delivery_pending {
            state.delivery_pending = true;
            drop(state);
            self.schedule_delivery()?;
        }
        Ok(id)
    }

    /// Triggers the event. Must be called at most once.
    pub fn post_notification(&self, args: A) -> Result<(), Error>
    {
        let mut state = self.state.lock();
        if state.args.is_some() {
            drop(state);
            programming_error("a one-shot notifier was posted more than once");
        }
        state.args = Some(Arc::new(args));
        state.delivery_pending = true;
        drop(state);
        self.schedule_delivery()
    }

    fn schedule_delivery(&self) -> Result<(), Error>
    {
        let this = self.clone();
        let enqueued = resolve_dispatcher(&self.dispatcher)
            .and_then(|dispatcher| dispatcher.enqueue(Box::new(move || this.deliver()), Priority::Normal));
        if enqueued.is_err() {
            self.state.lock().delivery_pending = false;
        }
        enqueued
    }
}

impl<A: Send + Sync + 'static> SubscriptionSource for WeakP<OneShotNotifier<A>>
{
    fn unsubscribe(&self, id: SubscriptionId)
    {
        if let Some(notifier) = self.to_strong() {
            let removed = notifier.state.lock().subscribers.remove(id);
            drop(removed);
        }
    }
}

impl<A: 'static> fmt::Debug for OneShotNotifier<A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let state = self.state.lock();
        f.debug_struct("OneShotNotifier")
            .field("subscribers", &state.subscribers.len())
            .field("posted", &state.args.is_some())
            .field("delivery_pending", &state.delivery_pending)
            .finish()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::dispatcher::MainQueue;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Box<dyn Fn(&u8) + Send + Sync>)
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |name: &'static str| -> Box<dyn Fn(&u8) + Send + Sync> {
            let sink = sink.clone();
            Box::new(move |value: &u8| sink.lock().push(format!("{name}:{value}")))
        };
        (log, make)
    }

    #[test]
    fn delivers_once_and_drops_subscribers()
    {
        let queue = MainQueue::new();
        let done = OneShotNotifier::<u8>::with_dispatcher(queue.dispatcher());
        let (log, sub) = recorder();

        done.subscribe(sub("a")).unwrap();
        done.post_notification(5).unwrap();
        assert!(log.lock().is_empty());

        queue.run_pending().unwrap();
        assert_eq!(*log.lock(), ["a:5"]);
        assert_eq!(done.subscriber_count(), 0);
        assert_eq!(queue.run_pending().unwrap(), 0);
    }

    #[test]
    fn late_subscribers_are_called_with_stored_arguments()
    {
        let queue = MainQueue::new();
        let done = OneShotNotifier::<u8>::with_dispatcher(queue.dispatcher());
        let (log, sub) = recorder();

        done.post_notification(9).unwrap();
        queue.run_pending().unwrap();

        done.subscribe(sub("late")).unwrap();
        assert!(log.lock().is_empty());
        queue.run_pending().unwrap();
        assert_eq!(*log.lock(), ["late:9"]);
    }

    #[test]
    fn subscriber_added_during_delivery_is_picked_up()
    {
        let queue = MainQueue::new();
        let done = OneShotNotifier::<u8>::with_dispatcher(queue.dispatcher());
        let (log, sub) = recorder();

        let inner = done.clone();
        let nested = Mutex::new(Some(sub("nested")));
        done.subscribe(move |_: &u8| -> Result<(), Error> {
            if let Some(func) = nested.lock().take() {
                inner.subscribe(func)?;
            }
            Ok(())
        })
        .unwrap();
        done.post_notification(1).unwrap();

        assert_eq!(queue.run_pending().unwrap(), 1);
        assert_eq!(*log.lock(), ["nested:1"]);
    }

    #[test]
    fn unsubscribed_before_delivery_is_not_called()
    {
        let queue = MainQueue::new();
        let done = OneShotNotifier::<u8>::with_dispatcher(queue.dispatcher());
        let (log, sub) = recorder();

        let subscription = done.subscribe(sub("gone")).unwrap();
        done.post_notification(1).unwrap();
        subscription.unsubscribe();

        queue.run_pending().unwrap();
        assert!(log.lock().is_empty());
    }

    #[test]
    #[should_panic(expected = "more than once")]
    fn second_post_is_a_programming_error()
    {
        let queue = MainQueue::new();
        let done = OneShotNotifier::<u8>::with_dispatcher(queue.dispatcher());
        done.post_notification(1).unwrap();
        let _ = done.post_notification(2);
    }
}
