//! Observable values.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{
    base::Object,
    dispatcher::Dispatcher,
    error::Error,
    method::weak_method,
    notifier::{Notifier, Subscription},
    pointers::P,
};

/// A value that announces its changes through a [`Notifier`].
///
/// Change notifications are posted, so subscribers see them on the main
/// context, in the order the changes were made.
pub struct Property<T: 'static>
{
    value: Mutex<T>,
    on_change: P<Notifier<T>>,
    binding: Mutex<Option<P<Subscription>>>,
}

impl<T: 'static> Object for Property<T> {}

impl<T> Property<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(initial: T) -> P<Self> { Self::create(initial, Notifier::new()) }

    pub fn with_dispatcher(initial: T, dispatcher: Arc<dyn Dispatcher>) -> P<Self>
    {
        Self::create(initial, Notifier::with_dispatcher(dispatcher))
    }

    fn create(initial: T, on_change: P<Notifier<T>>) -> P<Self>
    {
        P::new(Property {
            value: Mutex::new(initial),
            on_change,
            binding: Mutex::new(None),
        })
    }

    pub fn get(&self) -> T { self.value.lock().clone() }

    /// Stores `value` and posts a change notification if it differs from the
    /// current one.
    pub fn set(&self, value: T) -> Result<(), Error>
    {
        {
            let mut current = self.value.lock();
            if *current == value {
                return Ok(());
            }
            *current = value.clone();
        }
        self.on_change.post_notification(value)
    }

    pub fn on_change(&self) -> &P<Notifier<T>> { &self.on_change }

    /// Stops following the bound source, if any.
    pub fn unbind(&self)
    {
        if let Some(previous) = self.binding.lock().take() {
            previous.unsubscribe();
        }
    }
}

impl<T> P<Property<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Makes this property follow `source`.
    ///
    /// The current value is copied right away; later changes arrive through
    /// the source's change notifications. Binding again replaces the previous
    /// binding. The source does not keep this property alive.
    pub fn bind(&self, source: &P<Property<T>>) -> Result<(), Error>
    {
        let follow = weak_method(self, |target: &Property<T>, value: &T| target.set(value.clone()));
        let subscription = source.on_change().subscribe(follow);

        if let Some(previous) = self.binding.lock().replace(subscription) {
            previous.unsubscribe();
        }
        self.set(source.get())
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Property<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Property")
            .field("value", &*self.value.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::dispatcher::MainQueue;

    #[test]
    fn set_posts_only_real_changes()
    {
        let queue = MainQueue::new();
        let title = Property::with_dispatcher(String::from("untitled"), queue.dispatcher());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        title.on_change().subscribe(move |value: &String| sink.lock().push(value.clone()));

        title.set("draft".into()).unwrap();
        title.set("draft".into()).unwrap();
        title.set("final".into()).unwrap();
        assert_eq!(title.get(), "final");

        queue.run_pending().unwrap();
        assert_eq!(*seen.lock(), ["draft", "final"]);
    }

    #[test]
    fn bound_property_follows_its_source()
    {
        let queue = MainQueue::new();
        let source = Property::with_dispatcher(1, queue.dispatcher());
        let target = Property::with_dispatcher(0, queue.dispatcher());

        target.bind(&source).unwrap();
        assert_eq!(target.get(), 1);

        source.set(5).unwrap();
        queue.run_pending().unwrap();
        assert_eq!(target.get(), 5);

        target.unbind();
        source.set(6).unwrap();
        queue.run_pending().unwrap();
        assert_eq!(target.get(), 5);
    }

    #[test]
    fn dropped_target_leaves_the_source_notifier()
    {
        let queue = MainQueue::new();
        let source = Property::with_dispatcher(1, queue.dispatcher());
        let target = Property::with_dispatcher(0, queue.dispatcher());
        target.bind(&source).unwrap();
        queue.run_pending().unwrap();
        assert_eq!(source.on_change().subscriber_count(), 1);

        drop(target);
        source.set(2).unwrap();
        queue.run_pending().unwrap();
        assert_eq!(source.on_change().subscriber_count(), 0);
    }
}
