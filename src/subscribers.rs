//! Subscriber storage shared by the notifier types.
//!
//! Subscribers are kept in id order. Every dispatch in progress registers a
//! cursor naming the next id it will visit; removing or clearing entries moves
//! those cursors along, so a dispatch never calls a subscriber that was removed
//! before its turn came.

use std::{collections::BTreeMap, marker::PhantomData, ops::Bound, sync::Arc};

use lock_api::MutexGuard;
use parking_lot::Mutex;

use crate::error::Error;

pub(crate) type Callback<A> = Arc<dyn Fn(&A) -> Result<(), Error> + Send + Sync>;

/// Identifies one subscription within its notifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

struct Cursor
{
    token: u64,
    next: Option<u64>,
    // ids at or above this were added after the dispatch started
    end: u64,
}

pub(crate) struct SubscriberMap<A>
{
    next_id: u64,
    entries: BTreeMap<u64, Callback<A>>,
    cursors: Vec<Cursor>,
    next_token: u64,
}

impl<A> SubscriberMap<A>
{
    pub(crate) fn new() -> Self
    {
        SubscriberMap {
            next_id: 1,
            entries: BTreeMap::new(),
            cursors: Vec::new(),
            next_token: 0,
        }
    }

    pub(crate) fn insert(&mut self, callback: Callback<A>) -> SubscriptionId
    {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, callback);

        for cursor in &mut self.cursors {
            if cursor.next.is_none() && id < cursor.end {
                cursor.next = Some(id);
            }
        }
        SubscriptionId(id)
    }

    /// Removes a subscriber and hands it back so the caller can drop it after
    /// releasing the lock.
    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Option<Callback<A>>
    {
        let removed = self.entries.remove(&id.0)?;
        for index in 0..self.cursors.len() {
            if self.cursors[index].next == Some(id.0) {
                let end = self.cursors[index].end;
                self.cursors[index].next = self.key_after(id.0, end);
            }
        }
        Some(removed)
    }

    pub(crate) fn clear(&mut self) -> BTreeMap<u64, Callback<A>>
    {
        for cursor in &mut self.cursors {
            cursor.next = None;
        }
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn len(&self) -> usize { self.entries.len() }

    /// Starts a dispatch. A `bounded` cursor ignores subscribers added after
    /// this call, an unbounded one picks them up.
    fn open_cursor(&mut self, bounded: bool) -> u64
    {
        let token = self.next_token;
        self.next_token += 1;
        let end = if bounded { self.next_id } else { u64::MAX };
        let next = self.key_after_or_at(0, end);
        self.cursors.push(Cursor { token, next, end });
        token
    }

    fn advance(&mut self, token: u64) -> Option<(SubscriptionId, Callback<A>)>
    {
        let index = self.cursors.iter().position(|c| c.token == token)?;
        let id = self.cursors[index].next?;
        let end = self.cursors[index].end;
        let callback = self.entries.get(&id)?.clone();
        self.cursors[index].next = self.key_after(id, end);
        Some((SubscriptionId(id), callback))
    }

    fn close_cursor(&mut self, token: u64) { self.cursors.retain(|c| c.token != token) }

    fn key_after(&self, id: u64, end: u64) -> Option<u64>
    {
        self.entries
            .range((Bound::Excluded(id), Bound::Excluded(end)))
            .next()
            .map(|(&key, _)| key)
    }

    fn key_after_or_at(&self, id: u64, end: u64) -> Option<u64>
    {
        self.entries.range(id..end).next().map(|(&key, _)| key)
    }
}

/// State guarded by a notifier's mutex.
pub(crate) trait Subscribers<A>
{
    /// Subscribers are dropped from the map as soon as their call starts.
    const ONE_SHOT: bool = false;

    fn map(&mut self) -> &mut SubscriberMap<A>;

    /// Runs with the lock held once a dispatch ends, `completed` being false
    /// if it was cut short by an error or a panic.
    fn dispatch_finished(&mut self, _completed: bool) {}
}

impl<A> Subscribers<A> for SubscriberMap<A>
{
    fn map(&mut self) -> &mut SubscriberMap<A> { self }
}

struct ActiveCursor<'a, S: Subscribers<A>, A>
{
    guard: MutexGuard<'a, parking_lot::RawMutex, S>,
    token: u64,
    completed: bool,
    _args: PhantomData<fn(&A)>,
}

impl<S: Subscribers<A>, A> Drop for ActiveCursor<'_, S, A>
{
    fn drop(&mut self)
    {
        self.guard.map().close_cursor(self.token);
        self.guard.dispatch_finished(self.completed);
    }
}

/// Calls every subscriber in `lock` with `args`.
///
/// The lock is released around each call. A subscriber returning
/// [`Error::DanglingFunction`] is removed and the dispatch goes on; any other
/// error ends the dispatch and is returned.
pub(crate) fn dispatch<S, A>(lock: &Mutex<S>, args: &A) -> Result<(), Error>
where
    S: Subscribers<A>,
{
    let mut guard = lock.lock();
    let token = guard.map().open_cursor(!S::ONE_SHOT);
    let mut active = ActiveCursor {
        guard,
        token,
        completed: false,
        _args: PhantomData,
    };

    while let Some((id, callback)) = active.guard.map().advance(active.token) {
        let detached = if S::ONE_SHOT {
            active.guard.map().remove(id)
        } else {
            None
        };

        let outcome = MutexGuard::unlocked(&mut active.guard, move || {
            let outcome = callback(args);
            drop(callback);
            drop(detached);
            outcome
        });

        match outcome {
            Ok(()) => {}
            Err(Error::DanglingFunction) => {
                tracing::debug!(target: "objcore", subscription = ?id, "removing subscriber with destroyed target");
                let removed = active.guard.map().remove(id);
                MutexGuard::unlocked(&mut active.guard, move || drop(removed));
            }
            Err(err) => return Err(err),
        }
    }

    active.completed = true;
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn noop() -> Callback<()> { Arc::new(|_: &()| -> Result<(), Error> { Ok(()) }) }

    #[test]
    fn ids_are_never_reused()
    {
        let mut map = SubscriberMap::new();
        let a = map.insert(noop());
        map.remove(a);
        let b = map.insert(noop());
        assert_ne!(a, b);
        map.clear();
        let c = map.insert(noop());
        assert!(c > b);
    }

    #[test]
    fn removal_moves_cursor_past_the_entry()
    {
        let mut map = SubscriberMap::new();
        let a = map.insert(noop());
        let b = map.insert(noop());
        let c = map.insert(noop());

        let token = map.open_cursor(true);
        assert_eq!(map.advance(token).map(|(id, _)| id), Some(a));
        map.remove(b);
        assert_eq!(map.advance(token).map(|(id, _)| id), Some(c));
        assert!(map.advance(token).is_none());
        map.close_cursor(token);
    }

    #[test]
    fn bounded_cursor_skips_late_subscribers()
    {
        let mut map = SubscriberMap::new();
        let a = map.insert(noop());
        let token = map.open_cursor(true);
        map.insert(noop());

        assert_eq!(map.advance(token).map(|(id, _)| id), Some(a));
        assert!(map.advance(token).is_none());
    }

    #[test]
    fn unbounded_cursor_picks_up_late_subscribers()
    {
        let mut map = SubscriberMap::new();
        let token = map.open_cursor(false);
        assert!(map.advance(token).is_none());

        let late = map.insert(noop());
        assert_eq!(map.advance(token).map(|(id, _)| id), Some(late));
    }

    #[test]
    fn clear_stops_every_cursor()
    {
        let mut map = SubscriberMap::new();
        map.insert(noop());
        map.insert(noop());
        let first = map.open_cursor(true);
        let second = map.open_cursor(true);
        map.advance(first);

        assert_eq!(map.clear().len(), 2);
        assert!(map.advance(first).is_none());
        assert!(map.advance(second).is_none());
    }

    #[test]
    fn cursor_is_closed_when_a_subscriber_panics()
    {
        let lock = Mutex::new(SubscriberMap::<()>::new());
        lock.lock().insert(Arc::new(|_: &()| -> Result<(), Error> { panic!("subscriber failed") }));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| dispatch(&lock, &())));
        assert!(result.is_err());
        assert!(lock.lock().cursors.is_empty());
    }
}
