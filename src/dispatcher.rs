//! # Main-context dispatch
//!
//! Deferred notifications and main-thread calls are funnelled through a
//! [`Dispatcher`]. The stock implementation is a pair of objects:
//!
//! * [`MainQueue`] lives on the main context (it is `!Send`) and executes
//!   queued work, one item at a time, in enqueue order.
//! * [`MainDispatcher`] is the thread-safe sending side. Any thread may
//!   enqueue through it.
//!
//! Items of [`Priority::Idle`] only run once no normal item is pending. Timed
//! items move into their queue when due.

use std::{
    collections::BTreeMap,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::error::{programming_error, Error};

/// A unit of work for the main context.
pub type Task = Box<dyn FnOnce() -> Result<(), Error> + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority
{
    #[default]
    Normal,

    /// Runs only when no normal item is waiting.
    Idle,
}

/// Something that can run tasks on a single serialization context.
pub trait Dispatcher: Send + Sync
{
    /// Schedules `task`. Tasks of the same priority run in enqueue order.
    fn enqueue(&self, task: Task, priority: Priority) -> Result<(), Error>;

    /// Schedules `task` to be enqueued once `delay` has passed.
    fn enqueue_after(&self, delay: Duration, task: Task, priority: Priority) -> Result<(), Error>;

    /// True if the calling thread is the one that executes the tasks.
    fn is_current_main(&self) -> bool;
}

struct TimedItem
{
    task: Task,
    priority: Priority,
}

/// Thread-safe enqueueing side of a main queue.
pub struct MainDispatcher
{
    main_thread: ThreadId,
    normal: Sender<Task>,
    idle: Sender<Task>,
    wake: Sender<()>,
    timed: Mutex<BTreeMap<(Instant, u64), TimedItem>>,
    timed_counter: AtomicU64,
}

impl MainDispatcher
{
    fn queue(&self, priority: Priority) -> &Sender<Task>
    {
        match priority {
            Priority::Normal => &self.normal,
            Priority::Idle => &self.idle,
        }
    }

    /// Calls `tick` every `interval` on the main context until it returns
    /// `false`.
    ///
    /// Missed ticks are skipped rather than run in a burst.
    pub fn create_timer<F>(self: &Arc<Self>, interval: Duration, tick: F) -> Result<(), Error>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        if interval.is_zero() {
            programming_error("timer interval must be greater than zero");
        }
        let timer = Arc::new(Timer {
            dispatcher: Arc::downgrade(self),
            interval,
            tick: Mutex::new(Box::new(tick)),
        });
        Timer::schedule(timer, Instant::now() + interval)
    }

    fn promote_due_items(&self) -> Option<Instant>
    {
        let now = Instant::now();
        let mut timed = self.timed.lock();
        while let Some(entry) = timed.first_entry() {
            let due = entry.key().0;
            if due > now {
                return Some(due);
            }
            let item = entry.remove();
            // the receiving side is the caller, so this cannot be disconnected
            let _ = self.queue(item.priority).send(item.task);
        }
        None
    }
}

impl Dispatcher for MainDispatcher
{
    fn enqueue(&self, task: Task, priority: Priority) -> Result<(), Error>
    {
        self.queue(priority)
            .send(task)
            .map_err(|_| Error::DispatcherClosed)
    }

    fn enqueue_after(&self, delay: Duration, task: Task, priority: Priority) -> Result<(), Error>
    {
        if delay.is_zero() {
            return self.enqueue(task, priority);
        }
        let key = (
            Instant::now() + delay,
            self.timed_counter.fetch_add(1, Ordering::Relaxed),
        );
        self.timed.lock().insert(key, TimedItem { task, priority });
        // a full wake channel already guarantees a wake up
        match self.wake.try_send(()) {
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                // nobody will ever run it
                self.timed.lock().remove(&key);
                Err(Error::DispatcherClosed)
            }
            _ => Ok(()),
        }
    }

    fn is_current_main(&self) -> bool { thread::current().id() == self.main_thread }
}

struct Timer
{
    dispatcher: Weak<MainDispatcher>,
    interval: Duration,
    tick: Mutex<Box<dyn FnMut() -> bool + Send>>,
}

impl Timer
{
    fn schedule(this: Arc<Self>, at: Instant) -> Result<(), Error>
    {
        let dispatcher = this.dispatcher.upgrade().ok_or(Error::DispatcherClosed)?;
        let delay = at.saturating_duration_since(Instant::now());
        dispatcher.enqueue_after(
            delay,
            Box::new(move || {
                let keep_going = {
                    let mut tick = this.tick.lock();
                    (*tick)()
                };
                if keep_going {
                    let next = this.next_event_time(at);
                    if let Err(err) = Timer::schedule(this, next) {
                        tracing::warn!(target: "objcore", error = %err, "timer stopped, main queue is gone");
                    }
                }
                Ok(())
            }),
            Priority::Normal,
        )
    }

    fn next_event_time(&self, last: Instant) -> Instant
    {
        let now = Instant::now();
        let next = last + self.interval;
        if next >= now {
            return next;
        }
        let behind = (now - next).as_nanos() / self.interval.as_nanos();
        let skip = u32::try_from(behind + 1).unwrap_or(u32::MAX);
        next + self.interval * skip
    }
}

/// The executing side of a main queue. Bound to the thread that created it.
pub struct MainQueue
{
    dispatcher: Arc<MainDispatcher>,
    normal: Receiver<Task>,
    idle: Receiver<Task>,
    wake: Receiver<()>,
    _not_send: PhantomData<*const ()>,
}

impl MainQueue
{
    /// Makes the calling thread the main context of a new queue.
    pub fn new() -> Self
    {
        let (normal_tx, normal) = crossbeam_channel::unbounded();
        let (idle_tx, idle) = crossbeam_channel::unbounded();
        let (wake_tx, wake) = crossbeam_channel::bounded(1);

        MainQueue {
            dispatcher: Arc::new(MainDispatcher {
                main_thread: thread::current().id(),
                normal: normal_tx,
                idle: idle_tx,
                wake: wake_tx,
                timed: Mutex::new(BTreeMap::new()),
                timed_counter: AtomicU64::new(0),
            }),
            normal,
            idle,
            wake,
            _not_send: PhantomData,
        }
    }

    pub fn dispatcher(&self) -> Arc<MainDispatcher> { self.dispatcher.clone() }

    /// Runs the next ready item, if any.
    ///
    /// A task failing with [`Error::DanglingFunction`] counts as handled;
    /// any other error is returned to the caller and the remaining items stay
    /// queued.
    pub fn handle_next(&self) -> Result<bool, Error>
    {
        self.dispatcher.promote_due_items();

        let task = match self.normal.try_recv() {
            Ok(task) => task,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => match self.idle.try_recv() {
                Ok(task) => task,
                Err(_) => return Ok(false),
            },
        };

        match task() {
            Err(Error::DanglingFunction) => {
                tracing::debug!(target: "objcore", "dispatched call targeted a destroyed object");
                Ok(true)
            }
            Err(err) => Err(err),
            Ok(()) => Ok(true),
        }
    }

    /// Runs items until none is ready. Returns how many were handled.
    ///
    /// Items enqueued by the running items are handled in the same call.
    pub fn run_pending(&self) -> Result<usize, Error>
    {
        let mut handled = 0;
        while self.handle_next()? {
            handled += 1;
        }
        Ok(handled)
    }

    /// Blocks until an item is ready or `timeout` has passed.
    ///
    /// Returns `true` if an item is ready. Does not execute it.
    pub fn wait_for_next(&self, timeout: Duration) -> bool
    {
        let deadline = Instant::now() + timeout;
        loop {
            let next_timed = self.dispatcher.promote_due_items();
            if !self.normal.is_empty() || !self.idle.is_empty() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait_until = next_timed.map_or(deadline, |due| due.min(deadline));

            let mut select = Select::new();
            select.recv(&self.normal);
            select.recv(&self.idle);
            let wake = select.recv(&self.wake);
            match select.ready_deadline(wait_until) {
                Ok(index) if index == wake => {
                    let _ = self.wake.try_recv();
                }
                Ok(_) => return true,
                Err(_) => {}
            }
        }
    }

    pub fn is_empty(&self) -> bool
    {
        self.normal.is_empty() && self.idle.is_empty() && self.dispatcher.timed.lock().is_empty()
    }
}

impl Default for MainQueue
{
    fn default() -> Self { Self::new() }
}

/// Result of a [`call_from_main`].
pub struct CallResult<R>
{
    rx: Receiver<R>,
}

impl<R> CallResult<R>
{
    /// Blocks until the call has run.
    ///
    /// Fails with [`Error::DispatcherClosed`] if the call was dropped without
    /// running.
    pub fn wait(self) -> Result<R, Error> { self.rx.recv().map_err(|_| Error::DispatcherClosed) }

    /// Returns the value if the call has already run.
    pub fn try_get(&self) -> Option<R> { self.rx.try_recv().ok() }
}

/// Runs `call` on the main context.
///
/// On the main context itself the call happens immediately. From any other
/// thread it is enqueued and the returned [`CallResult`] can be waited on.
pub fn call_from_main<R, F>(dispatcher: &dyn Dispatcher, call: F) -> Result<CallResult<R>, Error>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    if dispatcher.is_current_main() {
        let _ = tx.send(call());
    } else {
        dispatcher.enqueue(
            Box::new(move || {
                let _ = tx.send(call());
                Ok(())
            }),
            Priority::Normal,
        )?;
    }
    Ok(CallResult { rx })
}

/// Enqueues `call` on the main context, even when already there.
///
/// A [`Error::DanglingFunction`] returned by `call` is dropped silently.
pub fn async_call_from_main<F>(dispatcher: &dyn Dispatcher, call: F) -> Result<(), Error>
where
    F: FnOnce() -> Result<(), Error> + Send + 'static,
{
    dispatcher.enqueue(Box::new(call), Priority::Normal)
}

/// Like [`async_call_from_main`], but runs once the main context is idle.
pub fn async_call_from_main_when_idle<F>(dispatcher: &dyn Dispatcher, call: F) -> Result<(), Error>
where
    F: FnOnce() -> Result<(), Error> + Send + 'static,
{
    dispatcher.enqueue(Box::new(call), Priority::Idle)
}

#[cfg(feature = "global")]
mod registry
{
    use std::sync::Arc;

    use lazy_static::lazy_static;
    use parking_lot::RwLock;

    use super::Dispatcher;

    lazy_static! {
        static ref MAIN_DISPATCHER: RwLock<Option<Arc<dyn Dispatcher>>> = RwLock::new(None);
    }

    /// Installs the process-wide main dispatcher, returning the previous one.
    pub fn install_main_dispatcher(dispatcher: Arc<dyn Dispatcher>) -> Option<Arc<dyn Dispatcher>>
    {
        MAIN_DISPATCHER.write().replace(dispatcher)
    }

    pub fn uninstall_main_dispatcher() -> Option<Arc<dyn Dispatcher>> { MAIN_DISPATCHER.write().take() }

    pub fn main_dispatcher() -> Option<Arc<dyn Dispatcher>> { MAIN_DISPATCHER.read().clone() }
}

#[cfg(feature = "global")]
pub use registry::{install_main_dispatcher, main_dispatcher, uninstall_main_dispatcher};

/// Without the `global` feature there is no process-wide dispatcher.
#[cfg(not(feature = "global"))]
pub fn main_dispatcher() -> Option<Arc<dyn Dispatcher>> { None }

#[cfg(test)]
mod tests
{
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task)
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |name: &'static str| -> Task {
            let sink = sink.clone();
            Box::new(move || {
                sink.lock().push(name);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn tasks_run_in_enqueue_order()
    {
        let queue = MainQueue::new();
        let dispatcher = queue.dispatcher();
        let (log, task) = recorder();

        dispatcher.enqueue(task("a"), Priority::Normal).unwrap();
        dispatcher.enqueue(task("b"), Priority::Normal).unwrap();
        dispatcher.enqueue(task("c"), Priority::Normal).unwrap();

        assert_eq!(queue.run_pending().unwrap(), 3);
        assert_eq!(*log.lock(), ["a", "b", "c"]);
    }

    #[test]
    fn idle_items_wait_for_normal_ones()
    {
        let queue = MainQueue::new();
        let dispatcher = queue.dispatcher();
        let (log, task) = recorder();

        dispatcher.enqueue(task("idle"), Priority::Idle).unwrap();
        dispatcher.enqueue(task("normal"), Priority::Normal).unwrap();

        queue.run_pending().unwrap();
        assert_eq!(*log.lock(), ["normal", "idle"]);
    }

    #[test]
    fn nested_enqueue_runs_after_current_items()
    {
        let queue = MainQueue::new();
        let dispatcher = queue.dispatcher();
        let (log, task) = recorder();

        let inner = dispatcher.clone();
        let nested = task("nested");
        let first = task("first");
        dispatcher
            .enqueue(
                Box::new(move || {
                    inner.enqueue(nested, Priority::Normal)?;
                    first()
                }),
                Priority::Normal,
            )
            .unwrap();
        dispatcher.enqueue(task("second"), Priority::Normal).unwrap();

        assert_eq!(queue.run_pending().unwrap(), 3);
        assert_eq!(*log.lock(), ["first", "second", "nested"]);
    }

    #[test]
    fn failing_task_stops_the_run_and_keeps_the_rest()
    {
        let queue = MainQueue::new();
        let dispatcher = queue.dispatcher();
        let (log, task) = recorder();

        dispatcher
            .enqueue(Box::new(|| Err(Error::subscriber("boom"))), Priority::Normal)
            .unwrap();
        dispatcher.enqueue(task("after"), Priority::Normal).unwrap();

        assert!(matches!(queue.run_pending(), Err(Error::Subscriber(_))));
        assert!(log.lock().is_empty());
        assert_eq!(queue.run_pending().unwrap(), 1);
        assert_eq!(*log.lock(), ["after"]);
    }

    #[test]
    fn dangling_task_counts_as_handled()
    {
        let queue = MainQueue::new();
        let dispatcher = queue.dispatcher();
        async_call_from_main(&*dispatcher, || Err(Error::DanglingFunction)).unwrap();
        assert_eq!(queue.run_pending().unwrap(), 1);
    }

    #[test]
    fn delayed_items_become_ready()
    {
        let queue = MainQueue::new();
        let dispatcher = queue.dispatcher();
        let (log, task) = recorder();

        dispatcher
            .enqueue_after(Duration::from_millis(20), task("late"), Priority::Normal)
            .unwrap();
        assert_eq!(queue.run_pending().unwrap(), 0);
        assert!(!queue.is_empty());

        assert!(queue.wait_for_next(Duration::from_secs(5)));
        assert_eq!(queue.run_pending().unwrap(), 1);
        assert_eq!(*log.lock(), ["late"]);
    }

    #[test]
    fn wait_for_next_times_out()
    {
        let queue = MainQueue::new();
        assert!(!queue.wait_for_next(Duration::from_millis(10)));
    }

    #[test]
    fn timer_repeats_until_it_returns_false()
    {
        let queue = MainQueue::new();
        let dispatcher = queue.dispatcher();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        dispatcher
            .create_timer(Duration::from_millis(1), move || {
                counter.fetch_add(1, Ordering::SeqCst) + 1 < 3
            })
            .unwrap();

        while !queue.is_empty() {
            queue.wait_for_next(Duration::from_secs(5));
            queue.run_pending().unwrap();
        }
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[test]
    #[should_panic(expected = "timer interval")]
    fn zero_timer_interval_is_a_programming_error()
    {
        let queue = MainQueue::new();
        let _ = queue.dispatcher().create_timer(Duration::ZERO, || false);
    }

    #[test]
    fn call_from_main_runs_inline_on_main()
    {
        let queue = MainQueue::new();
        let dispatcher = queue.dispatcher();
        let result = call_from_main(&*dispatcher, || 6 * 7).unwrap();
        assert_eq!(result.try_get(), Some(42));
    }

    #[test]
    fn call_from_main_from_another_thread()
    {
        let queue = MainQueue::new();
        let dispatcher = queue.dispatcher();
        let main = thread::current().id();

        let pending = thread::spawn(move || {
            assert!(!dispatcher.is_current_main());
            call_from_main(&*dispatcher, move || thread::current().id() == main).unwrap()
        })
        .join()
        .unwrap();

        assert!(pending.try_get().is_none());
        queue.run_pending().unwrap();
        assert_eq!(pending.wait().unwrap(), true);
    }

    #[test]
    fn enqueue_after_queue_is_gone_fails()
    {
        let queue = MainQueue::new();
        let dispatcher = queue.dispatcher();
        drop(queue);

        assert!(matches!(
            async_call_from_main(&*dispatcher, || Ok(())),
            Err(Error::DispatcherClosed)
        ));
        let captured = Arc::new(());
        let held = captured.clone();
        assert!(matches!(
            dispatcher.enqueue_after(
                Duration::from_millis(1),
                Box::new(move || {
                    let _ = &held;
                    Ok(())
                }),
                Priority::Idle
            ),
            Err(Error::DispatcherClosed)
        ));
        // the rejected task is dropped, not parked in the timed queue
        assert_eq!(Arc::strong_count(&captured), 1);
    }
}
