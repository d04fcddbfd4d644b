//! Tag-scoped task scheduling.
//!
//! A [`TaskTag`] buckets tasks so that one logical owner's work is ordered
//! independently of others sharing the same threads: tasks under the same tag
//! run in submission order and never concurrently with each other, while
//! independent tags are free to interleave. Two executors implement the
//! contract:
//!
//! * [`ThreadedScheduler`] — a worker pool, parallel across tags. Used for
//!   tile parsing and style evaluation.
//! * [`SequencedScheduler`] — a single thread with strict global ordering
//!   across all tags. Used to funnel many callers onto one thread-unsafe
//!   resource.
//!
//! There is no general task-cancellation primitive. Replies capture a weak
//! [`SchedulerHandle`] and silently no-op once the target scheduler is gone;
//! longer-lived work can poll a [`CancellationToken`], which each scheduler
//! cancels on destruction.

mod sequenced;
mod threaded;

use std::{
    any::Any,
    fmt,
    fmt::{Display, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock, Weak,
    },
};

pub use sequenced::SequencedScheduler;
use thiserror::Error;
pub use threaded::ThreadedScheduler;

use crate::util::SimpleIdentity;

/// A task submitted to a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handler invoked with a short description when a task panics on a
/// scheduler-owned thread.
pub type PanicHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifies the mailbox a task is enqueued onto. Consumers use one tag per
/// logical owner (e.g. one per map instance), so that draining at teardown
/// only waits for that owner's work.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskTag(SimpleIdentity);

impl TaskTag {
    pub fn unique() -> Self {
        TaskTag(SimpleIdentity::unique())
    }
}

impl Display for TaskTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "tag{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("scheduler is shutting down")]
    ShutDown,
}

/// The object-safe scheduling contract. Generic conveniences live in
/// [`SchedulerExt`].
pub trait Scheduler: Send + Sync + 'static {
    /// Enqueues `task` onto the FIFO associated with `tag`. Tasks under the
    /// same tag execute in submission order, never concurrently with each
    /// other; tasks under different tags may interleave.
    fn schedule(&self, tag: TaskTag, task: Task) -> Result<(), ScheduleError>;

    /// Transfers ownership of `item` to be dropped on one of this scheduler's
    /// threads. The scheduler's destructor blocks until all such items have
    /// been dropped. This exists because releasing certain GPU-bound
    /// resources off their owning thread would violate backend thread
    /// affinity.
    fn schedule_release(&self, tag: TaskTag, item: Box<dyn Any + Send>) -> Result<(), ScheduleError>;

    /// Blocks until the named tag's queue (or, if `None`, all queues
    /// including pending releases) is empty. Must not be called from a task
    /// this scheduler is running; that would deadlock and is asserted against
    /// in debug builds.
    fn wait_for_empty(&self, tag: Option<TaskTag>);

    /// A token cancelled when this scheduler shuts down. Long-running or
    /// deferred work checks it at the top instead of relying on ambient
    /// pointer validity.
    fn cancellation_token(&self) -> CancellationToken;

    /// Installs the handler invoked when a task panics on a scheduler-owned
    /// thread. Without one, panics are reported through `log::error!` and the
    /// worker continues processing its queue either way.
    fn set_panic_handler(&self, handler: PanicHandler);
}

/// Generic helpers over any [`Scheduler`].
pub trait SchedulerExt: Scheduler {
    /// Runs `task` on this scheduler, then schedules `reply(result)` onto
    /// `reply_to`. If the replying scheduler has been destroyed by the time
    /// the task completes, the reply is silently dropped.
    fn schedule_and_reply<T, F, R>(
        &self,
        tag: TaskTag,
        task: F,
        reply_to: SchedulerHandle,
        reply: R,
    ) -> Result<(), ScheduleError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        R: FnOnce(T) + Send + 'static,
    {
        self.schedule(
            tag,
            Box::new(move || {
                let value = task();
                reply_to.schedule(tag, Box::new(move || reply(value)));
            }),
        )
    }

    /// See [`Scheduler::schedule_release`].
    fn deferred_release<T: Send + 'static>(
        &self,
        tag: TaskTag,
        item: T,
    ) -> Result<(), ScheduleError> {
        self.schedule_release(tag, Box::new(item))
    }
}

impl<S: Scheduler + ?Sized> SchedulerExt for S {}

/// A weak, cloneable reference to a scheduler, passed explicitly wherever a
/// "post back to whoever called me" target is needed. Scheduling through an
/// expired handle is a silent no-op; that is the cancellation idiom for
/// replies.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Weak<dyn Scheduler>,
}

impl SchedulerHandle {
    pub fn new<S: Scheduler>(scheduler: &Arc<S>) -> Self {
        let weak = Arc::downgrade(scheduler);
        Self { inner: weak }
    }

    /// Whether the scheduler is still alive. Advisory only; it can expire
    /// between this check and a subsequent call.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Returns whether the task was accepted.
    pub fn schedule(&self, tag: TaskTag, task: Task) -> bool {
        match self.inner.upgrade() {
            Some(scheduler) => scheduler.schedule(tag, task).is_ok(),
            None => false,
        }
    }
}

/// Wraps `f` so that it is scheduled exactly once, no matter how many times
/// the returned closure is invoked, and not at all once the target scheduler
/// is gone. Used for one-shot callbacks such as "notify me once when a
/// missing image arrives", where the event source may fire repeatedly.
pub fn bind_once<F>(reply_to: SchedulerHandle, tag: TaskTag, f: F) -> impl FnMut() + Send
where
    F: FnOnce() + Send + 'static,
{
    let mut slot = Some(f);
    move || {
        if let Some(f) = slot.take() {
            reply_to.schedule(tag, Box::new(f));
        }
    }
}

/// Explicit cancellation signal owned by a scheduler and checked at the top
/// of deferred work. Cancellable without destroying the scheduler, which
/// keeps the idiom testable.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// The shared worker-pool scheduler, parallel across tags. Lives for the
/// remainder of the process; it is never torn down, so the deferred-release
/// destructor guarantee only applies to locally owned schedulers.
pub fn background() -> &'static Arc<ThreadedScheduler> {
    static BACKGROUND: OnceLock<Arc<ThreadedScheduler>> = OnceLock::new();
    BACKGROUND.get_or_init(|| Arc::new(ThreadedScheduler::new(4)))
}

/// The shared single-thread scheduler with strict global ordering across all
/// tags. Same process-lifetime caveat as [`background`].
pub fn sequenced() -> &'static Arc<SequencedScheduler> {
    static SEQUENCED: OnceLock<Arc<SequencedScheduler>> = OnceLock::new();
    SEQUENCED.get_or_init(|| Arc::new(SequencedScheduler::new()))
}

pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "task panicked"
    }
}
