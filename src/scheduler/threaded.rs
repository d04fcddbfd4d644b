//! Worker-pool scheduler with per-tag FIFO mailboxes.

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    panic,
    panic::AssertUnwindSafe,
    sync::{Arc, Condvar, Mutex},
    thread,
    thread::{JoinHandle, ThreadId},
};

use super::{describe_panic, CancellationToken, PanicHandler, ScheduleError, Scheduler, Task, TaskTag};

enum Job {
    Run(Task),
    /// Dropping the payload is the work.
    Release(Box<dyn Any + Send>),
}

#[derive(Default)]
struct Mailbox {
    queue: VecDeque<Job>,
    /// Whether a worker is currently executing a job from this mailbox. At
    /// most one may be, which is what serializes a tag.
    running: bool,
}

#[derive(Default)]
struct State {
    /// Mailboxes are created on first use and removed once drained, so a
    /// present entry means queued or in-flight work for that tag.
    mailboxes: HashMap<TaskTag, Mailbox>,
    /// Tags with a non-running mailbox and at least one queued job, each
    /// present at most once.
    ready: VecDeque<TaskTag>,
    shutdown: bool,
    pending_releases: usize,
}

struct Shared {
    state: Mutex<State>,
    work_available: Condvar,
    /// Notified when a mailbox drains or a deferred release completes.
    idle: Condvar,
    panic_handler: Mutex<Option<PanicHandler>>,
    token: CancellationToken,
    worker_ids: Mutex<Vec<ThreadId>>,
}

impl Shared {
    fn report_panic(&self, payload: Box<dyn Any + Send>) {
        let message = describe_panic(payload.as_ref());
        let handler = self.panic_handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(message),
            None => log::error!("scheduler task panicked: {message}"),
        }
    }
}

/// A scheduler backed by a pool of worker threads.
///
/// Tasks under one tag run in submission order, never concurrently with each
/// other; independent tags run in parallel across the pool. Dropping the
/// scheduler blocks until every pending [`deferred
/// release`](Scheduler::schedule_release) has completed, then drains the
/// remaining queues and joins the workers.
pub struct ThreadedScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadedScheduler {
    pub fn new(thread_count: usize) -> Self {
        assert!(thread_count > 0);
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            work_available: Condvar::new(),
            idle: Condvar::new(),
            panic_handler: Mutex::new(None),
            token: CancellationToken::new(),
            worker_ids: Mutex::new(Vec::with_capacity(thread_count)),
        });

        let workers = (0..thread_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("maprender-worker-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn scheduler worker")
            })
            .collect();

        Self { shared, workers }
    }

    fn enqueue(&self, tag: TaskTag, job: Job) -> Result<(), ScheduleError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return Err(ScheduleError::ShutDown);
        }
        if let Job::Release(_) = job {
            state.pending_releases += 1;
        }
        let mailbox = state.mailboxes.entry(tag).or_default();
        mailbox.queue.push_back(job);
        if !mailbox.running && mailbox.queue.len() == 1 {
            state.ready.push_back(tag);
            self.shared.work_available.notify_one();
        }
        Ok(())
    }

    fn is_worker_thread(&self) -> bool {
        self.shared
            .worker_ids
            .lock()
            .unwrap()
            .contains(&thread::current().id())
    }

    #[cfg(test)]
    pub(crate) fn begin_shutdown_for_test(&self) {
        self.shared.state.lock().unwrap().shutdown = true;
    }
}

impl Scheduler for ThreadedScheduler {
    fn schedule(&self, tag: TaskTag, task: Task) -> Result<(), ScheduleError> {
        self.enqueue(tag, Job::Run(task))
    }

    fn schedule_release(&self, tag: TaskTag, item: Box<dyn Any + Send>) -> Result<(), ScheduleError> {
        self.enqueue(tag, Job::Release(item))
    }

    fn wait_for_empty(&self, tag: Option<TaskTag>) {
        // Waiting from a worker would deadlock: the queue can never drain
        // while its observer occupies a worker slot.
        debug_assert!(!self.is_worker_thread());

        let mut state = self.shared.state.lock().unwrap();
        loop {
            let empty = match tag {
                Some(tag) => !state.mailboxes.contains_key(&tag),
                None => state.mailboxes.is_empty() && state.pending_releases == 0,
            };
            if empty {
                return;
            }
            state = self.shared.idle.wait(state).unwrap();
        }
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.shared.token.clone()
    }

    fn set_panic_handler(&self, handler: PanicHandler) {
        *self.shared.panic_handler.lock().unwrap() = Some(handler);
    }
}

impl Drop for ThreadedScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            // Deferred releases must complete on our threads before they go
            // away; block here until the counter drains.
            while state.pending_releases > 0 {
                state = self.shared.idle.wait(state).unwrap();
            }
            state.shutdown = true;
        }
        self.shared.token.cancel();
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    shared.worker_ids.lock().unwrap().push(thread::current().id());

    loop {
        let (tag, job) = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(tag) = state.ready.pop_front() {
                    let mailbox = state
                        .mailboxes
                        .get_mut(&tag)
                        .expect("ready tag without mailbox");
                    debug_assert!(!mailbox.running);
                    let job = mailbox.queue.pop_front().expect("ready tag with empty mailbox");
                    mailbox.running = true;
                    break (tag, job);
                }
                if state.shutdown {
                    return;
                }
                state = shared.work_available.wait(state).unwrap();
            }
        };

        let is_release = matches!(job, Job::Release(_));
        let result = panic::catch_unwind(AssertUnwindSafe(|| match job {
            Job::Run(task) => task(),
            Job::Release(item) => drop(item),
        }));
        if let Err(payload) = result {
            shared.report_panic(payload);
        }

        let mut state = shared.state.lock().unwrap();
        if is_release {
            state.pending_releases -= 1;
        }
        let mailbox = state.mailboxes.get_mut(&tag).expect("mailbox vanished mid-task");
        mailbox.running = false;
        if mailbox.queue.is_empty() {
            state.mailboxes.remove(&tag);
            shared.idle.notify_all();
        } else {
            state.ready.push_back(tag);
            shared.work_available.notify_one();
            if is_release {
                shared.idle.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc, Mutex,
        },
        thread,
        time::Duration,
    };

    use super::ThreadedScheduler;
    use crate::scheduler::{Scheduler, SchedulerExt, TaskTag};

    #[test]
    fn tasks_under_one_tag_run_in_submission_order() {
        let scheduler = ThreadedScheduler::new(4);
        let tag = TaskTag::unique();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let order = Arc::clone(&order);
            scheduler
                .schedule(tag, Box::new(move || order.lock().unwrap().push(i)))
                .unwrap();
        }
        scheduler.wait_for_empty(Some(tag));

        let order = order.lock().unwrap();
        assert_eq!(*order, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn tasks_under_one_tag_never_overlap() {
        let scheduler = ThreadedScheduler::new(4);
        let tag = TaskTag::unique();
        let active = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let active = Arc::clone(&active);
            scheduler
                .schedule(
                    tag,
                    Box::new(move || {
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        active.fetch_sub(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }
        scheduler.wait_for_empty(Some(tag));
    }

    #[test]
    fn independent_tags_may_run_concurrently() {
        let scheduler = ThreadedScheduler::new(2);
        let tag_a = TaskTag::unique();
        let tag_b = TaskTag::unique();

        // The task under tag A cannot finish until the task under tag B has
        // run. With per-tag serialization but cross-tag parallelism this
        // completes; if tags could not interleave it would deadlock.
        let (sender, receiver) = mpsc::channel();
        scheduler
            .schedule(
                tag_a,
                Box::new(move || {
                    receiver
                        .recv_timeout(Duration::from_secs(10))
                        .expect("tag B never ran concurrently with tag A");
                }),
            )
            .unwrap();
        scheduler
            .schedule(tag_b, Box::new(move || sender.send(()).unwrap()))
            .unwrap();

        scheduler.wait_for_empty(None);
    }

    #[test]
    fn wait_for_empty_scopes_to_the_requested_tag() {
        let scheduler = ThreadedScheduler::new(2);
        let blocked_tag = TaskTag::unique();
        let quick_tag = TaskTag::unique();

        let (release, gate) = mpsc::channel::<()>();
        scheduler
            .schedule(
                blocked_tag,
                Box::new(move || {
                    gate.recv().ok();
                }),
            )
            .unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_task = Arc::clone(&ran);
        scheduler
            .schedule(quick_tag, Box::new(move || {
                ran_in_task.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        // Returns even though the other tag is still blocked.
        scheduler.wait_for_empty(Some(quick_tag));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        release.send(()).unwrap();
        scheduler.wait_for_empty(None);
    }

    #[test]
    fn destructor_blocks_on_pending_deferred_releases() {
        struct SlowRelease {
            gate: mpsc::Receiver<()>,
            dropped: mpsc::Sender<()>,
        }
        impl Drop for SlowRelease {
            fn drop(&mut self) {
                self.gate.recv().ok();
                self.dropped.send(()).ok();
            }
        }

        let scheduler = ThreadedScheduler::new(2);
        let tag = TaskTag::unique();
        let (release, gate) = mpsc::channel();
        let (dropped_tx, dropped_rx) = mpsc::channel();
        scheduler
            .deferred_release(
                tag,
                SlowRelease {
                    gate,
                    dropped: dropped_tx,
                },
            )
            .unwrap();

        let (destroyed_tx, destroyed_rx) = mpsc::channel();
        let destroyer = thread::spawn(move || {
            drop(scheduler);
            destroyed_tx.send(()).ok();
        });

        // The destructor must not return while the release is still pending.
        assert!(destroyed_rx.recv_timeout(Duration::from_millis(100)).is_err());

        release.send(()).unwrap();
        destroyed_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("destructor never returned");
        dropped_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("deferred item was never dropped");
        destroyer.join().unwrap();
    }

    #[test]
    fn a_panicking_task_is_reported_and_the_worker_continues() {
        let _ = env_logger::builder().is_test(true).try_init();
        let scheduler = ThreadedScheduler::new(1);
        let tag = TaskTag::unique();

        let reported = Arc::new(Mutex::new(Vec::new()));
        let reported_in_handler = Arc::clone(&reported);
        scheduler.set_panic_handler(Arc::new(move |message| {
            reported_in_handler.lock().unwrap().push(message.to_string());
        }));

        let survived = Arc::new(AtomicUsize::new(0));
        let survived_in_task = Arc::clone(&survived);
        scheduler
            .schedule(tag, Box::new(|| panic!("broken tile")))
            .unwrap();
        scheduler
            .schedule(tag, Box::new(move || {
                survived_in_task.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        scheduler.wait_for_empty(Some(tag));

        assert_eq!(*reported.lock().unwrap(), vec!["broken tile".to_string()]);
        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }
}
