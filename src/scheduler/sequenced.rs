//! Single-thread scheduler with strict global ordering.

use std::{
    any::Any,
    collections::HashMap,
    panic,
    panic::AssertUnwindSafe,
    sync::{Arc, Condvar, Mutex},
    thread,
    thread::JoinHandle,
};

use crossbeam_channel::{Receiver, Sender};

use super::{describe_panic, CancellationToken, PanicHandler, ScheduleError, Scheduler, Task, TaskTag};

enum Job {
    Run(Task),
    Release(Box<dyn Any + Send>),
}

#[derive(Default)]
struct State {
    /// Queued-or-running job count per tag, plus the overall total.
    in_flight: HashMap<TaskTag, usize>,
    total: usize,
    pending_releases: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    idle: Condvar,
    panic_handler: Mutex<Option<PanicHandler>>,
    token: CancellationToken,
}

/// A scheduler that executes everything on one thread, in exact submission
/// order across all tags.
///
/// Where [`ThreadedScheduler`](super::ThreadedScheduler) trades ordering
/// between tags for parallelism, this one exists for the opposite need:
/// funneling many callers onto a single thread-unsafe resource (a database
/// handle, a foreign API with thread affinity) with one global timeline.
pub struct SequencedScheduler {
    shared: Arc<Shared>,
    sender: Option<Sender<(TaskTag, Job)>>,
    thread: Option<JoinHandle<()>>,
}

impl SequencedScheduler {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            idle: Condvar::new(),
            panic_handler: Mutex::new(None),
            token: CancellationToken::new(),
        });

        let (sender, receiver) = crossbeam_channel::unbounded();
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("maprender-sequenced".to_string())
                .spawn(move || executor_loop(shared, receiver))
                .expect("failed to spawn sequenced scheduler thread")
        };

        Self {
            shared,
            sender: Some(sender),
            thread: Some(thread),
        }
    }

    fn submit(&self, tag: TaskTag, job: Job) -> Result<(), ScheduleError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return Err(ScheduleError::ShutDown);
            }
            *state.in_flight.entry(tag).or_insert(0) += 1;
            state.total += 1;
            if let Job::Release(_) = job {
                state.pending_releases += 1;
            }
        }
        self.sender
            .as_ref()
            .expect("sender taken before drop")
            .send((tag, job))
            .map_err(|_| ScheduleError::ShutDown)
    }

    fn is_executor_thread(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| thread.thread().id() == thread::current().id())
            .unwrap_or(false)
    }
}

impl Default for SequencedScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for SequencedScheduler {
    fn schedule(&self, tag: TaskTag, task: Task) -> Result<(), ScheduleError> {
        self.submit(tag, Job::Run(task))
    }

    fn schedule_release(&self, tag: TaskTag, item: Box<dyn Any + Send>) -> Result<(), ScheduleError> {
        self.submit(tag, Job::Release(item))
    }

    fn wait_for_empty(&self, tag: Option<TaskTag>) {
        debug_assert!(!self.is_executor_thread());

        let mut state = self.shared.state.lock().unwrap();
        loop {
            let empty = match tag {
                Some(tag) => !state.in_flight.contains_key(&tag),
                None => state.total == 0,
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

impl Drop for SequencedScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            while state.pending_releases > 0 {
                state = self.shared.idle.wait(state).unwrap();
            }
        }
        self.shared.token.cancel();
        // Disconnecting the channel ends the executor loop after it drains
        // everything already submitted.
        drop(self.sender.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn executor_loop(shared: Arc<Shared>, receiver: Receiver<(TaskTag, Job)>) {
    for (tag, job) in receiver.iter() {
        let is_release = matches!(job, Job::Release(_));
        let result = panic::catch_unwind(AssertUnwindSafe(|| match job {
            Job::Run(task) => task(),
            Job::Release(item) => drop(item),
        }));
        if let Err(payload) = result {
            let message = describe_panic(payload.as_ref());
            let handler = shared.panic_handler.lock().unwrap().clone();
            match handler {
                Some(handler) => handler(message),
                None => log::error!("sequenced task panicked: {message}"),
            }
        }

        let mut state = shared.state.lock().unwrap();
        if is_release {
            state.pending_releases -= 1;
        }
        let count = state.in_flight.get_mut(&tag).expect("job without in-flight count");
        *count -= 1;
        if *count == 0 {
            state.in_flight.remove(&tag);
        }
        state.total -= 1;
        shared.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::SequencedScheduler;
    use crate::scheduler::{Scheduler, SchedulerExt, TaskTag};

    #[test]
    fn all_tags_share_one_global_order() {
        let scheduler = SequencedScheduler::new();
        let tag_a = TaskTag::unique();
        let tag_b = TaskTag::unique();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let order = Arc::clone(&order);
            let tag = if i % 2 == 0 { tag_a } else { tag_b };
            scheduler
                .schedule(tag, Box::new(move || order.lock().unwrap().push(i)))
                .unwrap();
        }
        scheduler.wait_for_empty(None);

        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn deferred_release_runs_before_destruction_completes() {
        struct Flagged(Arc<Mutex<bool>>);
        impl Drop for Flagged {
            fn drop(&mut self) {
                *self.0.lock().unwrap() = true;
            }
        }

        let dropped = Arc::new(Mutex::new(false));
        let scheduler = SequencedScheduler::new();
        scheduler
            .deferred_release(TaskTag::unique(), Flagged(Arc::clone(&dropped)))
            .unwrap();
        drop(scheduler);

        assert!(*dropped.lock().unwrap());
    }

    #[test]
    fn wait_for_empty_scopes_to_a_tag() {
        let scheduler = SequencedScheduler::new();
        let tag = TaskTag::unique();
        scheduler.schedule(tag, Box::new(|| {})).unwrap();
        scheduler.wait_for_empty(Some(tag));
        scheduler.wait_for_empty(None);
    }
}
