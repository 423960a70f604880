use {
    parking_lot::{Condvar, Mutex},
    run_on_drop::on_drop,
    std::{
        collections::VecDeque,
        io,
        sync::Arc,
        thread::{self, JoinHandle, ThreadId},
    },
};

#[cfg(test)]
mod tests;

pub type Job = Box<dyn FnOnce() + Send>;

/// Where handlers and completions run.
///
/// Jobs scheduled on the same context must run in the order they were
/// scheduled. The connection never holds its lock while scheduling.
pub trait ExecutionContext: Send + Sync {
    fn schedule(&self, job: Job);
}

/// Runs jobs on the thread that schedules them.
pub struct Immediate;

impl ExecutionContext for Immediate {
    fn schedule(&self, job: Job) {
        job();
    }
}

#[derive(Default)]
struct WorkerState {
    jobs: VecDeque<Job>,
    running: bool,
    stopped: bool,
}

#[derive(Default)]
struct WorkerShared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

/// Runs jobs on a dedicated thread.
pub struct WorkerThread {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
    id: ThreadId,
}

impl WorkerThread {
    pub fn new(name: &str) -> Result<Arc<Self>, io::Error> {
        let shared = Arc::new(WorkerShared::default());
        let thread = thread::Builder::new().name(name.to_string()).spawn({
            let shared = shared.clone();
            move || work(&shared)
        })?;
        Ok(Arc::new(Self {
            shared,
            id: thread.thread().id(),
            thread: Some(thread),
        }))
    }

    /// Blocks until all scheduled jobs have run.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.running || state.jobs.len() > 0 {
            self.shared.cond.wait(&mut state);
        }
    }
}

fn work(shared: &WorkerShared) {
    let mut state = shared.state.lock();
    loop {
        if let Some(job) = state.jobs.pop_front() {
            state.running = true;
            drop(state);
            let done = on_drop(|| {
                shared.state.lock().running = false;
                shared.cond.notify_all();
            });
            job();
            drop(done);
            state = shared.state.lock();
            continue;
        }
        if state.stopped {
            return;
        }
        shared.cond.wait(&mut state);
    }
}

impl ExecutionContext for WorkerThread {
    fn schedule(&self, job: Job) {
        let mut state = self.shared.state.lock();
        state.jobs.push_back(job);
        self.shared.cond.notify_all();
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shared.state.lock().stopped = true;
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread::current().id() != self.id {
                let _ = thread.join();
            }
        }
    }
}

/// Collects jobs until the owner runs them with [`LocalQueue::run_pending`].
#[derive(Default)]
pub struct LocalQueue {
    jobs: Mutex<VecDeque<Job>>,
}

impl LocalQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs jobs until the queue is empty, including jobs scheduled by the
    /// jobs themselves. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let mut n = 0;
        loop {
            let Some(job) = self.jobs.lock().pop_front() else {
                return n;
            };
            job();
            n += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }
}

impl ExecutionContext for LocalQueue {
    fn schedule(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }
}

struct MailboxState<E> {
    queue: VecDeque<E>,
    draining: bool,
}

/// Serializes the events of a single observer.
///
/// Events are queued with [`Mailbox::push`] while the connection lock is
/// held, which fixes their order. [`Mailbox::flush`] is called after the lock
/// has been released and delivers them on the observer's context. At most one
/// drain job per mailbox exists at any time.
pub(super) struct Mailbox<E> {
    ctx: Arc<dyn ExecutionContext>,
    handler: Arc<dyn Fn(E) + Send + Sync>,
    state: Mutex<MailboxState<E>>,
}

impl<E: Send + 'static> Mailbox<E> {
    pub fn new(ctx: Arc<dyn ExecutionContext>, handler: Arc<dyn Fn(E) + Send + Sync>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            handler,
            state: Mutex::new(MailboxState {
                queue: VecDeque::new(),
                draining: false,
            }),
        })
    }

    pub fn push(&self, event: E) {
        self.state.lock().queue.push_back(event);
    }

    pub fn flush(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.draining || state.queue.is_empty() {
                return;
            }
            state.draining = true;
        }
        let slf = self.clone();
        self.ctx.schedule(Box::new(move || slf.drain()));
    }

    fn drain(&self) {
        loop {
            let event = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(e) => e,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            (self.handler)(event);
        }
    }
}
