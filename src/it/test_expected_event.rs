use {
    crate::it::test_error::TestResult,
    isnt::std_1::collections::IsntVecDequeExt,
    parking_lot::{Condvar, Mutex},
    std::{
        collections::VecDeque,
        sync::Arc,
        time::{Duration, Instant},
    },
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Collects events produced on other threads.
pub struct TestExpectedEvent<T> {
    data: Arc<TestExpectedEventData<T>>,
}

struct TestExpectedEventData<T> {
    events: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> Clone for TestExpectedEvent<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T: Send + 'static> TestExpectedEvent<T> {
    pub fn new() -> Self {
        Self {
            data: Arc::new(TestExpectedEventData {
                events: Default::default(),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn push(&self, t: T) {
        self.data.events.lock().push_back(t);
        self.data.cond.notify_all();
    }

    /// Returns a handler that records its argument.
    pub fn pusher(&self) -> impl Fn(T) + Send + Sync + 'static {
        let slf = self.clone();
        move |t| slf.push(t)
    }

    /// Waits for the next event.
    pub fn next(&self) -> TestResult<T> {
        let deadline = Instant::now() + TIMEOUT;
        let mut events = self.data.events.lock();
        loop {
            if let Some(t) = events.pop_front() {
                return Ok(t);
            }
            if self.data.cond.wait_until(&mut events, deadline).timed_out() {
                bail!("No event occurred");
            }
        }
    }

    pub fn none(&self) -> TestResult {
        if self.data.events.lock().is_not_empty() {
            bail!("There are unexpected events");
        }
        Ok(())
    }
}
