use {
    ahash::AHashMap,
    parking_lot::{Condvar, Mutex},
    std::{
        cmp::Reverse,
        collections::BinaryHeap,
        io,
        sync::Arc,
        thread,
        time::Instant,
    },
};


linear_ids!(TimerIds, TimerId);

/// Cancelled entries stay in the heap until it holds this many more entries
/// than live callbacks.
const PRUNE_SLACK: usize = 64;

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd)]
struct TimerEntry {
    expiration: Instant,
    id: TimerId,
}

#[derive(Default)]
struct TimerState {
    started: bool,
    destroyed: bool,
    expirations: BinaryHeap<Reverse<TimerEntry>>,
    dispatchers: AHashMap<TimerId, Box<dyn FnOnce() + Send>>,
}

#[derive(Default)]
struct TimerData {
    ids: TimerIds,
    state: Mutex<TimerState>,
    cond: Condvar,
    #[cfg(test)]
    fail_spawn: std::sync::atomic::AtomicBool,
}

/// Runs callbacks at deadlines on a dedicated thread.
///
/// The thread is started on first use and exits when the timer is dropped.
pub(super) struct Timer {
    name: String,
    data: Arc<TimerData>,
}

impl Timer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data: Default::default(),
        }
    }

    /// Fails only if the timer thread cannot be started. A later call tries
    /// again.
    pub fn schedule(
        &self,
        expiration: Instant,
        f: Box<dyn FnOnce() + Send>,
    ) -> Result<TimerId, io::Error> {
        let mut state = self.data.state.lock();
        if !state.started {
            self.spawn()?;
            state.started = true;
        }
        let id = self.data.ids.next();
        state.expirations.push(Reverse(TimerEntry { expiration, id }));
        state.dispatchers.insert(id, f);
        self.data.cond.notify_all();
        Ok(id)
    }

    fn spawn(&self) -> Result<(), io::Error> {
        #[cfg(test)]
        if self
            .data
            .fail_spawn
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            return Err(io::Error::other("spawning is disabled"));
        }
        let data = self.data.clone();
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || dispatch(&data))
            .map(drop)
    }

    /// Returns whether the callback had not yet run.
    pub fn cancel(&self, id: TimerId) -> bool {
        let f = {
            let mut state = self.data.state.lock();
            let state = &mut *state;
            let f = state.dispatchers.remove(&id);
            if state.expirations.len() > 2 * state.dispatchers.len() + PRUNE_SLACK {
                let live = &state.dispatchers;
                state.expirations.retain(|Reverse(e)| live.contains_key(&e.id));
            }
            f
        };
        f.is_some()
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.data.state.lock().expirations.len()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let mut state = self.data.state.lock();
        state.destroyed = true;
        state.dispatchers.clear();
        self.data.cond.notify_all();
    }
}

fn dispatch(data: &TimerData) {
    let mut state = data.state.lock();
    loop {
        if state.destroyed {
            return;
        }
        let Some(Reverse(next)) = state.expirations.peek() else {
            data.cond.wait(&mut state);
            continue;
        };
        let expiration = next.expiration;
        if expiration > Instant::now() {
            data.cond.wait_until(&mut state, expiration);
            continue;
        }
        let Some(Reverse(entry)) = state.expirations.pop() else {
            continue;
        };
        if let Some(f) = state.dispatchers.remove(&entry.id) {
            drop(state);
            f();
            state = data.state.lock();
        }
    }
}
