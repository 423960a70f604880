//! Presence tracking of bus names.

use {
    crate::{
        dbus::{
            Connection, DbusError, ERROR_NAME_HAS_NO_OWNER, ExecutionContext, Immediate, Signal,
            SubscriptionId, UnsupportedValue, Value,
            bus::{self, ADD_MATCH, GET_NAME_OWNER, name_owner_changed_rule},
            connection::{ConnectionInner, ObserverId},
            context::Mailbox,
            pending::{CallResult, CallSink, PendingEntry},
            types::is_valid_bus_name,
        },
        utils::errorfmt::ErrorFmt,
    },
    ahash::AHashMap,
    indexmap::IndexMap,
    std::{mem, sync::Arc},
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NameWatchEvent {
    /// The name has an owner with the given unique name.
    Appeared(String),
    Vanished,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum WatchState {
    Resolving,
    Present(String),
    Absent,
}

type Mailboxes = Vec<Arc<Mailbox<NameWatchEvent>>>;

struct WatchObserver {
    mailbox: Arc<Mailbox<NameWatchEvent>>,
    present: Option<bool>,
}

impl WatchObserver {
    fn appeared(&mut self, owner: &str, mailboxes: &mut Mailboxes) {
        if self.present != Some(true) {
            self.present = Some(true);
            self.mailbox.push(NameWatchEvent::Appeared(owner.to_string()));
            mailboxes.push(self.mailbox.clone());
        }
    }

    fn vanished(&mut self, mailboxes: &mut Mailboxes) {
        if self.present != Some(false) {
            self.present = Some(false);
            self.mailbox.push(NameWatchEvent::Vanished);
            mailboxes.push(self.mailbox.clone());
        }
    }

    fn apply(&mut self, state: &WatchState, mailboxes: &mut Mailboxes) {
        match state {
            WatchState::Resolving => {}
            WatchState::Present(owner) => self.appeared(owner, mailboxes),
            WatchState::Absent => self.vanished(mailboxes),
        }
    }
}

pub(super) struct WatchRecord {
    generation: u64,
    state: WatchState,
    subscription: SubscriptionId,
    observers: IndexMap<ObserverId, WatchObserver>,
}

impl WatchRecord {
    fn set_state(&mut self, state: WatchState, mailboxes: &mut Mailboxes) {
        if let (WatchState::Present(old), WatchState::Present(new)) = (&self.state, &state) {
            if old != new {
                for observer in self.observers.values_mut() {
                    observer.vanished(mailboxes);
                }
            }
        }
        for observer in self.observers.values_mut() {
            observer.apply(&state, mailboxes);
        }
        self.state = state;
    }
}

/// Delivers a final `Vanished` to every watcher of the records taken from a
/// dead connection.
pub(super) fn disconnect(watchers: AHashMap<String, WatchRecord>) {
    let mut mailboxes = vec![];
    for (_, mut record) in watchers {
        for observer in record.observers.values_mut() {
            observer.vanished(&mut mailboxes);
        }
    }
    flush(mailboxes);
}

fn flush(mailboxes: Mailboxes) {
    for mailbox in mailboxes {
        mailbox.flush();
    }
}

/// Tracks the owner of a bus name.
///
/// The first event reports the state found by `GetNameOwner`. Events
/// alternate between `Appeared` and `Vanished`. If the owner changes from one
/// connection to another, `Vanished` is followed by `Appeared`.
pub struct NameWatcher {
    conn: Connection,
    name: String,
    generation: u64,
    observer: ObserverId,
    stopped: bool,
}

impl Connection {
    /// Starts tracking `name`. `handler` runs on `ctx` for every change.
    pub fn watch_name<F>(
        &self,
        name: &str,
        ctx: Arc<dyn ExecutionContext>,
        handler: F,
    ) -> Result<NameWatcher, DbusError>
    where
        F: Fn(NameWatchEvent) + Send + Sync + 'static,
    {
        if !is_valid_bus_name(name) {
            return Err(UnsupportedValue::InvalidBusName(name.to_string()).into());
        }
        let inner = &self.inner;
        let msg = bus::method(GET_NAME_OWNER).message(&[Value::from(name)])?;
        let mailbox = Mailbox::new(ctx, Arc::new(handler));
        let mut mailboxes = vec![];
        let guard = inner.lock_send();
        let (generation, observer, created) = {
            let mut state = inner.state.lock();
            let state = &mut *state;
            if state.dead {
                return Err(DbusError::Disconnected);
            }
            let id = state.observer_ids.next();
            let mut observer = WatchObserver {
                mailbox: mailbox.clone(),
                present: None,
            };
            let generation = state.next_generation();
            match state.watchers.get_mut(name) {
                Some(record) => {
                    observer.apply(&record.state, &mut mailboxes);
                    record.observers.insert(id, observer);
                    (record.generation, id, None)
                }
                None => {
                    let rule = name_owner_changed_rule(name);
                    let handler = {
                        let conn = Arc::downgrade(inner);
                        let name = name.to_string();
                        Arc::new(move |signal: &Signal| {
                            if let Some(conn) = conn.upgrade() {
                                owner_changed(&conn, &name, generation, signal);
                            }
                        })
                    };
                    let (subscription, register) =
                        state
                            .subscriptions
                            .add(rule.clone(), Arc::new(Immediate), handler);
                    let mut observers = IndexMap::new();
                    observers.insert(id, observer);
                    let record = WatchRecord {
                        generation,
                        state: WatchState::Resolving,
                        subscription,
                        observers,
                    };
                    state.watchers.insert(name.to_string(), record);
                    let register = register.then_some(rule);
                    (generation, id, Some((subscription, register)))
                }
            }
        };
        if let Some((subscription, register)) = created {
            log::debug!("{}: Watching name {}", inner.prefix, name);
            if let Some(rule) = register {
                inner.send_match(&guard, ADD_MATCH, &rule);
            }
            let conn = Arc::downgrade(inner);
            let owned = name.to_string();
            let sink = CallSink::Callback {
                ctx: Arc::new(Immediate),
                f: Box::new(move |res| {
                    if let Some(conn) = conn.upgrade() {
                        resolved(&conn, &owned, generation, res);
                    }
                }),
            };
            let entry = PendingEntry::new(sink);
            let timeout = inner.config.default_timeout();
            if let Err(e) = inner.send_locked(&guard, msg, Some(entry), timeout) {
                let record = {
                    let mut state = inner.state.lock();
                    let ours = state
                        .watchers
                        .get(name)
                        .is_some_and(|r| r.generation == generation);
                    match ours {
                        true => state.watchers.remove(name),
                        false => None,
                    }
                };
                inner.unsubscribe(subscription);
                drop(guard);
                drop(record);
                return Err(e);
            }
        }
        drop(guard);
        flush(mailboxes);
        Ok(NameWatcher {
            conn: self.clone(),
            name: name.to_string(),
            generation,
            observer,
            stopped: false,
        })
    }
}

fn resolved(conn: &ConnectionInner, name: &str, generation: u64, res: CallResult) {
    let owner = match res {
        Ok(reply) => match reply.expect_signature("s") {
            Ok(()) => reply.body.into_iter().next().and_then(|v| v.into_string()),
            Err(e) => {
                log::error!("{}: Unexpected reply to GetNameOwner: {}", conn.prefix, ErrorFmt(e));
                None
            }
        },
        Err(e) if e.remote_name() == Some(ERROR_NAME_HAS_NO_OWNER) => None,
        Err(e) => {
            log::warn!(
                "{}: Could not resolve the owner of {}: {}",
                conn.prefix,
                name,
                ErrorFmt(e),
            );
            None
        }
    };
    let mut mailboxes = vec![];
    {
        let mut state = conn.state.lock();
        let Some(record) = state.watchers.get_mut(name) else {
            return;
        };
        if record.generation != generation || record.state != WatchState::Resolving {
            return;
        }
        let new = match owner {
            Some(owner) => WatchState::Present(owner),
            None => WatchState::Absent,
        };
        log::debug!("{}: Name {} is {:?}", conn.prefix, name, new);
        record.set_state(new, &mut mailboxes);
    }
    flush(mailboxes);
}

fn owner_changed(conn: &ConnectionInner, name: &str, generation: u64, signal: &Signal) {
    let [Value::String(_), Value::String(_), Value::String(new_owner)] = &signal.body[..] else {
        log::warn!("{}: Ignoring malformed NameOwnerChanged signal", conn.prefix);
        return;
    };
    let mut mailboxes = vec![];
    {
        let mut state = conn.state.lock();
        let Some(record) = state.watchers.get_mut(name) else {
            return;
        };
        if record.generation != generation || record.state == WatchState::Resolving {
            return;
        }
        let new = match new_owner.is_empty() {
            true => WatchState::Absent,
            false => WatchState::Present(new_owner.clone()),
        };
        log::debug!("{}: Name {} is {:?}", conn.prefix, name, new);
        record.set_state(new, &mut mailboxes);
    }
    flush(mailboxes);
}

impl NameWatcher {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current owner as far as this connection knows.
    pub fn owner(&self) -> Option<String> {
        let state = self.conn.inner.state.lock();
        match state.watchers.get(&self.name) {
            Some(r) if r.generation == self.generation => match &r.state {
                WatchState::Present(owner) => Some(owner.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Stops tracking. If the name was present, a final `Vanished` is
    /// delivered.
    pub fn unwatch(mut self) {
        self.unwatch_();
    }

    fn unwatch_(&mut self) {
        if mem::replace(&mut self.stopped, true) {
            return;
        }
        let inner = &self.conn.inner;
        let mut mailboxes = vec![];
        let guard = inner.lock_send();
        let (record, observer) = {
            let mut state = inner.state.lock();
            let Some(record) = state.watchers.get_mut(&self.name) else {
                return;
            };
            if record.generation != self.generation {
                return;
            }
            let mut observer = record.observers.shift_remove(&self.observer);
            if let Some(observer) = &mut observer {
                if observer.present == Some(true) {
                    observer.vanished(&mut mailboxes);
                }
            }
            let record = match record.observers.is_empty() {
                true => state.watchers.remove(&self.name),
                false => None,
            };
            (record, observer)
        };
        drop(observer);
        if let Some(record) = record {
            log::debug!("{}: No longer watching name {}", inner.prefix, self.name);
            inner.unsubscribe(record.subscription);
        }
        drop(guard);
        flush(mailboxes);
    }
}

impl Drop for NameWatcher {
    fn drop(&mut self) {
        self.unwatch_();
    }
}
