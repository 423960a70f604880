//! Well-known name ownership.
//!
//! All [`NameOwner`]s for the same name on a connection share one record and
//! one `RequestName` call. Each owner sees an alternating sequence of
//! [`NameOwnerEvent`]s: `Lost` never follows `Lost` and `Acquired` never
//! follows `Acquired`.

use {
    crate::{
        dbus::{
            Connection, DbusError, ExecutionContext, Immediate, ReleaseNameReply,
            RequestNameFlags, RequestNameReply, Signal, SubscriptionId, UnsupportedValue, Value,
            bus::{self, RELEASE_NAME, REQUEST_NAME, name_acquired_rule, name_lost_rule},
            connection::{ConnectionInner, ObserverId, SendGuard},
            context::Mailbox,
            pending::{CallResult, CallSink, PendingCall, PendingEntry},
            subscriptions::SignalHandler,
            types::is_valid_bus_name,
        },
        utils::errorfmt::ErrorFmt,
    },
    ahash::AHashMap,
    indexmap::IndexMap,
    std::{
        mem,
        sync::{Arc, Weak},
    },
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NameOwnerEvent {
    Acquired,
    Lost,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum OwnerState {
    Requesting,
    Owner,
    Queued,
    Denied,
}

type Mailboxes = Vec<Arc<Mailbox<NameOwnerEvent>>>;

struct OwnerObserver {
    mailbox: Arc<Mailbox<NameOwnerEvent>>,
    last: Option<NameOwnerEvent>,
}

impl OwnerObserver {
    fn notify(&mut self, event: NameOwnerEvent, mailboxes: &mut Mailboxes) {
        if self.last != Some(event) {
            self.last = Some(event);
            self.mailbox.push(event);
            mailboxes.push(self.mailbox.clone());
        }
    }
}

pub(super) struct OwnerRecord {
    generation: u64,
    flags: RequestNameFlags,
    state: OwnerState,
    subscriptions: Vec<SubscriptionId>,
    observers: IndexMap<ObserverId, OwnerObserver>,
}

impl OwnerRecord {
    fn event(&self) -> Option<NameOwnerEvent> {
        match self.state {
            OwnerState::Requesting => None,
            OwnerState::Owner => Some(NameOwnerEvent::Acquired),
            OwnerState::Queued | OwnerState::Denied => Some(NameOwnerEvent::Lost),
        }
    }

    fn notify_all(&mut self, mailboxes: &mut Mailboxes) {
        if let Some(event) = self.event() {
            for observer in self.observers.values_mut() {
                observer.notify(event, mailboxes);
            }
        }
    }
}

/// Delivers a final `Lost` to every owner of the records taken from a dead
/// connection.
pub(super) fn disconnect(owners: AHashMap<String, OwnerRecord>) {
    let mut mailboxes = vec![];
    for (_, mut record) in owners {
        for observer in record.observers.values_mut() {
            observer.notify(NameOwnerEvent::Lost, &mut mailboxes);
        }
    }
    flush(mailboxes);
}

fn flush(mailboxes: Mailboxes) {
    for mailbox in mailboxes {
        mailbox.flush();
    }
}

/// A claim on a well-known name.
///
/// Dropping the handle releases the claim. The last claim for a name sends
/// `ReleaseName`.
pub struct NameOwner {
    conn: Connection,
    name: String,
    generation: u64,
    observer: ObserverId,
    released: bool,
}

impl Connection {
    /// Requests ownership of `name`.
    ///
    /// `handler` runs on `ctx` whenever ownership changes. If another owner
    /// for the same name already exists on this connection, the handle joins
    /// it and `flags` are ignored.
    pub fn own_name<F>(
        &self,
        name: &str,
        flags: RequestNameFlags,
        ctx: Arc<dyn ExecutionContext>,
        handler: F,
    ) -> Result<NameOwner, DbusError>
    where
        F: Fn(NameOwnerEvent) + Send + Sync + 'static,
    {
        if !is_valid_bus_name(name) || name.starts_with(':') {
            return Err(UnsupportedValue::InvalidBusName(name.to_string()).into());
        }
        let inner = &self.inner;
        let msg = bus::method(REQUEST_NAME).message(&[Value::from(name), Value::U32(flags.0)])?;
        let mailbox = Mailbox::new(ctx, Arc::new(handler));
        let mut mailboxes = vec![];
        let guard = inner.lock_send();
        let (generation, observer, request) = {
            let mut state = inner.state.lock();
            if state.dead {
                return Err(DbusError::Disconnected);
            }
            let id = state.observer_ids.next();
            let mut observer = OwnerObserver {
                mailbox: mailbox.clone(),
                last: None,
            };
            let generation = state.next_generation();
            match state.owners.get_mut(name) {
                Some(record) => {
                    if record.flags != flags {
                        log::warn!(
                            "{}: Name {} is already requested with flags {:?}. Ignoring flags {:?}",
                            inner.prefix,
                            name,
                            record.flags,
                            flags,
                        );
                    }
                    if let Some(event) = record.event() {
                        observer.notify(event, &mut mailboxes);
                    }
                    record.observers.insert(id, observer);
                    (record.generation, id, false)
                }
                None => {
                    let mut observers = IndexMap::new();
                    observers.insert(id, observer);
                    let record = OwnerRecord {
                        generation,
                        flags,
                        state: OwnerState::Requesting,
                        subscriptions: vec![],
                        observers,
                    };
                    state.owners.insert(name.to_string(), record);
                    (generation, id, true)
                }
            }
        };
        if request {
            log::debug!("{}: Requesting name {} with flags {:?}", inner.prefix, name, flags);
            let conn = Arc::downgrade(inner);
            let owned = name.to_string();
            let sink = CallSink::Callback {
                ctx: Arc::new(Immediate),
                f: Box::new(move |res| {
                    if let Some(conn) = conn.upgrade() {
                        request_name_reply(&conn, &owned, generation, res);
                    }
                }),
            };
            let entry = PendingEntry::new(sink);
            let timeout = inner.config.default_timeout();
            if let Err(e) = inner.send_locked(&guard, msg, Some(entry), timeout) {
                let record = {
                    let mut state = inner.state.lock();
                    let ours = state
                        .owners
                        .get(name)
                        .is_some_and(|r| r.generation == generation);
                    match ours {
                        true => state.owners.remove(name),
                        false => None,
                    }
                };
                drop(guard);
                drop(record);
                return Err(e);
            }
        }
        drop(guard);
        flush(mailboxes);
        Ok(NameOwner {
            conn: self.clone(),
            name: name.to_string(),
            generation,
            observer,
            released: false,
        })
    }
}

fn request_name_reply(conn: &Arc<ConnectionInner>, name: &str, generation: u64, res: CallResult) {
    let reply = res.and_then(|r| RequestNameReply::from_reply(&r));
    let mut mailboxes = vec![];
    {
        let mut state = conn.state.lock();
        let state = &mut *state;
        let Some(record) = state.owners.get_mut(name) else {
            return;
        };
        if record.generation != generation || record.state != OwnerState::Requesting {
            return;
        }
        record.state = match reply {
            Ok(RequestNameReply::PrimaryOwner) => OwnerState::Owner,
            Ok(RequestNameReply::InQueue) => OwnerState::Queued,
            Ok(r) => {
                log::debug!("{}: Could not acquire name {}: {}", conn.prefix, name, r);
                OwnerState::Denied
            }
            Err(e) => {
                log::error!(
                    "{}: Could not request name {}: {}",
                    conn.prefix,
                    name,
                    ErrorFmt(e),
                );
                OwnerState::Denied
            }
        };
        log::debug!("{}: Name {} is now {:?}", conn.prefix, name, record.state);
        if matches!(record.state, OwnerState::Owner | OwnerState::Queued) {
            let rules = [
                (name_acquired_rule(name), true),
                (name_lost_rule(name), false),
            ];
            for (rule, acquired) in rules {
                let handler = signal_handler(conn, name, generation, acquired);
                let (id, _) = state
                    .subscriptions
                    .add(rule, Arc::new(Immediate), handler);
                record.subscriptions.push(id);
            }
        }
        record.notify_all(&mut mailboxes);
    }
    flush(mailboxes);
}

fn signal_handler(
    conn: &Arc<ConnectionInner>,
    name: &str,
    generation: u64,
    acquired: bool,
) -> SignalHandler {
    let conn: Weak<ConnectionInner> = Arc::downgrade(conn);
    let name = name.to_string();
    Arc::new(move |_: &Signal| {
        if let Some(conn) = conn.upgrade() {
            ownership_changed(&conn, &name, generation, acquired);
        }
    })
}

fn ownership_changed(conn: &ConnectionInner, name: &str, generation: u64, acquired: bool) {
    let mut mailboxes = vec![];
    {
        let mut state = conn.state.lock();
        let Some(record) = state.owners.get_mut(name) else {
            return;
        };
        if record.generation != generation {
            return;
        }
        if !matches!(record.state, OwnerState::Owner | OwnerState::Queued) {
            return;
        }
        let new = match acquired {
            true => OwnerState::Owner,
            false => OwnerState::Queued,
        };
        if record.state != new {
            log::debug!("{}: Name {} is now {:?}", conn.prefix, name, new);
        }
        record.state = new;
        record.notify_all(&mut mailboxes);
    }
    flush(mailboxes);
}

impl NameOwner {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether this connection is the primary owner of the name.
    pub fn is_owner(&self) -> bool {
        let state = self.conn.inner.state.lock();
        match state.owners.get(&self.name) {
            Some(r) if r.generation == self.generation => r.state == OwnerState::Owner,
            _ => false,
        }
    }

    /// Releases the claim.
    ///
    /// If this is the last claim, `ReleaseName` has been sent when this
    /// function returns and a later [`Connection::own_name`] is processed by
    /// the bus after it. Unless called on the dispatch thread, this also waits
    /// for the bus to confirm.
    pub fn release(mut self) {
        self.release_();
    }

    fn release_(&mut self) {
        if mem::replace(&mut self.released, true) {
            return;
        }
        let inner = &self.conn.inner;
        let mut mailboxes = vec![];
        let guard = inner.lock_send();
        let (record, observer, on_reader_thread) = {
            let mut state = inner.state.lock();
            let Some(record) = state.owners.get_mut(&self.name) else {
                return;
            };
            if record.generation != self.generation {
                return;
            }
            let mut observer = record.observers.shift_remove(&self.observer);
            if let Some(observer) = &mut observer {
                observer.notify(NameOwnerEvent::Lost, &mut mailboxes);
            }
            let record = match record.observers.is_empty() {
                true => state.owners.remove(&self.name),
                false => None,
            };
            (record, observer, state.on_reader_thread())
        };
        drop(observer);
        let mut pending = None;
        if let Some(record) = record {
            for id in &record.subscriptions {
                inner.unsubscribe(*id);
            }
            if record.state != OwnerState::Denied {
                log::debug!("{}: Releasing name {}", inner.prefix, self.name);
                pending = send_release(inner, &guard, &self.name);
            }
        }
        drop(guard);
        flush(mailboxes);
        let Some(pending) = pending else {
            return;
        };
        if on_reader_thread {
            return;
        }
        match pending.wait_timeout(inner.config.release_timeout()) {
            Some(Ok(reply)) => match ReleaseNameReply::from_reply(&reply) {
                Ok(r) => log::debug!("{}: Released name {}: {:?}", inner.prefix, self.name, r),
                Err(e) => log::warn!(
                    "{}: Unexpected reply to ReleaseName: {}",
                    inner.prefix,
                    ErrorFmt(e),
                ),
            },
            Some(Err(e)) => log::warn!(
                "{}: Could not release name {}: {}",
                inner.prefix,
                self.name,
                ErrorFmt(e),
            ),
            None => log::warn!(
                "{}: The bus did not confirm the release of {}",
                inner.prefix,
                self.name,
            ),
        }
    }
}

fn send_release(
    inner: &Arc<ConnectionInner>,
    guard: &SendGuard<'_>,
    name: &str,
) -> Option<PendingCall> {
    let msg = match bus::method(RELEASE_NAME).message(&[Value::from(name)]) {
        Ok(msg) => msg,
        Err(e) => {
            log::error!("{}: Could not encode ReleaseName: {}", inner.prefix, ErrorFmt(e));
            return None;
        }
    };
    let slot = PendingCall::slot();
    let entry = PendingEntry::new(CallSink::Slot(slot.clone()));
    let timeout = inner.config.default_timeout();
    match inner.send_locked(guard, msg, Some(entry), timeout) {
        Ok(serial) => Some(PendingCall::new(inner.clone(), serial, slot)),
        Err(e) => {
            log::debug!("{}: Could not send ReleaseName: {}", inner.prefix, ErrorFmt(e));
            None
        }
    }
}

impl Drop for NameOwner {
    fn drop(&mut self) {
        self.release_();
    }
}
