use {
    crate::{
        config::ConnectionConfig,
        dbus::{
            CallId, DbusError, ERROR_FAILED, ERROR_INVALID_ARGS, ERROR_UNKNOWN_INTERFACE,
            ERROR_UNKNOWN_METHOD, ERROR_UNKNOWN_OBJECT, ExecutionContext, Immediate, MatchRule,
            MessageKind, NO_REPLY_EXPECTED, ObjectExport, ObjectPath, PEER_INTERFACE, PendingCall,
            Reply, Signal, SubscriptionId, Transport, TransportError, TransportEvent,
            UnsupportedValue, Value, WireError, WireMessage,
            bus::{self, ADD_MATCH, HELLO, REMOVE_MATCH},
            context::Job,
            export::{Export, Exports, MethodInvocation, Route},
            owner::{self, OwnerRecord},
            pending::{CallResult, CallSink, PendingEntry},
            subscriptions::Subscriptions,
            timer::Timer,
            types::{is_valid_bus_name, is_valid_interface_name, is_valid_member_name},
            watcher::{self, WatchRecord},
        },
        utils::errorfmt::ErrorFmt,
    },
    ahash::AHashMap,
    parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard},
    std::{
        cell::Cell,
        mem,
        sync::{Arc, Weak},
        thread::{self, ThreadId},
        time::{Duration, Instant},
    },
};


linear_ids!(ConnectionIds, ConnectionId);
linear_ids!(ObserverIds, ObserverId);

static CONNECTION_IDS: ConnectionIds = ConnectionIds::new();

/// The target of a method call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Method<'a> {
    pub destination: Option<&'a str>,
    pub path: &'a str,
    pub interface: Option<&'a str>,
    pub member: &'a str,
}

impl<'a> Method<'a> {
    pub fn new(destination: &'a str, path: &'a str, interface: &'a str, member: &'a str) -> Self {
        Self {
            destination: Some(destination),
            path,
            interface: Some(interface),
            member,
        }
    }

    pub(super) fn message(&self, args: &[Value]) -> Result<WireMessage, DbusError> {
        if let Some(destination) = self.destination {
            if !is_valid_bus_name(destination) {
                return Err(UnsupportedValue::InvalidBusName(destination.to_string()).into());
            }
        }
        ObjectPath::new(self.path)?;
        if let Some(interface) = self.interface {
            check_interface(interface)?;
        }
        if !is_valid_member_name(self.member) {
            return Err(UnsupportedValue::InvalidMemberName(self.member.to_string()).into());
        }
        WireMessage::method_call(self.destination, self.path, self.interface, self.member)
            .with_body(args)
    }
}

fn check_interface(interface: &str) -> Result<(), UnsupportedValue> {
    match is_valid_interface_name(interface) {
        true => Ok(()),
        false => Err(UnsupportedValue::InvalidInterfaceName(interface.to_string())),
    }
}

pub(super) type SendGuard<'a> = ReentrantMutexGuard<'a, Cell<u32>>;

#[derive(Default)]
pub(super) struct State {
    pub dead: bool,
    pub unique_name: Option<Arc<str>>,
    pub reader: Option<ThreadId>,
    pub pending: AHashMap<u32, PendingEntry>,
    pub subscriptions: Subscriptions,
    pub exports: Exports,
    pub disconnect_observers: Vec<(Arc<dyn ExecutionContext>, Job)>,
    pub owners: AHashMap<String, OwnerRecord>,
    pub watchers: AHashMap<String, WatchRecord>,
    pub observer_ids: ObserverIds,
    pub generation: u64,
}

impl State {
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn on_reader_thread(&self) -> bool {
        self.reader == Some(thread::current().id())
    }
}

pub(super) struct ConnectionInner {
    pub id: ConnectionId,
    pub prefix: String,
    pub config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    /// Holds the next serial. Every send happens while this is locked so
    /// that serials hit the wire in order. Must be locked before `state`.
    serial: ReentrantMutex<Cell<u32>>,
    pub state: Mutex<State>,
    timer: Timer,
}

/// A connection to a message bus.
///
/// Clones refer to the same connection. The connection is closed when the
/// last clone and the last handle created from it are dropped.
#[derive(Clone)]
pub struct Connection {
    pub(super) inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Creates a connection on top of an authenticated transport. Nothing is
    /// read from the transport until [`Connection::start`] is called.
    pub fn new(transport: impl Transport + 'static, config: ConnectionConfig) -> Self {
        let id = CONNECTION_IDS.next();
        let prefix = format!("{}#{}", config.name, id);
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                timer: Timer::new(&format!("{} timer", config.name)),
                prefix,
                config,
                transport: Arc::new(transport),
                serial: ReentrantMutex::new(Cell::new(1)),
                state: Default::default(),
            }),
        }
    }

    /// Creates and starts a connection.
    pub fn open(
        transport: impl Transport + 'static,
        config: ConnectionConfig,
    ) -> Result<Self, DbusError> {
        let conn = Self::new(transport, config);
        conn.start()?;
        Ok(conn)
    }

    /// Starts the dispatch thread and, if configured, registers with the bus.
    pub fn start(&self) -> Result<(), DbusError> {
        let inner = &self.inner;
        let weak = Arc::downgrade(inner);
        inner.transport.on_closed(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.kill();
            }
        }));
        let weak = Arc::downgrade(inner);
        let transport = inner.transport.clone();
        let res = thread::Builder::new()
            .name(format!("{} reader", inner.config.name))
            .spawn(move || read_messages(weak, transport));
        let reader = match res {
            Ok(r) => r,
            Err(e) => {
                inner.kill();
                return Err(TransportError::Io(e).into());
            }
        };
        inner.state.lock().reader = Some(reader.thread().id());
        if inner.config.send_hello {
            let res = self.call_blocking(&bus::method(HELLO), &[]).and_then(|reply| {
                reply.expect_signature("s")?;
                let name = reply.body.into_iter().next().and_then(|v| v.into_string());
                name.ok_or(DbusError::MalformedWireData(WireError::UnexpectedEof))
            });
            match res {
                Ok(name) => {
                    log::info!("{}: Acquired unique name {}", inner.prefix, name);
                    inner.state.lock().unique_name = Some(name.into());
                }
                Err(e) => {
                    log::error!("{}: Hello call failed: {}", inner.prefix, ErrorFmt(&e));
                    inner.kill();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The name assigned by the bus in response to `Hello`.
    pub fn unique_name(&self) -> Option<Arc<str>> {
        self.inner.state.lock().unique_name.clone()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.state.lock().dead
    }

    /// Closes the connection. Outstanding calls complete with
    /// [`DbusError::Disconnected`].
    pub fn close(&self) {
        self.inner.kill();
    }

    /// Calls a method.
    ///
    /// `timeout` overrides the configured default deadline.
    pub fn call(
        &self,
        method: &Method<'_>,
        args: &[Value],
        timeout: Option<Duration>,
    ) -> Result<PendingCall, DbusError> {
        let msg = method.message(args)?;
        let slot = PendingCall::slot();
        let entry = PendingEntry::new(CallSink::Slot(slot.clone()));
        let inner = &self.inner;
        let guard = inner.lock_send();
        let serial = inner.send_locked(&guard, msg, Some(entry), inner.timeout(timeout))?;
        Ok(PendingCall::new(inner.clone(), serial, slot))
    }

    /// Calls a method and schedules `f` with the result on `ctx`.
    pub fn call_with<F>(
        &self,
        method: &Method<'_>,
        args: &[Value],
        timeout: Option<Duration>,
        ctx: Arc<dyn ExecutionContext>,
        f: F,
    ) -> Result<CallId, DbusError>
    where
        F: FnOnce(Result<Reply, DbusError>) + Send + 'static,
    {
        let msg = method.message(args)?;
        let entry = PendingEntry::new(CallSink::Callback {
            ctx,
            f: Box::new(f),
        });
        let inner = &self.inner;
        let guard = inner.lock_send();
        let serial = inner.send_locked(&guard, msg, Some(entry), inner.timeout(timeout))?;
        Ok(CallId(serial))
    }

    /// Calls a method and blocks until it completes.
    pub fn call_blocking(&self, method: &Method<'_>, args: &[Value]) -> Result<Reply, DbusError> {
        if self.inner.state.lock().on_reader_thread() {
            return Err(DbusError::DispatchThread);
        }
        self.call(method, args, None)?.wait()
    }

    /// Calls a method without asking for a reply.
    pub fn call_noreply(&self, method: &Method<'_>, args: &[Value]) -> Result<(), DbusError> {
        let msg = method.message(args)?.with_flags(NO_REPLY_EXPECTED);
        let guard = self.inner.lock_send();
        self.inner.send_locked(&guard, msg, None, None)?;
        Ok(())
    }

    /// Completes the call with [`DbusError::Cancelled`] unless it has already
    /// completed. Returns whether this call completed it.
    pub fn call_cancel(&self, id: CallId) -> bool {
        self.inner.cancel(id.0)
    }

    /// Emits a signal. Signals emitted on a closed connection are dropped.
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        args: &[Value],
    ) -> Result<(), DbusError> {
        ObjectPath::new(path)?;
        check_interface(interface)?;
        if !is_valid_member_name(member) {
            return Err(UnsupportedValue::InvalidMemberName(member.to_string()).into());
        }
        let msg = WireMessage::signal(path, interface, member).with_body(args)?;
        let inner = &self.inner;
        let guard = inner.lock_send();
        if let Err(e) = inner.send_locked(&guard, msg, None, None) {
            log::debug!(
                "{}: Dropping signal {}.{}: {}",
                inner.prefix,
                interface,
                member,
                ErrorFmt(e),
            );
        }
        Ok(())
    }

    /// Invokes `handler` on `ctx` for every signal matching `rule`.
    pub fn subscribe<F>(
        &self,
        rule: MatchRule,
        ctx: Arc<dyn ExecutionContext>,
        handler: F,
    ) -> Result<SubscriptionId, DbusError>
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let guard = inner.lock_send();
        let (id, register) = {
            let mut state = inner.state.lock();
            if state.dead {
                return Err(DbusError::Disconnected);
            }
            state
                .subscriptions
                .add(rule.clone(), ctx, Arc::new(handler))
        };
        log::trace!("{}: Subscription {} for {}", inner.prefix, id, rule);
        if register {
            inner.send_match(&guard, ADD_MATCH, &rule);
        }
        Ok(id)
    }

    /// Returns whether the subscription existed. Handler invocations that
    /// have already been scheduled are skipped.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Runs `f` on `ctx` once the connection is closed. Runs it immediately if
    /// the connection is already closed.
    pub fn on_disconnect<F>(&self, ctx: Arc<dyn ExecutionContext>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let f: Job = Box::new(f);
        {
            let mut state = self.inner.state.lock();
            if !state.dead {
                state.disconnect_observers.push((ctx, f));
                return;
            }
        }
        ctx.schedule(f);
    }

    /// Routes method calls for `interface` at `path` to `obj`. Replaces an
    /// existing export.
    pub fn export(
        &self,
        path: &str,
        interface: &str,
        ctx: Arc<dyn ExecutionContext>,
        obj: Arc<dyn ObjectExport>,
    ) -> Result<(), DbusError> {
        ObjectPath::new(path)?;
        check_interface(interface)?;
        let prev = {
            let mut state = self.inner.state.lock();
            if state.dead {
                return Err(DbusError::Disconnected);
            }
            state.exports.insert(path, interface, Export { ctx, obj })
        };
        if prev.is_some() {
            log::debug!("{}: Replaced export of {} at {}", self.inner.prefix, interface, path);
        }
        Ok(())
    }

    pub fn unexport(&self, path: &str, interface: &str) -> bool {
        let prev = self.inner.state.lock().exports.remove(path, interface);
        prev.is_some()
    }

    #[cfg(test)]
    pub(crate) fn pending_calls(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    #[cfg(test)]
    pub(crate) fn registrations(&self, rule: &MatchRule) -> usize {
        self.inner.state.lock().subscriptions.registrations(rule)
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }
}

fn read_messages(conn: Weak<ConnectionInner>, transport: Arc<dyn Transport>) {
    loop {
        let event = match transport.receive() {
            Some(msg) => TransportEvent::Message(msg),
            None => TransportEvent::Closed,
        };
        let closed = matches!(event, TransportEvent::Closed);
        let Some(conn) = conn.upgrade() else {
            return;
        };
        conn.dispatch_incoming(event);
        if closed {
            return;
        }
    }
}

fn immediate() -> Arc<dyn ExecutionContext> {
    Arc::new(Immediate)
}

impl ConnectionInner {
    pub fn lock_send(&self) -> SendGuard<'_> {
        self.serial.lock()
    }

    fn timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        timeout.or_else(|| self.config.default_timeout())
    }

    /// Sends a message and registers `entry` to receive its reply.
    ///
    /// If sending fails after the entry has already been completed by the
    /// disconnect that the failure caused, the call counts as sent.
    pub fn send_locked(
        self: &Arc<Self>,
        guard: &SendGuard<'_>,
        mut msg: WireMessage,
        entry: Option<PendingEntry>,
        timeout: Option<Duration>,
    ) -> Result<u32, DbusError> {
        let serial = guard.get();
        guard.set(match serial.wrapping_add(1) {
            0 => 1,
            n => n,
        });
        msg.serial = serial;
        let expects_reply = entry.is_some();
        {
            let mut state = self.state.lock();
            if state.dead {
                return Err(DbusError::Disconnected);
            }
            if let Some(mut entry) = entry {
                let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
                if let Some(deadline) = deadline {
                    let conn = Arc::downgrade(self);
                    let id = self
                        .timer
                        .schedule(
                            deadline,
                            Box::new(move || {
                                if let Some(conn) = conn.upgrade() {
                                    conn.complete(serial, Err(DbusError::Timeout));
                                }
                            }),
                        )
                        .map_err(DbusError::TimerThread)?;
                    entry.timer = Some(id);
                }
                state.pending.insert(serial, entry);
            }
        }
        if let Err(e) = self.transport.send(msg) {
            if expects_reply && self.take_pending(serial).is_none() {
                return Ok(serial);
            }
            return Err(e.into());
        }
        Ok(serial)
    }

    fn take_pending(&self, serial: u32) -> Option<PendingEntry> {
        let entry = self.state.lock().pending.remove(&serial)?;
        if let Some(timer) = entry.timer {
            self.timer.cancel(timer);
        }
        Some(entry)
    }

    /// Completes a pending call unless it has already been completed.
    pub fn complete(&self, serial: u32, res: CallResult) -> bool {
        match self.take_pending(serial) {
            Some(entry) => {
                entry.sink.complete(res);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, serial: u32) -> bool {
        self.complete(serial, Err(DbusError::Cancelled))
    }

    /// Withdraws a pending call without completing it.
    pub fn forget(&self, serial: u32) {
        self.take_pending(serial);
    }

    pub fn unsubscribe(self: &Arc<Self>, id: SubscriptionId) -> bool {
        let guard = self.lock_send();
        let removed = self.state.lock().subscriptions.remove(id);
        let Some((subscriber, unregister)) = removed else {
            return false;
        };
        log::trace!("{}: Removed subscription {}", self.prefix, id);
        if let Some(rule) = unregister {
            self.send_match(&guard, REMOVE_MATCH, &rule);
        }
        drop(subscriber);
        true
    }

    /// Sends `AddMatch` or `RemoveMatch` for `rule`. Failures are logged.
    pub fn send_match(
        self: &Arc<Self>,
        guard: &SendGuard<'_>,
        member: &'static str,
        rule: &MatchRule,
    ) {
        let rule = rule.to_string();
        let msg = match bus::method(member).message(&[Value::String(rule.clone())]) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("{}: Could not encode {}: {}", self.prefix, member, ErrorFmt(e));
                return;
            }
        };
        let prefix = self.prefix.clone();
        let sink = CallSink::Callback {
            ctx: immediate(),
            f: Box::new(move |res| {
                if let Err(e) = res {
                    log::error!("{}: {} `{}` failed: {}", prefix, member, rule, ErrorFmt(e));
                }
            }),
        };
        let entry = PendingEntry::new(sink);
        let timeout = self.config.default_timeout();
        if let Err(e) = self.send_locked(guard, msg, Some(entry), timeout) {
            log::debug!("{}: Could not send {}: {}", self.prefix, member, ErrorFmt(e));
        }
    }

    pub fn dispatch_incoming(self: &Arc<Self>, event: TransportEvent) {
        let msg = match event {
            TransportEvent::Message(msg) => msg,
            TransportEvent::Closed => {
                self.kill();
                return;
            }
        };
        match msg.kind {
            MessageKind::MethodReturn | MessageKind::Error => self.handle_reply(msg),
            MessageKind::Signal => self.handle_signal(msg),
            MessageKind::MethodCall => self.handle_method_call(msg),
        }
    }

    fn handle_reply(&self, msg: WireMessage) {
        let Some(serial) = msg.headers.reply_serial else {
            return;
        };
        let Some(entry) = self.take_pending(serial) else {
            log::trace!("{}: Ignoring reply to serial {}", self.prefix, serial);
            return;
        };
        let res = Reply::from_message(&msg);
        if let Err(DbusError::MalformedWireData(e)) = &res {
            log::error!("{}: Received a malformed reply: {}", self.prefix, ErrorFmt(e));
        }
        entry.sink.complete(res);
    }

    fn handle_signal(&self, msg: WireMessage) {
        let body = match msg.decode_body() {
            Ok(body) => body,
            Err(e) => {
                log::error!(
                    "{}: Dropping malformed signal {}.{}: {}",
                    self.prefix,
                    msg.headers.interface.as_deref().unwrap_or_default(),
                    msg.headers.member.as_deref().unwrap_or_default(),
                    ErrorFmt(e),
                );
                return;
            }
        };
        let h = msg.headers;
        let (Some(path), Some(interface), Some(member)) = (h.path, h.interface, h.member) else {
            return;
        };
        let signal = Arc::new(Signal {
            sender: h.sender,
            path,
            interface,
            member,
            body,
        });
        let matches = self.state.lock().subscriptions.matching(&signal);
        for subscriber in matches {
            let signal = signal.clone();
            let ctx = subscriber.ctx.clone();
            ctx.schedule(Box::new(move || subscriber.deliver(&signal)));
        }
    }

    fn handle_method_call(self: &Arc<Self>, msg: WireMessage) {
        let no_reply = msg.flags & NO_REPLY_EXPECTED != 0;
        let (Some(path), Some(member)) = (msg.headers.path.clone(), msg.headers.member.clone())
        else {
            return;
        };
        if msg.headers.interface.as_deref() == Some(PEER_INTERFACE) {
            if member == "Ping" {
                if !no_reply {
                    self.send_reply(WireMessage::method_return(&msg));
                }
            } else {
                let text = format!("Unknown method {}", member);
                self.reply_error(&msg, ERROR_UNKNOWN_METHOD, &text);
            }
            return;
        }
        let route = self
            .state
            .lock()
            .exports
            .route(&path, msg.headers.interface.as_deref());
        let (interface, export) = match route {
            Route::Found(interface, export) => (interface, export),
            Route::UnknownObject => {
                let text = format!("No object at path {}", path);
                self.reply_error(&msg, ERROR_UNKNOWN_OBJECT, &text);
                return;
            }
            Route::UnknownInterface => {
                let text = format!(
                    "Object {} does not implement interface {}",
                    path,
                    msg.headers.interface.as_deref().unwrap_or_default(),
                );
                self.reply_error(&msg, ERROR_UNKNOWN_INTERFACE, &text);
                return;
            }
        };
        let args = match msg.decode_body() {
            Ok(args) => args,
            Err(e) => {
                self.reply_error(&msg, ERROR_INVALID_ARGS, &ErrorFmt(e).to_string());
                return;
            }
        };
        let invocation = MethodInvocation {
            sender: msg.headers.sender.clone(),
            path,
            interface,
            member,
            args,
            no_reply,
        };
        let conn = Arc::downgrade(self);
        let Export { ctx, obj } = export;
        ctx.schedule(Box::new(move || {
            let res = obj.route_method_call(&invocation);
            if no_reply {
                return;
            }
            let Some(conn) = conn.upgrade() else {
                return;
            };
            let reply = match res {
                Ok(body) => match WireMessage::method_return(&msg).with_body(&body) {
                    Ok(reply) => reply,
                    Err(e) => {
                        log::error!(
                            "{}: Could not encode the reply to {}.{}: {}",
                            conn.prefix,
                            invocation.interface,
                            invocation.member,
                            ErrorFmt(&e),
                        );
                        let text = ErrorFmt(e).to_string();
                        WireMessage::error(&msg, ERROR_FAILED, Some(&text))
                    }
                },
                Err(e) => WireMessage::error(&msg, &e.name, e.msg.as_deref()),
            };
            conn.send_reply(reply);
        }));
    }

    fn reply_error(self: &Arc<Self>, call: &WireMessage, name: &str, text: &str) {
        if call.flags & NO_REPLY_EXPECTED != 0 {
            return;
        }
        self.send_reply(WireMessage::error(call, name, Some(text)));
    }

    fn send_reply(self: &Arc<Self>, msg: WireMessage) {
        let guard = self.lock_send();
        if let Err(e) = self.send_locked(&guard, msg, None, None) {
            log::debug!("{}: Could not send a reply: {}", self.prefix, ErrorFmt(e));
        }
    }

    /// Transitions the connection to the disconnected state. Runs at most
    /// once.
    pub fn kill(&self) {
        let pending;
        let subscriptions;
        let exports;
        let observers;
        let owners;
        let watchers;
        {
            let mut state = self.state.lock();
            if state.dead {
                return;
            }
            state.dead = true;
            pending = mem::take(&mut state.pending);
            subscriptions = state.subscriptions.clear();
            exports = mem::take(&mut state.exports);
            observers = mem::take(&mut state.disconnect_observers);
            owners = mem::take(&mut state.owners);
            watchers = mem::take(&mut state.watchers);
        }
        log::info!("{}: Disconnected", self.prefix);
        self.transport.close();
        let mut pending: Vec<_> = pending.into_iter().collect();
        pending.sort_by_key(|(serial, _)| *serial);
        for (_, entry) in pending {
            if let Some(timer) = entry.timer {
                self.timer.cancel(timer);
            }
            entry.sink.complete(Err(DbusError::Disconnected));
        }
        owner::disconnect(owners);
        watcher::disconnect(watchers);
        for (ctx, f) in observers {
            ctx.schedule(f);
        }
        drop(subscriptions);
        drop(exports);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.kill();
    }
}
