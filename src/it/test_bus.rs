//! An in-process message bus.
//!
//! Implements the parts of the `org.freedesktop.DBus` interface used by the
//! engine. Every client is served by its own thread but all messages are
//! processed under one lock so the bus observes a single global order.

use {
    crate::{
        ErrorFmt,
        dbus::{
            BUS_INTERFACE, BUS_NAME, BUS_PATH, ERROR_INVALID_ARGS, ERROR_MATCH_RULE_NOT_FOUND,
            ERROR_NAME_HAS_NO_OWNER, ERROR_UNKNOWN_METHOD, MatchRule, MemoryTransport,
            MessageKind, NO_REPLY_EXPECTED, PEER_INTERFACE, ReleaseNameReply, RequestNameFlags,
            RequestNameReply, Signal, Transport, Value, WireMessage,
            bus::{
                ADD_MATCH, ALLOW_REPLACEMENT, DO_NOT_QUEUE, GET_NAME_OWNER, HELLO, NAME_ACQUIRED,
                NAME_LOST, NAME_OWNER_CHANGED, RELEASE_NAME, REMOVE_MATCH, REPLACE_EXISTING,
                REQUEST_NAME,
            },
        },
    },
    ahash::{AHashMap, AHashSet},
    indexmap::IndexMap,
    parking_lot::{Condvar, Mutex},
    std::{
        collections::VecDeque,
        mem,
        sync::Arc,
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
const ERROR_MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

struct BusClient {
    transport: Arc<MemoryTransport>,
    rules: Vec<MatchRule>,
}

struct NameEntry {
    owner: String,
    flags: RequestNameFlags,
    queue: VecDeque<(String, RequestNameFlags)>,
}

/// A call made to the bus itself.
#[derive(Clone, Debug)]
pub struct BusCall {
    pub sender: String,
    pub member: String,
    pub args: Vec<Value>,
}

#[derive(Default)]
struct BusState {
    next_client: u64,
    serial: u32,
    clients: IndexMap<String, BusClient>,
    names: AHashMap<String, NameEntry>,
    calls: Vec<BusCall>,
    silenced: AHashSet<String>,
    threads: Vec<JoinHandle<()>>,
}

impl BusState {
    fn next_serial(&mut self) -> u32 {
        self.serial += 1;
        self.serial
    }

    fn send(&mut self, dst: &str, mut msg: WireMessage) {
        if msg.serial == 0 {
            msg.serial = self.next_serial();
        }
        if msg.headers.sender.is_none() {
            msg.headers.sender = Some(BUS_NAME.to_string());
        }
        if let Some(client) = self.clients.get(dst) {
            if let Err(e) = client.transport.send(msg) {
                log::debug!("Could not send to {}: {}", dst, ErrorFmt(e));
            }
        }
    }

    fn bus_signal(member: &str, args: &[Value]) -> WireMessage {
        let msg = WireMessage::signal(BUS_PATH, BUS_INTERFACE, member);
        let mut msg = match msg.with_body(args) {
            Ok(msg) => msg,
            Err(e) => panic!("Could not encode {}: {}", member, ErrorFmt(e)),
        };
        msg.headers.sender = Some(BUS_NAME.to_string());
        msg
    }

    fn broadcast(&mut self, msg: WireMessage) {
        let body = msg.decode_body().unwrap_or_default();
        let h = &msg.headers;
        let (Some(path), Some(interface), Some(member)) =
            (h.path.clone(), h.interface.clone(), h.member.clone())
        else {
            return;
        };
        let signal = Signal {
            sender: h.sender.clone(),
            path,
            interface,
            member,
            body,
        };
        let targets: Vec<_> = self
            .clients
            .iter()
            .filter(|(_, c)| c.rules.iter().any(|r| r.matches(&signal)))
            .map(|(name, _)| name.clone())
            .collect();
        for target in targets {
            self.send(&target, msg.clone());
        }
    }

    fn unicast(&mut self, dst: &str, member: &str, name: &str) {
        let mut msg = Self::bus_signal(member, &[Value::from(name)]);
        msg.headers.destination = Some(dst.to_string());
        self.send(dst, msg);
    }

    /// Announces a change of the primary owner of `name`.
    fn owner_changed(&mut self, name: &str, old: Option<&str>, new: Option<&str>) {
        if let Some(old) = old {
            self.unicast(old, NAME_LOST, name);
        }
        let args = [
            Value::from(name),
            Value::from(old.unwrap_or_default()),
            Value::from(new.unwrap_or_default()),
        ];
        self.broadcast(Self::bus_signal(NAME_OWNER_CHANGED, &args));
        if let Some(new) = new {
            self.unicast(new, NAME_ACQUIRED, name);
        }
    }

    fn request_name(
        &mut self,
        sender: &str,
        name: &str,
        flags: RequestNameFlags,
    ) -> RequestNameReply {
        let Some(entry) = self.names.get_mut(name) else {
            self.names.insert(
                name.to_string(),
                NameEntry {
                    owner: sender.to_string(),
                    flags,
                    queue: Default::default(),
                },
            );
            self.owner_changed(name, None, Some(sender));
            return RequestNameReply::PrimaryOwner;
        };
        if entry.owner == sender {
            entry.flags = flags;
            return RequestNameReply::AlreadyOwner;
        }
        entry.queue.retain(|(q, _)| q != sender);
        if entry.flags.contains(ALLOW_REPLACEMENT) && flags.contains(REPLACE_EXISTING) {
            let old = mem::replace(&mut entry.owner, sender.to_string());
            let old_flags = mem::replace(&mut entry.flags, flags);
            if !old_flags.contains(DO_NOT_QUEUE) {
                entry.queue.push_front((old.clone(), old_flags));
            }
            self.owner_changed(name, Some(&old), Some(sender));
            return RequestNameReply::PrimaryOwner;
        }
        if flags.contains(DO_NOT_QUEUE) {
            return RequestNameReply::Exists;
        }
        entry.queue.push_back((sender.to_string(), flags));
        RequestNameReply::InQueue
    }

    fn release_name(&mut self, sender: &str, name: &str) -> ReleaseNameReply {
        let Some(entry) = self.names.get_mut(name) else {
            return ReleaseNameReply::NonExistent;
        };
        if entry.owner != sender {
            let len = entry.queue.len();
            entry.queue.retain(|(q, _)| q != sender);
            return match entry.queue.len() == len {
                true => ReleaseNameReply::NotOwner,
                false => ReleaseNameReply::Released,
            };
        }
        match entry.queue.pop_front() {
            Some((next, flags)) => {
                entry.owner = next.clone();
                entry.flags = flags;
                self.owner_changed(name, Some(sender), Some(&next));
            }
            None => {
                self.names.remove(name);
                self.owner_changed(name, Some(sender), None);
            }
        }
        ReleaseNameReply::Released
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if name.starts_with(':') {
            return self.clients.contains_key(name).then(|| name.to_string());
        }
        self.names.get(name).map(|e| e.owner.clone())
    }

    fn handle(&mut self, sender: &str, mut msg: WireMessage) {
        msg.headers.sender = Some(sender.to_string());
        if msg.kind == MessageKind::Signal {
            match msg.headers.destination.clone() {
                Some(dst) => {
                    if let Some(dst) = self.resolve(&dst) {
                        self.send(&dst, msg);
                    }
                }
                None => self.broadcast(msg),
            }
            return;
        }
        let destination = msg.headers.destination.clone().unwrap_or_default();
        if destination == BUS_NAME {
            if msg.kind == MessageKind::MethodCall {
                self.handle_bus_call(sender, msg);
            }
            return;
        }
        match self.resolve(&destination) {
            Some(dst) => self.send(&dst, msg),
            None if msg.kind == MessageKind::MethodCall => {
                if msg.flags & NO_REPLY_EXPECTED == 0 {
                    let text = format!("The name {} was not provided", destination);
                    let reply = WireMessage::error(&msg, ERROR_SERVICE_UNKNOWN, Some(&text));
                    self.send(sender, reply);
                }
            }
            None => {}
        }
    }

    fn handle_bus_call(&mut self, sender: &str, msg: WireMessage) {
        let member = msg.headers.member.clone().unwrap_or_default();
        let args = msg.decode_body().unwrap_or_default();
        self.calls.push(BusCall {
            sender: sender.to_string(),
            member: member.clone(),
            args: args.clone(),
        });
        if self.silenced.contains(&member) {
            return;
        }
        let res = match msg.headers.interface.as_deref() {
            Some(PEER_INTERFACE) if member == "Ping" => Ok(vec![]),
            Some(BUS_INTERFACE) | None => self.bus_method(sender, &member, &args),
            _ => Err((ERROR_UNKNOWN_METHOD, format!("Unknown method {}", member))),
        };
        if msg.flags & NO_REPLY_EXPECTED != 0 {
            return;
        }
        let reply = match res {
            Ok(body) => match WireMessage::method_return(&msg).with_body(&body) {
                Ok(reply) => reply,
                Err(e) => panic!("Could not encode the reply to {}: {}", member, ErrorFmt(e)),
            },
            Err((name, text)) => WireMessage::error(&msg, name, Some(&text)),
        };
        self.send(sender, reply);
    }

    fn bus_method(
        &mut self,
        sender: &str,
        member: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, (&'static str, String)> {
        let invalid = || (ERROR_INVALID_ARGS, format!("Invalid arguments to {}", member));
        let string_arg = || args.first().and_then(|v| v.as_str()).ok_or_else(invalid);
        match member {
            HELLO => {
                self.owner_changed(sender, None, Some(sender));
                Ok(vec![Value::from(sender)])
            }
            REQUEST_NAME => {
                let name = string_arg()?;
                let flags = args.get(1).and_then(|v| v.as_u32()).ok_or_else(invalid)?;
                if name.starts_with(':') || name == BUS_NAME {
                    return Err(invalid());
                }
                let reply = self.request_name(sender, name, RequestNameFlags(flags));
                Ok(vec![Value::U32(reply.to_u32())])
            }
            RELEASE_NAME => {
                let name = string_arg()?;
                let reply = self.release_name(sender, name);
                Ok(vec![Value::U32(reply.to_u32())])
            }
            GET_NAME_OWNER => {
                let name = string_arg()?;
                if name == BUS_NAME {
                    return Ok(vec![Value::from(BUS_NAME)]);
                }
                match self.resolve(name) {
                    Some(owner) => Ok(vec![Value::from(owner)]),
                    None => Err((
                        ERROR_NAME_HAS_NO_OWNER,
                        format!("Could not get owner of name '{}'", name),
                    )),
                }
            }
            ADD_MATCH | REMOVE_MATCH => {
                let rule = MatchRule::parse(string_arg()?)
                    .map_err(|e| (ERROR_MATCH_RULE_INVALID, ErrorFmt(e).to_string()))?;
                let Some(client) = self.clients.get_mut(sender) else {
                    return Ok(vec![]);
                };
                if member == ADD_MATCH {
                    client.rules.push(rule);
                    return Ok(vec![]);
                }
                match client.rules.iter().position(|r| r == &rule) {
                    Some(pos) => {
                        client.rules.remove(pos);
                        Ok(vec![])
                    }
                    None => Err((ERROR_MATCH_RULE_NOT_FOUND, format!("No rule {}", rule))),
                }
            }
            _ => Err((ERROR_UNKNOWN_METHOD, format!("Unknown method {}", member))),
        }
    }

    /// Removes a client and releases everything it held.
    fn remove_client(&mut self, unique: &str) -> Option<BusClient> {
        let client = self.clients.shift_remove(unique)?;
        let owned: Vec<_> = self
            .names
            .iter()
            .filter(|(_, e)| e.owner == unique)
            .map(|(n, _)| n.clone())
            .collect();
        for entry in self.names.values_mut() {
            entry.queue.retain(|(q, _)| q != unique);
        }
        for name in owned {
            let Some(entry) = self.names.get_mut(&name) else {
                continue;
            };
            match entry.queue.pop_front() {
                Some((next, flags)) => {
                    entry.owner = next.clone();
                    entry.flags = flags;
                    self.owner_changed(&name, Some(unique), Some(&next));
                }
                None => {
                    self.names.remove(&name);
                    self.owner_changed(&name, Some(unique), None);
                }
            }
        }
        self.owner_changed(unique, Some(unique), None);
        Some(client)
    }
}

pub struct TestBus {
    state: Mutex<BusState>,
    cond: Condvar,
}

impl TestBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Default::default(),
            cond: Condvar::new(),
        })
    }

    /// Creates a new client and returns its end of the transport.
    pub fn connect(self: &Arc<Self>) -> MemoryTransport {
        let (client, server) = MemoryTransport::pair_framed();
        let server = Arc::new(server);
        let mut state = self.state.lock();
        state.next_client += 1;
        let unique = format!(":1.{}", state.next_client);
        state.clients.insert(
            unique.clone(),
            BusClient {
                transport: server.clone(),
                rules: vec![],
            },
        );
        let slf = self.clone();
        let name = unique.clone();
        let res = thread::Builder::new()
            .name(format!("bus {}", unique))
            .spawn(move || slf.serve(&name, &server));
        match res {
            Ok(t) => state.threads.push(t),
            Err(e) => panic!("Could not spawn a bus thread: {}", ErrorFmt(e)),
        }
        client
    }

    fn serve(&self, unique: &str, transport: &MemoryTransport) {
        while let Some(msg) = transport.receive() {
            self.state.lock().handle(unique, msg);
            self.cond.notify_all();
        }
        let client = self.state.lock().remove_client(unique);
        self.cond.notify_all();
        drop(client);
        log::debug!("Client {} is gone", unique);
    }

    /// The calls made to the bus so far.
    pub fn calls(&self) -> Vec<BusCall> {
        self.state.lock().calls.clone()
    }

    /// The number of calls to `member` made to the bus so far.
    pub fn received(&self, member: &str) -> usize {
        let state = self.state.lock();
        state.calls.iter().filter(|c| c.member == member).count()
    }

    /// Waits until the bus has received `n` calls to `member`.
    pub fn wait_received(&self, member: &str, n: usize) -> bool {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut state = self.state.lock();
        loop {
            if state.calls.iter().filter(|c| c.member == member).count() >= n {
                return true;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
    }

    /// Stops answering calls to `member`.
    pub fn silence(&self, member: &str) {
        self.state.lock().silenced.insert(member.to_string());
    }

    /// Closes the connection of a client.
    pub fn disconnect(&self, unique: &str) {
        let transport = self
            .state
            .lock()
            .clients
            .get(unique)
            .map(|c| c.transport.clone());
        if let Some(transport) = transport {
            transport.close();
        }
    }

    /// Sends a raw message to a client.
    pub fn inject(&self, unique: &str, msg: WireMessage) {
        self.state.lock().send(unique, msg);
    }

    /// The primary owner of a well-known name.
    pub fn owner(&self, name: &str) -> Option<String> {
        self.state.lock().names.get(name).map(|e| e.owner.clone())
    }

    /// The number of match rules registered by a client.
    pub fn rules(&self, unique: &str) -> usize {
        let state = self.state.lock();
        state.clients.get(unique).map(|c| c.rules.len()).unwrap_or(0)
    }

    pub fn shutdown(&self) {
        let (transports, threads) = {
            let mut state = self.state.lock();
            let transports: Vec<_> = state
                .clients
                .values()
                .map(|c| c.transport.clone())
                .collect();
            (transports, mem::take(&mut state.threads))
        };
        for transport in transports {
            transport.close();
        }
        for thread in threads {
            let _ = thread.join();
        }
    }
}
