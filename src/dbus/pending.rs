use {
    crate::dbus::{
        CallError, DbusError, ExecutionContext, MessageKind, Signature, Value, WireError,
        WireMessage, connection::ConnectionInner, timer::TimerId,
    },
    futures_util::task::AtomicWaker,
    parking_lot::{Condvar, Mutex},
    std::{
        fmt::{Debug, Formatter},
        future::Future,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
        time::{Duration, Instant},
    },
};

/// Identifies an outstanding call on its connection.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct CallId(pub(super) u32);

impl CallId {
    pub fn serial(self) -> u32 {
        self.0
    }
}

/// A successful method return.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub sender: Option<String>,
    pub signature: Signature,
    pub body: Vec<Value>,
}

impl Reply {
    pub(super) fn from_message(msg: &WireMessage) -> Result<Self, DbusError> {
        let body = msg.decode_body()?;
        if msg.kind == MessageKind::Error {
            let name = msg.headers.error_name.clone().unwrap_or_default();
            let msg = match body.into_iter().next() {
                Some(Value::String(s)) => Some(s),
                _ => None,
            };
            return Err(DbusError::RemoteError(CallError { name, msg }));
        }
        Ok(Self {
            sender: msg.headers.sender.clone(),
            signature: msg.headers.signature.clone().unwrap_or_default(),
            body,
        })
    }

    /// Fails unless the reply has exactly the signature `expected`.
    pub fn expect_signature(&self, expected: &'static str) -> Result<(), DbusError> {
        if self.signature.as_str() != expected {
            return Err(DbusError::MalformedWireData(WireError::SignatureMismatch {
                expected,
                actual: self.signature.0.clone(),
            }));
        }
        Ok(())
    }

    pub fn arg(&self, idx: usize) -> Option<&Value> {
        self.body.get(idx)
    }
}

pub(super) type CallResult = Result<Reply, DbusError>;

#[derive(Default)]
pub(super) struct CallSlot {
    data: Mutex<SlotData>,
    cond: Condvar,
    waker: AtomicWaker,
}

#[derive(Default)]
struct SlotData {
    completed: bool,
    result: Option<CallResult>,
}

impl CallSlot {
    fn complete(&self, res: CallResult) {
        {
            let mut data = self.data.lock();
            data.completed = true;
            data.result = Some(res);
        }
        self.cond.notify_all();
        self.waker.wake();
    }

    fn is_completed(&self) -> bool {
        self.data.lock().completed
    }
}

/// Where the result of a call goes.
pub(super) enum CallSink {
    Slot(Arc<CallSlot>),
    Callback {
        ctx: Arc<dyn ExecutionContext>,
        f: Box<dyn FnOnce(CallResult) + Send>,
    },
}

impl CallSink {
    pub fn complete(self, res: CallResult) {
        match self {
            CallSink::Slot(slot) => slot.complete(res),
            CallSink::Callback { ctx, f } => ctx.schedule(Box::new(move || f(res))),
        }
    }
}

/// An entry in the pending-call table. Removing the entry from the table is
/// what makes a completion the only one.
pub(super) struct PendingEntry {
    pub sink: CallSink,
    pub timer: Option<TimerId>,
}

impl PendingEntry {
    pub fn new(sink: CallSink) -> Self {
        Self { sink, timer: None }
    }
}

/// The handle of a call made with [`Connection::call`](super::Connection::call).
///
/// The result can be awaited or obtained with [`PendingCall::wait`]. Dropping
/// the handle before completion withdraws the call without invoking anything.
#[must_use]
pub struct PendingCall {
    pub(super) conn: Arc<ConnectionInner>,
    pub(super) serial: u32,
    pub(super) slot: Arc<CallSlot>,
}

impl PendingCall {
    pub(super) fn new(conn: Arc<ConnectionInner>, serial: u32, slot: Arc<CallSlot>) -> Self {
        Self { conn, serial, slot }
    }

    pub(super) fn slot() -> Arc<CallSlot> {
        Default::default()
    }

    pub fn id(&self) -> CallId {
        CallId(self.serial)
    }

    /// Completes the call with [`DbusError::Cancelled`] unless it has already
    /// completed. Returns whether this call completed it.
    pub fn cancel(&self) -> bool {
        self.conn.cancel(self.serial)
    }

    pub fn is_completed(&self) -> bool {
        self.slot.is_completed()
    }

    /// Blocks until the call completes.
    ///
    /// Must not be called from a handler running on the dispatch thread since
    /// the reply could never be read.
    pub fn wait(self) -> CallResult {
        let mut data = self.slot.data.lock();
        loop {
            if let Some(res) = data.result.take() {
                return res;
            }
            if data.completed {
                return Err(DbusError::Cancelled);
            }
            self.slot.cond.wait(&mut data);
        }
    }

    /// Like [`Self::wait`] but gives up after `timeout`. The call is withdrawn
    /// in that case.
    pub fn wait_timeout(self, timeout: Duration) -> Option<CallResult> {
        let deadline = Instant::now().checked_add(timeout);
        let mut data = self.slot.data.lock();
        loop {
            if let Some(res) = data.result.take() {
                return Some(res);
            }
            if data.completed {
                return Some(Err(DbusError::Cancelled));
            }
            match deadline {
                Some(deadline) => {
                    if self.slot.cond.wait_until(&mut data, deadline).timed_out() {
                        return None;
                    }
                }
                None => self.slot.cond.wait(&mut data),
            }
        }
    }
}

impl Future for PendingCall {
    type Output = CallResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.slot.waker.register(cx.waker());
        let mut data = self.slot.data.lock();
        if let Some(res) = data.result.take() {
            return Poll::Ready(res);
        }
        if data.completed {
            return Poll::Ready(Err(DbusError::Cancelled));
        }
        Poll::Pending
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.slot.is_completed() {
            self.conn.forget(self.serial);
        }
    }
}

impl Debug for PendingCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("serial", &self.serial)
            .field("completed", &self.is_completed())
            .finish()
    }
}
