use {
    crate::{
        ErrorFmt,
        dbus::{WireError, WireMessage},
    },
    parking_lot::{Condvar, Mutex},
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        mem,
        net::Shutdown,
        os::unix::net::UnixStream,
        sync::Arc,
    },
    thiserror::Error,
};


#[derive(Debug, Error)]
pub enum TransportError {
    #[error("The transport is closed")]
    Closed,
    #[error("An IO error occurred")]
    Io(#[source] io::Error),
    #[error("Could not frame the message")]
    Wire(#[from] WireError),
}

/// Something delivered by a transport to the dispatch core.
#[derive(Debug)]
pub enum TransportEvent {
    Message(WireMessage),
    Closed,
}

/// A full-duplex stream of whole messages.
///
/// Authentication and connection setup happen before a transport is handed to
/// a connection.
pub trait Transport: Send + Sync {
    /// Enqueues a message. Messages are delivered in the order they were sent.
    fn send(&self, msg: WireMessage) -> Result<(), TransportError>;

    /// Blocks until the next message arrives. Returns `None` once the
    /// transport is closed and all queued messages have been returned.
    fn receive(&self) -> Option<WireMessage>;

    fn is_open(&self) -> bool;

    /// Registers a function to run once when the transport closes. Runs
    /// immediately if it is already closed.
    fn on_closed(&self, f: Box<dyn FnOnce() + Send>);

    fn close(&self);
}

#[derive(Default)]
struct CloseObservers {
    closed: bool,
    observers: Vec<Box<dyn FnOnce() + Send>>,
}

impl CloseObservers {
    fn register(&mut self, f: Box<dyn FnOnce() + Send>) -> Option<Box<dyn FnOnce() + Send>> {
        if self.closed {
            return Some(f);
        }
        self.observers.push(f);
        None
    }

    fn close(&mut self) -> Option<Vec<Box<dyn FnOnce() + Send>>> {
        if mem::replace(&mut self.closed, true) {
            return None;
        }
        Some(mem::take(&mut self.observers))
    }
}

fn run_observers(observers: Option<Vec<Box<dyn FnOnce() + Send>>>) {
    for f in observers.into_iter().flatten() {
        f();
    }
}

struct MemoryState {
    queues: [VecDeque<WireMessage>; 2],
    close: [CloseObservers; 2],
}

struct MemoryShared {
    state: Mutex<MemoryState>,
    cond: Condvar,
}

/// One end of an in-process transport pair.
pub struct MemoryTransport {
    shared: Arc<MemoryShared>,
    side: usize,
    framed: bool,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        Self::pair_(false)
    }

    /// Like [`Self::pair`] but every message is marshalled and parsed again
    /// on its way through the pipe.
    pub fn pair_framed() -> (Self, Self) {
        Self::pair_(true)
    }

    fn pair_(framed: bool) -> (Self, Self) {
        let shared = Arc::new(MemoryShared {
            state: Mutex::new(MemoryState {
                queues: Default::default(),
                close: Default::default(),
            }),
            cond: Condvar::new(),
        });
        let a = Self {
            shared: shared.clone(),
            side: 0,
            framed,
        };
        let b = Self {
            shared,
            side: 1,
            framed,
        };
        (a, b)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, mut msg: WireMessage) -> Result<(), TransportError> {
        if self.framed {
            let buf = msg.marshal()?;
            msg = WireMessage::unmarshal(&buf)?.0;
        }
        let mut state = self.shared.state.lock();
        if state.close[self.side].closed {
            return Err(TransportError::Closed);
        }
        state.queues[1 - self.side].push_back(msg);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn receive(&self) -> Option<WireMessage> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(msg) = state.queues[self.side].pop_front() {
                return Some(msg);
            }
            if state.close[self.side].closed {
                return None;
            }
            self.shared.cond.wait(&mut state);
        }
    }

    fn is_open(&self) -> bool {
        !self.shared.state.lock().close[self.side].closed
    }

    fn on_closed(&self, f: Box<dyn FnOnce() + Send>) {
        let f = self.shared.state.lock().close[self.side].register(f);
        if let Some(f) = f {
            f();
        }
    }

    fn close(&self) {
        let (a, b) = {
            let mut state = self.shared.state.lock();
            let [a, b] = &mut state.close;
            (a.close(), b.close())
        };
        self.shared.cond.notify_all();
        run_observers(a);
        run_observers(b);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct StreamReader {
    stream: UnixStream,
    buf: Vec<u8>,
}

/// A transport over an already authenticated unix stream socket.
pub struct StreamTransport {
    reader: Mutex<StreamReader>,
    writer: Mutex<UnixStream>,
    control: UnixStream,
    close: Mutex<CloseObservers>,
}

impl StreamTransport {
    pub fn new(stream: UnixStream) -> Result<Self, TransportError> {
        let reader = stream.try_clone().map_err(TransportError::Io)?;
        let control = stream.try_clone().map_err(TransportError::Io)?;
        Ok(Self {
            reader: Mutex::new(StreamReader {
                stream: reader,
                buf: vec![],
            }),
            writer: Mutex::new(stream),
            control,
            close: Default::default(),
        })
    }

    fn read_msg(reader: &mut StreamReader) -> Result<Option<WireMessage>, TransportError> {
        let mut chunk = [0; 4096];
        loop {
            if let Some(len) = WireMessage::frame_len(&reader.buf)? {
                if reader.buf.len() >= len {
                    let (msg, n) = WireMessage::unmarshal(&reader.buf)?;
                    reader.buf.drain(..n);
                    return Ok(Some(msg));
                }
            }
            let n = match reader.stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            };
            if n == 0 {
                return Ok(None);
            }
            reader.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl Transport for StreamTransport {
    fn send(&self, msg: WireMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let buf = msg.marshal()?;
        let res = self.writer.lock().write_all(&buf);
        if let Err(e) = res {
            self.close();
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    fn receive(&self) -> Option<WireMessage> {
        let mut reader = self.reader.lock();
        match Self::read_msg(&mut reader) {
            Ok(Some(msg)) => return Some(msg),
            Ok(None) => {}
            Err(e) => {
                log::error!("Could not read a message from the stream: {}", ErrorFmt(e));
            }
        }
        drop(reader);
        self.close();
        None
    }

    fn is_open(&self) -> bool {
        !self.close.lock().closed
    }

    fn on_closed(&self, f: Box<dyn FnOnce() + Send>) {
        let f = self.close.lock().register(f);
        if let Some(f) = f {
            f();
        }
    }

    fn close(&self) {
        let observers = self.close.lock().close();
        if observers.is_some() {
            let _ = self.control.shutdown(Shutdown::Both);
        }
        run_observers(observers);
    }
}
