//! A D-Bus client engine.
//!
//! The engine sits on top of a [`Transport`] that delivers whole messages. It
//! correlates method calls with their replies, fans incoming signals out to
//! subscribers selected by [`MatchRule`]s, routes incoming method calls to
//! exported objects, and implements well-known name ownership
//! ([`NameOwner`]) and presence tracking ([`NameWatcher`]) on top of those
//! primitives.
//!
//! All values crossing the engine boundary are [`Value`]s which are
//! translated to and from the wire format by the [`codec`].

use {
    std::{
        fmt::{Display, Formatter},
        io,
    },
    thiserror::Error,
};

pub use {
    bus::{
        BUS_INTERFACE, BUS_NAME, BUS_PATH, ReleaseNameReply, RequestNameFlags, RequestNameReply,
    },
    connection::{Connection, ConnectionId, Method},
    context::{ExecutionContext, Immediate, Job, LocalQueue, WorkerThread},
    dynamic_type::DynamicType,
    export::{MethodInvocation, ObjectExport},
    match_rule::{MatchRule, MatchRuleError},
    message::{Headers, MessageKind, WireMessage},
    owner::{NameOwner, NameOwnerEvent},
    pending::{CallId, PendingCall, Reply},
    subscriptions::{Signal, SubscriptionId},
    transport::{MemoryTransport, StreamTransport, Transport, TransportError, TransportEvent},
    types::{DictKey, ObjectPath, Signature, UnsupportedValue, Value},
    watcher::{NameWatchEvent, NameWatcher},
};

pub mod bus;
pub mod codec;
mod connection;
mod context;
mod dynamic_type;
mod export;
mod formatter;
mod match_rule;
mod message;
mod owner;
mod parser;
mod pending;
mod subscriptions;
mod timer;
mod transport;
mod types;
mod watcher;

/// The payload of an error reply sent by a peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallError {
    pub name: String,
    pub msg: Option<String>,
}

impl CallError {
    pub fn new(name: &str, msg: &str) -> Self {
        Self {
            name: name.to_string(),
            msg: Some(msg.to_string()),
        }
    }
}

impl Display for CallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(msg) = &self.msg {
            write!(f, "{}: {}", self.name, msg)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

#[derive(Debug, Error)]
pub enum DbusError {
    #[error("Received malformed wire data")]
    MalformedWireData(#[source] WireError),
    #[error("The value cannot be serialized")]
    UnsupportedValue(#[source] UnsupportedValue),
    #[error("The call was cancelled")]
    Cancelled,
    #[error("The connection is closed")]
    Disconnected,
    #[error("The peer replied with an error: {0}")]
    RemoteError(CallError),
    #[error("The call timed out")]
    Timeout,
    #[error("Could not send a message")]
    Transport(#[source] Box<TransportError>),
    #[error("Blocking calls cannot be made on the dispatch thread")]
    DispatchThread,
    #[error("Could not start the timer thread")]
    TimerThread(#[source] io::Error),
}
efrom!(DbusError, Transport, TransportError);

impl From<WireError> for DbusError {
    fn from(e: WireError) -> Self {
        Self::MalformedWireData(e)
    }
}

impl From<UnsupportedValue> for DbusError {
    fn from(e: UnsupportedValue) -> Self {
        Self::UnsupportedValue(e)
    }
}

impl DbusError {
    /// Returns the remote error name if this is an error reply.
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            DbusError::RemoteError(e) => Some(&e.name),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WireError {
    #[error("Encountered an unknown type {0:?} in a signature")]
    UnknownType(char),
    #[error("Unexpected end of message")]
    UnexpectedEof,
    #[error("String does not contain valid UTF-8")]
    InvalidUtf8,
    #[error("String is not terminated by a nul byte")]
    UnterminatedString,
    #[error("Boolean value was not 0 or 1")]
    InvalidBoolValue,
    #[error("Signature is empty")]
    EmptySignature,
    #[error("Signature is longer than 255 bytes")]
    SignatureTooLong,
    #[error("Struct signature does not contain a terminating ')'")]
    UnterminatedStruct,
    #[error("Struct signature contains no fields")]
    EmptyStruct,
    #[error("Dict signature does not contain a terminating '}}'")]
    UnterminatedDict,
    #[error("Dict signature contains trailing types")]
    DictTrailing,
    #[error("Dict entry appears outside of an array")]
    StrayDictEntry,
    #[error("Dict key is not a basic type")]
    InvalidDictKey,
    #[error("Variant signature is not a single type")]
    TrailingVariantSignature,
    #[error("Containers are nested too deeply")]
    NestingTooDeep,
    #[error("Array is longer than the protocol permits")]
    ArrayTooLong,
    #[error("Array length does not match its contents")]
    ArrayLength,
    #[error("Padding contains non-zero bytes")]
    NonZeroPadding,
    #[error("Body contains trailing bytes")]
    TrailingBytes,
    #[error("Object path `{0}` is invalid")]
    InvalidObjectPath(String),
    #[error("Message has an invalid endianess marker")]
    InvalidEndianess,
    #[error("Peer speaks an unexpected protocol version")]
    InvalidProtocol,
    #[error("Message has an unknown type {0}")]
    InvalidMessageType(u8),
    #[error("Message has serial 0")]
    ZeroSerial,
    #[error("Message is longer than the protocol permits")]
    MessageTooLong,
    #[error("Header field {0} has the wrong type")]
    InvalidHeaderType(u8),
    #[error("Message is missing the required header field `{0}`")]
    MissingHeader(&'static str),
    #[error("Message carries unix fds which are not supported")]
    UnixFds,
    #[error("The bus replied with the unknown code {0}")]
    UnknownReplyCode(u32),
    #[error("Body has signature `{actual}` but `{expected}` was expected")]
    SignatureMismatch {
        expected: &'static str,
        actual: String,
    },
}

/// The byte order of a message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    #[cfg(target_endian = "little")]
    pub const NATIVE: Self = Endian::Little;
    #[cfg(not(target_endian = "little"))]
    pub const NATIVE: Self = Endian::Big;

    pub fn from_marker(marker: u8) -> Result<Self, WireError> {
        match marker {
            b'l' => Ok(Endian::Little),
            b'B' => Ok(Endian::Big),
            _ => Err(WireError::InvalidEndianess),
        }
    }

    pub fn marker(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }
}

const TY_BYTE: u8 = b'y';
const TY_BOOLEAN: u8 = b'b';
const TY_INT16: u8 = b'n';
const TY_UINT16: u8 = b'q';
const TY_INT32: u8 = b'i';
const TY_UINT32: u8 = b'u';
const TY_INT64: u8 = b'x';
const TY_UINT64: u8 = b't';
const TY_DOUBLE: u8 = b'd';
const TY_STRING: u8 = b's';
const TY_OBJECT_PATH: u8 = b'o';
const TY_SIGNATURE: u8 = b'g';
const TY_ARRAY: u8 = b'a';
const TY_VARIANT: u8 = b'v';
const TY_UNIX_FD: u8 = b'h';

const HDR_PATH: u8 = 1;
const HDR_INTERFACE: u8 = 2;
const HDR_MEMBER: u8 = 3;
const HDR_ERROR_NAME: u8 = 4;
const HDR_REPLY_SERIAL: u8 = 5;
const HDR_DESTINATION: u8 = 6;
const HDR_SENDER: u8 = 7;
const HDR_SIGNATURE: u8 = 8;
const HDR_UNIX_FDS: u8 = 9;

const MSG_METHOD_CALL: u8 = 1;
const MSG_METHOD_RETURN: u8 = 2;
const MSG_ERROR: u8 = 3;
const MSG_SIGNAL: u8 = 4;

pub const NO_REPLY_EXPECTED: u8 = 0x1;
pub const NO_AUTO_START: u8 = 0x2;
pub const ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x4;

const MAX_ARRAY_LEN: usize = 1 << 26;
const MAX_MESSAGE_LEN: usize = 1 << 27;
const MAX_SIGNATURE_LEN: usize = 255;
const MAX_CONTAINER_DEPTH: u32 = 32;
const MAX_TOTAL_DEPTH: u32 = 64;

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERROR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
pub const ERROR_MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";

pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

pub mod prelude {
    pub use super::{
        CallError, Connection, DbusError, DictKey, DynamicType, ExecutionContext, Immediate,
        MatchRule, ObjectPath, Signature, Value,
    };
    pub use std::sync::Arc;
}
