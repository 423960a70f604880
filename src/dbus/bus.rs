//! The `org.freedesktop.DBus` interface of the bus daemon.

use {
    crate::dbus::{
        Connection, DbusError, ERROR_NAME_HAS_NO_OWNER, MatchRule, Method, Reply, Value,
        WireError,
    },
    std::fmt::{Display, Formatter},
};


pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

pub const HELLO: &str = "Hello";
pub const REQUEST_NAME: &str = "RequestName";
pub const RELEASE_NAME: &str = "ReleaseName";
pub const GET_NAME_OWNER: &str = "GetNameOwner";
pub const ADD_MATCH: &str = "AddMatch";
pub const REMOVE_MATCH: &str = "RemoveMatch";

pub const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";
pub const NAME_ACQUIRED: &str = "NameAcquired";
pub const NAME_LOST: &str = "NameLost";

bitflags! {
    RequestNameFlags: u32;
    ALLOW_REPLACEMENT = 1,
    REPLACE_EXISTING = 2,
    DO_NOT_QUEUE = 4,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

impl RequestNameReply {
    pub fn from_u32(code: u32) -> Option<Self> {
        let res = match code {
            1 => Self::PrimaryOwner,
            2 => Self::InQueue,
            3 => Self::Exists,
            4 => Self::AlreadyOwner,
            _ => return None,
        };
        Some(res)
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::PrimaryOwner => 1,
            Self::InQueue => 2,
            Self::Exists => 3,
            Self::AlreadyOwner => 4,
        }
    }

    pub fn from_reply(reply: &Reply) -> Result<Self, DbusError> {
        let code = reply_code(reply)?;
        Self::from_u32(code).ok_or(DbusError::MalformedWireData(WireError::UnknownReplyCode(code)))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

impl ReleaseNameReply {
    pub fn from_u32(code: u32) -> Option<Self> {
        let res = match code {
            1 => Self::Released,
            2 => Self::NonExistent,
            3 => Self::NotOwner,
            _ => return None,
        };
        Some(res)
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Released => 1,
            Self::NonExistent => 2,
            Self::NotOwner => 3,
        }
    }

    pub fn from_reply(reply: &Reply) -> Result<Self, DbusError> {
        let code = reply_code(reply)?;
        Self::from_u32(code).ok_or(DbusError::MalformedWireData(WireError::UnknownReplyCode(code)))
    }
}

impl Display for RequestNameReply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PrimaryOwner => "primary owner",
            Self::InQueue => "in queue",
            Self::Exists => "exists",
            Self::AlreadyOwner => "already owner",
        };
        f.write_str(s)
    }
}

fn reply_code(reply: &Reply) -> Result<u32, DbusError> {
    reply.expect_signature("u")?;
    match reply.arg(0) {
        Some(Value::U32(code)) => Ok(*code),
        _ => Err(DbusError::MalformedWireData(WireError::UnexpectedEof)),
    }
}

/// A method of the bus daemon.
pub fn method(member: &str) -> Method<'_> {
    Method {
        destination: Some(BUS_NAME),
        path: BUS_PATH,
        interface: Some(BUS_INTERFACE),
        member,
    }
}

fn bus_signal(member: &str, name: &str) -> MatchRule {
    MatchRule::new()
        .sender(BUS_NAME)
        .interface(BUS_INTERFACE)
        .member(member)
        .arg0(name)
}

/// Matches ownership changes of `name` on any connection.
pub fn name_owner_changed_rule(name: &str) -> MatchRule {
    bus_signal(NAME_OWNER_CHANGED, name).path(BUS_PATH)
}

pub fn name_acquired_rule(name: &str) -> MatchRule {
    bus_signal(NAME_ACQUIRED, name)
}

pub fn name_lost_rule(name: &str) -> MatchRule {
    bus_signal(NAME_LOST, name)
}

/// Blocking wrappers around the bus daemon interface.
///
/// These bypass the [`NameOwner`](super::NameOwner) bookkeeping and are meant
/// for tools and tests that want to see the raw replies.
impl Connection {
    pub fn request_name(
        &self,
        name: &str,
        flags: RequestNameFlags,
    ) -> Result<RequestNameReply, DbusError> {
        let args = [Value::from(name), Value::U32(flags.0)];
        let reply = self.call_blocking(&method(REQUEST_NAME), &args)?;
        RequestNameReply::from_reply(&reply)
    }

    pub fn release_name(&self, name: &str) -> Result<ReleaseNameReply, DbusError> {
        let reply = self.call_blocking(&method(RELEASE_NAME), &[Value::from(name)])?;
        ReleaseNameReply::from_reply(&reply)
    }

    /// Returns the unique name of the owner of `name` if it has one.
    pub fn get_name_owner(&self, name: &str) -> Result<Option<String>, DbusError> {
        let res = self.call_blocking(&method(GET_NAME_OWNER), &[Value::from(name)]);
        let reply = match res {
            Ok(r) => r,
            Err(e) if e.remote_name() == Some(ERROR_NAME_HAS_NO_OWNER) => return Ok(None),
            Err(e) => return Err(e),
        };
        reply.expect_signature("s")?;
        Ok(reply.body.into_iter().next().and_then(|v| v.into_string()))
    }
}
