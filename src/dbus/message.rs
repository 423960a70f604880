use {
    crate::dbus::{
        DbusError, Endian, HDR_DESTINATION, HDR_ERROR_NAME, HDR_INTERFACE, HDR_MEMBER, HDR_PATH,
        HDR_REPLY_SERIAL, HDR_SENDER, HDR_SIGNATURE, HDR_UNIX_FDS, MAX_MESSAGE_LEN,
        MSG_ERROR, MSG_METHOD_CALL, MSG_METHOD_RETURN, MSG_SIGNAL, WireError, codec,
        formatter::Formatter,
        parser::Parser,
        types::{ObjectPath, Signature, Value},
    },
    byteorder::{BigEndian, ByteOrder, LittleEndian},
};


const FIXED_HEADER_SIZE: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageKind {
    fn from_u8(ty: u8) -> Result<Self, WireError> {
        let kind = match ty {
            MSG_METHOD_CALL => MessageKind::MethodCall,
            MSG_METHOD_RETURN => MessageKind::MethodReturn,
            MSG_ERROR => MessageKind::Error,
            MSG_SIGNAL => MessageKind::Signal,
            _ => return Err(WireError::InvalidMessageType(ty)),
        };
        Ok(kind)
    }

    fn to_u8(self) -> u8 {
        match self {
            MessageKind::MethodCall => MSG_METHOD_CALL,
            MessageKind::MethodReturn => MSG_METHOD_RETURN,
            MessageKind::Error => MSG_ERROR,
            MessageKind::Signal => MSG_SIGNAL,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Headers {
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Option<Signature>,
    pub unix_fds: Option<u32>,
}

/// A single D-Bus message with an encoded body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WireMessage {
    pub kind: MessageKind,
    pub flags: u8,
    /// Assigned by the sending connection. Never 0 on the wire.
    pub serial: u32,
    pub endian: Endian,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl WireMessage {
    fn new(kind: MessageKind, headers: Headers) -> Self {
        Self {
            kind,
            flags: 0,
            serial: 0,
            endian: Endian::NATIVE,
            headers,
            body: vec![],
        }
    }

    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Self {
        Self::new(
            MessageKind::MethodCall,
            Headers {
                path: Some(ObjectPath(path.to_string())),
                interface: interface.map(|s| s.to_string()),
                member: Some(member.to_string()),
                destination: destination.map(|s| s.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self::new(
            MessageKind::Signal,
            Headers {
                path: Some(ObjectPath(path.to_string())),
                interface: Some(interface.to_string()),
                member: Some(member.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn method_return(call: &WireMessage) -> Self {
        Self::new(
            MessageKind::MethodReturn,
            Headers {
                reply_serial: Some(call.serial),
                destination: call.headers.sender.clone(),
                ..Default::default()
            },
        )
    }

    pub fn error(call: &WireMessage, name: &str, msg: Option<&str>) -> Self {
        let mut res = Self::new(
            MessageKind::Error,
            Headers {
                error_name: Some(name.to_string()),
                reply_serial: Some(call.serial),
                destination: call.headers.sender.clone(),
                ..Default::default()
            },
        );
        if let Some(msg) = msg {
            // A string body cannot fail to encode unless it contains a nul byte.
            let msg = msg.replace('\0', "");
            if let Ok((sig, body)) = codec::encode_body(&[Value::String(msg)], res.endian) {
                res.headers.signature = Some(sig);
                res.body = body;
            }
        }
        res
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Encodes `args` as the body of this message.
    pub fn set_body(&mut self, args: &[Value]) -> Result<(), DbusError> {
        let (sig, body) = codec::encode_body(args, self.endian)?;
        self.headers.signature = match sig.len() {
            0 => None,
            _ => Some(sig),
        };
        self.body = body;
        Ok(())
    }

    pub fn with_body(mut self, args: &[Value]) -> Result<Self, DbusError> {
        self.set_body(args)?;
        Ok(self)
    }

    pub fn signature(&self) -> &str {
        self.headers.signature.as_deref().unwrap_or("")
    }

    pub fn decode_body(&self) -> Result<Vec<Value>, DbusError> {
        codec::decode_body(self.signature(), &self.body, self.endian)
    }

    /// Checks that the headers required for the message kind are present.
    pub fn validate(&self) -> Result<(), WireError> {
        let h = &self.headers;
        if h.unix_fds.unwrap_or(0) > 0 {
            return Err(WireError::UnixFds);
        }
        let require = |present: bool, name: &'static str| match present {
            true => Ok(()),
            false => Err(WireError::MissingHeader(name)),
        };
        match self.kind {
            MessageKind::MethodCall => {
                require(h.path.is_some(), "path")?;
                require(h.member.is_some(), "member")?;
            }
            MessageKind::Signal => {
                require(h.path.is_some(), "path")?;
                require(h.interface.is_some(), "interface")?;
                require(h.member.is_some(), "member")?;
            }
            MessageKind::Error => {
                require(h.error_name.is_some(), "error_name")?;
                require(h.reply_serial.is_some(), "reply_serial")?;
            }
            MessageKind::MethodReturn => {
                require(h.reply_serial.is_some(), "reply_serial")?;
            }
        }
        Ok(())
    }

    /// Produces the complete wire representation of this message.
    pub fn marshal(&self) -> Result<Vec<u8>, WireError> {
        if self.serial == 0 {
            return Err(WireError::ZeroSerial);
        }
        self.validate()?;
        let mut buf = Vec::with_capacity(FIXED_HEADER_SIZE + 128 + self.body.len());
        let mut fmt = Formatter::new(&mut buf, self.endian);
        fmt.write_u8(self.endian.marker());
        fmt.write_u8(self.kind.to_u8());
        fmt.write_u8(self.flags);
        fmt.write_u8(1);
        fmt.write_u32(self.body.len() as u32);
        fmt.write_u32(self.serial);
        let h = &self.headers;
        let mut fields = Vec::with_capacity(8);
        if let Some(v) = &h.path {
            fields.push((HDR_PATH, Value::ObjectPath(v.clone())));
        }
        if let Some(v) = &h.interface {
            fields.push((HDR_INTERFACE, Value::String(v.clone())));
        }
        if let Some(v) = &h.member {
            fields.push((HDR_MEMBER, Value::String(v.clone())));
        }
        if let Some(v) = &h.error_name {
            fields.push((HDR_ERROR_NAME, Value::String(v.clone())));
        }
        if let Some(v) = h.reply_serial {
            fields.push((HDR_REPLY_SERIAL, Value::U32(v)));
        }
        if let Some(v) = &h.destination {
            fields.push((HDR_DESTINATION, Value::String(v.clone())));
        }
        if let Some(v) = &h.sender {
            fields.push((HDR_SENDER, Value::String(v.clone())));
        }
        if let Some(v) = &h.signature {
            fields.push((HDR_SIGNATURE, Value::Signature(v.clone())));
        }
        fmt.write_array(8, |fmt| {
            for (code, value) in &fields {
                fmt.pad_to(8);
                fmt.write_u8(*code);
                fmt.write_signature(&value.signature());
                fmt.write_value(value)?;
            }
            Ok(())
        })
        .map_err(|_| WireError::MessageTooLong)?;
        fmt.pad_to(8);
        if fmt.len() + self.body.len() > MAX_MESSAGE_LEN {
            return Err(WireError::MessageTooLong);
        }
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Returns the total length of the message at the start of `buf` or
    /// `None` if more bytes are needed to determine it.
    pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, WireError> {
        if buf.len() < FIXED_HEADER_SIZE {
            return Ok(None);
        }
        let read = match Endian::from_marker(buf[0])? {
            Endian::Little => LittleEndian::read_u32,
            Endian::Big => BigEndian::read_u32,
        };
        let body_len = read(&buf[4..8]) as usize;
        let fields_len = read(&buf[12..16]) as usize;
        let fields_len = fields_len + (fields_len.wrapping_neg() & 7);
        let total = FIXED_HEADER_SIZE + fields_len + body_len;
        if total > MAX_MESSAGE_LEN {
            return Err(WireError::MessageTooLong);
        }
        Ok(Some(total))
    }

    /// Parses the message at the start of `buf` and returns it together with
    /// the number of bytes it occupied.
    pub fn unmarshal(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let Some(total) = Self::frame_len(buf)? else {
            return Err(WireError::UnexpectedEof);
        };
        if buf.len() < total {
            return Err(WireError::UnexpectedEof);
        }
        let buf = &buf[..total];
        let endian = Endian::from_marker(buf[0])?;
        let mut parser = Parser::new(buf, endian);
        parser.read_u8()?;
        let kind = MessageKind::from_u8(parser.read_u8()?)?;
        let flags = parser.read_u8()?;
        if parser.read_u8()? != 1 {
            return Err(WireError::InvalidProtocol);
        }
        let body_len = parser.read_u32()? as usize;
        let serial = parser.read_u32()?;
        if serial == 0 {
            return Err(WireError::ZeroSerial);
        }
        let mut fields = parser.read_array(8)?;
        let headers = parse_headers(&mut fields)?;
        parser.align_to(8)?;
        let start = parser.pos();
        if start + body_len != total {
            return Err(WireError::ArrayLength);
        }
        let msg = Self {
            kind,
            flags,
            serial,
            endian,
            headers,
            body: buf[start..].to_vec(),
        };
        msg.validate()?;
        Ok((msg, total))
    }
}

fn parse_headers(parser: &mut Parser<'_>) -> Result<Headers, WireError> {
    let mut headers = Headers::default();
    while !parser.eof() {
        parser.align_to(8)?;
        let ty = parser.read_u8()?;
        let val = parser.read_variant()?;
        let invalid = || WireError::InvalidHeaderType(ty);
        let string = |val: Value| val.into_string().ok_or_else(invalid);
        match ty {
            HDR_PATH => match val {
                Value::ObjectPath(p) => headers.path = Some(p),
                _ => return Err(invalid()),
            },
            HDR_INTERFACE => headers.interface = Some(string(val)?),
            HDR_MEMBER => headers.member = Some(string(val)?),
            HDR_ERROR_NAME => headers.error_name = Some(string(val)?),
            HDR_REPLY_SERIAL => headers.reply_serial = Some(val.as_u32().ok_or_else(invalid)?),
            HDR_DESTINATION => headers.destination = Some(string(val)?),
            HDR_SENDER => headers.sender = Some(string(val)?),
            HDR_SIGNATURE => match val {
                Value::Signature(s) => headers.signature = Some(s),
                _ => return Err(invalid()),
            },
            HDR_UNIX_FDS => headers.unix_fds = Some(val.as_u32().ok_or_else(invalid)?),
            _ => {}
        }
    }
    Ok(headers)
}
