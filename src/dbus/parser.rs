use {
    crate::dbus::{
        DynamicType, Endian, MAX_ARRAY_LEN, MAX_CONTAINER_DEPTH, MAX_TOTAL_DEPTH, WireError,
        types::{ObjectPath, Signature, Value, is_valid_object_path},
    },
    bstr::ByteSlice,
    byteorder::{BigEndian, ByteOrder, LittleEndian},
};

/// A read cursor over marshalled data.
///
/// Offsets are absolute within `buf` so that alignment is computed relative to
/// the start of the message or body the parser was created for.
pub struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
    arrays: u32,
    structs: u32,
    total: u32,
}

macro_rules! read_num {
    ($name:ident, $ty:ty, $read:ident) => {
        pub fn $name(&mut self) -> Result<$ty, WireError> {
            let b = self.take(size_of::<$ty>())?;
            Ok(match self.endian {
                Endian::Little => LittleEndian::$read(b),
                Endian::Big => BigEndian::$read(b),
            })
        }
    };
}

impl<'a> Parser<'a> {
    pub fn new(buf: &'a [u8], endian: Endian) -> Self {
        Self {
            buf,
            pos: 0,
            endian,
            arrays: 0,
            structs: 0,
            total: 0,
        }
    }

    pub fn eof(&self) -> bool {
        self.pos == self.buf.len()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Fails if any bytes remain.
    pub fn finish(&self) -> Result<(), WireError> {
        match self.eof() {
            true => Ok(()),
            false => Err(WireError::TrailingBytes),
        }
    }

    pub fn align_to(&mut self, n: usize) -> Result<(), WireError> {
        let new = self.pos + (self.pos.wrapping_neg() & (n - 1));
        if new > self.buf.len() {
            return Err(WireError::UnexpectedEof);
        }
        if self.buf[self.pos..new].iter().any(|&b| b != 0) {
            return Err(WireError::NonZeroPadding);
        }
        self.pos = new;
        Ok(())
    }

    /// Aligns to the natural alignment of an `n`-byte number and consumes it.
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.align_to(n)?;
        if self.buf.len() - self.pos < n {
            return Err(WireError::UnexpectedEof);
        }
        let b = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(b)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    read_num!(read_i16, i16, read_i16);
    read_num!(read_u16, u16, read_u16);
    read_num!(read_i32, i32, read_i32);
    read_num!(read_u32, u32, read_u32);
    read_num!(read_i64, i64, read_i64);
    read_num!(read_u64, u64, read_u64);
    read_num!(read_f64, f64, read_f64);

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidBoolValue),
        }
    }

    pub fn read_string(&mut self) -> Result<&'a str, WireError> {
        let len = self.read_u32()?;
        self.read_string_(len as usize)
    }

    pub fn read_object_path(&mut self) -> Result<ObjectPath, WireError> {
        let s = self.read_string()?;
        if !is_valid_object_path(s) {
            return Err(WireError::InvalidObjectPath(s.to_string()));
        }
        Ok(ObjectPath(s.to_string()))
    }

    pub fn read_signature(&mut self) -> Result<Signature, WireError> {
        let len = self.read_u8()?;
        let s = self.read_string_(len as usize)?;
        DynamicType::parse_signature(s)?;
        Ok(Signature(s.to_string()))
    }

    fn read_string_(&mut self, len: usize) -> Result<&'a str, WireError> {
        if self.buf.len() - self.pos < len + 1 {
            return Err(WireError::UnexpectedEof);
        }
        let s = &self.buf[self.pos..self.pos + len];
        if self.buf[self.pos + len] != 0 || s.contains(&0) {
            return Err(WireError::UnterminatedString);
        }
        self.pos += len + 1;
        match s.to_str() {
            Ok(s) => Ok(s),
            _ => Err(WireError::InvalidUtf8),
        }
    }

    /// Reads an array header and returns a parser limited to the array
    /// contents. The contents are skipped in `self`.
    pub fn read_array(&mut self, alignment: usize) -> Result<Parser<'a>, WireError> {
        if self.arrays >= MAX_CONTAINER_DEPTH || self.total >= MAX_TOTAL_DEPTH {
            return Err(WireError::NestingTooDeep);
        }
        let len = self.read_u32()? as usize;
        if len > MAX_ARRAY_LEN {
            return Err(WireError::ArrayTooLong);
        }
        self.align_to(alignment)?;
        if self.buf.len() - self.pos < len {
            return Err(WireError::ArrayLength);
        }
        let parser = Parser {
            buf: &self.buf[..self.pos + len],
            pos: self.pos,
            endian: self.endian,
            arrays: self.arrays + 1,
            structs: self.structs,
            total: self.total + 1,
        };
        self.pos += len;
        Ok(parser)
    }

    pub fn enter(&mut self) -> Result<(), WireError> {
        if self.structs >= MAX_CONTAINER_DEPTH || self.total >= MAX_TOTAL_DEPTH {
            return Err(WireError::NestingTooDeep);
        }
        self.structs += 1;
        self.total += 1;
        Ok(())
    }

    pub fn leave(&mut self) {
        self.structs -= 1;
        self.total -= 1;
    }

    pub fn read_variant(&mut self) -> Result<Value, WireError> {
        let sig = self.read_signature()?;
        let ty = DynamicType::parse_single(&sig)?;
        if self.total >= MAX_TOTAL_DEPTH {
            return Err(WireError::NestingTooDeep);
        }
        self.total += 1;
        let res = ty.parse(self);
        self.total -= 1;
        res
    }
}
