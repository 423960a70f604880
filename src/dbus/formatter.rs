use {
    crate::dbus::{
        Endian, MAX_ARRAY_LEN,
        types::{UnsupportedValue, Value},
    },
    byteorder::{BigEndian, ByteOrder, LittleEndian},
};

/// Appends marshalled data to a buffer.
///
/// Alignment is computed relative to the start of `buf`.
pub struct Formatter<'a> {
    buf: &'a mut Vec<u8>,
    endian: Endian,
}

macro_rules! write_num {
    ($name:ident, $ty:ty, $write:ident) => {
        pub fn $name(&mut self, v: $ty) {
            const N: usize = size_of::<$ty>();
            self.pad_to(N);
            let mut b = [0; N];
            match self.endian {
                Endian::Little => LittleEndian::$write(&mut b, v),
                Endian::Big => BigEndian::$write(&mut b, v),
            }
            self.buf.extend_from_slice(&b);
        }
    };
}

impl<'a> Formatter<'a> {
    pub fn new(buf: &'a mut Vec<u8>, endian: Endian) -> Self {
        Self { buf, endian }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn pad_to(&mut self, n: usize) {
        let pad = self.buf.len().wrapping_neg() & (n - 1);
        self.buf.resize(self.buf.len() + pad, 0);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    write_num!(write_i16, i16, write_i16);
    write_num!(write_u16, u16, write_u16);
    write_num!(write_i32, i32, write_i32);
    write_num!(write_u32, u32, write_u32);
    write_num!(write_i64, i64, write_i64);
    write_num!(write_u64, u64, write_u64);
    write_num!(write_f64, f64, write_f64);

    pub fn write_bool(&mut self, v: bool) {
        self.write_u32(v as u32);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    pub fn write_signature(&mut self, s: &str) {
        self.write_u8(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Writes an array whose contents are produced by `f`.
    ///
    /// The length prefix is patched once the contents are known. It does not
    /// include the padding between the prefix and the first element.
    pub fn write_array<F>(&mut self, alignment: usize, f: F) -> Result<(), UnsupportedValue>
    where
        F: FnOnce(&mut Self) -> Result<(), UnsupportedValue>,
    {
        self.write_u32(0);
        let len_pos = self.buf.len() - 4;
        self.pad_to(alignment);
        let start = self.buf.len();
        f(self)?;
        let len = self.buf.len() - start;
        if len > MAX_ARRAY_LEN {
            return Err(UnsupportedValue::ArrayTooLong);
        }
        let dst = &mut self.buf[len_pos..len_pos + 4];
        match self.endian {
            Endian::Little => LittleEndian::write_u32(dst, len as u32),
            Endian::Big => BigEndian::write_u32(dst, len as u32),
        }
        Ok(())
    }

    /// Marshals a value that has already passed [`Value::check`].
    pub fn write_value(&mut self, value: &Value) -> Result<(), UnsupportedValue> {
        match value {
            Value::U8(v) => self.write_u8(*v),
            Value::Bool(v) => self.write_bool(*v),
            Value::I16(v) => self.write_i16(*v),
            Value::U16(v) => self.write_u16(*v),
            Value::I32(v) => self.write_i32(*v),
            Value::U32(v) => self.write_u32(*v),
            Value::I64(v) => self.write_i64(*v),
            Value::U64(v) => self.write_u64(*v),
            Value::F64(v) => self.write_f64(*v),
            Value::String(v) => self.write_str(v),
            Value::ObjectPath(v) => self.write_str(v),
            Value::Signature(v) => self.write_signature(v),
            Value::Array(el, values) => {
                self.write_array(el.alignment(), |fmt| {
                    values.iter().try_for_each(|v| fmt.write_value(v))
                })?;
            }
            Value::Dict(_, _, entries) => {
                self.write_array(8, |fmt| {
                    for (key, value) in entries {
                        fmt.pad_to(8);
                        fmt.write_value(&key.clone().into_value())?;
                        fmt.write_value(value)?;
                    }
                    Ok(())
                })?;
            }
            Value::Struct(fields) => {
                self.pad_to(8);
                for field in fields {
                    self.write_value(field)?;
                }
            }
            Value::Variant(inner) => {
                self.write_signature(&inner.signature());
                self.write_value(inner)?;
            }
        }
        Ok(())
    }
}
