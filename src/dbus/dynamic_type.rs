use {
    crate::dbus::{
        MAX_CONTAINER_DEPTH, MAX_SIGNATURE_LEN, TY_ARRAY, TY_BOOLEAN, TY_BYTE, TY_DOUBLE,
        TY_INT16, TY_INT32, TY_INT64, TY_OBJECT_PATH, TY_SIGNATURE, TY_STRING, TY_UINT16,
        TY_UINT32, TY_UINT64, TY_UNIX_FD, TY_VARIANT, WireError,
        parser::Parser,
        types::{DictKey, Signature, Value},
    },
    indexmap::IndexMap,
    std::fmt::{Display, Formatter},
};

/// A complete D-Bus type.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum DynamicType {
    U8,
    Bool,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F64,
    String,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<DynamicType>),
    DictEntry(Box<DynamicType>, Box<DynamicType>),
    Struct(Vec<DynamicType>),
}

impl DynamicType {
    /// Parses a single complete type from the start of `s` and returns the
    /// remainder.
    pub fn from_signature(s: &[u8]) -> Result<(DynamicType, &[u8]), WireError> {
        Self::from_signature_(s, 0, 0, false)
    }

    /// Parses a signature consisting of any number of complete types.
    pub fn parse_signature(s: &str) -> Result<Vec<DynamicType>, WireError> {
        if s.len() > MAX_SIGNATURE_LEN {
            return Err(WireError::SignatureTooLong);
        }
        let mut rem = s.as_bytes();
        let mut res = vec![];
        while rem.len() > 0 {
            let (ty, r) = Self::from_signature(rem)?;
            res.push(ty);
            rem = r;
        }
        Ok(res)
    }

    /// Parses a signature that must consist of exactly one complete type.
    pub fn parse_single(s: &str) -> Result<DynamicType, WireError> {
        if s.len() > MAX_SIGNATURE_LEN {
            return Err(WireError::SignatureTooLong);
        }
        let (ty, rem) = Self::from_signature(s.as_bytes())?;
        if rem.len() > 0 {
            return Err(WireError::TrailingVariantSignature);
        }
        Ok(ty)
    }

    fn from_signature_(
        s: &[u8],
        arrays: u32,
        structs: u32,
        in_array: bool,
    ) -> Result<(DynamicType, &[u8]), WireError> {
        let Some((&first, mut s)) = s.split_first() else {
            return Err(WireError::EmptySignature);
        };
        let dp = match first {
            TY_BYTE => DynamicType::U8,
            TY_BOOLEAN => DynamicType::Bool,
            TY_INT16 => DynamicType::I16,
            TY_UINT16 => DynamicType::U16,
            TY_INT32 => DynamicType::I32,
            TY_UINT32 => DynamicType::U32,
            TY_INT64 => DynamicType::I64,
            TY_UINT64 => DynamicType::U64,
            TY_DOUBLE => DynamicType::F64,
            TY_STRING => DynamicType::String,
            TY_OBJECT_PATH => DynamicType::ObjectPath,
            TY_SIGNATURE => DynamicType::Signature,
            TY_VARIANT => DynamicType::Variant,
            TY_UNIX_FD => return Err(WireError::UnixFds),
            TY_ARRAY => {
                if arrays >= MAX_CONTAINER_DEPTH {
                    return Err(WireError::NestingTooDeep);
                }
                let (elty, rem) = Self::from_signature_(s, arrays + 1, structs, true)?;
                s = rem;
                DynamicType::Array(Box::new(elty))
            }
            b'{' => {
                if !in_array {
                    return Err(WireError::StrayDictEntry);
                }
                if structs >= MAX_CONTAINER_DEPTH {
                    return Err(WireError::NestingTooDeep);
                }
                let (keyty, rem) = Self::from_signature_(s, arrays, structs + 1, false)?;
                if !keyty.is_basic() {
                    return Err(WireError::InvalidDictKey);
                }
                let (valty, rem) = Self::from_signature_(rem, arrays, structs + 1, false)?;
                match rem.split_first() {
                    None => return Err(WireError::UnterminatedDict),
                    Some((b'}', rem)) => s = rem,
                    Some(_) => return Err(WireError::DictTrailing),
                }
                DynamicType::DictEntry(Box::new(keyty), Box::new(valty))
            }
            b'(' => {
                if structs >= MAX_CONTAINER_DEPTH {
                    return Err(WireError::NestingTooDeep);
                }
                let mut fields = vec![];
                loop {
                    match s.split_first() {
                        None => return Err(WireError::UnterminatedStruct),
                        Some((b')', rem)) => {
                            s = rem;
                            break;
                        }
                        Some(_) => {}
                    }
                    let (fieldty, rem) = Self::from_signature_(s, arrays, structs + 1, false)?;
                    s = rem;
                    fields.push(fieldty);
                }
                if fields.is_empty() {
                    return Err(WireError::EmptyStruct);
                }
                DynamicType::Struct(fields)
            }
            c => return Err(WireError::UnknownType(c as char)),
        };
        Ok((dp, s))
    }

    /// Returns whether this is a basic type, i.e. a valid dict key.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            DynamicType::Variant
                | DynamicType::Array(_)
                | DynamicType::DictEntry(_, _)
                | DynamicType::Struct(_)
        )
    }

    pub fn alignment(&self) -> usize {
        match self {
            DynamicType::U8 => 1,
            DynamicType::Bool => 4,
            DynamicType::I16 => 2,
            DynamicType::U16 => 2,
            DynamicType::I32 => 4,
            DynamicType::U32 => 4,
            DynamicType::I64 => 8,
            DynamicType::U64 => 8,
            DynamicType::F64 => 8,
            DynamicType::String => 4,
            DynamicType::ObjectPath => 4,
            DynamicType::Signature => 1,
            DynamicType::Variant => 1,
            DynamicType::Array(_) => 4,
            DynamicType::DictEntry(_, _) => 8,
            DynamicType::Struct(_) => 8,
        }
    }

    pub fn write_signature(&self, w: &mut String) {
        let c = match self {
            DynamicType::U8 => TY_BYTE,
            DynamicType::Bool => TY_BOOLEAN,
            DynamicType::I16 => TY_INT16,
            DynamicType::U16 => TY_UINT16,
            DynamicType::I32 => TY_INT32,
            DynamicType::U32 => TY_UINT32,
            DynamicType::I64 => TY_INT64,
            DynamicType::U64 => TY_UINT64,
            DynamicType::F64 => TY_DOUBLE,
            DynamicType::String => TY_STRING,
            DynamicType::ObjectPath => TY_OBJECT_PATH,
            DynamicType::Signature => TY_SIGNATURE,
            DynamicType::Variant => TY_VARIANT,
            DynamicType::Array(el) => {
                w.push(TY_ARRAY as char);
                el.write_signature(w);
                return;
            }
            DynamicType::DictEntry(k, v) => {
                w.push('{');
                k.write_signature(w);
                v.write_signature(w);
                w.push('}');
                return;
            }
            DynamicType::Struct(f) => {
                w.push('(');
                for f in f {
                    f.write_signature(w);
                }
                w.push(')');
                return;
            }
        };
        w.push(c as char);
    }

    pub fn signature(&self) -> Signature {
        let mut s = String::new();
        self.write_signature(&mut s);
        Signature(s)
    }

    /// Decodes a value of this type.
    pub fn parse(&self, parser: &mut Parser<'_>) -> Result<Value, WireError> {
        let var = match self {
            DynamicType::U8 => Value::U8(parser.read_u8()?),
            DynamicType::Bool => Value::Bool(parser.read_bool()?),
            DynamicType::I16 => Value::I16(parser.read_i16()?),
            DynamicType::U16 => Value::U16(parser.read_u16()?),
            DynamicType::I32 => Value::I32(parser.read_i32()?),
            DynamicType::U32 => Value::U32(parser.read_u32()?),
            DynamicType::I64 => Value::I64(parser.read_i64()?),
            DynamicType::U64 => Value::U64(parser.read_u64()?),
            DynamicType::F64 => Value::F64(parser.read_f64()?),
            DynamicType::String => Value::String(parser.read_string()?.to_string()),
            DynamicType::ObjectPath => Value::ObjectPath(parser.read_object_path()?),
            DynamicType::Signature => Value::Signature(parser.read_signature()?),
            DynamicType::Variant => Value::Variant(Box::new(parser.read_variant()?)),
            DynamicType::Array(el) => {
                let mut elements = parser.read_array(el.alignment())?;
                if let DynamicType::DictEntry(k, v) = &**el {
                    let mut entries = IndexMap::new();
                    while !elements.eof() {
                        elements.align_to(8)?;
                        elements.enter()?;
                        let key = k.parse(&mut elements)?;
                        let value = v.parse(&mut elements)?;
                        elements.leave();
                        let Ok(key) = DictKey::try_from(key) else {
                            return Err(WireError::InvalidDictKey);
                        };
                        entries.insert(key, value);
                    }
                    Value::Dict((**k).clone(), (**v).clone(), entries)
                } else {
                    let mut vals = vec![];
                    while !elements.eof() {
                        vals.push(el.parse(&mut elements)?);
                    }
                    Value::Array((**el).clone(), vals)
                }
            }
            DynamicType::DictEntry(..) => return Err(WireError::StrayDictEntry),
            DynamicType::Struct(fields) => {
                parser.align_to(8)?;
                parser.enter()?;
                let mut vals = Vec::with_capacity(fields.len());
                for field in fields {
                    vals.push(field.parse(parser)?);
                }
                parser.leave();
                Value::Struct(vals)
            }
        };
        Ok(var)
    }
}

impl Display for DynamicType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        self.write_signature(&mut s);
        f.write_str(&s)
    }
}
