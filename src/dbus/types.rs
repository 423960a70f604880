use {
    crate::{
        dbus::{
            DynamicType, MAX_ARRAY_LEN, MAX_CONTAINER_DEPTH, MAX_SIGNATURE_LEN, MAX_TOTAL_DEPTH,
        },
        utils::ordered_float::F64,
    },
    indexmap::IndexMap,
    std::{
        borrow::Borrow,
        fmt::{Display, Formatter},
        ops::Deref,
    },
    thiserror::Error,
};

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum UnsupportedValue {
    #[error("Array element has type `{actual}` but the array holds `{expected}`")]
    HeterogeneousArray { expected: String, actual: String },
    #[error("Dict key has type `{actual}` but the dict is keyed by `{expected}`")]
    HeterogeneousDictKey { expected: String, actual: String },
    #[error("Dict value has type `{actual}` but the dict holds `{expected}`")]
    HeterogeneousDictValue { expected: String, actual: String },
    #[error("Dict keys must have a basic type, not `{0}`")]
    InvalidDictKey(String),
    #[error("Dict entries can only be expressed as a dict value")]
    BareDictEntry,
    #[error("Structs must have at least one field")]
    EmptyStruct,
    #[error("Object path `{0}` is invalid")]
    InvalidObjectPath(String),
    #[error("Signature `{0}` is invalid")]
    InvalidSignature(String),
    #[error("Strings must not contain nul bytes")]
    NulInString,
    #[error("The combined signature is longer than 255 bytes")]
    SignatureTooLong,
    #[error("Containers are nested too deeply")]
    NestingTooDeep,
    #[error("Array is longer than the protocol permits")]
    ArrayTooLong,
    #[error("Expected a struct to use as a message body but got `{0}`")]
    NotAStruct(String),
    #[error("Bus name `{0}` is invalid")]
    InvalidBusName(String),
    #[error("Member name `{0}` is invalid")]
    InvalidMemberName(String),
    #[error("Interface name `{0}` is invalid")]
    InvalidInterfaceName(String),
}

/// A type signature. The contents are not validated on construction.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Signature(pub String);

impl Signature {
    pub fn new(s: &str) -> Result<Self, UnsupportedValue> {
        if s.len() > MAX_SIGNATURE_LEN || DynamicType::parse_signature(s).is_err() {
            return Err(UnsupportedValue::InvalidSignature(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for Signature {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An object path such as `/org/freedesktop/DBus`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectPath(pub String);

impl ObjectPath {
    pub fn new(s: &str) -> Result<Self, UnsupportedValue> {
        if !is_valid_object_path(s) {
            return Err(UnsupportedValue::InvalidObjectPath(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ObjectPath {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Borrow<str> for ObjectPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn is_valid_object_path(s: &str) -> bool {
    if s == "/" {
        return true;
    }
    let Some(rest) = s.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|element| {
        !element.is_empty()
            && element
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

/// Validates a bus name, either unique (`:1.42`) or well-known
/// (`org.example.Foo`).
pub fn is_valid_bus_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 255 {
        return false;
    }
    let (unique, rest) = match s.strip_prefix(':') {
        Some(rest) => (true, rest),
        _ => (false, s),
    };
    let mut elements = 0;
    for element in rest.split('.') {
        let Some(first) = element.bytes().next() else {
            return false;
        };
        if !unique && first.is_ascii_digit() {
            return false;
        }
        let valid = element
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

pub fn is_valid_member_name(s: &str) -> bool {
    let Some(first) = s.bytes().next() else {
        return false;
    };
    s.len() <= 255
        && !first.is_ascii_digit()
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

pub fn is_valid_interface_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 255 {
        return false;
    }
    let mut elements = 0;
    for element in s.split('.') {
        if !is_valid_member_name(element) {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

/// A value of a basic type, usable as the key of a dict.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum DictKey {
    U8(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(F64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
}

impl DictKey {
    pub fn dynamic_type(&self) -> DynamicType {
        match self {
            DictKey::U8(_) => DynamicType::U8,
            DictKey::Bool(_) => DynamicType::Bool,
            DictKey::I16(_) => DynamicType::I16,
            DictKey::U16(_) => DynamicType::U16,
            DictKey::I32(_) => DynamicType::I32,
            DictKey::U32(_) => DynamicType::U32,
            DictKey::I64(_) => DynamicType::I64,
            DictKey::U64(_) => DynamicType::U64,
            DictKey::F64(_) => DynamicType::F64,
            DictKey::String(_) => DynamicType::String,
            DictKey::ObjectPath(_) => DynamicType::ObjectPath,
            DictKey::Signature(_) => DynamicType::Signature,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DictKey::String(s) => Some(s),
            DictKey::ObjectPath(s) => Some(s),
            DictKey::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            DictKey::U8(v) => Value::U8(v),
            DictKey::Bool(v) => Value::Bool(v),
            DictKey::I16(v) => Value::I16(v),
            DictKey::U16(v) => Value::U16(v),
            DictKey::I32(v) => Value::I32(v),
            DictKey::U32(v) => Value::U32(v),
            DictKey::I64(v) => Value::I64(v),
            DictKey::U64(v) => Value::U64(v),
            DictKey::F64(v) => Value::F64(v.0),
            DictKey::String(v) => Value::String(v),
            DictKey::ObjectPath(v) => Value::ObjectPath(v),
            DictKey::Signature(v) => Value::Signature(v),
        }
    }

    fn check(&self) -> Result<(), UnsupportedValue> {
        match self {
            DictKey::String(s) => check_string(s),
            DictKey::ObjectPath(p) => check_object_path(p),
            DictKey::Signature(s) => check_signature(s),
            _ => Ok(()),
        }
    }
}

impl TryFrom<Value> for DictKey {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let key = match value {
            Value::U8(v) => DictKey::U8(v),
            Value::Bool(v) => DictKey::Bool(v),
            Value::I16(v) => DictKey::I16(v),
            Value::U16(v) => DictKey::U16(v),
            Value::I32(v) => DictKey::I32(v),
            Value::U32(v) => DictKey::U32(v),
            Value::I64(v) => DictKey::I64(v),
            Value::U64(v) => DictKey::U64(v),
            Value::F64(v) => DictKey::F64(F64(v)),
            Value::String(v) => DictKey::String(v),
            Value::ObjectPath(v) => DictKey::ObjectPath(v),
            Value::Signature(v) => DictKey::Signature(v),
            v => return Err(v),
        };
        Ok(key)
    }
}

impl From<&str> for DictKey {
    fn from(value: &str) -> Self {
        DictKey::String(value.to_string())
    }
}

impl From<String> for DictKey {
    fn from(value: String) -> Self {
        DictKey::String(value)
    }
}

impl From<u32> for DictKey {
    fn from(value: u32) -> Self {
        DictKey::U32(value)
    }
}

/// A dynamically typed D-Bus value.
///
/// Containers carry their element types so that empty containers still have a
/// well-defined signature. The codec refuses to encode values whose children
/// do not match the declared element types.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    U8(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    Array(DynamicType, Vec<Value>),
    Dict(DynamicType, DynamicType, IndexMap<DictKey, Value>),
    Struct(Vec<Value>),
    Variant(Box<Value>),
}

impl Value {
    pub fn array(element: DynamicType, values: Vec<Value>) -> Self {
        Value::Array(element, values)
    }

    pub fn string_array<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Array(
            DynamicType::String,
            strings.into_iter().map(|s| Value::String(s.into())).collect(),
        )
    }

    pub fn dict<I>(key: DynamicType, value: DynamicType, entries: I) -> Self
    where
        I: IntoIterator<Item = (DictKey, Value)>,
    {
        Value::Dict(key, value, entries.into_iter().collect())
    }

    pub fn variant(value: impl Into<Value>) -> Self {
        Value::Variant(Box::new(value.into()))
    }

    pub fn object_path(path: &str) -> Result<Self, UnsupportedValue> {
        ObjectPath::new(path).map(Value::ObjectPath)
    }

    /// Computes the type of this value from its structure.
    pub fn dynamic_type(&self) -> DynamicType {
        match self {
            Value::U8(_) => DynamicType::U8,
            Value::Bool(_) => DynamicType::Bool,
            Value::I16(_) => DynamicType::I16,
            Value::U16(_) => DynamicType::U16,
            Value::I32(_) => DynamicType::I32,
            Value::U32(_) => DynamicType::U32,
            Value::I64(_) => DynamicType::I64,
            Value::U64(_) => DynamicType::U64,
            Value::F64(_) => DynamicType::F64,
            Value::String(_) => DynamicType::String,
            Value::ObjectPath(_) => DynamicType::ObjectPath,
            Value::Signature(_) => DynamicType::Signature,
            Value::Array(el, _) => DynamicType::Array(Box::new(el.clone())),
            Value::Dict(k, v, _) => DynamicType::Array(Box::new(DynamicType::DictEntry(
                Box::new(k.clone()),
                Box::new(v.clone()),
            ))),
            Value::Struct(fields) => {
                DynamicType::Struct(fields.iter().map(|f| f.dynamic_type()).collect())
            }
            Value::Variant(_) => DynamicType::Variant,
        }
    }

    pub fn write_signature(&self, w: &mut String) {
        match self {
            Value::Array(el, _) => {
                w.push('a');
                el.write_signature(w);
            }
            Value::Dict(k, v, _) => {
                w.push_str("a{");
                k.write_signature(w);
                v.write_signature(w);
                w.push('}');
            }
            Value::Struct(fields) => {
                w.push('(');
                for field in fields {
                    field.write_signature(w);
                }
                w.push(')');
            }
            _ => self.dynamic_type().write_signature(w),
        }
    }

    pub fn signature(&self) -> Signature {
        let mut s = String::new();
        self.write_signature(&mut s);
        Signature(s)
    }

    /// Checks that this value can be expressed as a single complete type on
    /// the wire.
    ///
    /// Depth is counted the way the parser counts it: every array, struct
    /// and dict entry on the path from the message body counts, including
    /// those above an enclosing variant. Signatures are limited separately,
    /// from the start of each signature, including the element types of
    /// empty arrays.
    pub fn check(&self) -> Result<(), UnsupportedValue> {
        check_type(&self.dynamic_type(), 0, 0, false)?;
        self.check_(0, 0, 0)
    }

    fn check_(&self, arrays: u32, structs: u32, total: u32) -> Result<(), UnsupportedValue> {
        match self {
            Value::String(s) => check_string(s),
            Value::ObjectPath(p) => check_object_path(p),
            Value::Signature(s) => check_signature(s),
            Value::Array(el, values) => {
                if matches!(el, DynamicType::DictEntry(..)) {
                    return Err(UnsupportedValue::BareDictEntry);
                }
                if arrays >= MAX_CONTAINER_DEPTH || total >= MAX_TOTAL_DEPTH {
                    return Err(UnsupportedValue::NestingTooDeep);
                }
                if values.len() > MAX_ARRAY_LEN {
                    return Err(UnsupportedValue::ArrayTooLong);
                }
                for value in values {
                    let ty = value.dynamic_type();
                    if &ty != el {
                        return Err(UnsupportedValue::HeterogeneousArray {
                            expected: el.signature().0,
                            actual: ty.signature().0,
                        });
                    }
                    value.check_(arrays + 1, structs, total + 1)?;
                }
                Ok(())
            }
            Value::Dict(k, v, entries) => {
                if !k.is_basic() {
                    return Err(UnsupportedValue::InvalidDictKey(k.signature().0));
                }
                if arrays >= MAX_CONTAINER_DEPTH || total >= MAX_TOTAL_DEPTH {
                    return Err(UnsupportedValue::NestingTooDeep);
                }
                if entries.len() > MAX_ARRAY_LEN {
                    return Err(UnsupportedValue::ArrayTooLong);
                }
                if entries.len() > 0
                    && (structs >= MAX_CONTAINER_DEPTH || total + 1 >= MAX_TOTAL_DEPTH)
                {
                    return Err(UnsupportedValue::NestingTooDeep);
                }
                for (key, value) in entries {
                    let kt = key.dynamic_type();
                    if &kt != k {
                        return Err(UnsupportedValue::HeterogeneousDictKey {
                            expected: k.signature().0,
                            actual: kt.signature().0,
                        });
                    }
                    key.check()?;
                    let vt = value.dynamic_type();
                    if &vt != v {
                        return Err(UnsupportedValue::HeterogeneousDictValue {
                            expected: v.signature().0,
                            actual: vt.signature().0,
                        });
                    }
                    value.check_(arrays + 1, structs + 1, total + 2)?;
                }
                Ok(())
            }
            Value::Struct(fields) => {
                if fields.is_empty() {
                    return Err(UnsupportedValue::EmptyStruct);
                }
                if structs >= MAX_CONTAINER_DEPTH || total >= MAX_TOTAL_DEPTH {
                    return Err(UnsupportedValue::NestingTooDeep);
                }
                for field in fields {
                    field.check_(arrays, structs + 1, total + 1)?;
                }
                Ok(())
            }
            Value::Variant(inner) => {
                let mut sig = String::new();
                inner.write_signature(&mut sig);
                if sig.len() > MAX_SIGNATURE_LEN {
                    return Err(UnsupportedValue::SignatureTooLong);
                }
                check_type(&inner.dynamic_type(), 0, 0, false)?;
                if total >= MAX_TOTAL_DEPTH {
                    return Err(UnsupportedValue::NestingTooDeep);
                }
                inner.check_(arrays, structs, total + 1)
            }
            _ => Ok(()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::ObjectPath(s) => Some(s),
            Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Strips any number of variant wrappers.
    pub fn unwrap_variant(&self) -> &Value {
        let mut v = self;
        while let Value::Variant(inner) = v {
            v = inner;
        }
        v
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

fn check_string(s: &str) -> Result<(), UnsupportedValue> {
    if s.as_bytes().contains(&0) {
        return Err(UnsupportedValue::NulInString);
    }
    Ok(())
}

fn check_object_path(p: &ObjectPath) -> Result<(), UnsupportedValue> {
    if !is_valid_object_path(p) {
        return Err(UnsupportedValue::InvalidObjectPath(p.0.clone()));
    }
    Ok(())
}

fn check_signature(s: &Signature) -> Result<(), UnsupportedValue> {
    if s.len() > MAX_SIGNATURE_LEN {
        return Err(UnsupportedValue::InvalidSignature(s.0.clone()));
    }
    if s.len() > 0 && DynamicType::parse_signature(s).is_err() {
        return Err(UnsupportedValue::InvalidSignature(s.0.clone()));
    }
    Ok(())
}

fn check_type(
    ty: &DynamicType,
    arrays: u32,
    structs: u32,
    in_array: bool,
) -> Result<(), UnsupportedValue> {
    match ty {
        DynamicType::Array(el) => {
            if arrays >= MAX_CONTAINER_DEPTH {
                return Err(UnsupportedValue::NestingTooDeep);
            }
            check_type(el, arrays + 1, structs, true)
        }
        DynamicType::Struct(fields) => {
            if fields.is_empty() {
                return Err(UnsupportedValue::EmptyStruct);
            }
            if structs >= MAX_CONTAINER_DEPTH {
                return Err(UnsupportedValue::NestingTooDeep);
            }
            fields
                .iter()
                .try_for_each(|f| check_type(f, arrays, structs + 1, false))
        }
        DynamicType::DictEntry(k, v) => {
            if !in_array {
                return Err(UnsupportedValue::BareDictEntry);
            }
            if structs >= MAX_CONTAINER_DEPTH {
                return Err(UnsupportedValue::NestingTooDeep);
            }
            if !k.is_basic() {
                return Err(UnsupportedValue::InvalidDictKey(k.signature().0));
            }
            check_type(v, arrays, structs + 1, false)
        }
        _ => Ok(()),
    }
}

macro_rules! from_primitive {
    ($($ty:ty => $variant:ident,)*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

from_primitive! {
    u8 => U8,
    bool => Bool,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f64 => F64,
    String => String,
    ObjectPath => ObjectPath,
    Signature => Signature,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<DictKey> for Value {
    fn from(v: DictKey) -> Self {
        v.into_value()
    }
}
