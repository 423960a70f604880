//! Translation between [`Value`]s and the D-Bus wire format.
//!
//! Encoding is driven by the values themselves: every value knows its own
//! signature. Decoding is driven by the signature advertised for the data.

use {
    crate::dbus::{
        DbusError, DynamicType, Endian, MAX_SIGNATURE_LEN,
        formatter::Formatter,
        parser::Parser,
        types::{Signature, UnsupportedValue, Value},
    },
};


/// Encodes a single complete value.
pub fn encode(value: &Value, endian: Endian) -> Result<Vec<u8>, DbusError> {
    value.check()?;
    let mut buf = vec![];
    Formatter::new(&mut buf, endian).write_value(value)?;
    Ok(buf)
}

/// Decodes a single complete value of the type described by `signature`.
pub fn decode(signature: &str, data: &[u8], endian: Endian) -> Result<Value, DbusError> {
    let ty = DynamicType::parse_single(signature)?;
    let mut parser = Parser::new(data, endian);
    let value = ty.parse(&mut parser)?;
    parser.finish()?;
    Ok(value)
}

/// Encodes an argument list as a message body.
///
/// The returned signature is the concatenation of the argument signatures.
pub fn encode_body(args: &[Value], endian: Endian) -> Result<(Signature, Vec<u8>), DbusError> {
    let mut sig = String::new();
    for arg in args {
        arg.check()?;
        arg.write_signature(&mut sig);
    }
    if sig.len() > MAX_SIGNATURE_LEN {
        return Err(UnsupportedValue::SignatureTooLong.into());
    }
    let mut buf = vec![];
    let mut fmt = Formatter::new(&mut buf, endian);
    for arg in args {
        fmt.write_value(arg)?;
    }
    Ok((Signature(sig), buf))
}

/// Encodes a struct value as a message body by flattening its fields into
/// the argument list.
pub fn encode_tuple(value: &Value, endian: Endian) -> Result<(Signature, Vec<u8>), DbusError> {
    match value {
        Value::Struct(fields) => encode_body(fields, endian),
        _ => Err(UnsupportedValue::NotAStruct(value.signature().0).into()),
    }
}

/// Decodes a message body with the given signature.
pub fn decode_body(signature: &str, body: &[u8], endian: Endian) -> Result<Vec<Value>, DbusError> {
    let types = DynamicType::parse_signature(signature)?;
    let mut parser = Parser::new(body, endian);
    let mut values = Vec::with_capacity(types.len());
    for ty in &types {
        values.push(ty.parse(&mut parser)?);
    }
    parser.finish()?;
    Ok(values)
}
