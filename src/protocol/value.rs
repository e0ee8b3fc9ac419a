//! Typed parameter values and their byte layout.
//!
//! Scalars use the host's native byte order at a fixed width. Strings carry no
//! terminator or length of their own, the enclosing frame decides how many
//! bytes belong to them. Arrays are a single element tag followed by at least
//! one fixed width element, back to back. They hold no strings and never nest.
use std::fmt;

use bincode::{Decode, Encode};
use thiserror::Error;

/// Errors raised while encoding or decoding a [`Value`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("value {value} out of range for {kind}")]
    OutOfRange { kind: ParamType, value: i64 },

    #[error("truncated {kind}: needed {needed} bytes, {available} available")]
    Truncated {
        kind: ParamType,
        needed: usize,
        available: usize,
    },

    #[error("arrays can not contain arrays")]
    NestedArray,

    #[error("arrays can not contain strings")]
    StringArray,

    #[error("arrays need at least one element")]
    EmptyArray,

    #[error("array of {expected} contains a {found}")]
    Mismatch { expected: ParamType, found: ParamType },

    #[error("unknown param type {0:#04x}")]
    UnknownParamType(u8),
}

/// Wire tag of a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum ParamType {
    Uint32,
    Int32,
    Uint8,
    Int8,
    Bool,
    String,
    Array,
}

impl ParamType {
    pub const ALL: [ParamType; 7] = [
        ParamType::Uint32,
        ParamType::Int32,
        ParamType::Uint8,
        ParamType::Int8,
        ParamType::Bool,
        ParamType::String,
        ParamType::Array,
    ];

    /// Encoded width in bytes, `None` for the variable length kinds.
    pub fn width(self) -> Option<usize> {
        match self {
            ParamType::Uint32 | ParamType::Int32 => Some(4),
            ParamType::Uint8 | ParamType::Int8 | ParamType::Bool => Some(1),
            ParamType::String | ParamType::Array => None,
        }
    }

    /// Short name used on the command line and in printed results.
    pub fn name(self) -> &'static str {
        match self {
            ParamType::Uint32 => "UINT32",
            ParamType::Int32 => "INT32",
            ParamType::Uint8 => "UINT8",
            ParamType::Int8 => "INT8",
            ParamType::Bool => "BOOL",
            ParamType::String => "STRING",
            ParamType::Array => "ARRAY",
        }
    }
}

impl TryFrom<u8> for ParamType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ParamType::ALL
            .get(value as usize)
            .copied()
            .ok_or(CodecError::UnknownParamType(value))
    }
}

impl From<ParamType> for u8 {
    fn from(value: ParamType) -> Self {
        value as u8
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single parameter, log entry or result exchanged with the firmware.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Value {
    Uint32(u32),
    Int32(i32),
    Uint8(u8),
    Int8(i8),
    Bool(bool),
    String(String),
    /// Element kind and elements. The element kind is never `Array`.
    Array(ParamType, Vec<Value>),
}

impl Value {
    pub fn param_type(&self) -> ParamType {
        match self {
            Value::Uint32(_) => ParamType::Uint32,
            Value::Int32(_) => ParamType::Int32,
            Value::Uint8(_) => ParamType::Uint8,
            Value::Int8(_) => ParamType::Int8,
            Value::Bool(_) => ParamType::Bool,
            Value::String(_) => ParamType::String,
            Value::Array(..) => ParamType::Array,
        }
    }

    /// Build an integer scalar of the given kind, checking that it fits.
    ///
    /// `Bool` accepts `0` and `1`.
    pub fn integer(kind: ParamType, value: i64) -> Result<Self, CodecError> {
        let out_of_range = || CodecError::OutOfRange { kind, value };

        Ok(match kind {
            ParamType::Uint32 => Value::Uint32(u32::try_from(value).map_err(|_| out_of_range())?),
            ParamType::Int32 => Value::Int32(i32::try_from(value).map_err(|_| out_of_range())?),
            ParamType::Uint8 => Value::Uint8(u8::try_from(value).map_err(|_| out_of_range())?),
            ParamType::Int8 => Value::Int8(i8::try_from(value).map_err(|_| out_of_range())?),
            ParamType::Bool => match value {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                _ => return Err(out_of_range()),
            },
            ParamType::String | ParamType::Array => return Err(out_of_range()),
        })
    }

}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uint32(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Uint8(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Array(_, items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Append the data bytes of `value` to `out`.
///
/// For arrays this includes the element tag byte, but never the outer
/// `ARRAY` param type tag, which belongs to the frame.
pub fn encode(value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match value {
        Value::Uint32(v) => out.extend_from_slice(&v.to_ne_bytes()),
        Value::Int32(v) => out.extend_from_slice(&v.to_ne_bytes()),
        Value::Uint8(v) => out.push(*v),
        Value::Int8(v) => out.extend_from_slice(&v.to_ne_bytes()),
        Value::Bool(v) => out.push(u8::from(*v)),
        Value::String(v) => out.extend_from_slice(v.as_bytes()),
        Value::Array(kind, items) => {
            check_element(*kind)?;
            if items.is_empty() {
                return Err(CodecError::EmptyArray);
            }
            out.push((*kind).into());
            for item in items {
                let found = item.param_type();
                if found != *kind {
                    return Err(CodecError::Mismatch {
                        expected: *kind,
                        found,
                    });
                }
                encode(item, out)?;
            }
        }
    }

    Ok(())
}

/// Decode one value of `kind` from the front of `bytes`.
///
/// `bytes` must be limited to what remains of the enclosing frame: strings
/// and arrays consume everything they are given. Returns the value and the
/// number of bytes consumed.
pub fn decode(kind: ParamType, bytes: &[u8]) -> Result<(Value, usize), CodecError> {
    match kind {
        ParamType::String => Ok((
            Value::String(String::from_utf8_lossy(bytes).into_owned()),
            bytes.len(),
        )),
        ParamType::Array => {
            let (&tag, mut rest) = bytes.split_first().ok_or(CodecError::Truncated {
                kind,
                needed: 1,
                available: 0,
            })?;
            let element = ParamType::try_from(tag)?;
            check_element(element)?;
            if rest.is_empty() {
                return Err(CodecError::EmptyArray);
            }

            let mut items = Vec::new();
            while !rest.is_empty() {
                let (item, used) = decode(element, rest)?;
                items.push(item);
                rest = &rest[used..];
            }

            Ok((Value::Array(element, items), bytes.len()))
        }
        scalar => {
            let width = scalar.width().unwrap_or_default();
            let data = bytes.get(..width).ok_or(CodecError::Truncated {
                kind,
                needed: width,
                available: bytes.len(),
            })?;

            let value = match scalar {
                ParamType::Uint32 => Value::Uint32(u32::from_ne_bytes(fixed(data))),
                ParamType::Int32 => Value::Int32(i32::from_ne_bytes(fixed(data))),
                ParamType::Uint8 => Value::Uint8(data[0]),
                ParamType::Int8 => Value::Int8(i8::from_ne_bytes([data[0]])),
                ParamType::Bool => Value::Bool(data[0] != 0),
                ParamType::String | ParamType::Array => unreachable!("handled above"),
            };

            Ok((value, width))
        }
    }
}

/// Array elements are fixed width scalars.
fn check_element(kind: ParamType) -> Result<(), CodecError> {
    match kind {
        ParamType::Array => Err(CodecError::NestedArray),
        ParamType::String => Err(CodecError::StringArray),
        _ => Ok(()),
    }
}

fn fixed(data: &[u8]) -> [u8; 4] {
    let mut out = [0; 4];
    out.copy_from_slice(data);
    out
}
