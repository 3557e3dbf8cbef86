//! Value codec - host value <-> native representation casts
//!
//! Three operations per type, each independently testable:
//! - `encode`: host value into a freshly allocated, tagged native buffer
//! - `decode`: native buffer slot back into a host value
//! - `write_into`: type-checked in-place update of one slot, used by struct
//!   field setters; payload allocations are attached to the parent buffer's
//!   keep-alive list so they cannot outlive-or-underlive the slot pointing
//!   at them.
//!
//! Handler coverage is intentionally narrower than the registry: kinds that
//! are registered (sized) but have no conversion handler surface
//! `UnsupportedType`, which is distinct from `UnknownType`.

use std::ffi::CStr;

use tracing::trace;

use crate::buffer::NativeBuffer;
use crate::error::FfiError;
use crate::types::NativeType;

/// A dynamically-typed host value.
///
/// `Undefined` models the host's "no value was supplied" sentinel and is
/// never a legal cast input; `Null` is an explicit nil and encodes as a null
/// pointer for pointer-family types.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A raw native address: a resolved symbol, a callback entry point, or a
    /// struct instance's backing buffer.
    Pointer(usize),
}

impl Value {
    /// Runtime kind name, used in type-assertion error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) | Self::Float(_) => "number",
            Self::Str(_) => "string",
            Self::Pointer(_) => "pointer",
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view over `Int` and `Float`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integral view: integers, or floats with no fractional part.
    pub fn as_integral(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<&NativeBuffer> for Value {
    fn from(buf: &NativeBuffer) -> Self {
        Self::Pointer(buf.addr())
    }
}

/// Convert a host value into a tagged native buffer of the type's size.
pub fn encode(ty: NativeType, value: &Value) -> Result<NativeBuffer, FfiError> {
    if matches!(value, Value::Undefined) {
        return Err(FfiError::MissingValue);
    }
    trace!(ty = %ty, kind = value.kind(), "encode");

    let mut buf = match ty {
        NativeType::Double => {
            let n = require_number(ty, value)?;
            let mut buf = NativeBuffer::alloc(8);
            buf.write_f64(0, n);
            buf
        }
        NativeType::Float => {
            let n = require_number(ty, value)?;
            let mut buf = NativeBuffer::alloc(4);
            buf.write_f32(0, n as f32);
            buf
        }
        t if t.is_integer() => {
            let n = require_integral(ty, value)?;
            let mut buf = NativeBuffer::alloc(ty.size());
            buf.write_word(0, n as u64, ty.size());
            buf
        }
        NativeType::CString => match value {
            // Explicit nil is a null pointer, not an error.
            Value::Null => NativeBuffer::alloc(ty.size()),
            Value::Str(s) => {
                let mut buf = NativeBuffer::alloc(ty.size());
                let payload = c_string_payload(s);
                buf.write_usize(0, payload.addr());
                buf.retain_at(0, payload);
                buf
            }
            other => return Err(FfiError::mismatch("string", other.kind())),
        },
        NativeType::Pointer => match value {
            Value::Null => NativeBuffer::alloc(ty.size()),
            Value::Pointer(p) => {
                let mut buf = NativeBuffer::alloc(ty.size());
                buf.write_usize(0, *p);
                buf
            }
            other => return Err(FfiError::mismatch("pointer", other.kind())),
        },
        other => return Err(FfiError::UnsupportedType(other.name().to_string())),
    };
    buf.set_tag(ty);
    Ok(buf)
}

/// Decode the slot at `offset` back into a host value.
///
/// `void` decodes to the host "no value" representation unconditionally.
pub fn decode(ty: NativeType, buf: &NativeBuffer, offset: usize) -> Result<Value, FfiError> {
    trace!(ty = %ty, offset, "decode");
    match ty {
        NativeType::Void => Ok(Value::Null),
        NativeType::Double => Ok(Value::Float(buf.read_f64(offset))),
        NativeType::Float => Ok(Value::Float(buf.read_f32(offset) as f64)),
        t if t.is_integer() => Ok(Value::Int(extend(buf.read_word(offset, t.size()), t))),
        NativeType::CString => {
            let ptr = buf.read_usize(offset);
            if ptr == 0 {
                return Ok(Value::Null);
            }
            // Safety: the slot was written by a string encode/write, so it
            // points at a NUL-terminated payload kept alive by this buffer,
            // or at memory native code handed back as a C string.
            let s = unsafe { CStr::from_ptr(ptr as *const core::ffi::c_char) };
            Ok(Value::Str(s.to_string_lossy().into_owned()))
        }
        NativeType::Pointer => Ok(Value::Pointer(buf.read_usize(offset))),
        other => Err(FfiError::UnsupportedType(other.name().to_string())),
    }
}

/// Type-checked in-place update of one slot.
///
/// Stricter than `encode`: the value must already have the slot's host kind
/// (a string slot takes only strings, a pointer slot only pointers). Writes
/// that allocate a payload attach it to the parent's keep-alive list.
pub fn write_into(
    ty: NativeType,
    buf: &mut NativeBuffer,
    offset: usize,
    value: &Value,
) -> Result<(), FfiError> {
    trace!(ty = %ty, offset, kind = value.kind(), "write");
    match ty {
        NativeType::Double => {
            let n = require_number(ty, value)?;
            buf.write_f64(offset, n);
            Ok(())
        }
        NativeType::Float => {
            let n = require_number(ty, value)?;
            buf.write_f32(offset, n as f32);
            Ok(())
        }
        t if t.is_integer() => {
            let n = require_integral(ty, value)?;
            buf.write_word(offset, n as u64, t.size());
            Ok(())
        }
        NativeType::CString => match value {
            Value::Str(s) => {
                let payload = c_string_payload(s);
                buf.write_usize(offset, payload.addr());
                buf.retain_at(offset, payload);
                Ok(())
            }
            other => Err(FfiError::mismatch("string", other.kind())),
        },
        NativeType::Pointer => match value {
            Value::Pointer(p) => {
                buf.write_usize(offset, *p);
                Ok(())
            }
            other => Err(FfiError::mismatch("pointer", other.kind())),
        },
        other => Err(FfiError::UnsupportedType(other.name().to_string())),
    }
}

fn require_number(ty: NativeType, value: &Value) -> Result<f64, FfiError> {
    value
        .as_number()
        .ok_or_else(|| FfiError::mismatch(ty.name(), value.kind()))
}

fn require_integral(ty: NativeType, value: &Value) -> Result<i64, FfiError> {
    value.as_integral().ok_or_else(|| match value {
        Value::Float(_) => FfiError::mismatch("integer", "non-integral number"),
        other => FfiError::mismatch("integer", other.kind()),
    })
}

/// NUL-terminated copy of a host string.
fn c_string_payload(s: &str) -> NativeBuffer {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    NativeBuffer::from_bytes(bytes)
}

/// Sign- or zero-extend a raw slot word to the host integer value.
fn extend(word: u64, ty: NativeType) -> i64 {
    if !ty.is_signed() {
        return word as i64;
    }
    match ty.size() {
        1 => word as u8 as i8 as i64,
        2 => word as u16 as i16 as i64,
        4 => word as u32 as i32 as i64,
        _ => word as i64,
    }
}
