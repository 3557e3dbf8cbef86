//! Type registry - canonical native type names, sizes, and aliases
//!
//! Design: a closed enumeration of the supported native kinds instead of a
//! runtime string-keyed handler map. The name table (including aliases) is a
//! single const list resolved in exactly one hop; the registry is immutable
//! after process start and safe for unsynchronized concurrent reads.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;

use crate::error::FfiError;

/// Size of a native pointer on this platform.
pub const POINTER_SIZE: usize = std::mem::size_of::<usize>();
/// Size of the platform C `int`.
pub const INT_SIZE: usize = std::mem::size_of::<core::ffi::c_int>();
/// Size of the platform C `long`.
pub const LONG_SIZE: usize = std::mem::size_of::<core::ffi::c_long>();
/// Size of the platform `size_t`.
pub const SIZE_T_SIZE: usize = std::mem::size_of::<usize>();

/// Native type descriptor.
///
/// Every type name accepted anywhere in the crate resolves to one of these
/// variants. Kinds without codec handlers (e.g. `Char`, `SizeT`) still carry
/// sizes so struct layout and return-buffer allocation work for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeType {
    Void,
    Bool,
    Char,
    UChar,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    SizeT,
    Float,
    Double,
    Pointer,
    CString,
}

/// Canonical name table. Aliases resolve in a single hop: each alias entry
/// maps directly to the canonical variant, never to another alias.
const NAME_TABLE: &[(&str, NativeType)] = &[
    ("void", NativeType::Void),
    ("bool", NativeType::Bool),
    ("char", NativeType::Char),
    ("uchar", NativeType::UChar),
    ("int8", NativeType::Int8),
    ("uint8", NativeType::UInt8),
    ("int16", NativeType::Int16),
    ("uint16", NativeType::UInt16),
    ("int32", NativeType::Int32),
    ("uint32", NativeType::UInt32),
    ("int64", NativeType::Int64),
    ("uint64", NativeType::UInt64),
    ("short", NativeType::Short),
    ("ushort", NativeType::UShort),
    ("int", NativeType::Int),
    ("uint", NativeType::UInt),
    ("long", NativeType::Long),
    ("ulong", NativeType::ULong),
    ("size_t", NativeType::SizeT),
    ("float", NativeType::Float),
    ("double", NativeType::Double),
    ("pointer", NativeType::Pointer),
    ("string", NativeType::CString),
    // Aliases
    ("void *", NativeType::Pointer),
    ("char *", NativeType::CString),
    ("integer", NativeType::Int),
    ("number", NativeType::Double),
];

static REGISTRY: Lazy<HashMap<&'static str, NativeType>> =
    Lazy::new(|| NAME_TABLE.iter().copied().collect());

impl NativeType {
    /// Resolve a type name (canonical or alias) to its descriptor.
    pub fn resolve(name: &str) -> Result<Self, FfiError> {
        REGISTRY
            .get(name)
            .copied()
            .ok_or_else(|| FfiError::UnknownType(name.to_string()))
    }

    /// Size in bytes of one value of this type.
    ///
    /// `void` occupies one byte so a return slot can always be allocated.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Void => 1,
            Self::Bool | Self::Char | Self::UChar | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Short | Self::UShort => 2,
            Self::Int32 | Self::UInt32 | Self::Float => 4,
            Self::Int64 | Self::UInt64 | Self::Double => 8,
            Self::Int | Self::UInt => INT_SIZE,
            Self::Long | Self::ULong => LONG_SIZE,
            Self::SizeT => SIZE_T_SIZE,
            Self::Pointer | Self::CString => POINTER_SIZE,
        }
    }

    /// Whether this kind holds an integer value.
    #[inline]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::UInt8
                | Self::Int16
                | Self::UInt16
                | Self::Int32
                | Self::UInt32
                | Self::Int64
                | Self::UInt64
                | Self::Int
                | Self::UInt
                | Self::Long
                | Self::ULong
        )
    }

    /// Whether the integer kind is signed. Meaningless for non-integers.
    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 | Self::Int | Self::Long
        )
    }

    /// Whether this kind holds a floating point value.
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Whether values of this kind are carried as a pointer.
    #[inline]
    pub const fn is_pointer(self) -> bool {
        matches!(self, Self::Pointer | Self::CString)
    }

    /// Canonical name of this type.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::Char => "char",
            Self::UChar => "uchar",
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Short => "short",
            Self::UShort => "ushort",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Long => "long",
            Self::ULong => "ulong",
            Self::SizeT => "size_t",
            Self::Float => "float",
            Self::Double => "double",
            Self::Pointer => "pointer",
            Self::CString => "string",
        }
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Size in bytes of the named type; `UnknownType` if the name does not
/// resolve through the registry.
pub fn size_of(name: &str) -> Result<usize, FfiError> {
    NativeType::resolve(name).map(NativeType::size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_canonical_names() {
        assert_eq!(NativeType::resolve("int32").unwrap(), NativeType::Int32);
        assert_eq!(NativeType::resolve("double").unwrap(), NativeType::Double);
        assert_eq!(NativeType::resolve("pointer").unwrap(), NativeType::Pointer);
        assert_eq!(NativeType::resolve("string").unwrap(), NativeType::CString);
    }

    #[test]
    fn resolves_aliases_in_one_hop() {
        assert_eq!(NativeType::resolve("void *").unwrap(), NativeType::Pointer);
        assert_eq!(NativeType::resolve("char *").unwrap(), NativeType::CString);
        assert_eq!(NativeType::resolve("integer").unwrap(), NativeType::Int);
        assert_eq!(NativeType::resolve("number").unwrap(), NativeType::Double);
    }

    #[test]
    fn unknown_name_is_a_hard_error() {
        assert_eq!(
            NativeType::resolve("quaternion"),
            Err(FfiError::UnknownType("quaternion".to_string()))
        );
        assert!(size_of("quaternion").is_err());
    }

    #[test]
    fn sizes_match_platform_constants() {
        assert_eq!(size_of("pointer").unwrap(), POINTER_SIZE);
        assert_eq!(size_of("void *").unwrap(), POINTER_SIZE);
        assert_eq!(size_of("string").unwrap(), POINTER_SIZE);
        assert_eq!(size_of("int").unwrap(), INT_SIZE);
        assert_eq!(size_of("uint").unwrap(), INT_SIZE);
        assert_eq!(size_of("long").unwrap(), LONG_SIZE);
        assert_eq!(size_of("ulong").unwrap(), LONG_SIZE);
        assert_eq!(size_of("size_t").unwrap(), SIZE_T_SIZE);
    }

    #[test]
    fn sizes_are_stable_across_calls() {
        for (name, _) in super::NAME_TABLE {
            assert_eq!(size_of(name).unwrap(), size_of(name).unwrap());
        }
    }

    #[test]
    fn fixed_width_sizes() {
        assert_eq!(NativeType::Void.size(), 1);
        assert_eq!(NativeType::UInt8.size(), 1);
        assert_eq!(NativeType::Int16.size(), 2);
        assert_eq!(NativeType::UInt32.size(), 4);
        assert_eq!(NativeType::Int64.size(), 8);
        assert_eq!(NativeType::Float.size(), 4);
        assert_eq!(NativeType::Double.size(), 8);
    }

    #[test]
    fn kind_predicates() {
        assert!(NativeType::Int32.is_integer());
        assert!(NativeType::Int32.is_signed());
        assert!(!NativeType::UInt32.is_signed());
        assert!(NativeType::Double.is_float());
        assert!(!NativeType::Double.is_integer());
        assert!(NativeType::Pointer.is_pointer());
        assert!(NativeType::CString.is_pointer());
    }
}
