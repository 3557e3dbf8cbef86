//! Struct layout and typed accessors
//!
//! Design: offsets are precomputed on the type descriptor, and instances use
//! index-based accessors over a raw backing buffer instead of per-instance
//! dynamic fields. Layout is uniform stride: every member occupies exactly
//! `alignment` bytes where `alignment` is the largest member size, so
//! `offset(i) = alignment * i`.
//!
//! Note: this deliberately does not match standard C struct packing for
//! mixed-size members. Native code expecting true C layout with natural
//! per-member alignment and tail padding will misread these structs; a
//! caller targeting ABI compatibility needs real padding rules instead.

use std::sync::Arc;

use tracing::debug;

use crate::buffer::NativeBuffer;
use crate::codec::{self, Value};
use crate::error::FfiError;
use crate::types::NativeType;

/// One struct member: resolved type plus declared name.
#[derive(Debug, Clone)]
pub struct StructMember {
    pub name: String,
    pub ty: NativeType,
}

/// A struct template: ordered members with a precomputed layout.
#[derive(Debug)]
pub struct StructType {
    members: Vec<StructMember>,
    alignment: usize,
    size: usize,
}

impl StructType {
    /// Define a struct type from ordered `(name, type name)` members.
    ///
    /// Fails with `UnknownType` if any member's type does not resolve.
    pub fn define(members: &[(&str, &str)]) -> Result<Arc<Self>, FfiError> {
        let members = members
            .iter()
            .map(|(name, ty)| {
                Ok(StructMember {
                    name: (*name).to_string(),
                    ty: NativeType::resolve(ty)?,
                })
            })
            .collect::<Result<Vec<_>, FfiError>>()?;

        let alignment = members.iter().map(|m| m.ty.size()).max().unwrap_or(0);
        let size = alignment * members.len();
        debug!(size, alignment, members = members.len(), "struct type defined");

        Ok(Arc::new(Self {
            members,
            alignment,
            size,
        }))
    }

    /// Total instance size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Uniform member stride (largest member size).
    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Ordered members.
    pub fn members(&self) -> &[StructMember] {
        &self.members
    }

    /// Byte offset of member `index`.
    #[inline]
    pub fn offset(&self, index: usize) -> usize {
        self.alignment * index
    }

    /// Index of the named member.
    pub fn member_index(&self, name: &str) -> Result<usize, FfiError> {
        self.members
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| FfiError::UnknownMember(name.to_string()))
    }

    /// The member at `index`, or `UnknownMember` when out of range.
    pub fn member_at(&self, index: usize) -> Result<&StructMember, FfiError> {
        self.members
            .get(index)
            .ok_or_else(|| FfiError::UnknownMember(format!("#{}", index)))
    }

    /// Allocate an instance over a fresh zeroed buffer.
    pub fn instantiate(self: &Arc<Self>) -> StructInstance {
        StructInstance {
            ty: Arc::clone(self),
            buf: NativeBuffer::alloc(self.size),
        }
    }

    /// Wrap a caller-supplied backing buffer, e.g. memory returned by native
    /// code that embeds this struct. The buffer must be exactly `size` bytes.
    pub fn wrap(self: &Arc<Self>, buf: NativeBuffer) -> Result<StructInstance, FfiError> {
        if buf.len() != self.size {
            return Err(FfiError::mismatch(
                &format!("{}-byte buffer", self.size),
                &format!("{}-byte buffer", buf.len()),
            ));
        }
        Ok(StructInstance {
            ty: Arc::clone(self),
            buf,
        })
    }

    /// Allocate an instance and set the given fields in order, each through
    /// the full type-checked write path.
    pub fn instantiate_with(
        self: &Arc<Self>,
        fields: &[(&str, Value)],
    ) -> Result<StructInstance, FfiError> {
        let mut instance = self.instantiate();
        for (name, value) in fields {
            instance.set(name, value)?;
        }
        Ok(instance)
    }
}

/// One struct value: a type descriptor plus exactly one backing buffer.
pub struct StructInstance {
    ty: Arc<StructType>,
    buf: NativeBuffer,
}

impl StructInstance {
    /// The struct's type descriptor.
    pub fn struct_type(&self) -> &Arc<StructType> {
        &self.ty
    }

    /// Base address of the backing buffer, for pointer-typed arguments.
    pub fn addr(&self) -> usize {
        self.buf.addr()
    }

    /// Read member `index`.
    pub fn get_at(&self, index: usize) -> Result<Value, FfiError> {
        let member = self.ty.member_at(index)?;
        let offset = self.ty.offset(index);
        debug!(member = %member.name, offset, "struct get");
        codec::decode(member.ty, &self.buf, offset)
    }

    /// Write member `index` through the type-checked write path.
    pub fn set_at(&mut self, index: usize, value: &Value) -> Result<(), FfiError> {
        let member = self.ty.member_at(index)?;
        let offset = self.ty.offset(index);
        debug!(member = %member.name, offset, "struct set");
        codec::write_into(member.ty, &mut self.buf, offset, value)
    }

    /// Read the named member.
    pub fn get(&self, name: &str) -> Result<Value, FfiError> {
        self.get_at(self.ty.member_index(name)?)
    }

    /// Write the named member.
    pub fn set(&mut self, name: &str, value: &Value) -> Result<(), FfiError> {
        self.set_at(self.ty.member_index(name)?, value)
    }

    /// Consume the instance and take back its backing buffer.
    pub fn into_buffer(self) -> NativeBuffer {
        self.buf
    }
}

impl std::fmt::Debug for StructInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructInstance")
            .field("size", &self.ty.size())
            .field("members", &self.ty.members().len())
            .finish()
    }
}

impl From<&StructInstance> for Value {
    /// A struct passed as a pointer argument contributes its backing
    /// buffer's address rather than being re-encoded.
    fn from(instance: &StructInstance) -> Self {
        Value::Pointer(instance.addr())
    }
}
