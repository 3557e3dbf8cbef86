//! Native memory buffers and argument packs
//!
//! Design: a `NativeBuffer` is a single-owner, fixed-length byte region.
//! Ownership of transient allocations referenced *by* a buffer (a C string
//! payload behind a pointer slot, for example) is expressed with an explicit
//! keep-alive list keyed by slot offset, so the payload lives exactly as long
//! as the buffer that points at it.

use crate::types::NativeType;

/// Owned, fixed-length, byte-addressable native memory region.
pub struct NativeBuffer {
    data: Box<[u8]>,
    tag: Option<NativeType>,
    // Auxiliary buffers this one points into, keyed by the slot offset that
    // holds the pointer. Writing the same slot again replaces the entry.
    keep_alive: Vec<(usize, NativeBuffer)>,
}

impl NativeBuffer {
    /// Allocate a zeroed buffer of `size` bytes.
    pub fn alloc(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            tag: None,
            keep_alive: Vec::new(),
        }
    }

    /// Build a buffer from existing bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: bytes.into_boxed_slice(),
            tag: None,
            keep_alive: Vec::new(),
        }
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The logical type this buffer was cast for, if any.
    #[inline]
    pub fn tag(&self) -> Option<NativeType> {
        self.tag
    }

    pub fn set_tag(&mut self, ty: NativeType) {
        self.tag = Some(ty);
    }

    /// Base address of the buffer data.
    #[inline]
    pub fn addr(&self) -> usize {
        self.data.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// True when the buffer holds a pointer-sized slot containing null.
    pub fn is_null_pointer(&self) -> bool {
        self.len() >= std::mem::size_of::<usize>() && self.read_usize(0) == 0
    }

    /// Attach `child` to this buffer's lifetime for the slot at `offset`.
    /// A previous attachment at the same offset is released.
    pub fn retain_at(&mut self, offset: usize, child: NativeBuffer) {
        if let Some(entry) = self.keep_alive.iter_mut().find(|(off, _)| *off == offset) {
            entry.1 = child;
        } else {
            self.keep_alive.push((offset, child));
        }
    }

    /// Number of auxiliary buffers currently kept alive.
    pub fn retained(&self) -> usize {
        self.keep_alive.len()
    }

    // Scalar slot access. Offsets are computed by the layout code; an
    // out-of-range slot is a bug in the caller, so these index directly.

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn write_usize(&mut self, offset: usize, value: usize) {
        self.write_bytes(offset, &value.to_ne_bytes());
    }

    pub fn read_usize(&self, offset: usize) -> usize {
        let mut raw = [0u8; std::mem::size_of::<usize>()];
        raw.copy_from_slice(self.read_bytes(offset, std::mem::size_of::<usize>()));
        usize::from_ne_bytes(raw)
    }

    /// Write the low `size` bytes of `word` at `offset`.
    pub fn write_word(&mut self, offset: usize, word: u64, size: usize) {
        self.write_bytes(offset, &word.to_ne_bytes()[..size]);
    }

    /// Read `size` bytes at `offset`, zero-extended into a word.
    pub fn read_word(&self, offset: usize, size: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(self.read_bytes(offset, size));
        u64::from_ne_bytes(raw)
    }

    pub fn write_f32(&mut self, offset: usize, value: f32) {
        self.write_bytes(offset, &value.to_ne_bytes());
    }

    pub fn read_f32(&self, offset: usize) -> f32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read_bytes(offset, 4));
        f32::from_ne_bytes(raw)
    }

    pub fn write_f64(&mut self, offset: usize, value: f64) {
        self.write_bytes(offset, &value.to_ne_bytes());
    }

    pub fn read_f64(&self, offset: usize) -> f64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(offset, 8));
        f64::from_ne_bytes(raw)
    }
}

impl std::fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("len", &self.len())
            .field("tag", &self.tag)
            .field("retained", &self.keep_alive.len())
            .finish()
    }
}

/// Encoded arguments for one call: the per-argument value buffers plus the
/// pointer array handed to the executor. Built once per call, never reused.
pub struct ArgPack {
    buffers: Vec<NativeBuffer>,
    pointers: NativeBuffer,
}

impl ArgPack {
    /// Build the pointer array over `buffers`. The buffers are moved in so
    /// their heap data cannot be freed (or relocated) under the array.
    pub fn new(buffers: Vec<NativeBuffer>) -> Self {
        let mut pointers = NativeBuffer::alloc(buffers.len() * std::mem::size_of::<usize>());
        for (i, buf) in buffers.iter().enumerate() {
            pointers.write_usize(i * std::mem::size_of::<usize>(), buf.addr());
        }
        Self { buffers, pointers }
    }

    /// Number of arguments.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Address of the `i`-th argument's value buffer.
    pub fn pointer_at(&self, i: usize) -> usize {
        self.pointers.read_usize(i * std::mem::size_of::<usize>())
    }

    /// Base address of the pointer array itself.
    pub fn argv_addr(&self) -> usize {
        self.pointers.addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_zeroed() {
        let buf = NativeBuffer::alloc(16);
        assert_eq!(buf.len(), 16);
        assert!(buf.bytes().iter().all(|&b| b == 0));
        assert!(buf.is_null_pointer());
    }

    #[test]
    fn word_round_trip() {
        let mut buf = NativeBuffer::alloc(8);
        buf.write_word(0, 0x1122_3344, 4);
        assert_eq!(buf.read_word(0, 4), 0x1122_3344);

        buf.write_usize(0, 0xdead_beef);
        assert_eq!(buf.read_usize(0), 0xdead_beef);
        assert!(!buf.is_null_pointer());
    }

    #[test]
    fn float_round_trip() {
        let mut buf = NativeBuffer::alloc(8);
        buf.write_f64(0, -2.5);
        assert_eq!(buf.read_f64(0), -2.5);
        buf.write_f32(0, 1.25);
        assert_eq!(buf.read_f32(0), 1.25);
    }

    #[test]
    fn retain_replaces_same_offset() {
        let mut parent = NativeBuffer::alloc(8);
        parent.retain_at(0, NativeBuffer::alloc(4));
        parent.retain_at(0, NativeBuffer::alloc(4));
        parent.retain_at(4, NativeBuffer::alloc(4));
        assert_eq!(parent.retained(), 2);
    }

    #[test]
    fn arg_pack_pointers_track_buffers() {
        let a = NativeBuffer::from_bytes(vec![1, 2, 3, 4]);
        let b = NativeBuffer::from_bytes(vec![5, 6, 7, 8]);
        let pack = ArgPack::new(vec![a, b]);
        assert_eq!(pack.len(), 2);

        // Pointer slots must point at the moved-in buffers' data.
        let first = pack.pointer_at(0) as *const u8;
        let bytes = unsafe { std::slice::from_raw_parts(first, 4) };
        assert_eq!(bytes, &[1, 2, 3, 4]);
        let second = pack.pointer_at(1) as *const u8;
        let bytes = unsafe { std::slice::from_raw_parts(second, 4) };
        assert_eq!(bytes, &[5, 6, 7, 8]);
    }
}
