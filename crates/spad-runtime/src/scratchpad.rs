//! Per-cluster scratchpad (TCDM) and its buffer planner.
//!
//! A kernel plans its TCDM layout once per invocation with a fresh
//! [`ScratchpadArena`]: named, bump-allocated, 16-byte aligned buffers. The
//! arena only hands out offsets; the bytes live in the cluster's [`Tcdm`].
//! Since every cluster runs the same kernel, one plan is valid for all of
//! them.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;

use spad_core::{DType, Element, Result, SpadError};

use crate::memory::{Endpoint, SharedRegion};

const SCRATCHPAD_ALIGN: usize = 16;

/// Typed handle to `len` elements of `T` at a fixed TCDM offset.
pub struct Buf<T> {
    offset: usize,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Buf<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Buf<T> {}

impl<T> fmt::Debug for Buf<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl<T: Element> Buf<T> {
    fn new(offset: usize, len: usize) -> Self {
        Self {
            offset,
            len,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte offset of the first element.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn nbytes(&self) -> usize {
        T::DTYPE.storage_bytes(self.len)
    }

    /// TCDM address of element `elem`, as a DMA endpoint.
    pub fn addr(&self, elem: usize) -> Endpoint {
        debug_assert!(elem <= self.len);
        Endpoint::Tcdm(self.offset + T::DTYPE.storage_bytes(elem))
    }

    /// Sub-handle over elements `range`.
    pub fn slice(&self, range: Range<usize>) -> Buf<T> {
        debug_assert!(
            range.start <= range.end && range.end <= self.len,
            "sub-buffer {range:?} outside buffer of {} elements",
            self.len
        );
        Buf::new(
            self.offset + T::DTYPE.storage_bytes(range.start),
            range.end - range.start,
        )
    }

    /// Sub-handle over rows `rows` of a row-major matrix with `row_len`
    /// elements per row.
    pub fn rows(&self, rows: Range<usize>, row_len: usize) -> Buf<T> {
        self.slice(rows.start * row_len..rows.end * row_len)
    }
}

/// A named allocation inside the scratchpad plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSlot {
    pub name: String,
    pub dtype: DType,
    pub offset: usize,
    pub size_bytes: usize,
}

/// Bump-pointer planner for a cluster's TCDM.
///
/// Allocations are 16-byte aligned. Names must be unique within one plan,
/// which lets later phases look buffers up by name.
#[derive(Debug)]
pub struct ScratchpadArena {
    capacity: usize,
    offset: usize,
    slots: Vec<BufferSlot>,
}

impl ScratchpadArena {
    /// Create an empty plan over `capacity` bytes of TCDM.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            offset: 0,
            slots: Vec::new(),
        }
    }

    /// Reserve `n` elements of `T` under `name`.
    pub fn alloc<T: Element>(&mut self, name: &str, n: usize) -> Result<Buf<T>> {
        if self.slots.iter().any(|s| s.name == name) {
            return Err(SpadError::DuplicateBuffer(name.to_string()));
        }
        let size_bytes = T::DTYPE.storage_bytes(n);
        let aligned_offset = align_up(self.offset, SCRATCHPAD_ALIGN);
        let available = self.capacity.saturating_sub(aligned_offset);
        if size_bytes > available {
            return Err(SpadError::ScratchpadExhausted {
                name: name.to_string(),
                requested: size_bytes,
                available,
            });
        }
        self.offset = aligned_offset + size_bytes;
        self.slots.push(BufferSlot {
            name: name.to_string(),
            dtype: T::DTYPE,
            offset: aligned_offset,
            size_bytes,
        });
        tracing::trace!(name, offset = aligned_offset, size_bytes, "scratchpad alloc");
        Ok(Buf::new(aligned_offset, n))
    }

    /// Look up a buffer allocated earlier in this plan.
    pub fn get<T: Element>(&self, name: &str) -> Result<Buf<T>> {
        let slot = self
            .slots
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| SpadError::UnknownBuffer(name.to_string()))?;
        if slot.dtype != T::DTYPE {
            return Err(SpadError::UnsupportedDType(T::DTYPE));
        }
        Ok(Buf::new(slot.offset, slot.size_bytes / T::DTYPE.element_size()))
    }

    pub fn slots(&self) -> &[BufferSlot] {
        &self.slots
    }

    /// Current bytes used.
    pub fn used(&self) -> usize {
        self.offset
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remaining bytes available.
    pub fn remaining(&self) -> usize {
        self.capacity - self.offset
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// A cluster's tightly-coupled data memory.
pub struct Tcdm {
    region: SharedRegion,
}

impl Tcdm {
    pub fn new(bytes: usize) -> Self {
        Self {
            region: SharedRegion::new("tcdm", bytes),
        }
    }

    pub fn capacity(&self) -> usize {
        self.region.size()
    }

    /// Borrow a buffer for reading.
    ///
    /// # Safety
    ///
    /// No other core or DMA transfer may write any element of `buf` while
    /// the slice is alive. Kernels establish this by only reading a buffer
    /// in a barrier phase where nobody writes it.
    pub unsafe fn read<T: Element>(&self, buf: Buf<T>) -> &[T] {
        self.region.slice(buf.offset, buf.len)
    }

    /// Borrow a buffer for writing.
    ///
    /// # Safety
    ///
    /// The caller must be the only accessor of every element of `buf` for
    /// the lifetime of the slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn write<T: Element>(&self, buf: Buf<T>) -> &mut [T] {
        self.region.slice_mut(buf.offset, buf.len)
    }

    pub(crate) fn region(&self) -> &SharedRegion {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_alloc() {
        let mut arena = ScratchpadArena::new(1024);
        let b = arena.alloc::<f32>("q", 25).unwrap();
        assert_eq!(b.len(), 25);
        assert_eq!(b.nbytes(), 100);
        assert!(arena.used() >= 100);
    }

    #[test]
    fn test_alignment() {
        let mut arena = ScratchpadArena::new(1024);
        arena.alloc::<half::f16>("a", 1).unwrap();
        let b = arena.alloc::<f32>("b", 1).unwrap();
        assert_eq!(b.offset() % SCRATCHPAD_ALIGN, 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut arena = ScratchpadArena::new(64);
        assert!(arena.alloc::<f32>("a", 8).is_ok());
        let err = arena.alloc::<f32>("b", 16).unwrap_err();
        match err {
            SpadError::ScratchpadExhausted {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 64);
                assert_eq!(available, 32);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_duplicate_and_lookup() {
        let mut arena = ScratchpadArena::new(1024);
        let k = arena.alloc::<f32>("k", 16).unwrap();
        assert!(matches!(
            arena.alloc::<f32>("k", 4),
            Err(SpadError::DuplicateBuffer(_))
        ));
        let found = arena.get::<f32>("k").unwrap();
        assert_eq!(found.offset(), k.offset());
        assert_eq!(found.len(), 16);
        assert!(arena.get::<f32>("v").is_err());
        assert!(arena.get::<f64>("k").is_err());
    }

    #[test]
    fn test_rows_and_addr() {
        let mut arena = ScratchpadArena::new(4096);
        arena.alloc::<f32>("pad", 3).unwrap();
        let m = arena.alloc::<f32>("m", 8 * 4).unwrap();
        let r = m.rows(2..4, 4);
        assert_eq!(r.len(), 8);
        assert_eq!(r.offset(), m.offset() + 2 * 4 * 4);
        assert_eq!(m.addr(5), Endpoint::Tcdm(m.offset() + 20));
    }

    #[test]
    fn test_tcdm_access() {
        let tcdm = Tcdm::new(256);
        let mut arena = ScratchpadArena::new(tcdm.capacity());
        let a = arena.alloc::<f32>("a", 4).unwrap();
        unsafe {
            tcdm.write(a).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
            assert_eq!(tcdm.read(a.slice(1..3)), &[2.0, 3.0]);
        }
    }
}
