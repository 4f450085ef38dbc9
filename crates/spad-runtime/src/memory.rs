//! Byte-addressable memories shared between the host, the DMA engines and
//! the cores.
//!
//! Both main memory and every cluster's TCDM are backed by a
//! [`SharedRegion`]. A region hands out raw slices to concurrently running
//! threads; exclusivity is not checked by the borrow checker but by the
//! barrier-phase discipline of the kernels (a buffer written by a DMA
//! transfer or a core in one phase is only read after the next barrier).

use std::cell::UnsafeCell;

use bytemuck::Pod;
use spad_core::{DType, Result, Shape, SpadError, Tensor};

/// Start alignment of every tensor placed in main memory (one AXI burst).
pub const MAIN_MEMORY_ALIGN: usize = 4096;

/// A byte address in one of the two memory levels a DMA transfer connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Offset into the shared main memory.
    Main(usize),
    /// Offset into the TCDM of the cluster that owns the DMA engine.
    Tcdm(usize),
}

impl Endpoint {
    pub fn offset(&self) -> usize {
        match *self {
            Endpoint::Main(o) | Endpoint::Tcdm(o) => o,
        }
    }
}

/// Interior-mutable backing store for a memory level.
pub(crate) struct SharedRegion {
    name: &'static str,
    words: Box<[UnsafeCell<u64>]>,
    size: usize,
}

// SAFETY: all access goes through the unsafe accessors below, whose callers
// guarantee that no two threads touch overlapping bytes within one phase.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub(crate) fn new(name: &'static str, size: usize) -> Self {
        let words = (0..size.div_ceil(8)).map(|_| UnsafeCell::new(0u64)).collect();
        Self { name, words, size }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(SpadError::OutOfBounds {
                region: self.name,
                offset,
                len,
                size: self.size,
            }),
        }
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.words.as_ptr()) as *mut u8
    }

    fn checked_ptr<T: Pod>(&self, offset: usize, len: usize) -> *mut T {
        let bytes = len * std::mem::size_of::<T>();
        assert!(
            self.check(offset, bytes).is_ok(),
            "{} access {offset}+{bytes} out of bounds ({} bytes)",
            self.name,
            self.size
        );
        debug_assert_eq!(
            offset % std::mem::align_of::<T>(),
            0,
            "misaligned {} access at {offset}",
            self.name
        );
        // SAFETY: offset + bytes is within the allocation, checked above.
        unsafe { self.base().add(offset) as *mut T }
    }

    /// # Safety
    ///
    /// No other thread may write the addressed bytes while the returned
    /// slice is alive.
    pub(crate) unsafe fn slice<T: Pod>(&self, offset: usize, len: usize) -> &[T] {
        std::slice::from_raw_parts(self.checked_ptr::<T>(offset, len), len)
    }

    /// # Safety
    ///
    /// No other thread may read or write the addressed bytes while the
    /// returned slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut<T: Pod>(&self, offset: usize, len: usize) -> &mut [T] {
        std::slice::from_raw_parts_mut(self.checked_ptr::<T>(offset, len), len)
    }

    /// Copy `len` bytes from `src` into this region.
    ///
    /// # Safety
    ///
    /// Neither range may be accessed by another thread during the copy.
    pub(crate) unsafe fn copy_from(
        &self,
        dst_offset: usize,
        src: &SharedRegion,
        src_offset: usize,
        len: usize,
    ) {
        let d = self.checked_ptr::<u8>(dst_offset, len);
        let s = src.checked_ptr::<u8>(src_offset, len);
        std::ptr::copy(s, d, len);
    }
}

/// Handle to a tensor living in main memory.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRef {
    offset: usize,
    shape: Shape,
    dtype: DType,
}

impl TensorRef {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel())
    }

    /// Address of element `elem` (row-major flat index).
    pub fn addr(&self, elem: usize) -> Endpoint {
        Endpoint::Main(self.offset + self.dtype.storage_bytes(elem))
    }
}

/// The shared off-chip memory all clusters reach through their DMA engines.
///
/// Tensors are bump-allocated; [`MainMemory::reset`] releases all of them.
pub struct MainMemory {
    region: SharedRegion,
    cursor: usize,
}

impl MainMemory {
    pub fn new(bytes: usize) -> Self {
        Self {
            region: SharedRegion::new("main memory", bytes),
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.region.size()
    }

    pub fn used(&self) -> usize {
        self.cursor
    }

    /// Reserve space for a tensor. Contents are whatever was there before.
    pub fn alloc(&mut self, shape: impl Into<Shape>, dtype: DType) -> Result<TensorRef> {
        let shape = shape.into();
        let bytes = dtype.storage_bytes(shape.numel());
        let offset = self.cursor.next_multiple_of(MAIN_MEMORY_ALIGN);
        let available = self.capacity().saturating_sub(offset);
        if bytes > available {
            return Err(SpadError::MainMemoryExhausted {
                requested: bytes,
                available,
            });
        }
        self.cursor = offset + bytes;
        Ok(TensorRef {
            offset,
            shape,
            dtype,
        })
    }

    /// Allocate a tensor and copy `tensor` into it.
    pub fn upload(&mut self, tensor: &Tensor) -> Result<TensorRef> {
        let dst = self.alloc(tensor.shape().clone(), tensor.dtype())?;
        self.write(&dst, tensor)?;
        Ok(dst)
    }

    /// Overwrite the contents of `dst` with `tensor`.
    pub fn write(&mut self, dst: &TensorRef, tensor: &Tensor) -> Result<()> {
        if tensor.dtype() != dst.dtype {
            return Err(SpadError::UnsupportedDType(tensor.dtype()));
        }
        if tensor.shape() != &dst.shape {
            return Err(SpadError::ShapeMismatch {
                expected: dst.shape.dims().to_vec(),
                got: tensor.shape().dims().to_vec(),
            });
        }
        self.region.check(dst.offset, dst.nbytes())?;
        // SAFETY: `&mut self` excludes any running kernel.
        let bytes = unsafe { self.region.slice_mut::<u8>(dst.offset, dst.nbytes()) };
        bytes.copy_from_slice(tensor.as_bytes());
        Ok(())
    }

    /// Copy a tensor back to the host.
    pub fn download(&self, src: &TensorRef) -> Result<Tensor> {
        self.region.check(src.offset, src.nbytes())?;
        // SAFETY: kernels only run under `System::launch(&mut self)`, so no
        // core can be writing while the host holds `&self`.
        let bytes = unsafe { self.region.slice::<u8>(src.offset, src.nbytes()) };
        Tensor::from_bytes(bytes.to_vec(), src.shape.dims(), src.dtype)
    }

    /// Release every allocation.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub(crate) fn region(&self) -> &SharedRegion {
        &self.region
    }
}
