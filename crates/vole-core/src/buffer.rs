use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::checked_elem_count;

// Buffer — Shared handle to contiguous scalar storage
//
// A Buffer is what a variable is bound to inside a compiled model. It is
// either attached by the caller (external) or allocated by the model builder
// (internal). Both kinds are the same type; ownership decides the kind:
//
//   - The caller keeps its own clone of an external buffer, so dropping or
//     disposing a model never frees it.
//   - Internal buffers are only referenced by the model, so they are freed
//     exactly when the model releases its plan.
//
// MEMORY MODEL:
//
//   The handle wraps an Arc around the inner data. Cloning a Buffer is O(1)
//   and yields the *same* handle: `Buffer::ptr_eq` and `id()` identify it.
//   The storage is a fixed-length `Box<[f32]>` behind a RwLock, so kernels
//   can read inputs concurrently while one kernel writes its output, and no
//   writer can resize a buffer after its capacity was validated.

/// Unique identifier for a buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

impl BufferId {
    fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        BufferId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

struct BufferInner {
    id: BufferId,
    data: RwLock<Box<[f32]>>,
    /// Element count; the storage is never resized.
    len: usize,
    /// Shape the creator declared for this buffer, if any.
    dims: Option<Vec<usize>>,
}

/// A contiguous region of f32 storage shared by handle.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    fn from_parts(data: Vec<f32>, dims: Option<Vec<usize>>) -> Self {
        Buffer {
            inner: Arc::new(BufferInner {
                id: BufferId::new(),
                len: data.len(),
                data: RwLock::new(data.into_boxed_slice()),
                dims,
            }),
        }
    }

    /// Allocate a zero-filled buffer of `len` elements with no declared shape.
    pub fn zeros(len: usize) -> Self {
        Self::from_parts(vec![0.0; len], None)
    }

    /// Allocate a zero-filled buffer whose declared shape is `dims`.
    pub fn zeros_with_dims(dims: &[usize]) -> Self {
        let len = dims.iter().product();
        Self::from_parts(vec![0.0; len], Some(dims.to_vec()))
    }

    /// Wrap existing data, with no declared shape.
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self::from_parts(data, None)
    }

    /// Wrap existing data with a declared shape.
    pub fn from_vec_with_dims(data: Vec<f32>, dims: &[usize]) -> Result<Self> {
        let expected = checked_elem_count(dims).ok_or_else(|| {
            Error::dim_mismatch(format!("buffer shape {dims:?} overflows the address space"))
        })?;
        if data.len() != expected {
            return Err(Error::dim_mismatch(format!(
                "buffer shape {:?} requires {} elements, got {}",
                dims,
                expected,
                data.len()
            )));
        }
        Ok(Self::from_parts(data, Some(dims.to_vec())))
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    /// Whether two handles refer to the same storage.
    pub fn ptr_eq(a: &Buffer, b: &Buffer) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Element type stored in this buffer.
    pub fn dtype(&self) -> DType {
        DType::F32
    }

    /// Declared shape, if the creator supplied one.
    pub fn dims(&self) -> Option<&[usize]> {
        self.inner.dims.as_deref()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }

    /// Number of live handles to this storage.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Acquire a read lock on the storage.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, Box<[f32]>>> {
        self.inner
            .data
            .read()
            .map_err(|_| Error::backend("buffer lock poisoned"))
    }

    /// Acquire a write lock on the storage.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Box<[f32]>>> {
        self.inner
            .data
            .write()
            .map_err(|_| Error::backend("buffer lock poisoned"))
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        Ok(self.read()?.to_vec())
    }

    /// Overwrite the leading elements with `src`.
    pub fn copy_from_slice(&self, src: &[f32]) -> Result<()> {
        let mut guard = self.write()?;
        if src.len() > guard.len() {
            return Err(Error::IndexOutOfRange {
                index: src.len(),
                len: guard.len(),
            });
        }
        guard[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Set every element to `value`.
    pub fn fill(&self, value: f32) -> Result<()> {
        self.write()?.iter_mut().for_each(|v| *v = value);
        Ok(())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("len", &self.len())
            .field("dims", &self.inner.dims)
            .finish()
    }
}
