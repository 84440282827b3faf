//! Single-writer, multi-reader circular byte queue living in shared memory.
//!
//! The shared block starts with a small header holding the writer's rear
//! index, followed by the byte ring:
//!
//! ```text
//! [rear: u64 | reserved (56) | data (capacity)]
//! ```
//!
//! The rear index only ever grows; its value modulo the capacity is the next
//! write position. Readers keep their own front index privately, so any number
//! of them can drain the same ring independently and none of them throttle the
//! writer. A reader that falls more than `capacity` bytes behind is skipped
//! forward and told how many bytes it lost.
//!
//! Every byte of the ring is accessed through an atomic so that a reader
//! racing the writer observes torn data rather than undefined behaviour. The
//! log layer above detects torn entries by their duplicated length byte.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;

use crate::entry::EntrySink;

/// Size of the header placed in front of the ring bytes.
pub const HEADER_SIZE: usize = 64;

/// Bytes a caller must map to host a ring of `capacity` bytes.
pub const fn shared_size(capacity: usize) -> usize {
    HEADER_SIZE + capacity
}

enum Backing {
    Heap(#[allow(dead_code)] Box<[AtomicU64]>),
    Mapped(#[allow(dead_code)] MmapMut),
    Borrowed,
}

struct RegionInner {
    _backing: Backing,
    base: *mut u8,
    capacity: usize,
}

// The raw base pointer is only dereferenced as atomics.
unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}

/// Handle to one shared block hosting a ring.
///
/// Clones refer to the same memory. Heap and file-mapped regions are kept
/// alive by the last clone; borrowed regions rely on the caller.
#[derive(Clone)]
pub struct SharedRegion {
    inner: Arc<RegionInner>,
}

impl SharedRegion {
    /// Allocates a zeroed region on the heap.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let words = shared_size(capacity).div_ceil(8);
        let mut storage: Box<[AtomicU64]> = (0..words).map(|_| AtomicU64::new(0)).collect();
        let base = storage.as_mut_ptr() as *mut u8;
        Self {
            inner: Arc::new(RegionInner {
                _backing: Backing::Heap(storage),
                base,
                capacity,
            }),
        }
    }

    /// Maps (and creates if needed) a file large enough for a ring of
    /// `capacity` bytes. Processes mapping the same file share the ring.
    pub fn map_file(path: impl AsRef<Path>, capacity: usize) -> io::Result<Self> {
        if capacity == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "ring capacity must be non-zero"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let wanted = shared_size(capacity) as u64;
        if file.metadata()?.len() < wanted {
            file.set_len(wanted)?;
        }
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();
        Ok(Self {
            inner: Arc::new(RegionInner {
                _backing: Backing::Mapped(map),
                base,
                capacity,
            }),
        })
    }

    /// Attaches to memory the caller already mapped.
    ///
    /// # Safety
    ///
    /// `ptr` must be 8-byte aligned, valid for reads and writes of
    /// `shared_size(capacity)` bytes, zero-initialised by whoever created it,
    /// and must stay mapped for as long as any clone of the returned handle or
    /// any writer/reader built on it exists.
    pub unsafe fn from_raw(ptr: *mut u8, capacity: usize) -> io::Result<Self> {
        if ptr.is_null() || capacity == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "null or empty shared region"));
        }
        if (ptr as usize) % std::mem::align_of::<AtomicU64>() != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "shared region is misaligned"));
        }
        Ok(Self {
            inner: Arc::new(RegionInner {
                _backing: Backing::Borrowed,
                base: ptr,
                capacity,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Whether both handles point at the same memory.
    pub fn same_region(&self, other: &SharedRegion) -> bool {
        self.inner.base == other.inner.base
    }

    fn rear(&self) -> &AtomicU64 {
        unsafe { &*(self.inner.base as *const AtomicU64) }
    }

    fn bytes(&self) -> &[AtomicU8] {
        unsafe {
            std::slice::from_raw_parts(
                self.inner.base.add(HEADER_SIZE) as *const AtomicU8,
                self.inner.capacity,
            )
        }
    }

    /// Total bytes ever written to the ring.
    pub fn written(&self) -> u64 {
        self.rear().load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.inner.base)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// Producer side of a ring. Never blocks: the oldest bytes are overwritten
/// when the ring is full.
#[derive(Debug)]
pub struct FifoWriter {
    region: SharedRegion,
}

impl FifoWriter {
    pub fn new(region: SharedRegion) -> Self {
        Self { region }
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Appends `bytes` and publishes them in one step, so readers either see
    /// the whole write or none of it. Returns the number of bytes written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }
        let capacity = self.region.capacity();
        let rear = self.region.rear().load(Ordering::Relaxed);
        // only the tail of an oversized write can survive
        let skip = bytes.len().saturating_sub(capacity);
        let ring = self.region.bytes();
        let mut index = ((rear + skip as u64) % capacity as u64) as usize;
        for &b in &bytes[skip..] {
            ring[index].store(b, Ordering::Relaxed);
            index += 1;
            if index == capacity {
                index = 0;
            }
        }
        self.region.rear().store(rear + bytes.len() as u64, Ordering::Release);
        bytes.len()
    }
}

impl EntrySink for FifoWriter {
    fn write(&mut self, bytes: &[u8]) -> usize {
        FifoWriter::write(self, bytes)
    }
}

/// A contiguous piece of readable ring bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoVec {
    pub offset: usize,
    pub length: usize,
}

/// Result of [`FifoReader::obtain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Obtained {
    /// Readable bytes in ring order; the second piece is non-empty only when
    /// the data wraps around the end of the ring.
    pub iovec: [IoVec; 2],
    pub available: usize,
    /// Bytes overwritten before this reader could see them.
    pub lost: usize,
}

/// Consumer side of a ring with its own private front index.
#[derive(Debug)]
pub struct FifoReader {
    region: SharedRegion,
    front: u64,
}

impl FifoReader {
    /// Starts reading at the oldest byte still held by the ring.
    pub fn new(region: SharedRegion) -> Self {
        Self { region, front: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Reports up to `max` readable bytes without consuming them.
    ///
    /// If the writer lapped this reader, the front index is moved to the
    /// oldest surviving byte and the gap is returned as `lost`.
    pub fn obtain(&mut self, max: usize) -> Obtained {
        let capacity = self.region.capacity() as u64;
        let rear = self.region.rear().load(Ordering::Acquire);
        if rear < self.front {
            // the ring was recreated underneath us
            self.front = rear;
        }
        let mut lost = 0;
        if rear - self.front > capacity {
            lost = (rear - capacity - self.front) as usize;
            self.front = rear - capacity;
        }
        let available = ((rear - self.front) as usize).min(max);
        let offset = (self.front % capacity) as usize;
        let first = available.min(capacity as usize - offset);
        Obtained {
            iovec: [
                IoVec { offset, length: first },
                IoVec { offset: 0, length: available - first },
            ],
            available,
            lost,
        }
    }

    /// Copies the bytes described by `iov` into the start of `dst`.
    pub fn copy_out(&self, iov: IoVec, dst: &mut [u8]) -> usize {
        let ring = self.region.bytes();
        let n = iov.length.min(dst.len());
        for (d, s) in dst[..n].iter_mut().zip(&ring[iov.offset..iov.offset + n]) {
            *d = s.load(Ordering::Relaxed);
        }
        n
    }

    /// Marks `count` bytes as consumed.
    pub fn release(&mut self, count: usize) {
        let rear = self.region.rear().load(Ordering::Acquire);
        self.front = (self.front + count as u64).min(rear);
    }
}
