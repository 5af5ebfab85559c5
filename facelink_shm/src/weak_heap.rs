//! Ring-allocated shared heap with weak references.
//!
//! Stages put images into a `WeakHeap` and pass the resulting [`DataRef`]
//! downstream. The heap never blocks a writer on slow readers: once it wraps,
//! the oldest data is overwritten and old references resolve as stale.
//!
//! Block layout:
//!
//! ```text
//! 0   magic      u64
//! 8   arena size u64
//! 16  ring head  u64 (atomic)
//! 24  lock word  u32 (atomic)
//! 64  arena ...
//! ```

use crate::arena::{Arena, DataRef, align_up};
use crate::block::SharedMemoryBlock;
use crate::error::{Fetched, ShmError, ShmResult};
use crate::sync::ShmMutex;
use facelink_common::consts::HEAP_ALIGN;
use std::sync::atomic::Ordering;

const HEAP_MAGIC: u64 = u64::from_le_bytes(*b"FLWHEAP1");
const MAGIC_OFFSET: usize = 0;
const ARENA_SIZE_OFFSET: usize = 8;
const HEAD_OFFSET: usize = 16;
const LOCK_OFFSET: usize = 24;
const CONTROL_SIZE: usize = 64;

static_assertions::const_assert!(CONTROL_SIZE % HEAP_ALIGN == 0);
static_assertions::const_assert!(LOCK_OFFSET + 4 <= CONTROL_SIZE);

/// Shared circular heap.
///
/// Any number of processes may add and fetch concurrently. Writers take the
/// heap lock only for header bookkeeping; payload copies happen outside it.
#[derive(Debug)]
pub struct WeakHeap {
    block: SharedMemoryBlock,
    arena: Arena,
}

impl WeakHeap {
    /// Create a heap whose arena holds `size` bytes (rounded down to the
    /// alignment; must fit at least one empty block header).
    pub fn create(name: &str, size: usize) -> ShmResult<Self> {
        let size = size / HEAP_ALIGN * HEAP_ALIGN;
        if size <= crate::arena::BLOCK_HEADER_SIZE {
            return Err(ShmError::InvalidSize { size });
        }

        let block = SharedMemoryBlock::create(name, CONTROL_SIZE + size)?;
        let arena = Arena {
            start: CONTROL_SIZE,
            size,
            head_offset: HEAD_OFFSET,
        };
        arena.format(&block)?;
        block
            .atomic_u64(ARENA_SIZE_OFFSET)?
            .store(size as u64, Ordering::Relaxed);
        block
            .atomic_u64(MAGIC_OFFSET)?
            .store(HEAP_MAGIC, Ordering::Release);

        tracing::debug!(heap = name, size, "Created weak heap");
        Ok(Self { block, arena })
    }

    /// Attach to an existing heap
    pub fn open(name: &str) -> ShmResult<Self> {
        let block = SharedMemoryBlock::open(name)?;
        let corrupted = |reason: &str| ShmError::Corrupted {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if block.size() <= CONTROL_SIZE
            || block.atomic_u64(MAGIC_OFFSET)?.load(Ordering::Acquire) != HEAP_MAGIC
        {
            return Err(corrupted("not a weak heap"));
        }
        let size = block.atomic_u64(ARENA_SIZE_OFFSET)?.load(Ordering::Relaxed) as usize;
        if size != align_up(size) || CONTROL_SIZE + size > block.size() {
            return Err(corrupted("arena size does not match block"));
        }

        Ok(Self {
            arena: Arena {
                start: CONTROL_SIZE,
                size,
                head_offset: HEAD_OFFSET,
            },
            block,
        })
    }

    /// Heap name
    pub fn name(&self) -> &str {
        self.block.name()
    }

    /// Largest payload that fits
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Store `data` and return a weak reference to it.
    ///
    /// Fails with `OutOfSpace` only when `data` can never fit.
    pub fn add_data(&self, data: &[u8]) -> ShmResult<DataRef> {
        let data_ref = {
            let _guard = ShmMutex::new(self.block.atomic_u32(LOCK_OFFSET)?).lock();
            self.arena.reserve(&self.block, data.len())?
        };
        self.arena.fill(&self.block, &data_ref, data)?;
        Ok(data_ref)
    }

    /// Copy out the data behind `data_ref`, or report it as overwritten.
    ///
    /// A reference that does not belong to this heap is reported as stale.
    pub fn get_data(&self, data_ref: &DataRef) -> Fetched<Vec<u8>> {
        self.arena.fetch(&self.block, data_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_name(tag: &str) -> String {
        format!("wheap_{}_{}", std::process::id(), tag)
    }

    #[test]
    fn test_create_rejects_tiny_arena() {
        assert!(matches!(
            WeakHeap::create(&heap_name("tiny"), 16),
            Err(ShmError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_add_and_get_through_peer() {
        let name = heap_name("peer");
        let heap = WeakHeap::create(&name, 4096).unwrap();
        let peer = WeakHeap::open(&name).unwrap();

        let r = peer.add_data(b"payload").unwrap();
        assert_eq!(heap.get_data(&r), Fetched::Fresh(b"payload".to_vec()));
        assert_eq!(peer.capacity(), 4096 - 32);
    }

    #[test]
    fn test_empty_payload_is_allowed() {
        let heap = WeakHeap::create(&heap_name("empty"), 256).unwrap();
        let r = heap.add_data(&[]).unwrap();
        assert_eq!(heap.get_data(&r), Fetched::Fresh(Vec::new()));
    }

    #[test]
    fn test_open_rejects_other_blocks() {
        let name = heap_name("other");
        let _block = SharedMemoryBlock::create(&name, 1024).unwrap();
        assert!(matches!(
            WeakHeap::open(&name),
            Err(ShmError::Corrupted { .. })
        ));
    }
}
