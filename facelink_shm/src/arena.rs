//! Circular block allocator shared by [`WeakHeap`](crate::WeakHeap) and
//! [`RingDirectory`](crate::RingDirectory).
//!
//! The arena is a chain of blocks, each starting with a 32-byte header:
//!
//! ```text
//! +------------+-----------+----------------+----------------
//! | block_size | data_size | signature (16) | payload ...
//! |    u64     |    u64    |     uuid       |
//! +------------+-----------+----------------+----------------
//! ```
//!
//! `block_size` includes the header. Blocks tile the arena exactly. A ring
//! head (shared `u64`) names the block the next allocation starts from; it
//! only moves forward and wraps to zero. Allocation never waits for readers:
//! it claims the head block, merging successors until the payload fits, and
//! gives the result a fresh signature. Readers holding an old reference see
//! a signature mismatch and report the data as stale.

use crate::block::SharedMemoryBlock;
use crate::error::{Fetched, ShmError, ShmResult};
use crate::view::StructuredMemoryView;
use facelink_common::consts::HEAP_ALIGN;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{Ordering, fence};
use uuid::Uuid;

/// Size of a block header inside the arena
pub const BLOCK_HEADER_SIZE: usize = 32;

const SIGNATURE_OFFSET: usize = 16;

/// Weak reference to an allocation.
///
/// Holding a `DataRef` does not keep the data alive; resolving it later may
/// yield [`Fetched::Stale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRef {
    /// Offset of the block header within the arena
    pub block_offset: u64,
    /// Signature the block carried when allocated
    pub signature: Uuid,
}

/// Round `n` up to the arena alignment
pub(crate) fn align_up(n: usize) -> usize {
    n.div_ceil(HEAP_ALIGN) * HEAP_ALIGN
}

/// Location of an arena inside a block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Arena {
    /// Byte offset of the arena within the block
    pub start: usize,
    /// Arena size in bytes (multiple of `HEAP_ALIGN`)
    pub size: usize,
    /// Offset of the shared ring head `u64` within the block
    pub head_offset: usize,
}

struct Header {
    block_size: usize,
    data_size: usize,
    signature: Uuid,
}

impl Arena {
    /// Largest payload a single allocation can hold
    pub fn capacity(&self) -> usize {
        self.size.saturating_sub(BLOCK_HEADER_SIZE)
    }

    /// Lay out a single empty block spanning the arena and reset the head.
    pub fn format(&self, block: &SharedMemoryBlock) -> ShmResult<()> {
        self.write_header(block, 0, self.size, 0, Uuid::nil())?;
        block.atomic_u64(self.head_offset)?.store(0, Ordering::Release);
        Ok(())
    }

    /// Claim room for `len` payload bytes and return a reference to it.
    ///
    /// Only the headers are touched; the caller copies the payload with
    /// [`fill`](Self::fill). Callers sharing the arena between writers must
    /// serialize `reserve` calls.
    pub fn reserve(&self, block: &SharedMemoryBlock, len: usize) -> ShmResult<DataRef> {
        let needed = BLOCK_HEADER_SIZE
            .checked_add(len)
            .map(align_up)
            .filter(|&n| n <= self.size)
            .ok_or(ShmError::OutOfSpace {
                requested: len,
                capacity: self.capacity(),
            })?;

        let head = block.atomic_u64(self.head_offset)?;
        let mut off = head.load(Ordering::Acquire) as usize;
        if off >= self.size {
            off = 0;
        }

        loop {
            let current = self.read_header(block, off)?;

            if current.block_size >= needed {
                self.invalidate(block, off)?;

                let mut block_size = current.block_size;
                if block_size - needed >= BLOCK_HEADER_SIZE {
                    self.write_header(block, off + needed, block_size - needed, 0, Uuid::nil())?;
                    block_size = needed;
                }

                let signature = Uuid::new_v4();
                self.write_header(block, off, block_size, len, signature)?;
                fence(Ordering::Release);

                let next = off + block_size;
                head.store(
                    if next >= self.size { 0 } else { next as u64 },
                    Ordering::Release,
                );

                return Ok(DataRef {
                    block_offset: off as u64,
                    signature,
                });
            }

            let next = off + current.block_size;
            if next >= self.size {
                if off == 0 {
                    return Err(ShmError::OutOfSpace {
                        requested: len,
                        capacity: self.capacity(),
                    });
                }
                off = 0;
                continue;
            }

            // Absorb the successor into the head block
            let successor = self.read_header(block, next)?;
            self.invalidate(block, off)?;
            self.invalidate(block, next)?;
            self.write_header(
                block,
                off,
                current.block_size + successor.block_size,
                0,
                Uuid::nil(),
            )?;
        }
    }

    /// Copy the payload of a freshly reserved block.
    pub fn fill(&self, block: &SharedMemoryBlock, data_ref: &DataRef, data: &[u8]) -> ShmResult<()> {
        let off = data_ref.block_offset as usize + BLOCK_HEADER_SIZE;
        let mut view = block.view_at(self.start, self.size)?;
        view.seek(off)?;
        view.write_bytes(data)
    }

    /// Resolve a reference, validating the signature before and after the copy.
    pub fn fetch(&self, block: &SharedMemoryBlock, data_ref: &DataRef) -> Fetched<Vec<u8>> {
        let off = data_ref.block_offset as usize;
        if data_ref.signature.is_nil() || off % HEAP_ALIGN != 0 {
            return Fetched::Stale;
        }

        let Ok(header) = self.read_header(block, off) else {
            return Fetched::Stale;
        };
        if header.signature != data_ref.signature
            || header.data_size > header.block_size.saturating_sub(BLOCK_HEADER_SIZE)
        {
            return Fetched::Stale;
        }
        fence(Ordering::Acquire);

        let data = match block.view_at(self.start, self.size).and_then(|mut view| {
            view.seek(off + BLOCK_HEADER_SIZE)?;
            view.read_bytes(header.data_size)
        }) {
            Ok(data) => data,
            Err(_) => return Fetched::Stale,
        };

        fence(Ordering::Acquire);
        match self.read_signature(block, off) {
            Ok(signature) if signature == data_ref.signature => Fetched::Fresh(data),
            _ => Fetched::Stale,
        }
    }

    fn read_header(&self, block: &SharedMemoryBlock, off: usize) -> ShmResult<Header> {
        let mut view = self.view(block)?;
        view.seek(off)?;
        let (block_size, data_size, signature): (u64, u64, Uuid) = view.read_fixed()?;
        let header = Header {
            block_size: block_size as usize,
            data_size: data_size as usize,
            signature,
        };
        if header.block_size < BLOCK_HEADER_SIZE
            || off
                .checked_add(header.block_size)
                .is_none_or(|end| end > self.size)
        {
            return Err(ShmError::Corrupted {
                name: block.name().to_string(),
                reason: format!("bad block header at arena offset {}", off),
            });
        }
        Ok(header)
    }

    fn read_signature(&self, block: &SharedMemoryBlock, off: usize) -> ShmResult<Uuid> {
        let mut view = self.view(block)?;
        view.seek(off + SIGNATURE_OFFSET)?;
        view.read_fixed()
    }

    fn write_header(
        &self,
        block: &SharedMemoryBlock,
        off: usize,
        block_size: usize,
        data_size: usize,
        signature: Uuid,
    ) -> ShmResult<()> {
        let mut view = self.view(block)?;
        view.seek(off)?;
        view.write_fixed((block_size as u64, data_size as u64, signature))
    }

    /// Clear a signature so concurrent readers of the old data bail out.
    fn invalidate(&self, block: &SharedMemoryBlock, off: usize) -> ShmResult<()> {
        let mut view = self.view(block)?;
        view.seek(off + SIGNATURE_OFFSET)?;
        view.write_fixed(Uuid::nil())?;
        fence(Ordering::Release);
        Ok(())
    }

    fn view<'b>(&self, block: &'b SharedMemoryBlock) -> ShmResult<StructuredMemoryView<'b>> {
        block.view_at(self.start, self.size)
    }
}
