//! Bounded record ring between pipeline stages.
//!
//! A `RingDirectory` carries encoded records from one stage to the next. The
//! writer never waits for the reader: records go into a small slot table
//! backed by a circular arena, and a reader that falls more than one table
//! behind skips straight to the oldest record still in the table.
//!
//! Record ids start at zero. Record `k` lives in slot `k % table_size`, and
//! each slot remembers the id it holds so overwritten records are detected.
//!
//! Block layout:
//!
//! ```text
//! 0    magic           u64
//! 8    table size      u64
//! 16   arena size      u64
//! 24   write id        u64 (atomic; ids written so far)
//! 32   read id         u64 (atomic; ids consumed so far)
//! 40   arena head      u64 (atomic)
//! 48   writer lock     u32 (atomic)
//! 52   event           u32 (atomic)
//! 56   multi producer  u32
//! 64   slot table      table size * 40 bytes
//! ...  arena           (64-byte aligned)
//! ```

use crate::arena::{Arena, DataRef};
use crate::block::SharedMemoryBlock;
use crate::error::{Fetched, ShmError, ShmResult};
use crate::sync::{ShmEvent, ShmMutex};
use crate::view::StructuredMemoryView;
use facelink_common::consts::HEAP_ALIGN;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::time::{Duration, Instant};
use uuid::Uuid;

const RING_MAGIC: u64 = u64::from_le_bytes(*b"FLRING01");
const MAGIC_OFFSET: usize = 0;
const TABLE_SIZE_OFFSET: usize = 8;
const ARENA_SIZE_OFFSET: usize = 16;
const WRITE_ID_OFFSET: usize = 24;
const READ_ID_OFFSET: usize = 32;
const HEAD_OFFSET: usize = 40;
const LOCK_OFFSET: usize = 48;
const EVENT_OFFSET: usize = 52;
const MULTI_OFFSET: usize = 56;
const CONTROL_SIZE: usize = 64;

/// Slot: record id, arena offset, data size, signature
const SLOT_SIZE: usize = 40;
const EMPTY_SLOT: u64 = u64::MAX;

static_assertions::const_assert!(SLOT_SIZE % HEAP_ALIGN == 0);

/// Ring construction parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingOptions {
    /// Number of directory slots
    pub table_size: usize,
    /// Arena bytes backing the records
    pub heap_size: usize,
    /// Serialize writers from several processes
    pub multi_producer: bool,
}

impl RingOptions {
    /// Single-producer ring
    pub fn new(table_size: usize, heap_size: usize) -> Self {
        Self {
            table_size,
            heap_size,
            multi_producer: false,
        }
    }

    /// Enable writer serialization
    pub fn multi_producer(mut self) -> Self {
        self.multi_producer = true;
        self
    }
}

/// Bounded multi-process record queue with lossy catch-up.
#[derive(Debug)]
pub struct RingDirectory {
    block: SharedMemoryBlock,
    table_size: u64,
    arena: Arena,
}

impl RingDirectory {
    /// Create a ring
    pub fn create(name: &str, options: RingOptions) -> ShmResult<Self> {
        let RingOptions {
            table_size,
            heap_size,
            multi_producer,
        } = options;
        if table_size == 0 {
            return Err(ShmError::InvalidSize { size: table_size });
        }
        let heap_size = heap_size / HEAP_ALIGN * HEAP_ALIGN;
        if heap_size <= crate::arena::BLOCK_HEADER_SIZE {
            return Err(ShmError::InvalidSize { size: heap_size });
        }

        let arena_start = table_end(table_size)
            .ok_or(ShmError::InvalidSize { size: table_size })?;
        let total = arena_start
            .checked_add(heap_size)
            .ok_or(ShmError::InvalidSize { size: heap_size })?;

        let block = SharedMemoryBlock::create(name, total)?;
        let arena = Arena {
            start: arena_start,
            size: heap_size,
            head_offset: HEAD_OFFSET,
        };
        arena.format(&block)?;

        let ring = Self {
            block,
            table_size: table_size as u64,
            arena,
        };
        {
            let mut view = ring.block.view();
            view.seek(TABLE_SIZE_OFFSET)?;
            view.write_fixed(table_size as u64)?;
            view.seek(ARENA_SIZE_OFFSET)?;
            view.write_fixed(heap_size as u64)?;
            view.seek(MULTI_OFFSET)?;
            view.write_fixed(u32::from(multi_producer))?;
            for slot in 0..table_size {
                view.seek(CONTROL_SIZE + slot * SLOT_SIZE)?;
                view.write_fixed(EMPTY_SLOT)?;
            }
        }
        ring.block
            .atomic_u64(MAGIC_OFFSET)?
            .store(RING_MAGIC, Ordering::Release);

        tracing::debug!(ring = name, table_size, heap_size, multi_producer, "Created ring");
        Ok(ring)
    }

    /// Attach to an existing ring
    pub fn open(name: &str) -> ShmResult<Self> {
        let block = SharedMemoryBlock::open(name)?;
        let corrupted = |reason: &str| ShmError::Corrupted {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if block.size() <= CONTROL_SIZE
            || block.atomic_u64(MAGIC_OFFSET)?.load(Ordering::Acquire) != RING_MAGIC
        {
            return Err(corrupted("not a ring directory"));
        }

        let mut view = block.view();
        view.seek(TABLE_SIZE_OFFSET)?;
        let table_size: u64 = view.read_fixed()?;
        view.seek(ARENA_SIZE_OFFSET)?;
        let heap_size: u64 = view.read_fixed()?;
        let arena_start = table_end(table_size as usize)
            .filter(|_| table_size > 0)
            .ok_or_else(|| corrupted("bad table size"))?;
        if arena_start
            .checked_add(heap_size as usize)
            .is_none_or(|end| end > block.size())
        {
            return Err(corrupted("arena does not fit block"));
        }

        Ok(Self {
            table_size,
            arena: Arena {
                start: arena_start,
                size: heap_size as usize,
                head_offset: HEAD_OFFSET,
            },
            block,
        })
    }

    /// Ring name
    pub fn name(&self) -> &str {
        self.block.name()
    }

    /// Number of slots
    pub fn table_size(&self) -> u64 {
        self.table_size
    }

    /// Largest record that fits
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Append a record and return its id.
    pub fn write(&self, payload: &[u8]) -> ShmResult<u64> {
        let _guard = if self.is_multi_producer()? {
            Some(ShmMutex::new(self.block.atomic_u32(LOCK_OFFSET)?).lock())
        } else {
            None
        };

        let write_id = self.write_id()?;
        let id = write_id.load(Ordering::Acquire);

        let data_ref = self.arena.reserve(&self.block, payload.len())?;
        self.arena.fill(&self.block, &data_ref, payload)?;

        let slot = self.slot_offset(id);
        let mut view = self.block.view();
        view.seek(slot)?;
        view.write_fixed(EMPTY_SLOT)?;
        fence(Ordering::Release);
        view.write_fixed((
            data_ref.block_offset,
            payload.len() as u64,
            data_ref.signature,
        ))?;
        fence(Ordering::Release);
        view.seek(slot)?;
        view.write_fixed(id)?;

        write_id.store(id + 1, Ordering::Release);
        self.event()?.notify_all();
        Ok(id)
    }

    /// Next unread record, waiting up to `timeout` for one to arrive.
    ///
    /// A zero timeout never blocks. When the reader has fallen more than a
    /// table behind, the ids no longer in the table are skipped, as are
    /// records whose data was overwritten. Returns `None` on timeout.
    /// A timeout too large to be a deadline (such as `Duration::MAX`) waits
    /// until a record arrives.
    pub fn read(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let event = self.event().ok()?;
            let seen = event.sequence();
            if let Some(record) = self.read_next() {
                return Some(record);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    deadline - now
                }
                None => UNBOUNDED_WAIT_SLICE,
            };
            event.wait(seen, wait);
        }
    }

    /// Look up a record by id without moving the read position.
    ///
    /// `None` when the id has not been written yet; `Stale` once its slot
    /// has been reused.
    pub fn get_by_id(&self, id: u64) -> Option<Fetched<Vec<u8>>> {
        if id >= self.get_write_id() {
            return None;
        }
        Some(self.fetch(id))
    }

    /// Most recently written record, if still resolvable
    pub fn latest(&self) -> Option<Vec<u8>> {
        let id = self.get_write_id().checked_sub(1)?;
        self.get_by_id(id)?.fresh()
    }

    /// Number of records written
    pub fn get_write_id(&self) -> u64 {
        self.write_id().map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// Number of record ids consumed
    pub fn get_read_id(&self) -> u64 {
        self.read_id().map_or(0, |r| r.load(Ordering::Acquire))
    }

    /// True when at most `slack` written records are unread
    pub fn is_caught_up(&self, slack: u64) -> bool {
        self.get_read_id() >= self.get_write_id().saturating_sub(slack)
    }

    fn read_next(&self) -> Option<Vec<u8>> {
        let read_id = self.read_id().ok()?;
        let write = self.get_write_id();
        let mut next = read_id.load(Ordering::Acquire);
        if write.saturating_sub(next) > self.table_size {
            let skipped = write - self.table_size - next;
            tracing::trace!(ring = self.name(), skipped, "Reader fell behind, skipping");
            next = write - self.table_size;
        }

        while next < write {
            let id = next;
            next += 1;
            read_id.store(next, Ordering::Release);
            if let Fetched::Fresh(record) = self.fetch(id) {
                return Some(record);
            }
        }
        read_id.store(next, Ordering::Release);
        None
    }

    fn fetch(&self, id: u64) -> Fetched<Vec<u8>> {
        let slot = self.slot_offset(id);
        let mut view = self.block.view();
        let entry = view
            .seek(slot)
            .and_then(|_| view.read_fixed::<(u64, u64, u64, Uuid)>());
        let Ok((slot_id, block_offset, _size, signature)) = entry else {
            return Fetched::Stale;
        };
        if slot_id != id {
            return Fetched::Stale;
        }

        let record = self.arena.fetch(
            &self.block,
            &DataRef {
                block_offset,
                signature,
            },
        );

        fence(Ordering::Acquire);
        match self.slot_id(slot) {
            Some(current) if current == id => record,
            _ => Fetched::Stale,
        }
    }

    fn slot_id(&self, slot: usize) -> Option<u64> {
        let mut view: StructuredMemoryView<'_> = self.block.view();
        view.seek(slot).ok()?;
        view.read_fixed().ok()
    }

    fn slot_offset(&self, id: u64) -> usize {
        CONTROL_SIZE + (id % self.table_size) as usize * SLOT_SIZE
    }

    fn is_multi_producer(&self) -> ShmResult<bool> {
        let mut view = self.block.view();
        view.seek(MULTI_OFFSET)?;
        Ok(view.read_fixed::<u32>()? != 0)
    }

    fn write_id(&self) -> ShmResult<&AtomicU64> {
        self.block.atomic_u64(WRITE_ID_OFFSET)
    }

    fn read_id(&self) -> ShmResult<&AtomicU64> {
        self.block.atomic_u64(READ_ID_OFFSET)
    }

    fn event(&self) -> ShmResult<ShmEvent<'_>> {
        Ok(ShmEvent::new(self.block.atomic_u32(EVENT_OFFSET)?))
    }
}

/// Longest single sleep of a reader that has no deadline
const UNBOUNDED_WAIT_SLICE: Duration = Duration::from_secs(1);

/// End of the slot table, rounded up to a cache line
fn table_end(table_size: usize) -> Option<usize> {
    let end = table_size.checked_mul(SLOT_SIZE)?.checked_add(CONTROL_SIZE)?;
    Some(end.div_ceil(64) * 64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_name(tag: &str) -> String {
        format!("ring_{}_{}", std::process::id(), tag)
    }

    #[test]
    fn test_table_end_alignment() {
        assert_eq!(table_end(1), Some(128));
        assert_eq!(table_end(8), Some(384));
        assert_eq!(table_end(usize::MAX), None);
    }

    #[test]
    fn test_create_validates_options() {
        assert!(RingDirectory::create(&ring_name("zero"), RingOptions::new(0, 1024)).is_err());
        assert!(RingDirectory::create(&ring_name("small"), RingOptions::new(4, 16)).is_err());
    }

    #[test]
    fn test_write_then_read_in_order() {
        let ring = RingDirectory::create(&ring_name("order"), RingOptions::new(4, 4096)).unwrap();
        assert_eq!(ring.write(b"a").unwrap(), 0);
        assert_eq!(ring.write(b"b").unwrap(), 1);

        assert_eq!(ring.read(Duration::ZERO), Some(b"a".to_vec()));
        assert_eq!(ring.read(Duration::ZERO), Some(b"b".to_vec()));
        assert_eq!(ring.read(Duration::ZERO), None);
        assert!(ring.is_caught_up(0));
    }

    #[test]
    fn test_read_without_deadline_waits_for_writer() {
        let name = ring_name("forever");
        let ring = RingDirectory::create(&name, RingOptions::new(4, 4096)).unwrap();
        let writer = std::thread::spawn(move || {
            let peer = RingDirectory::open(&name).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            peer.write(b"late").unwrap();
        });
        assert_eq!(ring.read(Duration::MAX), Some(b"late".to_vec()));
        writer.join().unwrap();
    }

    #[test]
    fn test_latest_and_get_by_id() {
        let ring = RingDirectory::create(&ring_name("latest"), RingOptions::new(2, 4096)).unwrap();
        assert_eq!(ring.latest(), None);
        assert_eq!(ring.get_by_id(0), None);

        ring.write(b"x").unwrap();
        ring.write(b"y").unwrap();
        ring.write(b"z").unwrap();
        assert_eq!(ring.latest(), Some(b"z".to_vec()));
        assert_eq!(ring.get_by_id(0), Some(Fetched::Stale));
        assert_eq!(ring.get_by_id(1), Some(Fetched::Fresh(b"y".to_vec())));
        assert_eq!(ring.get_read_id(), 0);
    }

    #[test]
    fn test_multi_producer_flag_persists_to_peers() {
        let name = ring_name("multi");
        let ring = RingDirectory::create(&name, RingOptions::new(4, 4096).multi_producer()).unwrap();
        let peer = RingDirectory::open(&name).unwrap();
        assert!(peer.is_multi_producer().unwrap());
        assert_eq!(peer.table_size(), 4);
        peer.write(b"from peer").unwrap();
        assert_eq!(ring.read(Duration::ZERO), Some(b"from peer".to_vec()));
    }
}
