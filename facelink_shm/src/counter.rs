//! Cross-process integer counter

use crate::block::SharedMemoryBlock;
use crate::error::{ShmError, ShmResult};
use crate::sync::ShmMutex;
use std::sync::atomic::{AtomicI32, Ordering};

const COUNTER_MAGIC: u64 = u64::from_le_bytes(*b"FLCOUNT1");
const MAGIC_OFFSET: usize = 0;
const VALUE_OFFSET: usize = 8;
const LOCK_OFFSET: usize = 12;
const COUNTER_BLOCK_SIZE: usize = 16;

/// A signed 32-bit integer shared between processes.
///
/// Reads are lock-free. Writers serialize on a lock word stored next to the
/// value; `compare_exchange` skips the lock entirely when the current value
/// already differs from `expected`.
#[derive(Debug)]
pub struct AtomicCounter {
    block: SharedMemoryBlock,
}

impl AtomicCounter {
    /// Create a counter block holding `initial`
    pub fn create(name: &str, initial: i32) -> ShmResult<Self> {
        let block = SharedMemoryBlock::create(name, COUNTER_BLOCK_SIZE)?;
        block.atomic_u64(MAGIC_OFFSET)?.store(COUNTER_MAGIC, Ordering::Relaxed);
        block.atomic_i32(VALUE_OFFSET)?.store(initial, Ordering::Release);
        Ok(Self { block })
    }

    /// Attach to an existing counter
    pub fn open(name: &str) -> ShmResult<Self> {
        let block = SharedMemoryBlock::open(name)?;
        if block.size() < COUNTER_BLOCK_SIZE
            || block.atomic_u64(MAGIC_OFFSET)?.load(Ordering::Acquire) != COUNTER_MAGIC
        {
            return Err(ShmError::Corrupted {
                name: name.to_string(),
                reason: "not a counter block".to_string(),
            });
        }
        Ok(Self { block })
    }

    /// Name of the backing block
    pub fn name(&self) -> &str {
        self.block.name()
    }

    /// Current value
    pub fn get(&self) -> i32 {
        self.value().map_or(0, |v| v.load(Ordering::Acquire))
    }

    /// Store `value`; a no-op when it is already current.
    pub fn set(&self, value: i32) -> ShmResult<()> {
        let slot = self.value()?;
        if slot.load(Ordering::Acquire) == value {
            return Ok(());
        }
        let _guard = self.lock()?.lock();
        slot.store(value, Ordering::Release);
        Ok(())
    }

    /// Replace the value with `new` if it equals `expected`.
    ///
    /// Returns the value observed before the operation: equal to `expected`
    /// exactly when the exchange happened.
    pub fn compare_exchange(&self, expected: i32, new: i32) -> ShmResult<i32> {
        let slot = self.value()?;
        let current = slot.load(Ordering::Acquire);
        if current != expected {
            return Ok(current);
        }

        let _guard = self.lock()?.lock();
        let current = slot.load(Ordering::Acquire);
        if current == expected {
            slot.store(new, Ordering::Release);
        }
        Ok(current)
    }

    fn value(&self) -> ShmResult<&AtomicI32> {
        self.block.atomic_i32(VALUE_OFFSET)
    }

    fn lock(&self) -> ShmResult<ShmMutex<'_>> {
        Ok(ShmMutex::new(self.block.atomic_u32(LOCK_OFFSET)?))
    }
}
