//! Fixed-size, name-addressed shared memory blocks

use crate::error::{ShmError, ShmResult};
use crate::lifecycle::{BlockInfo, meta_path, remove_meta, write_meta};
use crate::platform::{attach_block_mmap, create_block_mmap, get_current_pid};
use crate::view::StructuredMemoryView;
use facelink_common::consts::{SHM_DIR, SHM_MAX_SIZE, SHM_PREFIX};
use memmap2::MmapMut;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64};
use std::time::SystemTime;

/// Path of the file backing block `name`.
pub fn block_path(name: &str) -> String {
    format!("{}/{}{}", SHM_DIR, SHM_PREFIX, name)
}

/// Validate a block name: non-empty, no path separators.
pub fn validate_block_name(name: &str) -> ShmResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validate block size constraints
pub fn validate_block_size(size: usize) -> ShmResult<()> {
    if size == 0 || size > SHM_MAX_SIZE {
        return Err(ShmError::InvalidSize { size });
    }
    Ok(())
}

/// A fixed-size region of memory shared between processes.
///
/// The creating process owns the backing file and unlinks it on drop. Other
/// processes attach by name with [`SharedMemoryBlock::open`], which is how a
/// block crosses a spawn boundary: the child receives the name, never a
/// forked mapping. The size is fixed at creation and never changes.
pub struct SharedMemoryBlock {
    name: String,
    size: usize,
    owner: bool,
    base: NonNull<u8>,
    mmap: MmapMut,
}

// The mapping is plain shared memory; every concurrent access goes through
// atomics or the view/lock discipline of the structures built on top.
unsafe impl Send for SharedMemoryBlock {}
unsafe impl Sync for SharedMemoryBlock {}

impl SharedMemoryBlock {
    /// Create a new zero-filled block of `size` bytes.
    pub fn create(name: &str, size: usize) -> ShmResult<Self> {
        validate_block_name(name)?;
        validate_block_size(size)?;

        let path = block_path(name);
        let mut mmap = create_block_mmap(&path, name, size)?;
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| ShmError::Allocation {
            size,
            reason: "null mapping".to_string(),
        })?;

        let info = BlockInfo {
            name: name.to_string(),
            size,
            owner_pid: get_current_pid(),
            created_at: SystemTime::now(),
        };
        if let Err(e) = write_meta(&info) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        tracing::debug!(block = name, size, "Created shared memory block");

        Ok(Self {
            name: name.to_string(),
            size,
            owner: true,
            base,
            mmap,
        })
    }

    /// Attach to a block created by another process.
    pub fn open(name: &str) -> ShmResult<Self> {
        validate_block_name(name)?;

        let mut mmap = attach_block_mmap(&block_path(name), name)?;
        let size = mmap.len();
        if size == 0 {
            return Err(ShmError::Corrupted {
                name: name.to_string(),
                reason: "empty mapping".to_string(),
            });
        }
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| ShmError::NotFound {
            name: name.to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            size,
            owner: false,
            base,
            mmap,
        })
    }

    /// Block name (without the filesystem prefix)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// True in the process that created the block
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Raw base pointer of the mapping
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Byte view of the whole block.
    ///
    /// Other processes may write concurrently; use this for inspection and
    /// tests, and a [`StructuredMemoryView`] plus the owning structure's
    /// protocol for real traffic.
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Mutable byte view of the whole block
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    /// Cursor over the whole block
    pub fn view(&self) -> StructuredMemoryView<'_> {
        StructuredMemoryView::over_block(self)
    }

    /// Cursor over `len` bytes starting at `offset`
    pub fn view_at(&self, offset: usize, len: usize) -> ShmResult<StructuredMemoryView<'_>> {
        StructuredMemoryView::over_region(self, offset, len)
    }

    /// Shared 64-bit atomic living at `offset` (must be 8-byte aligned).
    pub fn atomic_u64(&self, offset: usize) -> ShmResult<&AtomicU64> {
        self.check_atomic(offset, 8)?;
        Ok(unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU64) })
    }

    /// Shared 32-bit atomic living at `offset` (must be 4-byte aligned).
    pub fn atomic_u32(&self, offset: usize) -> ShmResult<&AtomicU32> {
        self.check_atomic(offset, 4)?;
        Ok(unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU32) })
    }

    /// Signed 32-bit atomic at `offset`, which must be 4-byte aligned
    pub fn atomic_i32(&self, offset: usize) -> ShmResult<&AtomicI32> {
        self.check_atomic(offset, 4)?;
        Ok(unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicI32) })
    }

    fn check_atomic(&self, offset: usize, width: usize) -> ShmResult<()> {
        if offset.checked_add(width).is_none_or(|end| end > self.size) || offset % width != 0 {
            return Err(ShmError::OutOfBounds {
                offset,
                len: width,
                size: self.size,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedMemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryBlock")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for SharedMemoryBlock {
    fn drop(&mut self) {
        if self.owner {
            let _ = std::fs::remove_file(block_path(&self.name));
            remove_meta(&self.name);
            tracing::debug!(block = %self.name, meta = %meta_path(&self.name), "Released shared memory block");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn unique(name: &str) -> String {
        use std::sync::atomic::AtomicU32;
        static CTR: AtomicU32 = AtomicU32::new(0);
        format!(
            "blk_{}_{}_{}",
            std::process::id(),
            CTR.fetch_add(1, Ordering::Relaxed),
            name
        )
    }

    #[test]
    fn test_block_size_validation() {
        assert!(validate_block_size(1).is_ok());
        assert!(validate_block_size(4096).is_ok());
        assert!(validate_block_size(0).is_err());
        assert!(validate_block_size(SHM_MAX_SIZE + 1).is_err());
    }

    #[test]
    fn test_block_name_validation() {
        assert!(validate_block_name("ring_detector").is_ok());
        assert!(matches!(validate_block_name(""), Err(ShmError::InvalidName { .. })));
        assert!(matches!(
            validate_block_name("a/b"),
            Err(ShmError::InvalidName { name }) if name == "a/b"
        ));
        assert!(matches!(
            SharedMemoryBlock::open("x\0y"),
            Err(ShmError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_create_and_open_share_bytes() {
        let name = unique("share");
        let mut owner = SharedMemoryBlock::create(&name, 4096).unwrap();
        assert!(owner.is_owner());
        assert!(owner.as_bytes().iter().all(|&b| b == 0));
        owner.as_bytes_mut()[..5].copy_from_slice(b"hello");

        let peer = SharedMemoryBlock::open(&name).unwrap();
        assert!(!peer.is_owner());
        assert_eq!(peer.size(), 4096);
        assert_eq!(&peer.as_bytes()[..5], b"hello");
    }

    #[test]
    fn test_exclusive_creation() {
        let name = unique("exclusive");
        let _first = SharedMemoryBlock::create(&name, 64).unwrap();
        let second = SharedMemoryBlock::create(&name, 64);
        assert!(matches!(second, Err(ShmError::AlreadyExists { .. })));
    }

    #[test]
    fn test_owner_drop_unlinks() {
        let name = unique("unlink");
        let block = SharedMemoryBlock::create(&name, 128).unwrap();
        assert!(std::path::Path::new(&block_path(&name)).exists());
        drop(block);
        assert!(!std::path::Path::new(&block_path(&name)).exists());
        assert!(matches!(
            SharedMemoryBlock::open(&name),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn test_atomics_are_shared() {
        let name = unique("atomics");
        let owner = SharedMemoryBlock::create(&name, 64).unwrap();
        let peer = SharedMemoryBlock::open(&name).unwrap();

        owner.atomic_u64(8).unwrap().store(42, Ordering::Release);
        assert_eq!(peer.atomic_u64(8).unwrap().load(Ordering::Acquire), 42);

        assert!(owner.atomic_u64(4).is_err()); // misaligned
        assert!(owner.atomic_u32(64).is_err()); // out of range

        owner.atomic_i32(16).unwrap().store(-7, Ordering::Release);
        assert_eq!(peer.atomic_i32(16).unwrap().load(Ordering::Acquire), -7);
        assert!(owner.atomic_i32(18).is_err());
    }
}
