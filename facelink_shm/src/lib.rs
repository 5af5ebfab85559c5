//! # Facelink Shared Memory
//!
//! Inter-process transport for the face-swap pipeline. Every stage runs in
//! its own process; frames, images and control signals move between them
//! through named blocks in `/dev/shm` rather than through pipes.
//!
//! ## Building blocks
//!
//! - [`SharedMemoryBlock`]: fixed-size named mapping, unlinked by its creator on drop
//! - [`StructuredMemoryView`]: bounds-checked little-endian cursor over a region
//! - [`AtomicCounter`]: shared `i32` with lock-free reads and compare-exchange
//! - [`WeakHeap`]: circular allocator handing out weak [`DataRef`]s
//! - [`RingDirectory`]: bounded record queue with lossy reader catch-up
//!
//! ## Data flow
//!
//! ```text
//! ┌──────────┐  write   ┌───────────────┐  read   ┌──────────┐
//! │ Stage N  ├─────────►│ RingDirectory ├────────►│ Stage N+1│
//! │          │          └───────────────┘         │          │
//! │          │ add_data ┌───────────────┐get_data │          │
//! │          ├─────────►│   WeakHeap    ├────────►│          │
//! └──────────┘          └───────────────┘         └──────────┘
//! ```
//!
//! Records in a ring carry [`DataRef`]s into the image heap. Neither
//! structure ever blocks a writer on a reader; a slow reader loses old data
//! and sees it as [`Fetched::Stale`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use facelink_shm::{Fetched, RingDirectory, RingOptions, WeakHeap};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let images = WeakHeap::create("doc_images", 1 << 20)?;
//! let ring = RingDirectory::create("doc_ring", RingOptions::new(8, 1 << 16))?;
//!
//! let image = images.add_data(&[0u8; 1024])?;
//! ring.write(&image.block_offset.to_le_bytes())?;
//!
//! if let Some(record) = ring.read(Duration::from_millis(5)) {
//!     assert_eq!(record.len(), 8);
//! }
//! match images.get_data(&image) {
//!     Fetched::Fresh(bytes) => assert_eq!(bytes.len(), 1024),
//!     Fetched::Stale => unreachable!("nothing has wrapped yet"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Crash behavior
//!
//! Blocks record their creator in a `.meta` sidecar; [`sweep_orphans`]
//! removes those whose creator died. Locks are plain futex words: a process
//! killed inside a critical section leaves the structure wedged until the
//! pipeline recreates it.

#![deny(missing_docs)]
#![warn(clippy::all)]

mod arena;
pub mod block;
pub mod counter;
pub mod error;
pub mod lifecycle;
pub mod platform;
pub mod ring;
pub mod sync;
pub mod view;
pub mod weak_heap;

pub use arena::{BLOCK_HEADER_SIZE, DataRef};
pub use block::SharedMemoryBlock;
pub use counter::AtomicCounter;
pub use error::{Fetched, ShmError, ShmResult};
pub use lifecycle::{BlockInfo, list_blocks, sweep_orphans};
pub use ring::{RingDirectory, RingOptions};
pub use sync::{ShmEvent, ShmMutex};
pub use view::{FixedField, StructuredMemoryView};
pub use weak_heap::WeakHeap;
