//! Platform layer: mappings, process probes and futex wait/wake.

pub mod linux;

pub use linux::{
    attach_block_mmap, create_block_mmap, futex_wait, futex_wake, get_current_pid,
    is_process_alive,
};
