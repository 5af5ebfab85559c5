//! System-wide constants for the facelink workspace.
//!
//! Single source of truth for numeric limits, default sizes and paths.

/// Prefix of every shared memory file created under `/dev/shm`.
pub const SHM_PREFIX: &str = "facelink_";

/// Directory backing POSIX shared memory on Linux.
pub const SHM_DIR: &str = "/dev/shm";

/// Maximum shared memory block size in bytes (2GB).
pub const SHM_MAX_SIZE: usize = 2 * 1024 * 1024 * 1024;

/// Alignment of every block and record inside a shared heap.
pub const HEAP_ALIGN: usize = 8;

/// Default number of slots in a ring directory table.
pub const DEFAULT_TABLE_SIZE: usize = 8;

/// Default size of a ring directory heap, in megabytes.
pub const DEFAULT_RING_HEAP_MB: usize = 64;

/// Default size of the image weak heap, in megabytes.
pub const DEFAULT_IMAGE_HEAP_MB: usize = 512;

/// Default backpressure slack between adjacent stages.
pub const DEFAULT_BUFFER_SLACK: u64 = 1;

/// Default upstream read timeout of a stage loop, in milliseconds.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5;

/// Default minimum interval between two worker ticks, in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1;

/// Default interval of the host message pump, in milliseconds.
pub const DEFAULT_HOST_INTERVAL_MS: u64 = 10;

/// Delay between the first store mutation and the physical write.
pub const STORE_SAVE_DELAY_MS: u64 = 1000;

/// Largest frame accepted on a control pipe, in bytes.
pub const PIPE_MAX_FRAME: usize = 64 * 1024 * 1024;

/// How long a freshly spawned worker waits for its boot message, in milliseconds.
pub const WORKER_BOOT_TIMEOUT_MS: u64 = 10_000;

/// Name of the configuration file inside the user data directory.
pub const CONFIG_FILE_NAME: &str = "facelink.toml";

/// Name of the persisted key-value store inside the user data directory.
pub const STATE_FILE_NAME: &str = "states.dat";
