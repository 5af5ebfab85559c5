//! Block metadata sidecars, discovery and orphan cleanup
//!
//! Every owned block has a `<path>.meta` JSON file naming the creating
//! process. A crashed pipeline leaves its blocks behind; the host sweeps
//! blocks whose owner is no longer alive before creating new ones.

use crate::block::block_path;
use crate::error::ShmResult;
use crate::platform::is_process_alive;
use facelink_common::consts::{SHM_DIR, SHM_PREFIX};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

const META_SUFFIX: &str = ".meta";

/// Metadata recorded next to each block
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BlockInfo {
    /// Block name
    pub name: String,
    /// Size in bytes
    pub size: usize,
    /// PID of the creating process
    pub owner_pid: u32,
    /// Creation timestamp
    pub created_at: SystemTime,
}

impl BlockInfo {
    /// True when the creating process has exited
    pub fn is_orphaned(&self) -> bool {
        !is_process_alive(self.owner_pid)
    }
}

/// Path of the metadata sidecar for block `name`
pub fn meta_path(name: &str) -> String {
    format!("{}{}", block_path(name), META_SUFFIX)
}

pub(crate) fn write_meta(info: &BlockInfo) -> ShmResult<()> {
    let json = serde_json::to_string(info)?;
    std::fs::write(meta_path(&info.name), json)?;
    Ok(())
}

pub(crate) fn remove_meta(name: &str) {
    let _ = std::fs::remove_file(meta_path(name));
}

/// Read the metadata of block `name`
pub fn read_meta(name: &str) -> ShmResult<BlockInfo> {
    let json = std::fs::read_to_string(meta_path(name))?;
    Ok(serde_json::from_str(&json)?)
}

/// List every block that has a readable metadata sidecar, newest first.
pub fn list_blocks() -> ShmResult<Vec<BlockInfo>> {
    let dir = std::path::Path::new(SHM_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut blocks: Vec<BlockInfo> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|file| {
            file.strip_prefix(SHM_PREFIX)?
                .strip_suffix(META_SUFFIX)
                .map(str::to_string)
        })
        .filter_map(|name| read_meta(&name).ok())
        .collect();

    blocks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(blocks)
}

/// Remove blocks whose owning process is gone. Returns how many were removed.
pub fn sweep_orphans() -> ShmResult<usize> {
    let mut removed = 0;
    for info in list_blocks()? {
        if !info.is_orphaned() {
            continue;
        }
        tracing::info!(block = %info.name, pid = info.owner_pid, "Removing orphaned block");
        match std::fs::remove_file(block_path(&info.name)) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(block = %info.name, error = %e, "Failed to remove orphaned block");
                continue;
            }
        }
        remove_meta(&info.name);
    }
    Ok(removed)
}
