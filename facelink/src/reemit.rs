//! Cross-process "resend the last frame" request.
//!
//! Downstream stages raise it when only one of their parameters changed;
//! the source clears it and republishes its last record marked as
//! reemitted. Best effort: several requests before the source looks
//! collapse into one resend.

use facelink_shm::{AtomicCounter, ShmResult};

const IDLE: i32 = 0;
const REQUESTED: i32 = 1;

/// Binary request flag in shared memory
#[derive(Debug)]
pub struct ReemitSignal {
    counter: AtomicCounter,
}

impl ReemitSignal {
    /// Create the signal block, initially idle
    pub fn create(name: &str) -> ShmResult<Self> {
        Ok(Self {
            counter: AtomicCounter::create(name, IDLE)?,
        })
    }

    /// Attach to an existing signal
    pub fn open(name: &str) -> ShmResult<Self> {
        Ok(Self {
            counter: AtomicCounter::open(name)?,
        })
    }

    /// Name of the backing block
    pub fn name(&self) -> &str {
        self.counter.name()
    }

    /// Ask the source to resend
    pub fn request(&self) -> ShmResult<()> {
        self.counter.set(REQUESTED)
    }

    /// True if a request is pending
    pub fn is_requested(&self) -> bool {
        self.counter.get() == REQUESTED
    }

    /// Consume a pending request. Only one caller wins per request.
    pub fn take(&self) -> bool {
        self.counter
            .compare_exchange(REQUESTED, IDLE)
            .is_ok_and(|previous| previous == REQUESTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_taken_once() {
        let name = format!("ut_reemit_{}", std::process::id());
        let source = ReemitSignal::create(&name).unwrap();
        let merger = ReemitSignal::open(&name).unwrap();

        assert!(!source.take());
        merger.request().unwrap();
        merger.request().unwrap();
        assert!(source.is_requested());
        assert!(source.take());
        assert!(!source.take());
        assert!(!merger.is_requested());
    }
}
