//! Process-shared lock and event words.
//!
//! Both primitives are a single `u32` inside a shared block, so any process
//! that maps the block can use them. A process killed while holding a
//! [`ShmMutex`] leaves it locked; the pipeline recreates its blocks on every
//! start, which bounds the damage to one run.

use crate::platform::{futex_wait, futex_wake};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

const SPIN_LIMIT: u32 = 64;

/// Mutual exclusion over a shared lock word.
#[derive(Clone, Copy)]
pub struct ShmMutex<'a> {
    word: &'a AtomicU32,
}

impl<'a> ShmMutex<'a> {
    /// Wrap a lock word. A zeroed word is unlocked.
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Acquire the lock, blocking until it is free.
    pub fn lock(&self) -> ShmMutexGuard<'a> {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return ShmMutexGuard { word: self.word };
        }

        for _ in 0..SPIN_LIMIT {
            std::hint::spin_loop();
            if self
                .word
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return ShmMutexGuard { word: self.word };
            }
        }

        while self.word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            futex_wait(self.word, CONTENDED, None);
        }
        ShmMutexGuard { word: self.word }
    }

    /// Acquire the lock if it is free
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'a>> {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmMutexGuard { word: self.word })
    }

    /// True while some process holds the lock
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }
}

/// Releases the lock on drop.
pub struct ShmMutexGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(self.word, 1);
        }
    }
}

/// Broadcast wake-up over a shared sequence word.
///
/// Waiters snapshot [`sequence`](Self::sequence) before checking their
/// condition, then [`wait`](Self::wait) on that snapshot, so a notify that
/// lands in between is never lost.
#[derive(Clone, Copy)]
pub struct ShmEvent<'a> {
    word: &'a AtomicU32,
}

impl<'a> ShmEvent<'a> {
    /// Wrap an event word
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Current sequence number
    pub fn sequence(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    /// Wake every waiter
    pub fn notify_all(&self) {
        self.word.fetch_add(1, Ordering::Release);
        futex_wake(self.word, i32::MAX);
    }

    /// Block until the sequence moves past `seen` or `timeout` elapses.
    ///
    /// Returns true if the sequence changed.
    pub fn wait(&self, seen: u32, timeout: Duration) -> bool {
        if self.sequence() != seen {
            return true;
        }
        futex_wait(self.word, seen, Some(timeout));
        self.sequence() != seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_mutex_try_lock_and_release() {
        let word = AtomicU32::new(0);
        let mutex = ShmMutex::new(&word);
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_mutex_serializes_threads() {
        let word = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(AtomicU32::new(0));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let word = Arc::clone(&word);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = ShmMutex::new(&word).lock();
                        // Non-atomic read-modify-write under the lock
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert_eq!(word.load(Ordering::Relaxed), UNLOCKED);
    }

    #[test]
    fn test_event_wait_times_out() {
        let word = AtomicU32::new(0);
        let event = ShmEvent::new(&word);
        let seen = event.sequence();
        let start = Instant::now();
        assert!(!event.wait(seen, Duration::from_millis(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_event_notify_wakes_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let seen = ShmEvent::new(&word).sequence();

        let notifier = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                ShmEvent::new(&word).notify_all();
            })
        };

        let event = ShmEvent::new(&word);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !event.wait(seen, Duration::from_millis(100)) {
            assert!(Instant::now() < deadline, "notify was lost");
        }
        notifier.join().unwrap();
    }

    #[test]
    fn test_event_notify_before_wait_is_not_lost() {
        let word = AtomicU32::new(0);
        let event = ShmEvent::new(&word);
        let seen = event.sequence();
        event.notify_all();
        assert!(event.wait(seen, Duration::from_secs(5)));
    }
}
