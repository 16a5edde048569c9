//! Blocking advisory lock shared by the driver-level I/O lock and the
//! per-mount engine lock.
//!
//! Acquisition never times out and never fails: `acquire` returns only
//! once the lock is held. The lock is not tied to a guard because the
//! engine drives it through separate lock/unlock callbacks.
//!
//! For the same reason the lock has no owner identity: `release` frees
//! the current acquisition whoever calls it. What it does guarantee is
//! that each acquisition is released at most once; a second release of
//! the same acquisition is reported as a protocol violation.

use crate::error::{Error, Result};
use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A named lock acquired and released through explicit calls.
pub struct BlockingLock {
    name: String,
    raw: RawMutex,
    /// Set while an acquisition is outstanding; cleared exactly once per
    /// acquisition by `release`.
    held: AtomicBool,
}

impl BlockingLock {
    /// Create an unlocked lock.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw: RawMutex::INIT,
            held: AtomicBool::new(false),
        }
    }

    /// Name used in log messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the lock is held.
    pub fn acquire(&self) {
        self.raw.lock();
        self.held.store(true, Ordering::Release);
    }

    /// Take the lock only if it is free.
    pub fn try_acquire(&self) -> bool {
        if !self.raw.try_lock() {
            return false;
        }
        self.held.store(true, Ordering::Release);
        true
    }

    /// Release the lock.
    ///
    /// Releasing a lock nobody holds is a protocol violation.
    pub fn release(&self) -> Result<()> {
        if self
            .held
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::error!("release of unheld lock {}", self.name);
            return Err(Error::ProtocolViolation(format!(
                "lock {} released while not held",
                self.name
            )));
        }
        // SAFETY: the flag was set by the acquisition and only this call
        // cleared it, so the mutex is held and is unlocked once. parking_lot's
        // raw mutex is not bound to the acquiring thread, so the release may
        // come from whichever callback pairs with the acquire.
        unsafe { self.raw.unlock() };
        Ok(())
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl std::fmt::Debug for BlockingLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingLock")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish()
    }
}
