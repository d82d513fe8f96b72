//! Named, process-shared binary semaphores.
//!
//! Each mutable region of the shared state has its own guard; no operation
//! holds two of them at once and none is held across a blocking wait.

use std::ffi::CString;
use std::io;

use tracing::debug;

use crate::errors::{BakeryError, Result};

/// Names of the four guards of one simulation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardNames {
    pub queue: String,
    pub inventory: String,
    pub ready_products: String,
    pub cascade: String,
}

impl GuardNames {
    pub fn with_prefix(prefix: &str) -> GuardNames {
        GuardNames {
            queue: format!("/{}-queue", prefix),
            inventory: format!("/{}-inventory", prefix),
            ready_products: format!("/{}-ready", prefix),
            cascade: format!("/{}-cascade", prefix),
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [&self.queue, &self.inventory, &self.ready_products, &self.cascade]
    }
}

pub struct NamedSemaphore {
    name: String,
    sem: *mut libc::sem_t,
}

pub struct SemaphoreGuard<'a> {
    sem: &'a NamedSemaphore,
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| BakeryError::Config(format!("semaphore name {:?} contains NUL", name)))
}

impl NamedSemaphore {
    /// Creates the semaphore with value 1, replacing any leftover of the same
    /// name so a fresh run starts uncontended.
    pub fn reset(name: &str) -> Result<NamedSemaphore> {
        let c = c_name(name)?;
        unsafe { libc::sem_unlink(c.as_ptr()) };
        let sem = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(BakeryError::last_os("sem_open"));
        }
        debug!(name, "semaphore created");
        Ok(NamedSemaphore { name: name.to_string(), sem })
    }

    /// Attaches to a semaphore some other process created.
    pub fn open(name: &str) -> Result<NamedSemaphore> {
        let c = c_name(name)?;
        let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(BakeryError::last_os("sem_open"));
        }
        Ok(NamedSemaphore { name: name.to_string(), sem })
    }

    /// Removes the name. Processes that still have it open keep a working
    /// handle; removing it while someone is blocked in `acquire` is not supported.
    pub fn unlink(name: &str) -> Result<()> {
        let c = c_name(name)?;
        if unsafe { libc::sem_unlink(c.as_ptr()) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(BakeryError::Os { call: "sem_unlink", source: err });
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquire(&self) -> Result<SemaphoreGuard<'_>> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(SemaphoreGuard { sem: self });
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(BakeryError::Os { call: "sem_wait", source: err });
            }
        }
    }

    pub fn try_acquire(&self) -> Result<Option<SemaphoreGuard<'_>>> {
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(Some(SemaphoreGuard { sem: self }));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
            _ => Err(BakeryError::Os { call: "sem_trywait", source: err }),
        }
    }

    fn release(&self) {
        unsafe { libc::sem_post(self.sem) };
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unique_prefix() -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!("bakery-test-{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    #[test]
    fn names_are_distinct() {
        let names = GuardNames::with_prefix("run");
        let all = names.all();
        for (i, a) in all.iter().enumerate() {
            assert!(a.starts_with("/run-"));
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn guard_releases_on_drop() -> Result<()> {
        let name = format!("/{}", unique_prefix());
        let sem = NamedSemaphore::reset(&name)?;
        {
            let _held = sem.acquire()?;
            assert!(sem.try_acquire()?.is_none());
        }
        assert!(sem.try_acquire()?.is_some());
        NamedSemaphore::unlink(&name)?;
        Ok(())
    }

    #[test]
    fn open_shares_the_count() -> Result<()> {
        let names = GuardNames::with_prefix(&unique_prefix());
        let inventory = NamedSemaphore::reset(&names.inventory)?;
        let ready = NamedSemaphore::reset(&names.ready_products)?;
        let inventory_elsewhere = NamedSemaphore::open(&names.inventory)?;
        let held = inventory.acquire()?;
        assert!(inventory_elsewhere.try_acquire()?.is_none());
        // Regions are locked independently.
        assert!(ready.try_acquire()?.is_some());
        drop(held);
        assert!(inventory_elsewhere.try_acquire()?.is_some());
        for name in names.all() {
            NamedSemaphore::unlink(name)?;
        }
        assert!(NamedSemaphore::open(&names.inventory).is_err());
        // Unlinking twice is harmless.
        NamedSemaphore::unlink(&names.inventory)?;
        Ok(())
    }
}
