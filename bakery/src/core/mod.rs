use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::{debug, warn};

use crate::errors::{BakeryError, Result};

/// Marker for plain-old-data types that may be copied byte for byte into
/// shared memory or a message queue and read back by another process.
///
/// # Safety
/// Implementors must be `#[repr(C)]` (or primitive), contain no pointers or
/// references, and be valid for every bit pattern another process can write.
pub unsafe trait ShmemCast: Copy + 'static {}

unsafe impl ShmemCast for u8 {}
unsafe impl ShmemCast for u16 {}
unsafe impl ShmemCast for u32 {}
unsafe impl ShmemCast for u64 {}
unsafe impl ShmemCast for i32 {}
unsafe impl ShmemCast for i64 {}

pub static GAME_STATE_FILE_NAME: &'static str = "bakery-game-state";
pub static QUEUE_FILE_NAME: &'static str = "bakery-customer-queue";
pub static IPC_PREFIX: &'static str = "bakery";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShmemConfig {
    pub data_dir: String,
    pub game_state_file_name: String,
    pub queue_file_name: String,
    /// Prefix of every named semaphore, so parallel runs do not collide.
    pub ipc_prefix: String,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            data_dir: "/dev/shm".to_string(),
            game_state_file_name: GAME_STATE_FILE_NAME.to_string(),
            queue_file_name: QUEUE_FILE_NAME.to_string(),
            ipc_prefix: IPC_PREFIX.to_string(),
        }
    }
}

impl ShmemConfig {
    pub fn link_path(&self, file_name: &str) -> PathBuf {
        PathBuf::from(&self.data_dir).join(file_name)
    }
}

/// A named shared memory segment. The creating process owns it and unlinks it
/// when dropped; every other process attaches with `open` and only unmaps.
pub struct Segment {
    shmem: Shmem,
}

impl Segment {
    pub fn create(cfg: &ShmemConfig, file_name: &str, size: usize) -> Result<Segment> {
        let link = cfg.link_path(file_name);
        let conf = || ShmemConf::new().size(size).flink(&link);
        match conf().create() {
            Ok(shmem) => Ok(Segment { shmem }),
            Err(ShmemError::LinkExists) => {
                warn!(link = %link.display(), "stale shared memory link, recreating");
                match ShmemConf::new().flink(&link).open() {
                    Ok(mut stale) => {
                        // Take ownership so dropping it unlinks the old mapping.
                        stale.set_owner(true);
                        drop(stale);
                    }
                    Err(e) => {
                        debug!(error = %e, "stale link is dangling");
                    }
                }
                if link.exists() {
                    fs::remove_file(&link)?;
                }
                Ok(Segment { shmem: conf().create()? })
            }
            Err(e) => Err(BakeryError::from(e)),
        }
    }

    pub fn open(cfg: &ShmemConfig, file_name: &str) -> Result<Segment> {
        let shmem = ShmemConf::new().flink(cfg.link_path(file_name)).open()?;
        Ok(Segment { shmem })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }
}

/// Process-wide shutdown flag raised by SIGHUP, SIGINT, SIGQUIT or SIGTERM.
/// Blocking waits poll it when interrupted.
#[derive(Clone)]
pub struct Shutdown {
    closing: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn install() -> Result<Shutdown> {
        let closing = Arc::new(AtomicBool::new(false));
        for sig in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
            signal_hook::flag::register(sig, Arc::clone(&closing)).map_err(BakeryError::SignalHook)?;
        }
        Ok(Shutdown { closing })
    }

    /// A flag nothing but `trigger` raises. Used where signals are handled elsewhere.
    pub fn manual() -> Shutdown {
        Shutdown { closing: Arc::new(AtomicBool::new(false)) }
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    pub fn trigger(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn ensure_not_closing(&self) -> Result<()> {
        if self.is_closing() {
            Err(BakeryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Sends `signal` to `pid`. `ESRCH` (no such process) comes back as an error
/// like any other failure; callers decide whether a vanished peer matters.
pub fn send_signal(pid: i32, signal: libc::c_int) -> Result<()> {
    if pid <= 0 {
        return Err(BakeryError::Logic(format!("refusing to signal pid {}", pid)));
    }
    if unsafe { libc::kill(pid, signal) } == -1 {
        return Err(BakeryError::last_os("kill"));
    }
    Ok(())
}

/// Masks every blockable signal for the calling thread.
pub fn block_all_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut set);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Wall clock in seconds since the epoch. Shared timestamps use this so every
/// process agrees on them.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn unique(name: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!("{}_{}_{}", name, std::process::id(), COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    #[test]
    fn opened_segment_sees_owner_writes() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let cfg = ShmemConfig {
            data_dir: dir.path().to_str().unwrap().to_string(),
            ..Default::default()
        };
        let name = unique("segment");
        let owner = Segment::create(&cfg, &name, 64)?;
        assert!(owner.is_owner());
        unsafe { *owner.as_ptr().add(3) = 42 };

        let other = Segment::open(&cfg, &name)?;
        assert!(!other.is_owner());
        assert!(other.len() >= 64);
        assert_eq!(unsafe { *other.as_ptr().add(3) }, 42);
        Ok(())
    }

    #[test]
    fn signalling_nobody_is_refused() {
        assert!(matches!(send_signal(0, libc::SIGUSR1), Err(BakeryError::Logic(_))));
        // Signal 0 only checks that the target exists.
        assert!(send_signal(std::process::id() as i32, 0).is_ok());
    }

    #[test]
    fn manual_shutdown_flag() {
        let shutdown = Shutdown::manual();
        assert!(shutdown.ensure_not_closing().is_ok());
        shutdown.clone().trigger();
        assert!(matches!(shutdown.ensure_not_closing(), Err(BakeryError::Cancelled)));
    }
}
