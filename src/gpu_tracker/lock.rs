//! Cross-process mutual exclusion for tracker operations.
//!
//! An advisory `flock(2)` on a dedicated lock file, polled until a deadline.
//! While a lock is held, SIGINT and SIGTERM release it before the process
//! exits so an interrupted CLI never strands other callers.

use crate::error::TrackerError;
use nix::errno::Errno;
use nix::fcntl::{FlockArg, flock};
use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Time source for lock polling, replaceable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Held exclusive lock; released on drop.
#[derive(Debug)]
pub struct FileLock {
    _signals: SignalGuard,
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Poll for the lock until `settings.timeout` elapses.
    pub fn acquire(path: &Path, settings: &LockSettings, clock: &dyn Clock) -> Result<Self, TrackerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| TrackerError::LockAcquisition {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| TrackerError::LockAcquisition {
                path: path.to_path_buf(),
                source,
            })?;

        let deadline = clock.now() + settings.timeout;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => break,
                Err(Errno::EWOULDBLOCK) => {}
                Err(errno) => {
                    return Err(TrackerError::LockAcquisition {
                        path: path.to_path_buf(),
                        source: errno.into(),
                    });
                }
            }

            if clock.now() >= deadline {
                warn!("Timed out waiting for {:?}", path);
                return Err(TrackerError::LockTimeout {
                    path: path.to_path_buf(),
                    timeout: settings.timeout,
                });
            }
            clock.sleep(settings.poll_interval);
        }

        debug!("Acquired lock {:?}", path);
        let signals = SignalGuard::install(file.as_raw_fd());
        Ok(Self {
            _signals: signals,
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(errno) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!("Failed to unlock {:?}: {}", self.path, errno);
        } else {
            debug!("Released lock {:?}", self.path);
        }
    }
}

/// Descriptor the signal handler unlocks; -1 when none.
static HELD_LOCK_FD: AtomicI32 = AtomicI32::new(-1);

struct InstalledHandlers {
    holders: usize,
    previous: Vec<(Signal, SigAction)>,
}

static HANDLERS: Mutex<InstalledHandlers> = Mutex::new(InstalledHandlers {
    holders: 0,
    previous: Vec::new(),
});

const TERMINATION_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

extern "C" fn release_and_exit(_signal: libc::c_int) {
    const MESSAGE: &[u8] = b"Received termination signal, releasing GPU tracker lock\n";
    let fd = HELD_LOCK_FD.swap(-1, Ordering::SeqCst);
    // SAFETY: flock, write and _exit are async-signal-safe.
    unsafe {
        if fd >= 0 {
            libc::flock(fd, libc::LOCK_UN);
        }
        libc::write(libc::STDERR_FILENO, MESSAGE.as_ptr().cast(), MESSAGE.len());
        libc::_exit(1);
    }
}

/// Serializes unit tests that take file locks, since the installed signal
/// handlers are process-wide.
#[cfg(test)]
pub(crate) fn serial_for_tests() -> std::sync::MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps the termination handlers installed while at least one lock is held.
#[derive(Debug)]
struct SignalGuard {
    fd: RawFd,
}

impl SignalGuard {
    fn install(fd: RawFd) -> Self {
        HELD_LOCK_FD.store(fd, Ordering::SeqCst);

        let mut handlers = HANDLERS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if handlers.holders == 0 {
            let action = SigAction::new(
                SigHandler::Handler(release_and_exit),
                SaFlags::empty(),
                SigSet::empty(),
            );
            for signal in TERMINATION_SIGNALS {
                // SAFETY: the handler only touches an atomic and calls
                // async-signal-safe functions.
                match unsafe { sigaction(signal, &action) } {
                    Ok(previous) => handlers.previous.push((signal, previous)),
                    Err(errno) => warn!("Failed to install {} handler: {}", signal, errno),
                }
            }
        }
        handlers.holders += 1;

        Self { fd }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        let _ = HELD_LOCK_FD.compare_exchange(self.fd, -1, Ordering::SeqCst, Ordering::SeqCst);

        let mut handlers = HANDLERS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.holders = handlers.holders.saturating_sub(1);
        if handlers.holders == 0 {
            for (signal, previous) in handlers.previous.drain(..) {
                // SAFETY: restores the disposition that was active before install.
                if let Err(errno) = unsafe { sigaction(signal, &previous) } {
                    warn!("Failed to restore {} handler: {}", signal, errno);
                }
            }
        }
    }
}
