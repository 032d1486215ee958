//! Signal trigger: hand a signal off to a normal thread through a self-pipe.
//!
//! The handler only sets [`PENDING`] and writes one byte to a non-blocking
//! pipe. Everything else (allocating the path, pausing the heap, walking)
//! happens on the watcher thread that blocks in [`SignalTrigger::wait`].

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::error::ConfigError;

static PENDING: AtomicBool = AtomicBool::new(false);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);
static INSTALLED_SIGNAL: AtomicI32 = AtomicI32::new(0);

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__error() }
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__errno() }
}

#[cfg(any(target_os = "solaris", target_os = "illumos"))]
unsafe fn errno_location() -> *mut libc::c_int {
    unsafe { libc::___errno() }
}

extern "C" fn on_signal(_sig: libc::c_int) {
    // write(2) may clobber errno under the interrupted code.
    let saved = unsafe { *errno_location() };
    PENDING.store(true, Ordering::Release);
    let fd = WAKE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        let byte = 1u8;
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
    unsafe { *errno_location() = saved };
}

/// Whether this module's handler is the current disposition for `signal`.
pub fn handler_installed(signal: i32) -> bool {
    unsafe {
        let mut current: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signal, std::ptr::null(), &mut current) != 0 {
            return false;
        }
        current.sa_sigaction == on_signal as *const () as usize
    }
}

fn set_flags(fd: libc::c_int) -> io::Result<()> {
    unsafe {
        let status = libc::fcntl(fd, libc::F_GETFL);
        if status < 0 || libc::fcntl(fd, libc::F_SETFL, status | libc::O_NONBLOCK) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_flags(fds[0])?;
    set_flags(fds[1])?;
    Ok((read, write))
}

/// The installed handler for one signal. At most one exists per process; it
/// stays installed for the life of the process.
#[derive(Debug)]
pub struct SignalTrigger {
    signal: i32,
    wake: OwnedFd,
}

impl SignalTrigger {
    pub fn install(signal: i32) -> Result<Self, ConfigError> {
        if !usable_signal(signal) {
            return Err(ConfigError::SignalInstall {
                signal,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "signal cannot be caught or is raised by faults",
                ),
            });
        }
        if INSTALLED_SIGNAL
            .compare_exchange(0, signal, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ConfigError::SignalAlreadyInstalled { signal });
        }

        match Self::install_claimed(signal) {
            Ok(trigger) => Ok(trigger),
            Err(source) => {
                INSTALLED_SIGNAL.store(0, Ordering::Release);
                Err(ConfigError::SignalInstall { signal, source })
            }
        }
    }

    fn install_claimed(signal: i32) -> io::Result<Self> {
        let (read, write) = wake_pipe()?;
        // The write end is published before the handler so the handler never
        // sees a stale descriptor.
        let write_fd = write.into_raw_fd();
        WAKE_FD.store(write_fd, Ordering::Release);

        let installed = unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = on_signal as *const () as usize;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(signal, &sa, std::ptr::null_mut())
        };
        if installed != 0 {
            let err = io::Error::last_os_error();
            WAKE_FD.store(-1, Ordering::Release);
            drop(unsafe { OwnedFd::from_raw_fd(write_fd) });
            return Err(err);
        }

        Ok(Self { signal, wake: read })
    }

    pub fn signal(&self) -> i32 {
        self.signal
    }

    /// Clears the pending flag, returning whether a signal arrived since the
    /// last call.
    pub fn take_pending(&self) -> bool {
        PENDING.swap(false, Ordering::AcqRel)
    }

    /// Blocks until at least one signal has arrived, then drains every queued
    /// wake-up and returns how many there were.
    pub fn wait(&self) -> io::Result<usize> {
        loop {
            let mut pfd = libc::pollfd {
                fd: self.wake.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            if unsafe { libc::poll(&mut pfd, 1, -1) } < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            let drained = self.drain()?;
            if self.take_pending() || drained > 0 {
                return Ok(drained.max(1));
            }
        }
    }

    fn drain(&self) -> io::Result<usize> {
        let mut total = 0;
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.wake.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                total += n as usize;
                continue;
            }
            if n == 0 {
                return Ok(total);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(total),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }
}

/// Whether `signal` can carry capture requests: catchable, not raised by
/// faults, and a real signal on this platform.
pub fn usable_signal(signal: i32) -> bool {
    if signal <= 0 {
        return false;
    }
    if [
        libc::SIGKILL,
        libc::SIGSTOP,
        libc::SIGSEGV,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGILL,
        libc::SIGTRAP,
        libc::SIGSYS,
        libc::SIGABRT,
    ]
    .contains(&signal)
    {
        return false;
    }
    if signal < 32 {
        return true;
    }
    realtime_signal(signal)
}

// glibc keeps the first realtime signals for its own threading; SIGRTMIN()
// already skips them.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn realtime_signal(signal: i32) -> bool {
    (libc::SIGRTMIN()..=libc::SIGRTMAX()).contains(&signal)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn realtime_signal(_signal: i32) -> bool {
    false
}

/// Parses a signal number or name (`SIGUSR1`, `usr2`, `10`). Signals that
/// fail [`usable_signal`] parse to `None`.
pub fn parse_signal(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    if let Ok(number) = raw.parse::<i32>() {
        return usable_signal(number).then_some(number);
    }
    let upper = raw.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    let signal = match name {
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "HUP" => libc::SIGHUP,
        "QUIT" => libc::SIGQUIT,
        "PROF" => libc::SIGPROF,
        "WINCH" => libc::SIGWINCH,
        "URG" => libc::SIGURG,
        "TTIN" => libc::SIGTTIN,
        "TTOU" => libc::SIGTTOU,
        _ => return None,
    };
    Some(signal)
}
