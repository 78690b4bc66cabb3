// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Low-level unix helpers shared by the controller and the dump worker:
//! an epoll handle registered once per pipe side, short-read tolerant
//! I/O loops, and child-process signalling/reaping.

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::{error, info};

/// Thin epoll wrapper. The fd set is registered once; waits are
/// EINTR-retried and bounded by the given timeout.
pub struct Epoll {
    epfd: OwnedFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 returns a fresh fd which we immediately own.
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a valid, unowned fd.
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    pub fn add_reader(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        // SAFETY: epfd and fd are valid for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits up to `timeout_ms` for any registered fd to become readable.
    /// Returns `Ok(true)` on readiness, `Ok(false)` on timeout.
    pub fn wait_readable(&self, timeout_ms: i32) -> io::Result<bool> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }];
        loop {
            // SAFETY: events is a valid out-array of length 1.
            let n = unsafe {
                libc::epoll_wait(self.epfd.as_raw_fd(), events.as_mut_ptr(), 1, timeout_ms)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(n > 0);
        }
    }
}

/// Reads until `buf` is full or the source reports EOF, retrying EINTR.
/// Returns the number of bytes actually read.
pub fn read_full(src: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match src.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}

/// Writes the whole buffer or fails, retrying EINTR; the write-direction
/// counterpart of [`read_full`]. Record writers go through this so both
/// pipe directions share the same retry contract.
pub fn write_full(dst: &mut impl Write, buf: &[u8]) -> io::Result<()> {
    dst.write_all(buf)
}

/// Polls `waitpid(WNOHANG)` every 100 ms until the child exits or
/// `max_wait` elapses. Returns true when the child was reaped.
pub fn wait_for_child(pid: Pid, max_wait: Duration) -> bool {
    const CHECK_INTERVAL: Duration = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < max_wait {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                std::thread::sleep(CHECK_INTERVAL);
                waited += CHECK_INTERVAL;
            }
            Ok(status) => {
                info!(?pid, ?status, "child process reaped");
                return true;
            }
            Err(err) => {
                error!(?pid, %err, "waitpid failed");
                return false;
            }
        }
    }
    error!(?pid, "child process did not exit within timeout");
    false
}

/// Sends `SIGUSR1` (the cooperative worker-exit signal) and reaps the
/// child, waiting up to `max_wait`.
pub fn signal_and_reap(pid: Pid, max_wait: Duration) -> bool {
    if let Err(err) = kill(pid, Signal::SIGUSR1) {
        error!(?pid, %err, "failed to signal child process");
    }
    wait_for_child(pid, max_wait)
}

/// Whether a process with this pid currently exists (signal 0 probe).
pub fn process_exists(pid: Pid) -> bool {
    if pid.as_raw() <= 0 {
        return false;
    }
    kill(pid, None).is_ok()
}
