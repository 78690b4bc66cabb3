// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Discovery of the mounted ftrace pseudo-filesystem and plain read/write
//! access to its nodes. All node paths are relative to the detected root so
//! tests can point a [`TraceFs`] at a fabricated directory tree.

use anyhow::Context;
use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::time;

pub const DEBUGFS_TRACING_DIR: &str = "/sys/kernel/debug/tracing/";
pub const TRACEFS_DIR: &str = "/sys/kernel/tracing/";

pub const TRACING_ON_NODE: &str = "tracing_on";
pub const TRACE_MARKER_NODE: &str = "trace_marker";
pub const TRACE_NODE: &str = "trace";
pub const BUFFER_SIZE_NODE: &str = "buffer_size_kb";

/// One ftrace ring-buffer page, the smallest unit of raw capture I/O.
pub const PAGE_SIZE: usize = 4096;

/// Handle to a mounted (or fabricated) tracefs root.
#[derive(Debug, Clone)]
pub struct TraceFs {
    root: PathBuf,
}

impl TraceFs {
    /// Probes the two well-known mount points, preferring debugfs, and
    /// returns a handle iff `trace_marker` is present under one of them.
    pub fn detect() -> Option<Self> {
        for root in [DEBUGFS_TRACING_DIR, TRACEFS_DIR] {
            if Path::new(root).join(TRACE_MARKER_NODE).exists() {
                return Some(Self { root: root.into() });
            }
        }
        None
    }

    /// Uses `root` directly without probing. Intended for tests and for
    /// worker processes that receive the root from their parent.
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node_path(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    /// `per_cpu/cpu<idx>/<leaf>`
    pub fn per_cpu_node(cpu: usize, leaf: &str) -> String {
        format!("per_cpu/cpu{cpu}/{leaf}")
    }

    pub fn read_node(&self, node: &str) -> anyhow::Result<String> {
        let path = self.node_path(node);
        std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn write_node(&self, node: &str, value: &str) -> anyhow::Result<()> {
        let path = self.node_path(node);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .with_context(|| format!("open {} for writing", path.display()))?;
        file.write_all(value.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Writes `"1"` or `"0"` to an enable node, logging on failure.
    pub fn set_node_enabled(&self, node: &str, enabled: bool) -> bool {
        match self.write_node(node, if enabled { "1" } else { "0" }) {
            Ok(()) => true,
            Err(err) => {
                error!(node, enabled, %err, "failed to toggle trace node");
                false
            }
        }
    }

    /// Truncates a node by re-creating it, dropping buffered trace data.
    pub fn truncate_node(&self, node: &str) {
        let path = self.node_path(node);
        if let Err(err) = File::create(&path) {
            error!(path = %path.display(), %err, "failed to truncate trace node");
        }
    }

    pub fn is_tracing_on(&self) -> bool {
        match self.read_node(TRACING_ON_NODE) {
            Ok(contents) => contents.starts_with('1'),
            Err(err) => {
                warn!(%err, "failed to read tracing_on");
                false
            }
        }
    }

    /// Emits the two clock-sync marker lines decoders use to correlate
    /// boot-clocked pages with wall time.
    pub fn mark_clock_sync(&self) -> anyhow::Result<()> {
        let path = self.node_path(TRACE_MARKER_NODE);
        let mut marker = OpenOptions::new()
            .write(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;

        let realtime_ms = time::realtime_ns() / time::MS_TO_NS;
        marker
            .write_all(format!("trace_event_clock_sync: realtime_ts={realtime_ms}\n").as_bytes())
            .context("write realtime_ts marker")?;

        let parent_ts = time::monotonic_time_ns() as f64 / time::S_TO_NS as f64;
        marker
            .write_all(format!("trace_event_clock_sync: parent_ts={parent_ts:.6}\n").as_bytes())
            .context("write parent_ts marker")?;
        info!(realtime_ms, parent_ts, "wrote clock sync markers");
        Ok(())
    }
}

/// Number of configured processors, never zero.
pub fn cpu_processors() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n <= 0 {
        1
    } else {
        n as usize
    }
}

/// The running kernel's release string (`uname -r`).
pub fn kernel_release() -> String {
    // SAFETY: zeroed utsname is a valid out-parameter for uname(2).
    let mut buf: libc::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: buf is valid for the duration of the call.
    if unsafe { libc::uname(&mut buf) } != 0 {
        error!("uname failed, errno {}", std::io::Error::last_os_error());
        return String::new();
    }
    // SAFETY: uname produces a NUL-terminated string in the release field.
    unsafe { CStr::from_ptr(buf.release.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// The HM kernel coalesces per-CPU ring buffers into a single
/// `trace_pipe_raw` and omits `header_page`/`printk_formats`.
pub fn is_hm_kernel() -> bool {
    kernel_release().contains("HongMeng")
}

/// Free bytes available to unprivileged users on the filesystem holding
/// `path`. Returns `u64::MAX` when the probe itself fails so callers do not
/// mistake a probe error for a full disk.
pub fn remaining_space(path: impl AsRef<Path>) -> u64 {
    match nix::sys::statvfs::statvfs(path.as_ref()) {
        Ok(stat) => stat.blocks_available() as u64 * stat.fragment_size() as u64,
        Err(err) => {
            error!(%err, "statvfs failed");
            u64::MAX
        }
    }
}
