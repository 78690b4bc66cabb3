// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The trace source bundles the content writers for one output file and owns
//! the output descriptor. Kernel-variant behavior is selected once, at
//! construction; the writers themselves are flat functions over the chosen
//! flavor.

pub mod content;
pub mod cpu_raw;

use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{error, info};

use libkt_common::tracefs::{self, TraceFs};

/// Kernel flavor driving the handful of writers that differ between a
/// stock Linux kernel and the HM kernel (single coalesced raw pipe, no
/// header_page/printk_formats).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFlavor {
    Linux,
    Hm,
}

impl KernelFlavor {
    pub fn detect() -> Self {
        if tracefs::is_hm_kernel() {
            KernelFlavor::Hm
        } else {
            KernelFlavor::Linux
        }
    }

    pub(crate) fn file_type(self) -> u8 {
        match self {
            KernelFlavor::Linux => content::FILE_RAW_TRACE,
            KernelFlavor::Hm => content::HM_FILE_RAW_TRACE,
        }
    }
}

/// Owns the output fd for one trace file and the per-file bookkeeping the
/// writers share (running framed size, periodic existence checks).
pub struct TraceSource {
    flavor: KernelFlavor,
    tracefs: TraceFs,
    /// Directory holding output files and the persisted
    /// `saved_events_format` cache.
    trace_dir: PathBuf,
    trace_file_path: PathBuf,
    out: File,
    output_size: AtomicU64,
    write_checks: AtomicU32,
}

impl TraceSource {
    pub fn create(
        flavor: KernelFlavor,
        tracefs: TraceFs,
        trace_dir: impl Into<PathBuf>,
        trace_file_path: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let trace_file_path = trace_file_path.into();
        let out = open_output(&trace_file_path)?;
        Ok(Self {
            flavor,
            tracefs,
            trace_dir: trace_dir.into(),
            trace_file_path,
            out,
            output_size: AtomicU64::new(0),
            write_checks: AtomicU32::new(0),
        })
    }

    pub fn flavor(&self) -> KernelFlavor {
        self.flavor
    }

    pub fn tracefs(&self) -> &TraceFs {
        &self.tracefs
    }

    pub fn trace_dir(&self) -> &Path {
        &self.trace_dir
    }

    pub fn trace_file_path(&self) -> &Path {
        &self.trace_file_path
    }

    pub(crate) fn out(&self) -> &File {
        &self.out
    }

    /// Bytes framed into the current output file so far, maintained across
    /// segments so file-size limits apply to the whole file.
    pub fn output_size(&self) -> u64 {
        self.output_size.load(Ordering::Relaxed)
    }

    pub(crate) fn add_output_size(&self, bytes: u64) {
        self.output_size.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Every tenth segment write re-checks that the output file still
    /// exists; rotation loops abort when it was deleted under them.
    pub(crate) fn output_still_exists(&self) -> bool {
        const JUDGE_FILE_EXIST: u32 = 10;
        let count = self.write_checks.fetch_add(1, Ordering::Relaxed) + 1;
        if count < JUDGE_FILE_EXIST {
            return true;
        }
        self.write_checks.store(0, Ordering::Relaxed);
        if self.trace_file_path.exists() {
            true
        } else {
            error!(file = %self.trace_file_path.display(), "trace output file disappeared");
            false
        }
    }

    /// Atomically replaces the output file: the new descriptor is opened
    /// first and the old one is preserved when opening fails. Resets the
    /// per-file size accumulator.
    pub fn update_trace_file(&mut self, trace_file_path: impl Into<PathBuf>) -> bool {
        let trace_file_path = trace_file_path.into();
        match open_output(&trace_file_path) {
            Ok(out) => {
                self.out = out;
                self.trace_file_path = trace_file_path;
                self.output_size.store(0, Ordering::Relaxed);
                self.write_checks.store(0, Ordering::Relaxed);
                info!(file = %self.trace_file_path.display(), "switched trace output file");
                true
            }
            Err(err) => {
                error!(file = %trace_file_path.display(), %err, "failed to switch output file");
                false
            }
        }
    }
}

fn open_output(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("open trace output {}", path.display()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// A fabricated tracefs tree plus an output directory, with every node
    /// the Linux writers read from.
    pub(crate) struct FakeCapture {
        pub tracefs_dir: TempDir,
        pub out_dir: TempDir,
    }

    impl FakeCapture {
        pub(crate) fn new(cpu_count: usize) -> Self {
            let tracefs_dir = TempDir::new().unwrap();
            let out_dir = TempDir::new().unwrap();
            let root = tracefs_dir.path();
            fs::create_dir_all(root.join("events")).unwrap();
            fs::write(root.join("saved_cmdlines"), "1 init\n2 kthreadd\n").unwrap();
            fs::write(root.join("saved_tgids"), "1 1\n2 2\n").unwrap();
            fs::write(root.join("events/header_page"), "field: u64 timestamp;\n").unwrap();
            fs::write(root.join("printk_formats"), "0xdead: \"%s\"\n").unwrap();
            for cpu in 0..cpu_count {
                let dir = root.join(format!("per_cpu/cpu{cpu}"));
                fs::create_dir_all(&dir).unwrap();
                fs::write(dir.join("trace_pipe_raw"), b"").unwrap();
            }
            Self {
                tracefs_dir,
                out_dir,
            }
        }

        pub(crate) fn tracefs(&self) -> TraceFs {
            TraceFs::from_root(self.tracefs_dir.path())
        }

        /// Fills one CPU's raw pipe with synthetic 4 KiB pages carrying the
        /// given timestamps. The page's commit size field is set large
        /// enough to pass the default sanity check.
        pub(crate) fn write_raw_pages(&self, cpu: usize, timestamps: &[u64]) {
            use libkt_common::tracefs::PAGE_SIZE;
            let mut data = Vec::new();
            for &ts in timestamps {
                let mut page = vec![0u8; PAGE_SIZE];
                page[..8].copy_from_slice(&ts.to_le_bytes());
                page[8..16].copy_from_slice(&(PAGE_SIZE as u64 - 16).to_le_bytes());
                data.extend_from_slice(&page);
            }
            fs::write(
                self.tracefs_dir
                    .path()
                    .join(format!("per_cpu/cpu{cpu}/trace_pipe_raw")),
                data,
            )
            .unwrap();
        }

        pub(crate) fn source(&self, file_name: &str) -> TraceSource {
            TraceSource::create(
                KernelFlavor::Linux,
                self.tracefs(),
                self.out_dir.path(),
                self.out_dir.path().join(file_name),
            )
            .unwrap()
        }
    }
}
