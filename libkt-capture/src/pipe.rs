// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The three-FIFO IPC contract between the controller process and the dump
//! worker.
//!
//! `task_submit` carries tasks from the controller to the worker; `sync_ret`
//! carries the first, blocking-phase result ("trace drained"); `async_ret`
//! carries the later "file written" result. Splitting the result stream lets
//! the controller answer the synchronous caller as soon as reading from
//! ftrace is done while file serialization continues in the worker.
//!
//! All three FIFOs carry fixed-size records. A record is smaller than
//! `PIPE_BUF`, so a well-formed write is atomic; a short read or write is
//! treated as a failed task, never retried into framing drift.

use anyhow::Context;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::TraceErrorCode;
use crate::types::{TraceDumpRet, TraceDumpStatus, TraceDumpTask};
use libkt_common::unix::{write_full, Epoll};

pub const TASK_SUBMIT_PIPE: &str = "task_submit.pipe";
pub const SYNC_RET_PIPE: &str = "sync_ret.pipe";
pub const ASYNC_RET_PIPE: &str = "async_ret.pipe";

/// Capacity reserved for the output file path inside a record.
const TASK_PATH_CAP: usize = 256;
/// 7 u64 fields + status/code/overflow bytes + path length prefix + path.
pub(crate) const TASK_RECORD_SIZE: usize = 7 * 8 + 3 + 2 + TASK_PATH_CAP;
/// code + first/last page timestamps + path length prefix + path.
pub(crate) const RET_RECORD_SIZE: usize = 1 + 2 * 8 + 2 + TASK_PATH_CAP;

pub(crate) fn encode_task(task: &TraceDumpTask) -> Option<[u8; TASK_RECORD_SIZE]> {
    let path = task.output_file.as_bytes();
    if path.len() > TASK_PATH_CAP {
        error!(path = %task.output_file, "output path exceeds record capacity");
        return None;
    }
    let mut buf = [0u8; TASK_RECORD_SIZE];
    let mut pos = 0;
    for value in [
        task.task_id,
        task.trace_start_ns,
        task.trace_end_ns,
        task.file_size_limit,
        task.file_size,
        task.first_page_ns,
        task.last_page_ns,
    ] {
        buf[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
        pos += 8;
    }
    buf[pos] = task.status.to_u8();
    buf[pos + 1] = task.code.to_u8();
    buf[pos + 2] = task.is_file_size_over_limit as u8;
    pos += 3;
    buf[pos..pos + 2].copy_from_slice(&(path.len() as u16).to_le_bytes());
    pos += 2;
    buf[pos..pos + path.len()].copy_from_slice(path);
    Some(buf)
}

pub(crate) fn decode_task(buf: &[u8]) -> Option<TraceDumpTask> {
    if buf.len() != TASK_RECORD_SIZE {
        return None;
    }
    let mut fields = [0u64; 7];
    let mut pos = 0;
    for field in fields.iter_mut() {
        *field = u64::from_le_bytes(buf[pos..pos + 8].try_into().ok()?);
        pos += 8;
    }
    let status = TraceDumpStatus::from_u8(buf[pos])?;
    let code = TraceErrorCode::from_u8(buf[pos + 1])?;
    let over_limit = buf[pos + 2] != 0;
    pos += 3;
    let path_len = u16::from_le_bytes(buf[pos..pos + 2].try_into().ok()?) as usize;
    pos += 2;
    if path_len > TASK_PATH_CAP {
        return None;
    }
    let output_file = String::from_utf8(buf[pos..pos + path_len].to_vec()).ok()?;
    Some(TraceDumpTask {
        task_id: fields[0],
        trace_start_ns: fields[1],
        trace_end_ns: fields[2],
        file_size_limit: fields[3],
        file_size: fields[4],
        first_page_ns: fields[5],
        last_page_ns: fields[6],
        status,
        code,
        output_file,
        is_file_size_over_limit: over_limit,
    })
}

pub(crate) fn encode_ret(ret: &TraceDumpRet) -> Option<[u8; RET_RECORD_SIZE]> {
    let path = ret.output_file.as_bytes();
    if path.len() > TASK_PATH_CAP {
        error!(path = %ret.output_file, "output path exceeds record capacity");
        return None;
    }
    let mut buf = [0u8; RET_RECORD_SIZE];
    buf[0] = ret.code.to_u8();
    buf[1..9].copy_from_slice(&ret.first_page_ns.to_le_bytes());
    buf[9..17].copy_from_slice(&ret.last_page_ns.to_le_bytes());
    buf[17..19].copy_from_slice(&(path.len() as u16).to_le_bytes());
    buf[19..19 + path.len()].copy_from_slice(path);
    Some(buf)
}

pub(crate) fn decode_ret(buf: &[u8]) -> Option<TraceDumpRet> {
    if buf.len() != RET_RECORD_SIZE {
        return None;
    }
    let code = TraceErrorCode::from_u8(buf[0])?;
    let first_page_ns = u64::from_le_bytes(buf[1..9].try_into().ok()?);
    let last_page_ns = u64::from_le_bytes(buf[9..17].try_into().ok()?);
    let path_len = u16::from_le_bytes(buf[17..19].try_into().ok()?) as usize;
    if path_len > TASK_PATH_CAP {
        return None;
    }
    let output_file = String::from_utf8(buf[19..19 + path_len].to_vec()).ok()?;
    Some(TraceDumpRet {
        code,
        output_file,
        first_page_ns,
        last_page_ns,
    })
}

/// Read direction of one FIFO with its epoll registration (registered once
/// per pipe side).
struct PipeReader {
    file: File,
    epoll: Epoll,
}

impl PipeReader {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let file = open_fifo(path)?;
        let epoll = Epoll::new().context("epoll_create")?;
        epoll
            .add_reader(file.as_raw_fd())
            .context("epoll_ctl add fifo")?;
        Ok(Self { file, epoll })
    }

    /// Reads exactly one `size`-byte record within `timeout`. `Ok(None)` on
    /// timeout; a partial record is an error (failed task).
    fn read_record(&mut self, size: usize, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if !self
                .epoll
                .wait_readable(remaining.as_millis().min(i32::MAX as u128) as i32)
                .context("epoll_wait on fifo")?
            {
                return Ok(None);
            }
            let mut buf = vec![0u8; size];
            match self.file.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) if n == size => return Ok(Some(buf)),
                Ok(n) => anyhow::bail!("short read on dump pipe: {n} of {size} bytes"),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("read dump pipe"),
            }
        }
    }
}

/// Write direction of one FIFO.
struct PipeWriter {
    file: File,
}

impl PipeWriter {
    fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            file: open_fifo(path)?,
        })
    }

    /// Records are smaller than `PIPE_BUF`, so the kernel either takes the
    /// whole record or refuses it; a failure here fails the task.
    fn write_record(&mut self, record: &[u8]) -> bool {
        match write_full(&mut self.file, record) {
            Ok(()) => true,
            Err(err) => {
                error!(%err, "failed to write dump pipe record");
                false
            }
        }
    }
}

/// FIFOs are opened read-write so neither side blocks on open ordering and
/// the reader never sees EOF storms when its peer restarts.
fn open_fifo(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("open fifo {}", path.display()))
}

fn fifo_paths(dir: &Path) -> [PathBuf; 3] {
    [
        dir.join(TASK_SUBMIT_PIPE),
        dir.join(SYNC_RET_PIPE),
        dir.join(ASYNC_RET_PIPE),
    ]
}

/// One side of the dump-pipe pair. The controller holds the write end of
/// the submit FIFO and the read ends of both result FIFOs; the worker holds
/// the mirror.
pub struct TraceDumpPipe {
    submit_tx: Option<PipeWriter>,
    submit_rx: Option<PipeReader>,
    sync_tx: Option<PipeWriter>,
    sync_rx: Option<PipeReader>,
    async_tx: Option<PipeWriter>,
    async_rx: Option<PipeReader>,
}

impl TraceDumpPipe {
    /// Creates the three FIFOs, tolerating ones that already exist.
    pub fn init(dir: &Path) -> anyhow::Result<()> {
        for path in fifo_paths(dir) {
            match mkfifo(&path, Mode::from_bits_truncate(0o644)) {
                Ok(()) => {}
                Err(nix::errno::Errno::EEXIST) => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("mkfifo {}", path.display()));
                }
            }
        }
        info!(dir = %dir.display(), "trace dump pipes ready");
        Ok(())
    }

    /// Unlinks the FIFOs; safe to call when they are already gone.
    pub fn clear(dir: &Path) {
        for path in fifo_paths(dir) {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %err, "failed to remove dump pipe");
                }
            }
        }
    }

    pub fn controller(dir: &Path) -> anyhow::Result<Self> {
        let [submit, sync_ret, async_ret] = fifo_paths(dir);
        Ok(Self {
            submit_tx: Some(PipeWriter::open(&submit)?),
            submit_rx: None,
            sync_tx: None,
            sync_rx: Some(PipeReader::open(&sync_ret)?),
            async_tx: None,
            async_rx: Some(PipeReader::open(&async_ret)?),
        })
    }

    pub fn worker(dir: &Path) -> anyhow::Result<Self> {
        let [submit, sync_ret, async_ret] = fifo_paths(dir);
        Ok(Self {
            submit_tx: None,
            submit_rx: Some(PipeReader::open(&submit)?),
            sync_tx: Some(PipeWriter::open(&sync_ret)?),
            sync_rx: None,
            async_tx: Some(PipeWriter::open(&async_ret)?),
            async_rx: None,
        })
    }

    // Controller side.

    pub fn submit_trace_dump_task(&mut self, task: &TraceDumpTask) -> bool {
        let Some(writer) = self.submit_tx.as_mut() else {
            error!("submit_trace_dump_task called on the worker side");
            return false;
        };
        match encode_task(task) {
            Some(record) => writer.write_record(&record),
            None => false,
        }
    }

    pub fn read_sync_dump_ret(&mut self, timeout: Duration) -> Option<TraceDumpTask> {
        Self::read_task(self.sync_rx.as_mut(), timeout, "sync return")
    }

    pub fn read_async_dump_ret(&mut self, timeout: Duration) -> Option<TraceDumpTask> {
        Self::read_task(self.async_rx.as_mut(), timeout, "async return")
    }

    // Worker side.

    pub fn read_trace_task(&mut self, timeout: Duration) -> Option<TraceDumpTask> {
        Self::read_task(self.submit_rx.as_mut(), timeout, "task submit")
    }

    pub fn write_sync_return(&mut self, task: &TraceDumpTask) -> bool {
        Self::write_task(self.sync_tx.as_mut(), task, "sync return")
    }

    pub fn write_async_return(&mut self, task: &TraceDumpTask) -> bool {
        Self::write_task(self.async_tx.as_mut(), task, "async return")
    }

    fn read_task(
        reader: Option<&mut PipeReader>,
        timeout: Duration,
        which: &str,
    ) -> Option<TraceDumpTask> {
        let Some(reader) = reader else {
            error!(which, "pipe read attempted from the wrong process role");
            return None;
        };
        match reader.read_record(TASK_RECORD_SIZE, timeout) {
            Ok(Some(record)) => match decode_task(&record) {
                Some(task) => Some(task),
                None => {
                    error!(which, "undecodable dump pipe record");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                error!(which, %err, "dump pipe read failed");
                None
            }
        }
    }

    fn write_task(writer: Option<&mut PipeWriter>, task: &TraceDumpTask, which: &str) -> bool {
        let Some(writer) = writer else {
            error!(which, "pipe write attempted from the wrong process role");
            return false;
        };
        match encode_task(task) {
            Some(record) => writer.write_record(&record),
            None => false,
        }
    }
}
