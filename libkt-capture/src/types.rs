// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Value types shared between the controller process and the dump worker.

use crate::error::TraceErrorCode;
use libkt_common::tracefs::PAGE_SIZE;
use std::path::PathBuf;

/// Default per-file size for recording/cache slices, in KiB.
pub const DEFAULT_FILE_SIZE_KB: u64 = 100 * 1024;

/// Capture mode bitmask. `OPEN` must be set before `RECORD` or `CACHE` can
/// be added; the controller enforces the allowed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceMode(pub u8);

impl TraceMode {
    pub const CLOSE: TraceMode = TraceMode(0);
    pub const OPEN: TraceMode = TraceMode(1);
    pub const RECORD: TraceMode = TraceMode(1 << 1);
    pub const CACHE: TraceMode = TraceMode(1 << 2);

    pub fn is_close(self) -> bool {
        self.0 == 0
    }

    pub fn is_open(self) -> bool {
        self.0 & TraceMode::OPEN.0 != 0
    }

    pub fn is_record_on(self) -> bool {
        self.0 & TraceMode::RECORD.0 != 0
    }

    pub fn is_cache_on(self) -> bool {
        self.0 & TraceMode::CACHE.0 != 0
    }

    pub fn set(&mut self, flag: TraceMode) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self, flag: TraceMode) {
        self.0 &= !flag.0;
    }
}

/// The three capture flavors, which also select the output file prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceDumpType {
    Snapshot,
    Recording,
    Cache,
}

impl TraceDumpType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            TraceDumpType::Snapshot => 0,
            TraceDumpType::Recording => 1,
            TraceDumpType::Cache => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => TraceDumpType::Snapshot,
            1 => TraceDumpType::Recording,
            2 => TraceDumpType::Cache,
            _ => return None,
        })
    }
}

/// One capture request handed to the content writers. Times are
/// `CLOCK_BOOTTIME` nanoseconds, matching the ftrace page clock when the
/// trace clock is "boot".
#[derive(Debug, Clone)]
pub struct TraceDumpRequest {
    pub dump_type: TraceDumpType,
    /// Per-file byte budget enforced by the CPU raw writer when
    /// `limit_file_size` is set.
    pub file_size_threshold: u64,
    pub limit_file_size: bool,
    pub trace_start_ns: u64,
    pub trace_end_ns: u64,
    pub task_id: Option<u64>,
    /// Pages whose header reports fewer committed bytes than this are
    /// counted as suspect; two suspect pages stop the per-CPU loop. This is
    /// a heuristic, hence configurable.
    pub page_check_threshold: u64,
}

impl TraceDumpRequest {
    pub fn new(dump_type: TraceDumpType, trace_start_ns: u64, trace_end_ns: u64) -> Self {
        Self {
            dump_type,
            file_size_threshold: DEFAULT_FILE_SIZE_KB * 1024,
            limit_file_size: false,
            trace_start_ns,
            trace_end_ns,
            task_id: None,
            page_check_threshold: (PAGE_SIZE / 2) as u64,
        }
    }
}

/// Result record a dump worker reports back to the controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceDumpRet {
    pub code: TraceErrorCode,
    pub output_file: String,
    pub first_page_ns: u64,
    pub last_page_ns: u64,
}

/// Lifecycle of one asynchronous dump task inside the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDumpStatus {
    /// Submitted, not yet picked up by the read thread.
    Start,
    /// Ring-buffer pages drained into the block pool.
    ReadDone,
    /// Read side ended without producing data for this task.
    ReadFinish,
    /// Output file fully written.
    WriteDone,
    /// Acknowledged by the controller; bookkeeping may be dropped.
    Finish,
}

impl TraceDumpStatus {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            TraceDumpStatus::Start => 0,
            TraceDumpStatus::ReadDone => 1,
            TraceDumpStatus::ReadFinish => 2,
            TraceDumpStatus::WriteDone => 3,
            TraceDumpStatus::Finish => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => TraceDumpStatus::Start,
            1 => TraceDumpStatus::ReadDone,
            2 => TraceDumpStatus::ReadFinish,
            3 => TraceDumpStatus::WriteDone,
            4 => TraceDumpStatus::Finish,
            _ => return None,
        })
    }
}

/// One async dump task, passed by value between the controller and the
/// worker over the dump pipe. The worker overwrites status, code, output
/// file and sizes in place.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceDumpTask {
    /// Task id: `CLOCK_BOOTTIME` nanoseconds at submission.
    pub task_id: u64,
    pub trace_start_ns: u64,
    pub trace_end_ns: u64,
    pub file_size_limit: u64,
    pub status: TraceDumpStatus,
    pub code: TraceErrorCode,
    pub output_file: String,
    pub file_size: u64,
    pub is_file_size_over_limit: bool,
    pub first_page_ns: u64,
    pub last_page_ns: u64,
}

impl TraceDumpTask {
    pub fn new(task_id: u64, trace_start_ns: u64, trace_end_ns: u64, file_size_limit: u64) -> Self {
        Self {
            task_id,
            trace_start_ns,
            trace_end_ns,
            file_size_limit,
            status: TraceDumpStatus::Start,
            code: TraceErrorCode::Unset,
            output_file: String::new(),
            file_size: 0,
            is_file_size_over_limit: false,
            first_page_ns: u64::MAX,
            last_page_ns: 0,
        }
    }
}

/// Structured result returned by every public dump entry point.
#[derive(Debug, Clone, Default)]
pub struct TraceRetInfo {
    pub error_code: TraceErrorCode,
    pub mode: TraceMode,
    /// Tags and tag groups active for the capture that produced the files.
    pub tags: Vec<String>,
    pub output_files: Vec<PathBuf>,
    pub file_size: u64,
    /// Portion of the requested window actually covered, in milliseconds.
    pub cover_duration_ms: i64,
    /// `cover_duration / committed_duration`, per-mille (1000 = full cover).
    pub cover_ratio: i64,
    pub is_overflow_control: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bit_operations() {
        let mut mode = TraceMode::CLOSE;
        assert!(mode.is_close());
        mode.set(TraceMode::OPEN);
        assert!(mode.is_open());
        mode.set(TraceMode::CACHE);
        assert!(mode.is_open() && mode.is_cache_on() && !mode.is_record_on());
        mode.clear(TraceMode::CACHE);
        assert_eq!(mode, TraceMode::OPEN);
    }

    #[test]
    fn test_dump_type_round_trip() {
        for ty in [
            TraceDumpType::Snapshot,
            TraceDumpType::Recording,
            TraceDumpType::Cache,
        ] {
            assert_eq!(TraceDumpType::from_u8(ty.to_u8()), Some(ty));
        }
        assert_eq!(TraceDumpType::from_u8(9), None);
    }

    #[test]
    fn test_new_task_defaults() {
        let task = TraceDumpTask::new(7, 100, 200, 4096);
        assert_eq!(task.status, TraceDumpStatus::Start);
        assert_eq!(task.code, TraceErrorCode::Unset);
        assert_eq!(task.first_page_ns, u64::MAX);
        assert_eq!(task.last_page_ns, 0);
    }

    #[test]
    fn test_request_default_page_threshold() {
        let request = TraceDumpRequest::new(TraceDumpType::Snapshot, 0, u64::MAX);
        assert_eq!(request.page_check_threshold, 2048);
        assert!(!request.limit_file_size);
    }
}
