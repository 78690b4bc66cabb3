// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The central writer: per-CPU raw ring-buffer pages, filtered in-stream
//! against the requested boot-time window, plus the asynchronous split of
//! the same loop into a block-pool producer (read side) and a drain writer
//! (write side).

use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use super::content::{read_chunk, CONTENT_TYPE_CPU_RAW, COPY_BUFFER_SIZE, SEGMENT_HEADER_SIZE};
use super::{KernelFlavor, TraceSource};
use crate::buffer::TraceBufferManager;
use crate::error::TraceErrorCode;
use crate::types::{TraceDumpRequest, TraceDumpType};
use libkt_common::tracefs::{TraceFs, PAGE_SIZE};

/// Result of one CPU raw pass. `first_page_ns`/`last_page_ns` are the
/// extreme accepted page timestamps; `u64::MAX`/`0` when nothing matched.
#[derive(Debug, Clone)]
pub struct CpuRawOutcome {
    pub status: TraceErrorCode,
    pub first_page_ns: u64,
    pub last_page_ns: u64,
    pub is_overflow: bool,
}

impl Default for CpuRawOutcome {
    fn default() -> Self {
        Self {
            status: TraceErrorCode::Unset,
            first_page_ns: u64::MAX,
            last_page_ns: 0,
            is_overflow: false,
        }
    }
}

impl CpuRawOutcome {
    fn finalize_status(&mut self, wrote_any: bool) {
        if wrote_any {
            self.status = TraceErrorCode::Success;
        } else if self.status == TraceErrorCode::Unset {
            self.status = TraceErrorCode::OutOfTime;
        }
    }
}

/// Window placement of one page timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageWindow {
    /// Past the window end: stop reading this CPU.
    Beyond,
    /// Before the window start: discard the page and keep reading.
    Before,
    /// Inside the window: accept.
    In,
}

pub(crate) fn classify_page(page_ts: u64, start_ns: u64, end_ns: u64) -> PageWindow {
    if page_ts > end_ns {
        PageWindow::Beyond
    } else if page_ts < start_ns {
        PageWindow::Before
    } else {
        PageWindow::In
    }
}

pub(crate) fn page_timestamp(page: &[u8]) -> u64 {
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&page[..8]);
    u64::from_le_bytes(ts)
}

/// Sanity heuristic: a page whose header reports fewer committed bytes than
/// the threshold is suspect. Two suspect pages stop the CPU loop.
pub(crate) fn check_page(page: &[u8], threshold: u64, is_hm: bool) -> bool {
    if is_hm || page.len() < 16 {
        return true;
    }
    let mut commit = [0u8; 8];
    commit.copy_from_slice(&page[8..16]);
    u64::from_le_bytes(commit) >= threshold
}

fn is_write_file_overflow(request: &TraceDumpRequest, output_size: u64, write_len: u64) -> bool {
    if !matches!(
        request.dump_type,
        TraceDumpType::Recording | TraceDumpType::Cache
    ) || !request.limit_file_size
    {
        return false;
    }
    if output_size + write_len + SEGMENT_HEADER_SIZE as u64 >= request.file_size_threshold {
        warn!(
            output_size,
            write_len,
            threshold = request.file_size_threshold,
            "write would exceed the file size limit"
        );
        return true;
    }
    if write_len > (i32::MAX as u64).saturating_sub(COPY_BUFFER_SIZE as u64) {
        error!(write_len, "segment length is nearly overflowing");
        return true;
    }
    false
}

fn open_raw_pipe(path: &PathBuf) -> anyhow::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

/// CPUs present under `per_cpu/`; the kernel exposes exactly the possible
/// CPUs there, so the directory is authoritative.
fn present_cpus(tracefs: &TraceFs) -> usize {
    let mut count = 0;
    while tracefs.node_path(&format!("per_cpu/cpu{count}")).exists() {
        count += 1;
    }
    if count == 0 {
        libkt_common::tracefs::cpu_processors()
    } else {
        count
    }
}

fn raw_pipe_paths(tracefs: &TraceFs, flavor: KernelFlavor) -> Vec<(usize, PathBuf)> {
    match flavor {
        // The HM kernel coalesces all CPUs into one pipe reported as cpu 0.
        KernelFlavor::Hm => vec![(0, tracefs.node_path("trace_pipe_raw"))],
        KernelFlavor::Linux => (0..present_cpus(tracefs))
            .map(|cpu| {
                (
                    cpu,
                    tracefs.node_path(&TraceFs::per_cpu_node(cpu, "trace_pipe_raw")),
                )
            })
            .collect(),
    }
}

impl TraceSource {
    /// Frames one segment per CPU (`CONTENT_TYPE_CPU_RAW + cpuIdx`, in
    /// ascending CPU order) holding the raw pages that fall inside the
    /// request window.
    pub fn write_cpu_raw(&self, request: &TraceDumpRequest) -> CpuRawOutcome {
        let mut outcome = CpuRawOutcome::default();
        for (cpu, path) in raw_pipe_paths(self.tracefs(), self.flavor()) {
            if let Err(err) = self.write_cpu_pipe_raw(&path, cpu, request, &mut outcome) {
                error!(cpu, %err, "cpu raw dump failed");
                outcome.status = TraceErrorCode::FileError;
                return outcome;
            }
            if outcome.is_overflow {
                break;
            }
        }
        outcome
    }

    fn write_cpu_pipe_raw(
        &self,
        path: &PathBuf,
        cpu: usize,
        request: &TraceDumpRequest,
        outcome: &mut CpuRawOutcome,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(self.output_still_exists(), "trace output file is gone");
        let mut src = open_raw_pipe(path)?;
        let content_type = CONTENT_TYPE_CPU_RAW + cpu as u8;
        let header_pos = self.begin_segment(content_type)?;
        let mut scratch = vec![0u8; COPY_BUFFER_SIZE];
        let mut write_len: u64 = 0;
        let mut page_chk_failed = 0;
        let mut have_first_page = false;
        loop {
            let mut bytes = 0usize;
            let mut end_flag = false;
            while bytes <= COPY_BUFFER_SIZE - PAGE_SIZE {
                let n = read_chunk(&mut src, &mut scratch[bytes..bytes + PAGE_SIZE])
                    .context("read trace_pipe_raw")?;
                if n == 0 {
                    end_flag = true;
                    break;
                }
                let page_ts = page_timestamp(&scratch[bytes..bytes + n]);
                match classify_page(page_ts, request.trace_start_ns, request.trace_end_ns) {
                    PageWindow::Beyond => {
                        // Keep the boundary page only if the segment already
                        // holds one, avoiding a trailing page past the window.
                        info!(
                            cpu,
                            page_ts,
                            end_ns = request.trace_end_ns,
                            "page beyond requested window"
                        );
                        end_flag = true;
                        if have_first_page {
                            bytes += n;
                        }
                        break;
                    }
                    PageWindow::Before => continue,
                    PageWindow::In => {
                        outcome.last_page_ns = outcome.last_page_ns.max(page_ts);
                        if !have_first_page {
                            have_first_page = true;
                            debug!(cpu, page_ts, "first accepted page");
                            outcome.first_page_ns = outcome.first_page_ns.min(page_ts);
                        }
                        if !check_page(
                            &scratch[bytes..bytes + n],
                            request.page_check_threshold,
                            self.flavor() == KernelFlavor::Hm,
                        ) {
                            page_chk_failed += 1;
                        }
                        bytes += n;
                        if page_chk_failed >= 2 {
                            warn!(cpu, "two suspect pages, stopping this cpu");
                            end_flag = true;
                            break;
                        }
                    }
                }
            }
            self.out()
                .write_all(&scratch[..bytes])
                .context("write cpu raw payload")?;
            write_len += bytes as u64;
            if is_write_file_overflow(request, self.output_size(), write_len) {
                outcome.is_overflow = true;
                break;
            }
            if end_flag {
                break;
            }
        }
        self.end_segment(header_pos, content_type, write_len as u32)?;
        outcome.finalize_status(write_len > 0);
        info!(cpu, write_len, "cpu raw segment done");
        Ok(())
    }

    /// Async write side: drains a task's blocks from the pool into framed
    /// per-CPU segments, preserving the read side's CPU grouping. Returns
    /// the payload bytes written.
    pub fn write_cpu_raw_from_blocks(
        &self,
        task_id: u64,
        manager: &TraceBufferManager,
    ) -> anyhow::Result<u64> {
        use libkt_common::MutexExt;
        let blocks = manager.task_buffers(task_id);
        let mut total: u64 = 0;
        let mut index = 0;
        while index < blocks.len() {
            let cpu = blocks[index].lock_or_panic().cpu;
            let content_type = CONTENT_TYPE_CPU_RAW + cpu as u8;
            let header_pos = self.begin_segment(content_type)?;
            let mut write_len: u64 = 0;
            while index < blocks.len() {
                let block = blocks[index].lock_or_panic();
                if block.cpu != cpu {
                    break;
                }
                self.out()
                    .write_all(block.payload())
                    .context("write block payload")?;
                write_len += block.used_bytes() as u64;
                index += 1;
            }
            self.end_segment(header_pos, content_type, write_len as u32)?;
            total += write_len;
        }
        info!(task_id, total, "drained task blocks into trace file");
        Ok(total)
    }
}

/// Async read side: drains the raw pipes into the task's blocks in the
/// shared pool, applying the same window filter as the synchronous writer.
/// One block holds pages of exactly one CPU.
pub fn read_cpu_raw_into_blocks(
    tracefs: &TraceFs,
    flavor: KernelFlavor,
    request: &TraceDumpRequest,
    task_id: u64,
    manager: &TraceBufferManager,
) -> CpuRawOutcome {
    use libkt_common::MutexExt;
    let mut outcome = CpuRawOutcome::default();
    let mut wrote_any = false;
    'cpus: for (cpu, path) in raw_pipe_paths(tracefs, flavor) {
        let mut src = match open_raw_pipe(&path) {
            Ok(src) => src,
            Err(err) => {
                error!(cpu, %err, "failed to open raw pipe");
                outcome.status = TraceErrorCode::FileError;
                break;
            }
        };
        let Some(mut block) = manager.allocate_block(task_id, cpu) else {
            warn!(task_id, cpu, "block pool exhausted, truncating capture");
            break;
        };
        let mut page = vec![0u8; PAGE_SIZE];
        let mut page_chk_failed = 0;
        let mut have_first_page = false;
        loop {
            let n = match read_chunk(&mut src, &mut page) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    error!(cpu, %err, "raw pipe read failed");
                    outcome.status = TraceErrorCode::FileError;
                    break;
                }
            };
            let page_ts = page_timestamp(&page[..n]);
            match classify_page(page_ts, request.trace_start_ns, request.trace_end_ns) {
                PageWindow::Beyond => break,
                PageWindow::Before => continue,
                PageWindow::In => {}
            }
            outcome.last_page_ns = outcome.last_page_ns.max(page_ts);
            if !have_first_page {
                have_first_page = true;
                outcome.first_page_ns = outcome.first_page_ns.min(page_ts);
            }
            if !check_page(
                &page[..n],
                request.page_check_threshold,
                flavor == KernelFlavor::Hm,
            ) {
                page_chk_failed += 1;
                if page_chk_failed >= 2 {
                    warn!(cpu, "two suspect pages, stopping this cpu");
                    break;
                }
            }
            if block.lock_or_panic().free_bytes() < n {
                match manager.allocate_block(task_id, cpu) {
                    Some(next) => block = next,
                    None => {
                        warn!(task_id, cpu, "block pool exhausted, truncating capture");
                        break 'cpus;
                    }
                }
            }
            if !block.lock_or_panic().append(&page[..n]) {
                error!(cpu, "block append failed");
                break;
            }
            wrote_any = true;
        }
    }
    outcome.finalize_status(wrote_any);
    outcome
}

#[cfg(test)]
mod tests {
    use super::super::content::parse::parse_container;
    use super::super::test_support::FakeCapture;
    use super::*;

    fn request(start_ns: u64, end_ns: u64) -> TraceDumpRequest {
        TraceDumpRequest::new(TraceDumpType::Snapshot, start_ns, end_ns)
    }

    fn dump_with_pages(pages_per_cpu: &[&[u64]], start_ns: u64, end_ns: u64) -> (Vec<u8>, CpuRawOutcome) {
        let fixture = FakeCapture::new(pages_per_cpu.len());
        for (cpu, timestamps) in pages_per_cpu.iter().enumerate() {
            fixture.write_raw_pages(cpu, timestamps);
        }
        let source = fixture.source("trace_cpu.sys");
        source.write_file_header().unwrap();
        let outcome = source.write_cpu_raw(&request(start_ns, end_ns));
        (std::fs::read(source.trace_file_path()).unwrap(), outcome)
    }

    #[test]
    fn test_classify_page_boundaries() {
        assert_eq!(classify_page(5, 10, 20), PageWindow::Before);
        assert_eq!(classify_page(10, 10, 20), PageWindow::In);
        assert_eq!(classify_page(20, 10, 20), PageWindow::In);
        assert_eq!(classify_page(21, 10, 20), PageWindow::Beyond);
    }

    #[test]
    fn test_check_page_threshold() {
        let mut page = vec![0u8; PAGE_SIZE];
        page[8..16].copy_from_slice(&100u64.to_le_bytes());
        assert!(!check_page(&page, 2048, false));
        assert!(check_page(&page, 100, false));
        // HM pages are never second-guessed.
        assert!(check_page(&page, 2048, true));
    }

    #[test]
    fn test_window_filter_and_timestamps() {
        let (data, outcome) = dump_with_pages(&[&[100, 200, 300, 900]], 150, 400);
        let (_, segments) = parse_container(&data).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].content_type, CONTENT_TYPE_CPU_RAW);
        // 200 and 300 are in-window; 900 is the kept boundary page.
        assert_eq!(segments[0].payload.len(), 3 * PAGE_SIZE);
        assert_eq!(outcome.status, TraceErrorCode::Success);
        assert_eq!(outcome.first_page_ns, 200);
        assert_eq!(outcome.last_page_ns, 300);
    }

    #[test]
    fn test_trailing_page_dropped_when_nothing_accepted() {
        // Every page is past the window: no boundary page is kept because
        // the segment never accepted one.
        let (data, outcome) = dump_with_pages(&[&[900, 950]], 100, 400);
        let (_, segments) = parse_container(&data).unwrap();
        assert_eq!(segments[0].payload.len(), 0);
        assert_eq!(outcome.status, TraceErrorCode::OutOfTime);
    }

    #[test]
    fn test_out_of_time_when_empty() {
        let (data, outcome) = dump_with_pages(&[&[]], 100, 400);
        let (_, segments) = parse_container(&data).unwrap();
        assert_eq!(segments[0].payload.len(), 0);
        assert_eq!(outcome.status, TraceErrorCode::OutOfTime);
        assert_eq!(outcome.first_page_ns, u64::MAX);
        assert_eq!(outcome.last_page_ns, 0);
    }

    #[test]
    fn test_cpu_segments_ascend() {
        let (data, outcome) = dump_with_pages(&[&[100], &[110], &[120]], 0, 1_000);
        let (_, segments) = parse_container(&data).unwrap();
        let types: Vec<u8> = segments.iter().map(|s| s.content_type).collect();
        assert_eq!(
            types,
            vec![
                CONTENT_TYPE_CPU_RAW,
                CONTENT_TYPE_CPU_RAW + 1,
                CONTENT_TYPE_CPU_RAW + 2
            ]
        );
        assert_eq!(outcome.first_page_ns, 100);
        assert_eq!(outcome.last_page_ns, 120);
    }

    #[test]
    fn test_suspect_pages_stop_cpu_loop() {
        let fixture = FakeCapture::new(1);
        // Two pages with tiny commit sizes trip the two-strike rule; the
        // later healthy page is never reached.
        use libkt_common::tracefs::PAGE_SIZE;
        let mut data = Vec::new();
        for (ts, commit) in [(100u64, 10u64), (200, 10), (300, 4000)] {
            let mut page = vec![0u8; PAGE_SIZE];
            page[..8].copy_from_slice(&ts.to_le_bytes());
            page[8..16].copy_from_slice(&commit.to_le_bytes());
            data.extend_from_slice(&page);
        }
        std::fs::write(
            fixture
                .tracefs_dir
                .path()
                .join("per_cpu/cpu0/trace_pipe_raw"),
            data,
        )
        .unwrap();
        let source = fixture.source("trace_suspect.sys");
        source.write_file_header().unwrap();
        let outcome = source.write_cpu_raw(&request(0, 1_000));
        let bytes = std::fs::read(source.trace_file_path()).unwrap();
        let (_, segments) = parse_container(&bytes).unwrap();
        assert_eq!(segments[0].payload.len(), 2 * PAGE_SIZE);
        assert_eq!(outcome.last_page_ns, 200);
    }

    #[test]
    fn test_overflow_guard_in_recording_mode() {
        let fixture = FakeCapture::new(1);
        fixture.write_raw_pages(0, &(0..64).map(|i| 100 + i).collect::<Vec<_>>());
        let source = fixture.source("record_trace_x.sys");
        source.write_file_header().unwrap();
        let mut request = request(0, 10_000);
        request.dump_type = TraceDumpType::Recording;
        request.limit_file_size = true;
        // Threshold small enough that the first flush trips the guard.
        request.file_size_threshold = 8 * PAGE_SIZE as u64;
        let outcome = source.write_cpu_raw(&request);
        assert!(outcome.is_overflow);
    }

    #[test]
    fn test_snapshot_mode_ignores_size_threshold() {
        let fixture = FakeCapture::new(1);
        fixture.write_raw_pages(0, &[100, 200, 300]);
        let source = fixture.source("trace_nolimit.sys");
        source.write_file_header().unwrap();
        let mut request = request(0, 10_000);
        request.file_size_threshold = 1;
        let outcome = source.write_cpu_raw(&request);
        assert!(!outcome.is_overflow);
        assert_eq!(outcome.status, TraceErrorCode::Success);
    }

    #[test]
    fn test_read_into_blocks_and_drain() {
        let fixture = FakeCapture::new(2);
        fixture.write_raw_pages(0, &[100, 200]);
        fixture.write_raw_pages(1, &[150]);
        let manager = TraceBufferManager::new(PAGE_SIZE * 4, PAGE_SIZE * 64);
        let outcome = read_cpu_raw_into_blocks(
            &fixture.tracefs(),
            KernelFlavor::Linux,
            &request(0, 1_000),
            7,
            &manager,
        );
        assert_eq!(outcome.status, TraceErrorCode::Success);
        assert_eq!(outcome.first_page_ns, 100);
        assert_eq!(outcome.last_page_ns, 200);
        assert_eq!(manager.task_total_used_bytes(7), 3 * PAGE_SIZE);

        let source = fixture.source("trace_async.sys");
        source.write_file_header().unwrap();
        let total = source.write_cpu_raw_from_blocks(7, &manager).unwrap();
        assert_eq!(total, 3 * PAGE_SIZE as u64);
        let data = std::fs::read(source.trace_file_path()).unwrap();
        let (_, segments) = parse_container(&data).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].content_type, CONTENT_TYPE_CPU_RAW);
        assert_eq!(segments[0].payload.len(), 2 * PAGE_SIZE);
        assert_eq!(segments[1].content_type, CONTENT_TYPE_CPU_RAW + 1);
        assert_eq!(segments[1].payload.len(), PAGE_SIZE);

        manager.release_task_blocks(7);
        assert_eq!(manager.current_total_size(), 0);
    }

    #[test]
    fn test_read_into_blocks_window_filter() {
        let fixture = FakeCapture::new(1);
        fixture.write_raw_pages(0, &[50, 100, 900]);
        let manager = TraceBufferManager::default();
        let outcome = read_cpu_raw_into_blocks(
            &fixture.tracefs(),
            KernelFlavor::Linux,
            &request(80, 400),
            9,
            &manager,
        );
        assert_eq!(outcome.first_page_ns, 100);
        assert_eq!(outcome.last_page_ns, 100);
        assert_eq!(manager.task_total_used_bytes(9), PAGE_SIZE);
        manager.release_task_blocks(9);
    }
}
