// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dump-worker process entry points, used by the `trace-dump-worker`
//! binary.
//!
//! `single` mode runs one snapshot dump and reports a fixed-size result
//! record on stdout. `monitor` mode is the long-lived async worker: a task
//! monitor accepting work over the dump pipe, a read thread draining the
//! kernel ring buffer into the block pool, and a write thread serializing
//! finished tasks into container files.

use anyhow::Context;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{ExecutorContext, TraceDumpExecutor, TraceDumpParam};
use crate::config::TagRegistry;
use crate::error::TraceErrorCode;
use crate::file_utils;
use crate::pipe::{encode_ret, TraceDumpPipe};
use crate::source::cpu_raw::read_cpu_raw_into_blocks;
use crate::source::{KernelFlavor, TraceSource};
use crate::types::{TraceDumpRequest, TraceDumpStatus, TraceDumpType};

/// Consecutive idle one-second polls after which an idle monitor exits; the
/// controller restarts the worker on the next async call.
const MONITOR_IDLE_EXIT_COUNT: u32 = 180;
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub tracefs_root: PathBuf,
    pub trace_dir: PathBuf,
}

impl WorkerOptions {
    fn context(&self) -> ExecutorContext {
        ExecutorContext {
            tracefs: libkt_common::tracefs::TraceFs::from_root(&self.tracefs_root),
            flavor: KernelFlavor::detect(),
            trace_dir: self.trace_dir.clone(),
            // The saved events format cache was produced at open time; the
            // worker only ever copies it.
            registry: TagRegistry::default(),
        }
    }
}

/// Runs one snapshot dump over the given boot-time window and writes the
/// result record to stdout, where the controller's epoll wait picks it up.
pub fn run_single_dump(
    opts: &WorkerOptions,
    trace_start_ns: u64,
    trace_end_ns: u64,
) -> anyhow::Result<()> {
    let executor = TraceDumpExecutor::new(opts.context());
    let param = TraceDumpParam {
        dump_type: TraceDumpType::Snapshot,
        output_file: None,
        file_limit: 0,
        file_size_kb: 0,
        trace_start_ns,
        trace_end_ns,
    };
    let ret = executor.dump_trace(&param);
    info!(
        code = ?ret.code,
        file = %ret.output_file,
        first = ret.first_page_ns,
        last = ret.last_page_ns,
        "single dump finished"
    );
    let record = encode_ret(&ret).context("result record encoding failed")?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&record).context("write result record")?;
    stdout.flush().context("flush result record")?;
    Ok(())
}

/// Runs the long-lived async worker until it has been idle for three
/// minutes or the controller kills it with SIGUSR1.
pub fn run_monitor(opts: &WorkerOptions) -> anyhow::Result<()> {
    let executor = Arc::new(TraceDumpExecutor::new(opts.context()));
    executor.monitor_running().store(true, Ordering::SeqCst);

    let read_pipe = TraceDumpPipe::worker(&opts.trace_dir)?;
    let write_pipe = TraceDumpPipe::worker(&opts.trace_dir)?;
    let mut monitor_pipe = TraceDumpPipe::worker(&opts.trace_dir)?;

    let read_thread = {
        let executor = Arc::clone(&executor);
        std::thread::spawn(move || read_raw_trace_loop(&executor, read_pipe))
    };
    let write_thread = {
        let executor = Arc::clone(&executor);
        std::thread::spawn(move || write_trace_loop(&executor, write_pipe))
    };

    trace_dump_task_monitor(&executor, &mut monitor_pipe);

    if read_thread.join().is_err() || write_thread.join().is_err() {
        error!("worker loop thread panicked");
    }
    info!("dump worker monitor exits");
    Ok(())
}

/// Dispatcher: accepts tasks over the submit FIFO and queues them for the
/// read thread.
fn trace_dump_task_monitor(executor: &TraceDumpExecutor, pipe: &mut TraceDumpPipe) {
    let mut idle_count = 0u32;
    loop {
        match pipe.read_trace_task(Duration::from_secs(1)) {
            Some(task) => {
                info!(task_id = task.task_id, "accepted trace dump task");
                idle_count = 0;
                executor.add_trace_dump_task(task);
            }
            None => {
                if executor.trace_dump_task_count() == 0 {
                    idle_count += 1;
                    if idle_count >= MONITOR_IDLE_EXIT_COUNT {
                        info!("monitor idle for too long, shutting down");
                        break;
                    }
                }
            }
        }
    }
    executor.monitor_running().store(false, Ordering::SeqCst);
}

/// Producer: drains ring-buffer pages into the block pool for the oldest
/// submitted task, then reports the trace-drained result on the sync FIFO.
fn read_raw_trace_loop(executor: &TraceDumpExecutor, mut pipe: TraceDumpPipe) {
    loop {
        let Some(mut task) = executor.take_oldest_task_with_status(TraceDumpStatus::Start) else {
            if !executor.monitor_running().load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(TASK_POLL_INTERVAL);
            continue;
        };
        let ctx = executor.context();
        let mut request =
            TraceDumpRequest::new(TraceDumpType::Snapshot, task.trace_start_ns, task.trace_end_ns);
        request.task_id = Some(task.task_id);
        let outcome = read_cpu_raw_into_blocks(
            &ctx.tracefs,
            ctx.flavor,
            &request,
            task.task_id,
            executor.buffer(),
        );
        task.first_page_ns = outcome.first_page_ns;
        task.last_page_ns = outcome.last_page_ns;
        task.code = outcome.status;
        if outcome.status == TraceErrorCode::Success {
            task.status = TraceDumpStatus::ReadDone;
        } else {
            // Nothing to serialize; the task ends at the sync stage.
            task.status = TraceDumpStatus::ReadFinish;
            executor.buffer().release_task_blocks(task.task_id);
        }
        executor.update_trace_dump_task(&task);
        if task.status == TraceDumpStatus::ReadFinish {
            executor.remove_trace_dump_task(task.task_id);
        }
        if !pipe.write_sync_return(&task) {
            error!(task_id = task.task_id, "failed to send sync return");
        }
    }
}

/// Consumer: serializes the oldest drained task into a fresh snapshot
/// container and reports the file-written result on the async FIFO.
fn write_trace_loop(executor: &TraceDumpExecutor, mut pipe: TraceDumpPipe) {
    loop {
        let Some(mut task) = executor.take_oldest_task_with_status(TraceDumpStatus::ReadDone)
        else {
            if !executor.monitor_running().load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(TASK_POLL_INTERVAL);
            continue;
        };
        let ctx = executor.context();
        let trace_file = file_utils::generate_trace_file_name(&ctx.trace_dir, TraceDumpType::Snapshot);
        match write_task_file(executor, &task, &trace_file) {
            Ok(file_size) => {
                task.output_file = trace_file.to_string_lossy().into_owned();
                task.file_size = file_size;
                task.is_file_size_over_limit =
                    task.file_size_limit > 0 && file_size > task.file_size_limit;
                task.code = TraceErrorCode::Success;
            }
            Err(err) => {
                error!(task_id = task.task_id, %err, "failed to write task file");
                file_utils::remove_file(&trace_file);
                task.code = TraceErrorCode::FileError;
            }
        }
        task.status = TraceDumpStatus::WriteDone;
        executor.buffer().release_task_blocks(task.task_id);
        executor.remove_trace_dump_task(task.task_id);
        if !pipe.write_async_return(&task) {
            warn!(task_id = task.task_id, "failed to send async return");
        }
    }
}

/// The single-dump sequence with the CPU raw stream substituted by a drain
/// of the task's blocks.
fn write_task_file(
    executor: &TraceDumpExecutor,
    task: &crate::types::TraceDumpTask,
    trace_file: &PathBuf,
) -> anyhow::Result<u64> {
    let ctx = executor.context();
    let source = TraceSource::create(
        ctx.flavor,
        ctx.tracefs.clone(),
        &ctx.trace_dir,
        trace_file,
    )?;
    source.write_file_header()?;
    if let Err(err) = source.write_base_info() {
        warn!(%err, "base info write failed, continuing");
    }
    if let Err(err) = source.write_events_format(&ctx.registry) {
        warn!(%err, "events format write failed, continuing");
    }
    source.write_cpu_raw_from_blocks(task.task_id, executor.buffer())?;
    if let Err(err) = source.write_cmd_lines() {
        warn!(%err, "cmdlines write failed, continuing");
    }
    if let Err(err) = source.write_tgids() {
        warn!(%err, "tgids write failed, continuing");
    }
    if let Err(err) = source.write_header_page() {
        warn!(%err, "header page write failed, continuing");
    }
    if let Err(err) = source.write_printk_formats() {
        warn!(%err, "printk formats write failed, continuing");
    }
    Ok(file_utils::file_size(trace_file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::sample_registry;
    use crate::source::test_support::FakeCapture;
    use crate::types::TraceDumpTask;

    fn worker_executor(fixture: &FakeCapture) -> Arc<TraceDumpExecutor> {
        Arc::new(TraceDumpExecutor::new(ExecutorContext {
            tracefs: fixture.tracefs(),
            flavor: KernelFlavor::Linux,
            trace_dir: fixture.out_dir.path().to_path_buf(),
            registry: sample_registry(),
        }))
    }

    /// Drives the three worker loops in-process against fake pipes,
    /// exercising the same paths the spawned worker binary runs.
    #[test]
    fn test_monitor_worker_round_trip() {
        let fixture = FakeCapture::new(1);
        let base = 1_000u64;
        fixture.write_raw_pages(0, &[base, base + 1]);
        let dir = fixture.out_dir.path().to_path_buf();
        TraceDumpPipe::init(&dir).unwrap();

        let executor = worker_executor(&fixture);
        executor.monitor_running().store(true, Ordering::SeqCst);

        let read_pipe = TraceDumpPipe::worker(&dir).unwrap();
        let write_pipe = TraceDumpPipe::worker(&dir).unwrap();
        let read_thread = {
            let executor = Arc::clone(&executor);
            std::thread::spawn(move || read_raw_trace_loop(&executor, read_pipe))
        };
        let write_thread = {
            let executor = Arc::clone(&executor);
            std::thread::spawn(move || write_trace_loop(&executor, write_pipe))
        };

        let mut controller = TraceDumpPipe::controller(&dir).unwrap();
        let task = TraceDumpTask::new(77, 0, u64::MAX, 50 * 1024 * 1024);
        executor.add_trace_dump_task(task.clone());
        // The read thread picks the task straight from the queue; the
        // submit FIFO is exercised by the pipe tests.
        let sync = controller
            .read_sync_dump_ret(Duration::from_secs(5))
            .expect("sync return");
        assert_eq!(sync.task_id, 77);
        assert_eq!(sync.status, TraceDumpStatus::ReadDone);
        assert_eq!(sync.code, TraceErrorCode::Success);
        assert_eq!(sync.first_page_ns, base);

        let done = controller
            .read_async_dump_ret(Duration::from_secs(5))
            .expect("async return");
        assert_eq!(done.status, TraceDumpStatus::WriteDone);
        assert_eq!(done.code, TraceErrorCode::Success);
        assert!(!done.output_file.is_empty());
        assert!(std::path::Path::new(&done.output_file).exists());
        assert!(done.file_size > 0);
        assert!(!done.is_file_size_over_limit);

        executor.monitor_running().store(false, Ordering::SeqCst);
        read_thread.join().unwrap();
        write_thread.join().unwrap();
        assert_eq!(executor.trace_dump_task_count(), 0);
        assert_eq!(executor.buffer().current_total_size(), 0);
    }

    #[test]
    fn test_read_loop_reports_out_of_time_at_sync_stage() {
        let fixture = FakeCapture::new(1);
        fixture.write_raw_pages(0, &[5_000]);
        let dir = fixture.out_dir.path().to_path_buf();
        TraceDumpPipe::init(&dir).unwrap();

        let executor = worker_executor(&fixture);
        executor.monitor_running().store(true, Ordering::SeqCst);
        let read_pipe = TraceDumpPipe::worker(&dir).unwrap();
        let read_thread = {
            let executor = Arc::clone(&executor);
            std::thread::spawn(move || read_raw_trace_loop(&executor, read_pipe))
        };

        let mut controller = TraceDumpPipe::controller(&dir).unwrap();
        // Window that no page can satisfy.
        executor.add_trace_dump_task(TraceDumpTask::new(5, 0, 100, 0));
        let sync = controller
            .read_sync_dump_ret(Duration::from_secs(5))
            .expect("sync return");
        assert_eq!(sync.status, TraceDumpStatus::ReadFinish);
        assert_eq!(sync.code, TraceErrorCode::OutOfTime);
        // The failed task does not linger in the queue or the pool.
        assert_eq!(executor.trace_dump_task_count(), 0);
        assert_eq!(executor.buffer().current_total_size(), 0);

        executor.monitor_running().store(false, Ordering::SeqCst);
        read_thread.join().unwrap();
    }
}
