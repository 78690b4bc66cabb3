// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The capture controller: the only public entry point of the engine.
//!
//! One controller value owns the whole module state behind a single mutex;
//! every mode-changing entry point locks it first. Snapshot dumps run in a
//! short-lived worker process whose single result record arrives over a
//! pipe; asynchronous dumps share one long-lived worker process reached
//! through the dump-pipe FIFOs; recording and cache modes run loop threads
//! in this process.

pub mod balancer;

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::config::{TagRegistry, TraceParams};
use crate::error::TraceErrorCode;
use crate::executor::{ExecutorContext, TraceDumpExecutor, TraceDumpParam};
use crate::file_utils::{self, TraceFileInfo, CACHE_FILE_PREFIX, SAVED_EVENTS_FORMAT};
use crate::pipe::{decode_ret, TraceDumpPipe, RET_RECORD_SIZE};
use crate::source::content::pre_write_events_format;
use crate::source::KernelFlavor;
use crate::types::{
    TraceDumpTask, TraceDumpType, TraceMode, TraceRetInfo, TraceDumpStatus,
};
use libkt_common::time::{self, S_TO_MS, S_TO_NS};
use libkt_common::tracefs::{self, TraceFs, BUFFER_SIZE_NODE, TRACING_ON_NODE, TRACE_NODE};
use libkt_common::unix::{read_full, signal_and_reap, wait_for_child, Epoll};
use libkt_common::MutexExt;

/// Free space required before a snapshot dump may start.
pub const SNAPSHOT_MIN_REMAINING_SPACE: u64 = 300 * 1024 * 1024;
/// Extra head-room reserved per queued async task.
pub const DEFAULT_ASYNC_TRACE_SIZE: u64 = 50 * 1024 * 1024;

const DEFAULT_FULL_TRACE_LENGTH_S: u64 = 30;
const DURATION_TOLERANCE_MS: u64 = 100;
const MAX_RATIO_UNIT: i64 = 1000;
const SAVED_CMDLINES_SIZE: u32 = 3072;
/// Published windows longer than this are treated as corrupt names and
/// excluded from search results.
const MAX_TRACE_FILE_SPAN_MS: u64 = 2000 * 1000;
const SYNC_DUMP_WAIT_RETRIES: u32 = 10;
const ASYNC_SYNC_RET_WAIT: Duration = Duration::from_secs(10);
const ASYNC_WAIT_EMPTY_LOOP_COUNT: u32 = 180;
const CHILD_REAP_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_CACHE_TOTAL_FILE_SIZE_MB: u64 = 300;
const DEFAULT_CACHE_SLICE_DURATION_S: u64 = 10;
const BALANCER_INTERVAL: Duration = Duration::from_secs(15);

/// The published user-tag bits; producers and other controllers observe it
/// through this file, so a second controller taking over is detectable.
const TAG_FLAGS_FILE: &str = "tag_flags";

pub type TraceCallback = Box<dyn FnOnce(TraceRetInfo) + Send + 'static>;

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Fixed tracefs root; probed from the well-known mount points when
    /// unset.
    pub tracefs_root: Option<PathBuf>,
    /// Directory receiving trace files, the dump pipes and the persisted
    /// events-format cache.
    pub trace_dir: PathBuf,
    /// Path of the `trace-dump-worker` binary; defaults to a sibling of the
    /// current executable.
    pub worker_binary: Option<PathBuf>,
    pub min_free_space: u64,
    pub snapshot_keep_count: usize,
    pub enable_cpu_balancer: bool,
}

impl ControllerOptions {
    pub fn new(trace_dir: impl Into<PathBuf>) -> Self {
        Self {
            tracefs_root: None,
            trace_dir: trace_dir.into(),
            worker_binary: None,
            min_free_space: SNAPSHOT_MIN_REMAINING_SPACE,
            snapshot_keep_count: file_utils::DEFAULT_SNAPSHOT_KEEP_COUNT,
            enable_cpu_balancer: true,
        }
    }
}

#[derive(Default)]
struct AsyncBook {
    callbacks: HashMap<u64, Option<TraceCallback>>,
    ret_infos: HashMap<u64, TraceRetInfo>,
}

struct ControllerState {
    mode: TraceMode,
    params: TraceParams,
    tracefs: Option<TraceFs>,
    flavor: KernelFlavor,
    trace_files: Vec<TraceFileInfo>,
    total_file_size_limit: u64,
    slice_max_duration: Duration,
    trace_start_ns: u64,
    trace_end_ns: u64,
    first_page_ns: u64,
    last_page_ns: u64,
    dest_start_ut_s: u64,
    dest_end_ut_s: u64,
    init_tag_flags: u64,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            mode: TraceMode::CLOSE,
            params: TraceParams::default(),
            tracefs: None,
            flavor: KernelFlavor::Linux,
            trace_files: Vec::new(),
            total_file_size_limit: 0,
            slice_max_duration: Duration::from_secs(DEFAULT_CACHE_SLICE_DURATION_S),
            trace_start_ns: 0,
            trace_end_ns: u64::MAX,
            first_page_ns: u64::MAX,
            last_page_ns: 0,
            dest_start_ut_s: 0,
            dest_end_ut_s: 0,
            init_tag_flags: 0,
        }
    }
}

struct ControllerInner {
    opts: ControllerOptions,
    registry: TagRegistry,
    state: Mutex<ControllerState>,
    executor: Mutex<Option<Arc<TraceDumpExecutor>>>,
    async_book: Mutex<AsyncBook>,
    async_wait_running: AtomicBool,
    balancer_running: AtomicBool,
    worker_pid: AtomicI32,
}

/// Public handle. Cloning is cheap and shares the underlying state.
#[derive(Clone)]
pub struct TraceController {
    inner: Arc<ControllerInner>,
}

impl TraceController {
    pub fn new(registry: TagRegistry, opts: ControllerOptions) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                opts,
                registry,
                state: Mutex::new(ControllerState::default()),
                executor: Mutex::new(None),
                async_book: Mutex::new(AsyncBook::default()),
                async_wait_running: AtomicBool::new(false),
                balancer_running: AtomicBool::new(false),
                worker_pid: AtomicI32::new(-1),
            }),
        }
    }

    pub fn trace_mode(&self) -> TraceMode {
        self.inner.state.lock_or_panic().mode
    }

    /// Opens capture with the textual argument form
    /// (`tags:a,b bufferSize:1024 overwrite:1 ...`).
    pub fn open_trace(&self, args: &str) -> TraceErrorCode {
        let Some(params) = TraceParams::parse_args(args) else {
            error!(args, "failed to parse capture arguments");
            return TraceErrorCode::TagError;
        };
        self.open_trace_with_params(params)
    }

    /// Opens capture from tag groups with the registry's defaults.
    pub fn open_trace_groups(&self, groups: &[String]) -> TraceErrorCode {
        if groups.is_empty() {
            error!("no tag groups given");
            return TraceErrorCode::TagError;
        }
        let mut params = TraceParams::default();
        params.tag_groups = groups.to_vec();
        params.buffer_size_kb = Some(self.inner.registry.snapshot_default_buffer_kb);
        params.clock_type = "boot".to_string();
        self.open_trace_with_params(params)
    }

    fn open_trace_with_params(&self, params: TraceParams) -> TraceErrorCode {
        let inner = &self.inner;
        let mut state = inner.state.lock_or_panic();
        if !state.mode.is_close() {
            error!(mode = state.mode.0, "open rejected in current trace mode");
            return TraceErrorCode::WrongTraceMode;
        }
        let Some(trace_fs) = self.detect_tracefs() else {
            error!("tracefs is not mounted");
            return TraceErrorCode::TraceNotSupported;
        };
        if inner.registry.is_empty() {
            error!("empty tag registry");
            return TraceErrorCode::TagError;
        }
        if !inner.registry.check_tags(&params.tags)
            || !inner.registry.check_groups(&params.tag_groups)
        {
            return TraceErrorCode::TagError;
        }
        if !params.buffer_size_in_bounds() {
            error!(buffer_size_kb = ?params.buffer_size_kb, "buffer size out of bounds");
            return TraceErrorCode::TagError;
        }

        let resolved = inner.registry.resolve(&params);
        self.apply_trace_settings(&trace_fs, &params, &resolved.enable_paths);
        trace_fs.set_node_enabled(TRACING_ON_NODE, true);

        file_utils::del_saved_events_format(&inner.opts.trace_dir);
        let saved = inner.opts.trace_dir.join(SAVED_EVENTS_FORMAT);
        if let Err(err) = pre_write_events_format(&trace_fs, &inner.registry, &saved) {
            warn!(%err, "failed to pre-write events format cache");
        }
        self.publish_tag_flags(resolved.user_bits);

        state.trace_files =
            file_utils::refresh_trace_vec(&inner.opts.trace_dir, TraceDumpType::Snapshot);
        let mut cache_files =
            file_utils::refresh_trace_vec(&inner.opts.trace_dir, TraceDumpType::Cache);
        file_utils::clear_cache_trace_file_by_duration(&mut cache_files);

        let flavor = KernelFlavor::detect();
        *inner.executor.lock_or_panic() = Some(Arc::new(TraceDumpExecutor::new(ExecutorContext {
            tracefs: trace_fs.clone(),
            flavor,
            trace_dir: inner.opts.trace_dir.clone(),
            registry: inner.registry.clone(),
        })));

        state.init_tag_flags = resolved.user_bits;
        state.params = params;
        state.tracefs = Some(trace_fs);
        state.flavor = flavor;
        state.mode = TraceMode::OPEN;
        info!("trace opened");
        drop(state);
        self.start_cpu_buffer_balancer();
        TraceErrorCode::Success
    }

    /// One-shot snapshot covering `[utEndTime − maxDuration, utEndTime]`
    /// (Unix seconds; zero end means "now").
    pub fn dump_trace(&self, max_duration_s: u32, ut_end_time_s: u64) -> TraceRetInfo {
        let inner = &self.inner;
        let mut state = inner.state.lock_or_panic();
        let mut ret = TraceRetInfo {
            mode: state.mode,
            ..Default::default()
        };
        if let Err(code) = Self::check_dump_status(&state, max_duration_s) {
            ret.error_code = code;
            return ret;
        }
        file_utils::handle_snapshot_ageing(&mut state.trace_files, inner.opts.snapshot_keep_count);
        info!(max_duration_s, ut_end_time_s, "dump trace start");
        Self::set_dest_trace_time_and_duration(&mut state, max_duration_s, ut_end_time_s);
        let committed_duration_s = DEFAULT_FULL_TRACE_LENGTH_S
            .min(state.dest_end_ut_s - state.dest_start_ut_s) as i64;

        if state.mode.is_cache_on() {
            self.get_file_in_cache(&mut state, &mut ret);
            Self::load_dump_ret(&state, &mut ret, committed_duration_s);
            Self::sanitize_ret_info(&mut ret);
            return ret;
        }

        ret.error_code = Self::set_time_interval_boundary(&mut state, max_duration_s, ut_end_time_s);
        if ret.error_code != TraceErrorCode::Success {
            return ret;
        }
        state.first_page_ns = u64::MAX;
        state.last_page_ns = 0;

        ret.error_code = self.process_dump_sync(&mut state, &mut ret);
        Self::load_dump_ret(&state, &mut ret, committed_duration_s);
        Self::restore_time_interval_boundary(&mut state);
        Self::sanitize_ret_info(&mut ret);
        info!(code = ?ret.error_code, "dump trace done");
        ret
    }

    /// Asynchronous snapshot. Returns as soon as the worker reports the
    /// trace drained; `callback` fires later with the final result once
    /// the file is written.
    pub fn dump_trace_async(
        &self,
        max_duration_s: u32,
        ut_end_time_s: u64,
        file_size_limit: u64,
        callback: Option<TraceCallback>,
    ) -> TraceRetInfo {
        let inner = &self.inner;
        let mut state = inner.state.lock_or_panic();
        let mut ret = TraceRetInfo {
            mode: state.mode,
            ..Default::default()
        };
        if let Err(code) = Self::check_dump_status(&state, max_duration_s) {
            ret.error_code = code;
            if let Some(callback) = callback {
                callback(ret.clone());
            }
            return ret;
        }
        file_utils::handle_snapshot_ageing(&mut state.trace_files, inner.opts.snapshot_keep_count);
        info!(max_duration_s, ut_end_time_s, "dump trace async start");
        Self::set_dest_trace_time_and_duration(&mut state, max_duration_s, ut_end_time_s);
        let committed_duration_s = DEFAULT_FULL_TRACE_LENGTH_S
            .min(state.dest_end_ut_s - state.dest_start_ut_s) as i64;

        if state.mode.is_cache_on() {
            self.get_file_in_cache(&mut state, &mut ret);
            Self::load_dump_ret(&state, &mut ret, committed_duration_s);
            Self::sanitize_ret_info(&mut ret);
            if let Some(callback) = callback {
                callback(ret.clone());
            }
            return ret;
        }

        ret.error_code = Self::set_time_interval_boundary(&mut state, max_duration_s, ut_end_time_s);
        if ret.error_code != TraceErrorCode::Success {
            if let Some(callback) = callback {
                callback(ret.clone());
            }
            return ret;
        }
        state.first_page_ns = u64::MAX;
        state.last_page_ns = 0;

        let task_id = time::boot_time_ns();
        inner
            .async_book
            .lock_or_panic()
            .callbacks
            .insert(task_id, callback);

        let code = self.process_dump_async(&mut state, task_id, file_size_limit, &mut ret);
        if code != TraceErrorCode::AsyncDump {
            ret.error_code = code;
            Self::load_dump_ret(&state, &mut ret, committed_duration_s);
            Self::sanitize_ret_info(&mut ret);
            let callback = inner
                .async_book
                .lock_or_panic()
                .callbacks
                .remove(&task_id)
                .flatten();
            if let Some(callback) = callback {
                callback(ret.clone());
            }
        } else {
            ret.error_code = TraceErrorCode::Success;
            Self::load_dump_ret(&state, &mut ret, committed_duration_s);
            Self::sanitize_ret_info(&mut ret);
            inner
                .async_book
                .lock_or_panic()
                .ret_infos
                .insert(task_id, ret.clone());
        }
        Self::restore_time_interval_boundary(&mut state);
        info!(outputs = ret.output_files.len(), "dump trace async returned");
        ret
    }

    /// Starts the continuous recording loop.
    pub fn record_trace_on(&self) -> TraceErrorCode {
        let inner = &self.inner;
        let mut state = inner.state.lock_or_panic();
        if state.mode != TraceMode::OPEN {
            error!(mode = state.mode.0, "record on rejected in current trace mode");
            return TraceErrorCode::WrongTraceMode;
        }
        let Some(executor) = self.executor() else {
            return TraceErrorCode::FileError;
        };
        if !executor.pre_check_dump_trace_loop_status() {
            error!("a dump loop is already running");
            return TraceErrorCode::WrongTraceMode;
        }
        let param = TraceDumpParam {
            dump_type: TraceDumpType::Recording,
            output_file: state.params.output_file.clone(),
            file_limit: state.params.file_limit,
            file_size_kb: state.params.file_size_kb,
            trace_start_ns: 0,
            trace_end_ns: u64::MAX,
        };
        let loop_executor = Arc::clone(&executor);
        std::thread::Builder::new()
            .name("RecordTraceTask".into())
            .spawn(move || {
                loop_executor.start_dump_trace_loop(&param);
            })
            .map(|_| ())
            .unwrap_or_else(|err| error!(%err, "failed to spawn record loop thread"));
        wait_loop_session_started(&executor);
        state.mode.set(TraceMode::RECORD);
        info!("recording trace on");
        TraceErrorCode::Success
    }

    /// Stops the recording loop and returns the files it produced during
    /// this session.
    pub fn record_trace_off(&self) -> TraceRetInfo {
        let inner = &self.inner;
        let mut state = inner.state.lock_or_panic();
        let mut ret = TraceRetInfo::default();
        if !state.mode.is_record_on() {
            error!(mode = state.mode.0, "record off rejected in current trace mode");
            ret.error_code = TraceErrorCode::WrongTraceMode;
            return ret;
        }
        if let Some(trace_fs) = state.tracefs.as_ref() {
            if let Err(err) = trace_fs.mark_clock_sync() {
                warn!(%err, "failed to write clock sync markers");
            }
        }
        if let Some(executor) = self.executor() {
            ret.output_files = executor.stop_dump_trace_loop();
        }
        ret.error_code = TraceErrorCode::Success;
        state.mode.clear(TraceMode::RECORD);
        info!("recording trace off");
        ret
    }

    /// Starts the cache loop: slices of at most `slice_max_duration_s`
    /// seconds, with all cache files kept under `total_file_size_mb`.
    pub fn cache_trace_on(&self, total_file_size_mb: u64, slice_max_duration_s: u64) -> TraceErrorCode {
        let inner = &self.inner;
        let mut state = inner.state.lock_or_panic();
        if state.mode != TraceMode::OPEN {
            error!(mode = state.mode.0, "cache on rejected in current trace mode");
            return TraceErrorCode::WrongTraceMode;
        }
        let Some(executor) = self.executor() else {
            return TraceErrorCode::FileError;
        };
        if !executor.pre_check_dump_trace_loop_status() {
            error!("a dump loop is already running");
            return TraceErrorCode::WrongTraceMode;
        }
        state.total_file_size_limit = if total_file_size_mb == 0 {
            DEFAULT_CACHE_TOTAL_FILE_SIZE_MB * 1024 * 1024
        } else {
            total_file_size_mb * 1024 * 1024
        };
        state.slice_max_duration = Duration::from_secs(if slice_max_duration_s == 0 {
            DEFAULT_CACHE_SLICE_DURATION_S
        } else {
            slice_max_duration_s
        });
        let param = TraceDumpParam {
            dump_type: TraceDumpType::Cache,
            output_file: None,
            file_limit: state.params.file_limit,
            file_size_kb: state.params.file_size_kb,
            trace_start_ns: 0,
            trace_end_ns: u64::MAX,
        };
        let total = state.total_file_size_limit;
        let slice = state.slice_max_duration;
        let loop_executor = Arc::clone(&executor);
        std::thread::Builder::new()
            .name("CacheTraceTask".into())
            .spawn(move || {
                loop_executor.start_cache_trace_loop(&param, total, slice);
            })
            .map(|_| ())
            .unwrap_or_else(|err| error!(%err, "failed to spawn cache loop thread"));
        wait_loop_session_started(&executor);
        state.mode.set(TraceMode::CACHE);
        info!("caching trace on");
        TraceErrorCode::Success
    }

    pub fn cache_trace_off(&self) -> TraceErrorCode {
        let inner = &self.inner;
        let mut state = inner.state.lock_or_panic();
        if state.mode.0 != TraceMode::OPEN.0 | TraceMode::CACHE.0 {
            error!(mode = state.mode.0, "cache off rejected in current trace mode");
            return TraceErrorCode::WrongTraceMode;
        }
        if let Some(executor) = self.executor() {
            executor.stop_cache_trace_loop();
        }
        state.mode.clear(TraceMode::CACHE);
        info!("caching trace off");
        TraceErrorCode::Success
    }

    /// Stops all capture and resets the kernel nodes. Idempotent: closing
    /// an already-closed controller succeeds.
    pub fn close_trace(&self) -> TraceErrorCode {
        let inner = &self.inner;
        let mut state = inner.state.lock_or_panic();
        info!("close trace start");
        if state.mode.is_close() {
            info!("trace is already closed");
            return TraceErrorCode::Success;
        }
        if let Some(trace_fs) = state.tracefs.as_ref() {
            if let Err(err) = trace_fs.mark_clock_sync() {
                warn!(%err, "failed to write clock sync markers");
            }
        }
        if let Some(executor) = self.executor() {
            if state.mode.is_record_on() {
                executor.stop_dump_trace_loop();
            }
            if state.mode.is_cache_on() {
                executor.stop_cache_trace_loop();
            }
        }
        state.mode = TraceMode::CLOSE;
        if inner.registry.is_empty() {
            error!("empty tag registry");
            return TraceErrorCode::TagError;
        }
        if let Some(trace_fs) = state.tracefs.clone() {
            self.reset_trace_nodes(&trace_fs);
        }
        state.params.filter_pids.clear();
        self.publish_tag_flags(0);
        info!("close trace done");
        TraceErrorCode::Success
    }

    /// Directly toggles `tracing_on` without touching the mode machine.
    pub fn set_trace_status(&self, enable: bool) -> TraceErrorCode {
        let state = self.inner.state.lock_or_panic();
        let trace_fs = match state.tracefs.clone() {
            Some(trace_fs) => trace_fs,
            None => match self.detect_tracefs() {
                Some(trace_fs) => trace_fs,
                None => return TraceErrorCode::TraceNotSupported,
            },
        };
        if !trace_fs.set_node_enabled(TRACING_ON_NODE, enable) {
            return TraceErrorCode::WriteTraceInfoError;
        }
        TraceErrorCode::Success
    }

    // ---- internals ---------------------------------------------------

    fn detect_tracefs(&self) -> Option<TraceFs> {
        match &self.inner.opts.tracefs_root {
            Some(root) => {
                let trace_fs = TraceFs::from_root(root);
                trace_fs
                    .node_path(tracefs::TRACE_MARKER_NODE)
                    .exists()
                    .then_some(trace_fs)
            }
            None => TraceFs::detect(),
        }
    }

    fn executor(&self) -> Option<Arc<TraceDumpExecutor>> {
        self.inner.executor.lock_or_panic().clone()
    }

    fn publish_tag_flags(&self, bits: u64) {
        let path = self.inner.opts.trace_dir.join(TAG_FLAGS_FILE);
        if let Err(err) = std::fs::write(&path, bits.to_string()) {
            error!(path = %path.display(), %err, "failed to publish tag flags");
        }
    }

    fn read_tag_flags(&self) -> Option<u64> {
        let path = self.inner.opts.trace_dir.join(TAG_FLAGS_FILE);
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    /// Another controller rewriting the published tag flags or turning
    /// tracing off means ftrace is no longer ours.
    fn check_service_running(&self, state: &ControllerState) -> bool {
        let flags_match = self.read_tag_flags() == Some(state.init_tag_flags);
        if !flags_match {
            error!("published tag flags changed, trace is occupied");
            return false;
        }
        match state.tracefs.as_ref() {
            Some(trace_fs) => trace_fs.is_tracing_on(),
            None => false,
        }
    }

    fn check_dump_status(
        state: &ControllerState,
        max_duration_s: u32,
    ) -> Result<(), TraceErrorCode> {
        if !state.mode.is_open() || state.mode.is_record_on() {
            error!(mode = state.mode.0, "dump rejected in current trace mode");
            return Err(TraceErrorCode::WrongTraceMode);
        }
        if max_duration_s == u32::MAX {
            error!("invalid max duration");
            return Err(TraceErrorCode::InvalidMaxDuration);
        }
        Ok(())
    }

    fn verify_service_or(&self, state: &ControllerState) -> Result<(), TraceErrorCode> {
        if !self.check_service_running(state) {
            return Err(TraceErrorCode::TraceIsOccupied);
        }
        Ok(())
    }

    /// Kernel node settings applied at open, grounded in the capture
    /// bring-up sequence of the original engine.
    fn apply_trace_settings(
        &self,
        trace_fs: &TraceFs,
        params: &TraceParams,
        enable_paths: &[String],
    ) {
        // Close every kernel tag node first so only the requested set is
        // active.
        for tag in self.inner.registry.tags.values() {
            for path in &tag.enable_paths {
                trace_fs.set_node_enabled(path, false);
            }
        }
        self.publish_tag_flags(0);
        write_node_logged(trace_fs, BUFFER_SIZE_NODE, "1");
        trace_fs.set_node_enabled(TRACING_ON_NODE, false);
        trace_fs.truncate_node(TRACE_NODE);

        for path in enable_paths {
            trace_fs.set_node_enabled(path, true);
        }

        write_node_logged(trace_fs, "current_tracer", "nop");
        let buffer_kb = params
            .buffer_size_kb
            .unwrap_or(self.inner.registry.snapshot_default_buffer_kb);
        write_node_logged(trace_fs, BUFFER_SIZE_NODE, &buffer_kb.to_string());
        set_clock(trace_fs, &params.clock_type);
        write_node_logged(
            trace_fs,
            "options/overwrite",
            if params.overwrite { "1" } else { "0" },
        );
        write_node_logged(
            trace_fs,
            "saved_cmdlines_size",
            &SAVED_CMDLINES_SIZE.to_string(),
        );
        write_node_logged(trace_fs, "options/record-tgid", "1");
        write_node_logged(trace_fs, "options/record-cmd", "1");
        if !params.filter_pids.is_empty() {
            trace_fs.truncate_node("trace_pipe_raw");
        }
    }

    fn reset_trace_nodes(&self, trace_fs: &TraceFs) {
        for tag in self.inner.registry.tags.values() {
            for path in &tag.enable_paths {
                trace_fs.set_node_enabled(path, false);
            }
        }
        write_node_logged(trace_fs, BUFFER_SIZE_NODE, "1");
        trace_fs.set_node_enabled(TRACING_ON_NODE, false);
        trace_fs.truncate_node(TRACE_NODE);
    }

    fn set_dest_trace_time_and_duration(
        state: &mut ControllerState,
        max_duration_s: u32,
        ut_end_time_s: u64,
    ) {
        state.dest_end_ut_s = if ut_end_time_s == 0 {
            time::unix_time_s()
        } else {
            ut_end_time_s
        };
        let max_duration_s = if max_duration_s == 0 || max_duration_s == u32::MAX {
            DEFAULT_FULL_TRACE_LENGTH_S
        } else {
            max_duration_s as u64
        };
        state.dest_start_ut_s = if state.dest_end_ut_s <= max_duration_s {
            // Theoretical lower bound, kept above zero so the tolerance
            // subtraction cannot wrap.
            1
        } else {
            state.dest_end_ut_s - max_duration_s
        };
        info!(
            dest_start = state.dest_start_ut_s,
            dest_end = state.dest_end_ut_s,
            "snapshot target window"
        );
    }

    /// Maps the caller-facing Unix window onto the ftrace boot clock.
    fn set_time_interval_boundary(
        state: &mut ControllerState,
        max_duration_s: u32,
        ut_end_time_s: u64,
    ) -> TraceErrorCode {
        let ut_now = time::unix_time_s();
        let mut ut_end = ut_end_time_s;
        if ut_end >= ut_now {
            warn!("trace end time is later than now, clamping to now");
            ut_end = 0;
        }
        let boot_ns = time::boot_time_ns();
        let boot_now_s = boot_ns / S_TO_NS + u64::from(boot_ns % S_TO_NS != 0);
        let ut_boot_time = ut_now.saturating_sub(boot_now_s);
        if ut_end == 0 {
            state.trace_end_ns = boot_ns;
        } else if ut_end > ut_boot_time {
            // Input has whole-second precision: allow one second of
            // tolerance at the end of the window.
            state.trace_end_ns = (ut_end - ut_boot_time + 1) * S_TO_NS;
        } else {
            error!(ut_end, ut_boot_time, "trace end time predates boot");
            return TraceErrorCode::OutOfTime;
        }

        let mut max_duration_s = if max_duration_s > 0 {
            max_duration_s as u64 + 1
        } else {
            0
        };
        if max_duration_s > state.trace_end_ns / S_TO_NS {
            warn!("max duration reaches past boot, capturing from boot");
            max_duration_s = 0;
        }
        state.trace_start_ns = if max_duration_s > 0 {
            state.trace_end_ns - max_duration_s * S_TO_NS
        } else {
            0
        };
        TraceErrorCode::Success
    }

    fn restore_time_interval_boundary(state: &mut ControllerState) {
        state.trace_start_ns = 0;
        state.trace_end_ns = u64::MAX;
    }

    /// Collects the published files overlapping the target window and sums
    /// the covered duration (with the input tolerance applied).
    fn trace_files_in_window(
        state: &ControllerState,
        files: &[TraceFileInfo],
        targets: &mut Vec<TraceFileInfo>,
    ) -> i64 {
        let target_start_ms = state.dest_start_ut_s * S_TO_MS;
        let target_end_ms = state.dest_end_ut_s * S_TO_MS;
        let mut cover_ms: i64 = 0;
        for info in files {
            if !info.filename.exists() {
                warn!(file = %info.filename.display(), "published file no longer exists");
                continue;
            }
            let overlaps = info.trace_end_ut_ms >= target_start_ms
                && info.trace_start_ut_ms <= target_end_ms;
            let sane_span =
                info.trace_end_ut_ms.saturating_sub(info.trace_start_ut_ms) < MAX_TRACE_FILE_SPAN_MS;
            if overlaps && sane_span {
                targets.push(info.clone());
                let upper = info
                    .trace_end_ut_ms
                    .min(target_end_ms + DURATION_TOLERANCE_MS);
                let lower = info
                    .trace_start_ut_ms
                    .max(target_start_ms.saturating_sub(DURATION_TOLERANCE_MS));
                cover_ms += upper.saturating_sub(lower) as i64;
            }
        }
        cover_ms
    }

    fn search_trace_files(&self, state: &mut ControllerState, ret: &mut TraceRetInfo) {
        let mut targets = Vec::new();
        let mut cover_ms = Self::trace_files_in_window(state, &state.trace_files, &mut targets);
        if let Some(executor) = self.executor() {
            let cache_files = executor.cache_trace_files();
            cover_ms += Self::trace_files_in_window(state, &cache_files, &mut targets);
        }
        for mut info in targets {
            let is_cache = info
                .filename
                .file_name()
                .map(|n| n.to_string_lossy().starts_with(CACHE_FILE_PREFIX))
                .unwrap_or(false);
            if is_cache {
                info.filename = file_utils::rename_cache_file(&info.filename);
                state.trace_files.push(info.clone());
            }
            ret.file_size += info.file_size;
            ret.output_files.push(info.filename);
        }
        ret.cover_duration_ms += cover_ms;
    }

    fn get_file_in_cache(&self, state: &mut ControllerState, ret: &mut TraceRetInfo) {
        info!("trace is caching, harvesting cache files");
        self.search_trace_files(state, ret);
        if ret.output_files.is_empty() {
            error!("cache is on but no slice covers the target window");
            ret.error_code = TraceErrorCode::OutOfTime;
        } else {
            ret.error_code = TraceErrorCode::Success;
        }
    }

    fn load_dump_ret(state: &ControllerState, ret: &mut TraceRetInfo, committed_duration_s: i64) {
        ret.mode = state.mode;
        let committed = committed_duration_s.max(1);
        ret.cover_ratio = ret.cover_duration_ms / committed;
        ret.tags = state
            .params
            .tag_groups
            .iter()
            .chain(state.params.tags.iter())
            .cloned()
            .collect();
    }

    fn sanitize_ret_info(ret: &mut TraceRetInfo) {
        ret.cover_duration_ms = ret
            .cover_duration_ms
            .min((DEFAULT_FULL_TRACE_LENGTH_S * S_TO_MS) as i64);
        ret.cover_ratio = ret.cover_ratio.min(MAX_RATIO_UNIT);
    }

    fn worker_binary(&self) -> PathBuf {
        if let Some(path) = &self.inner.opts.worker_binary {
            return path.clone();
        }
        std::env::current_exe()
            .map(|exe| exe.with_file_name("trace-dump-worker"))
            .unwrap_or_else(|_| PathBuf::from("trace-dump-worker"))
    }

    fn tracefs_root_arg(&self, state: &ControllerState) -> PathBuf {
        state
            .tracefs
            .as_ref()
            .map(|fs| fs.root().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(tracefs::TRACEFS_DIR))
    }

    /// Snapshot policy: free-space gate, then a short-lived worker process
    /// whose single result record is awaited over a pipe for up to ten
    /// seconds.
    fn process_dump_sync(
        &self,
        state: &mut ControllerState,
        ret: &mut TraceRetInfo,
    ) -> TraceErrorCode {
        if let Err(code) = self.verify_service_or(state) {
            return code;
        }
        let task_count = self
            .executor()
            .map(|executor| executor.trace_dump_task_count() as u64)
            .unwrap_or(0);
        let required = self.inner.opts.min_free_space + task_count * DEFAULT_ASYNC_TRACE_SIZE;
        if tracefs::remaining_space(&self.inner.opts.trace_dir) <= required {
            error!(required, "not enough disk space for a snapshot dump");
            return TraceErrorCode::FileError;
        }
        if let Some(trace_fs) = state.tracefs.as_ref() {
            if let Err(err) = trace_fs.mark_clock_sync() {
                warn!(%err, "failed to write clock sync markers");
            }
        }

        let mut child = match Command::new(self.worker_binary())
            .arg("single")
            .arg("--tracefs")
            .arg(self.tracefs_root_arg(state))
            .arg("--dir")
            .arg(&self.inner.opts.trace_dir)
            .arg("--start-ns")
            .arg(state.trace_start_ns.to_string())
            .arg("--end-ns")
            .arg(state.trace_end_ns.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                error!(%err, "failed to spawn dump worker");
                return TraceErrorCode::ForkError;
            }
        };
        let pid = Pid::from_raw(child.id() as i32);
        let Some(mut stdout) = child.stdout.take() else {
            signal_and_reap(pid, CHILD_REAP_WAIT);
            return TraceErrorCode::PipeCreateError;
        };

        let ready = match Epoll::new().and_then(|epoll| {
            epoll.add_reader(stdout.as_raw_fd())?;
            let mut ready = false;
            for _ in 0..SYNC_DUMP_WAIT_RETRIES {
                if epoll.wait_readable(1000)? {
                    ready = true;
                    break;
                }
            }
            Ok(ready)
        }) {
            Ok(ready) => ready,
            Err(err) => {
                error!(%err, "epoll wait on dump worker failed");
                signal_and_reap(pid, CHILD_REAP_WAIT);
                return TraceErrorCode::EpollWaitError;
            }
        };
        if !ready {
            error!(?pid, "dump worker timed out, killing it");
            signal_and_reap(pid, CHILD_REAP_WAIT);
            return TraceErrorCode::EpollWaitError;
        }

        let mut record = vec![0u8; RET_RECORD_SIZE];
        let dump_ret = match read_full(&mut stdout, &mut record) {
            Ok(n) if n == RET_RECORD_SIZE => decode_ret(&record),
            Ok(n) => {
                error!(read = n, "short dump result record");
                None
            }
            Err(err) => {
                error!(%err, "failed to read dump result record");
                None
            }
        };
        wait_for_child(pid, CHILD_REAP_WAIT);
        let Some(dump_ret) = dump_ret else {
            return TraceErrorCode::FileError;
        };
        info!(
            code = ?dump_ret.code,
            file = %dump_ret.output_file,
            "dump worker result received"
        );
        state.first_page_ns = dump_ret.first_page_ns;
        state.last_page_ns = dump_ret.last_page_ns;
        self.handle_dump_result(state, &dump_ret, ret)
    }

    fn handle_dump_result(
        &self,
        state: &mut ControllerState,
        dump_ret: &crate::types::TraceDumpRet,
        ret: &mut TraceRetInfo,
    ) -> TraceErrorCode {
        self.search_trace_files(state, ret);
        let out_path = PathBuf::from(&dump_ret.output_file);
        if dump_ret.code != TraceErrorCode::Success {
            match std::fs::remove_file(&out_path) {
                Ok(()) => info!(file = %out_path.display(), "removed failed dump output"),
                Err(err) => warn!(file = %out_path.display(), %err, "failed to remove dump output"),
            }
        } else if !out_path.exists() {
            error!(file = %out_path.display(), "dump output went missing");
        } else {
            match file_utils::set_file_info(
                true,
                &out_path,
                state.first_page_ns,
                state.last_page_ns,
            ) {
                Some(info) => {
                    ret.cover_duration_ms +=
                        (info.trace_end_ut_ms - info.trace_start_ut_ms) as i64;
                    ret.file_size += info.file_size;
                    ret.output_files.push(info.filename.clone());
                    state.trace_files.push(info);
                }
                None => {
                    error!(file = %out_path.display(), "failed to publish dump output");
                    file_utils::remove_file(&out_path);
                }
            }
        }

        if ret.output_files.is_empty() {
            if dump_ret.code != TraceErrorCode::Success && dump_ret.code != TraceErrorCode::Unset {
                dump_ret.code
            } else {
                TraceErrorCode::FileError
            }
        } else {
            TraceErrorCode::Success
        }
    }

    /// Async policy: reuse the live worker when it has queued work,
    /// otherwise recreate the FIFOs and spawn a fresh one, then submit and
    /// wait for the trace-drained stage.
    fn process_dump_async(
        &self,
        state: &mut ControllerState,
        task_id: u64,
        file_size_limit: u64,
        ret: &mut TraceRetInfo,
    ) -> TraceErrorCode {
        if let Err(code) = self.verify_service_or(state) {
            return code;
        }
        let Some(executor) = self.executor() else {
            return TraceErrorCode::FileError;
        };
        let task_count = executor.trace_dump_task_count() as u64;
        let required = self.inner.opts.min_free_space + task_count * DEFAULT_ASYNC_TRACE_SIZE;
        if tracefs::remaining_space(&self.inner.opts.trace_dir) <= required {
            error!(required, "not enough disk space for an async dump");
            return TraceErrorCode::FileError;
        }
        if let Some(trace_fs) = state.tracefs.as_ref() {
            if let Err(err) = trace_fs.mark_clock_sync() {
                warn!(%err, "failed to write clock sync markers");
            }
        }

        let task = TraceDumpTask::new(
            task_id,
            state.trace_start_ns,
            state.trace_end_ns,
            file_size_limit,
        );
        info!(task_id, "new async dump task");
        let worker_alive = self.reap_or_alive();
        if !(worker_alive && task_count > 0) {
            TraceDumpPipe::clear(&self.inner.opts.trace_dir);
            if let Err(err) = TraceDumpPipe::init(&self.inner.opts.trace_dir) {
                error!(%err, "failed to create dump pipes");
                return TraceErrorCode::PipeCreateError;
            }
            match Command::new(self.worker_binary())
                .arg("monitor")
                .arg("--tracefs")
                .arg(self.tracefs_root_arg(state))
                .arg("--dir")
                .arg(&self.inner.opts.trace_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => {
                    self.inner
                        .worker_pid
                        .store(child.id() as i32, Ordering::SeqCst);
                }
                Err(err) => {
                    error!(%err, "failed to spawn async dump worker");
                    return TraceErrorCode::ForkError;
                }
            }
        }
        self.submit_task_and_wait_return(state, executor, task, ret)
    }

    fn submit_task_and_wait_return(
        &self,
        state: &mut ControllerState,
        executor: Arc<TraceDumpExecutor>,
        task: TraceDumpTask,
        ret: &mut TraceRetInfo,
    ) -> TraceErrorCode {
        executor.add_trace_dump_task(task.clone());
        let mut pipe = match TraceDumpPipe::controller(&self.inner.opts.trace_dir) {
            Ok(pipe) => pipe,
            Err(err) => {
                error!(%err, "failed to open dump pipes");
                executor.remove_trace_dump_task(task.task_id);
                return TraceErrorCode::PipeCreateError;
            }
        };
        if !pipe.submit_trace_dump_task(&task) {
            executor.remove_trace_dump_task(task.task_id);
            return TraceErrorCode::TraceTaskSubmitError;
        }
        let Some(sync_ret) = pipe.read_sync_dump_ret(ASYNC_SYNC_RET_WAIT) else {
            error!("async dump sync return timed out, clearing tasks");
            executor.clear_trace_dump_task();
            let pid = self.inner.worker_pid.swap(-1, Ordering::SeqCst);
            if pid > 0 {
                signal_and_reap(Pid::from_raw(pid), CHILD_REAP_WAIT);
            }
            return TraceErrorCode::TraceTaskDumpTimeout;
        };

        state.first_page_ns = sync_ret.first_page_ns;
        state.last_page_ns = sync_ret.last_page_ns;
        executor.update_trace_dump_task(&sync_ret);

        if sync_ret.status == TraceDumpStatus::ReadDone
            && sync_ret.code == TraceErrorCode::Success
        {
            // Trace drained; file serialization continues in the worker.
            self.search_trace_files(state, ret);
            self.start_async_wait_loop();
            TraceErrorCode::AsyncDump
        } else {
            // The task died at the read stage.
            executor.remove_trace_dump_task(sync_ret.task_id);
            self.search_trace_files(state, ret);
            if ret.output_files.is_empty() {
                sync_ret.code
            } else {
                TraceErrorCode::Success
            }
        }
    }

    /// Reaps the async worker if it exited and reports whether it is still
    /// alive.
    fn reap_or_alive(&self) -> bool {
        let pid = self.inner.worker_pid.load(Ordering::SeqCst);
        if pid <= 0 {
            return false;
        }
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(_) => {
                self.inner.worker_pid.store(-1, Ordering::SeqCst);
                false
            }
            Err(_) => libkt_common::unix::process_exists(Pid::from_raw(pid)),
        }
    }

    fn start_async_wait_loop(&self) {
        if self.inner.async_wait_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let controller = self.clone();
        if let Err(err) = std::thread::Builder::new()
            .name("AsyncWaitRet".into())
            .spawn(move || controller.wait_async_dump_ret_loop())
        {
            error!(%err, "failed to spawn async wait thread");
            self.inner.async_wait_running.store(false, Ordering::SeqCst);
        }
    }

    /// Drains the async-return FIFO: publishes finished files, invokes the
    /// registered callbacks and drops the bookkeeping. Exits after three
    /// idle minutes or once the worker is gone.
    fn wait_async_dump_ret_loop(&self) {
        info!("async wait loop start");
        let mut pipe = match TraceDumpPipe::controller(&self.inner.opts.trace_dir) {
            Ok(pipe) => pipe,
            Err(err) => {
                error!(%err, "async wait loop cannot open pipes");
                self.inner.async_wait_running.store(false, Ordering::SeqCst);
                return;
            }
        };
        let mut empty_loops = 0u32;
        loop {
            if empty_loops >= ASYNC_WAIT_EMPTY_LOOP_COUNT || !self.reap_or_alive() {
                info!("async task queue idle or worker gone, winding down");
                self.inner.worker_pid.store(-1, Ordering::SeqCst);
                if let Some(executor) = self.executor() {
                    executor.clear_trace_dump_task();
                }
                TraceDumpPipe::clear(&self.inner.opts.trace_dir);
                break;
            }
            let Some(task) = pipe.read_async_dump_ret(Duration::from_secs(1)) else {
                empty_loops += 1;
                continue;
            };
            empty_loops = 0;
            if task.status == TraceDumpStatus::WriteDone {
                self.finish_async_task(&task);
            } else {
                error!(task_id = task.task_id, status = ?task.status, "unexpected async return");
            }
            if let Some(executor) = self.executor() {
                executor.remove_trace_dump_task(task.task_id);
            }
        }
        self.inner.async_wait_running.store(false, Ordering::SeqCst);
        info!("async wait loop exit");
    }

    fn finish_async_task(&self, task: &TraceDumpTask) {
        let (mut ret, callback) = {
            let mut book = self.inner.async_book.lock_or_panic();
            (
                book.ret_infos.remove(&task.task_id).unwrap_or_default(),
                book.callbacks.remove(&task.task_id).flatten(),
            )
        };
        if task.code == TraceErrorCode::Success {
            let mut state = self.inner.state.lock_or_panic();
            let out_path = PathBuf::from(&task.output_file);
            if let Some(mut info) = file_utils::set_file_info(
                false,
                &out_path,
                task.first_page_ns,
                task.last_page_ns,
            ) {
                info.file_size = task.file_size;
                ret.cover_duration_ms += (info.trace_end_ut_ms - info.trace_start_ut_ms) as i64;
                ret.output_files.push(info.filename.clone());
                state.trace_files.push(info);
            }
            ret.error_code = TraceErrorCode::Success;
        } else if ret.output_files.is_empty() {
            ret.error_code = task.code;
        }
        ret.file_size = ret
            .output_files
            .iter()
            .map(|file| file_utils::file_size(file))
            .sum();
        if task.is_file_size_over_limit
            || (task.file_size_limit > 0 && ret.file_size > task.file_size_limit)
        {
            ret.is_overflow_control = true;
        }
        Self::sanitize_ret_info(&mut ret);
        if let Some(callback) = callback {
            info!(task_id = task.task_id, "invoking async dump callback");
            callback(ret);
        }
    }

    /// Linux-only background thread that periodically rebalances the
    /// per-CPU ring buffers by their observed byte rates.
    fn start_cpu_buffer_balancer(&self) {
        if !self.inner.opts.enable_cpu_balancer {
            return;
        }
        {
            let state = self.inner.state.lock_or_panic();
            if state.flavor == KernelFlavor::Hm {
                return;
            }
        }
        if self.inner.balancer_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let controller = self.clone();
        if let Err(err) = std::thread::Builder::new()
            .name("CpuBufferBalancer".into())
            .spawn(move || controller.cpu_buffer_balance_loop())
        {
            error!(%err, "failed to spawn cpu buffer balancer");
            self.inner.balancer_running.store(false, Ordering::SeqCst);
        }
    }

    fn cpu_buffer_balance_loop(&self) {
        info!("cpu buffer balancer start");
        loop {
            std::thread::sleep(BALANCER_INTERVAL);
            let trace_fs = {
                let state = self.inner.state.lock_or_panic();
                if !state.mode.is_open() || !self.check_service_running(&state) {
                    break;
                }
                state.tracefs.clone()
            };
            let Some(trace_fs) = trace_fs else { break };
            let cpu_count = tracefs::cpu_processors();
            let mut dynamic = balancer::DynamicBuffer::new(trace_fs.clone(), cpu_count);
            let sizes = dynamic.calculate_buffer_size();
            if sizes.len() != cpu_count {
                error!("buffer size calculation failed");
                break;
            }
            for (cpu, size_kb) in sizes.iter().enumerate() {
                let node = TraceFs::per_cpu_node(cpu, BUFFER_SIZE_NODE);
                write_node_logged(&trace_fs, &node, &size_kb.to_string());
            }
        }
        self.inner.balancer_running.store(false, Ordering::SeqCst);
        info!("cpu buffer balancer exit");
    }
}

/// Waits briefly until a freshly spawned loop thread has taken ownership of
/// the session, so an immediate stop cannot slip in before it starts.
fn wait_loop_session_started(executor: &Arc<TraceDumpExecutor>) {
    for _ in 0..50 {
        if !executor.pre_check_dump_trace_loop_status() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    warn!("loop thread did not take over the session in time");
}

fn write_node_logged(trace_fs: &TraceFs, node: &str, value: &str) {
    if let Err(err) = trace_fs.write_node(node, value) {
        error!(node, %err, "failed to write trace node");
    }
}

/// Applies the requested trace clock, falling back to `boot` when the
/// kernel does not offer the requested source.
fn set_clock(trace_fs: &TraceFs, clock_type: &str) {
    let desired = if clock_type.is_empty() {
        "boot"
    } else {
        clock_type
    };
    let all_clocks = match trace_fs.read_node("trace_clock") {
        Ok(all_clocks) => all_clocks,
        Err(err) => {
            error!(%err, "failed to read trace_clock");
            return;
        }
    };
    if all_clocks
        .split_whitespace()
        .any(|clock| clock == format!("[{desired}]"))
    {
        // Already selected.
        return;
    }
    if all_clocks.split_whitespace().any(|clock| clock == desired) {
        write_node_logged(trace_fs, "trace_clock", desired);
        return;
    }
    warn!(desired, "clock source not offered, defaulting to boot");
    write_node_logged(trace_fs, "trace_clock", "boot");
}
