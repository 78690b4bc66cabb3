// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dump-worker process entry point.
//!
//! `trace-dump-worker single --tracefs <root> --dir <dir> --start-ns <ns>
//! --end-ns <ns>` runs one snapshot dump and writes the result record to
//! stdout for the controller's epoll wait.
//!
//! `trace-dump-worker monitor --tracefs <root> --dir <dir>` runs the
//! long-lived async worker serving tasks over the dump-pipe FIFOs.
//!
//! SIGUSR1 is the controller's cooperative kill: the process exits
//! immediately and cleanly.

use anyhow::{bail, Context};
use std::path::PathBuf;

use libkt_capture::executor::worker::{run_monitor, run_single_dump, WorkerOptions};

extern "C" fn exit_on_sigusr1(_signum: libc::c_int) {
    // SAFETY: _exit is async-signal-safe.
    unsafe { libc::_exit(0) };
}

struct Args {
    mode: String,
    tracefs_root: PathBuf,
    trace_dir: PathBuf,
    start_ns: u64,
    end_ns: u64,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut argv = std::env::args().skip(1);
    let mode = argv.next().context("missing mode (single|monitor)")?;
    let mut tracefs_root = None;
    let mut trace_dir = None;
    let mut start_ns = 0u64;
    let mut end_ns = u64::MAX;
    while let Some(flag) = argv.next() {
        let value = argv
            .next()
            .with_context(|| format!("missing value for {flag}"))?;
        match flag.as_str() {
            "--tracefs" => tracefs_root = Some(PathBuf::from(value)),
            "--dir" => trace_dir = Some(PathBuf::from(value)),
            "--start-ns" => start_ns = value.parse().context("bad --start-ns")?,
            "--end-ns" => end_ns = value.parse().context("bad --end-ns")?,
            _ => bail!("unknown flag {flag}"),
        }
    }
    Ok(Args {
        mode,
        tracefs_root: tracefs_root.context("missing --tracefs")?,
        trace_dir: trace_dir.context("missing --dir")?,
        start_ns,
        end_ns,
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // SAFETY: installing a handler that only calls _exit.
    unsafe { libc::signal(libc::SIGUSR1, exit_on_sigusr1 as libc::sighandler_t) };

    let args = parse_args()?;
    let opts = WorkerOptions {
        tracefs_root: args.tracefs_root,
        trace_dir: args.trace_dir,
    };
    match args.mode.as_str() {
        "single" => run_single_dump(&opts, args.start_ns, args.end_ns),
        "monitor" => run_monitor(&opts),
        other => bail!("unknown mode {other}"),
    }
}
