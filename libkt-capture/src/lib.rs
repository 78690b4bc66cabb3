// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! System-wide kernel trace capture engine on top of the Linux ftrace
//! subsystem.
//!
//! The crate exposes three capture modes through [`TraceController`]:
//!
//! - **snapshot** — a one-shot dump covering the recent past, produced by a
//!   short-lived worker process;
//! - **recording** — continuous rotation of fixed-size output files driven by
//!   a thread in the controller process;
//! - **cache** — a recording loop whose slices are kept as a ring of recent
//!   segments and harvested on demand by a snapshot call.
//!
//! Asynchronous snapshots are served by a single long-lived worker process
//! (`trace-dump-worker`) that decouples reading the kernel ring buffer from
//! writing the output file over a bounded block pool, talking to the
//! controller over three named pipes.
//!
//! Captured data is written as a versioned container file: a file header
//! followed by typed, length-prefixed segments (event formats, per-CPU raw
//! pages, saved cmdlines/tgids, printk formats, base info) that can be parsed
//! offline.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod file_utils;
pub mod pipe;
pub mod source;
pub mod types;

pub use config::{TagKind, TagRegistry, TraceParams, TraceTag};
pub use controller::{ControllerOptions, TraceController};
pub use error::TraceErrorCode;
pub use types::{TraceDumpType, TraceMode, TraceRetInfo};
