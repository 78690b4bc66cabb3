// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The error taxonomy surfaced at the public API boundary. Every entry point
//! returns one of these codes inside a structured result; nothing panics
//! across the crate boundary.

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error,
)]
#[repr(u8)]
pub enum TraceErrorCode {
    #[error("success")]
    Success = 0,
    /// Sentinel for "no status recorded yet".
    #[default]
    #[error("unset")]
    Unset = 1,
    #[error("tracefs is not mounted")]
    TraceNotSupported = 2,
    #[error("unknown tag or tag group, or empty tag registry")]
    TagError = 3,
    #[error("trace file error")]
    FileError = 4,
    #[error("illegal trace mode transition")]
    WrongTraceMode = 5,
    #[error("ftrace is owned by another controller")]
    TraceIsOccupied = 6,
    #[error("requested time window yielded no trace pages")]
    OutOfTime = 7,
    #[error("invalid max duration")]
    InvalidMaxDuration = 8,
    #[error("failed to create pipe")]
    PipeCreateError = 9,
    #[error("failed to fork dump process")]
    ForkError = 10,
    #[error("epoll wait failed or timed out")]
    EpollWaitError = 11,
    #[error("failed to submit trace dump task")]
    TraceTaskSubmitError = 12,
    #[error("trace dump task timed out")]
    TraceTaskDumpTimeout = 13,
    /// Not a failure: the result is deferred to the async callback.
    #[error("result deferred to async callback")]
    AsyncDump = 14,
    #[error("failed to write trace info")]
    WriteTraceInfoError = 15,
}

impl TraceErrorCode {
    pub fn is_success(self) -> bool {
        self == TraceErrorCode::Success
    }

    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        use TraceErrorCode::*;
        Some(match value {
            0 => Success,
            1 => Unset,
            2 => TraceNotSupported,
            3 => TagError,
            4 => FileError,
            5 => WrongTraceMode,
            6 => TraceIsOccupied,
            7 => OutOfTime,
            8 => InvalidMaxDuration,
            9 => PipeCreateError,
            10 => ForkError,
            11 => EpollWaitError,
            12 => TraceTaskSubmitError,
            13 => TraceTaskDumpTimeout,
            14 => AsyncDump,
            15 => WriteTraceInfoError,
            _ => return None,
        })
    }
}
