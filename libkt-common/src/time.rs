// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Clock helpers for the two time domains carried through a capture: the
//! ftrace page clock (`CLOCK_BOOTTIME` nanoseconds) and Unix wall time in
//! milliseconds, plus the conversion between them via the wall−boot offset
//! sampled at call time.

use std::time::{SystemTime, UNIX_EPOCH};

pub const S_TO_NS: u64 = 1_000_000_000;
pub const MS_TO_NS: u64 = 1_000_000;
pub const S_TO_MS: u64 = 1_000;

fn clock_gettime_ns(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer; the clock ids used here are always available on Linux.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64).saturating_mul(S_TO_NS) + ts.tv_nsec as u64
}

/// Nanoseconds on `CLOCK_BOOTTIME`, the default ftrace page clock.
pub fn boot_time_ns() -> u64 {
    clock_gettime_ns(libc::CLOCK_BOOTTIME)
}

/// Nanoseconds on `CLOCK_MONOTONIC`.
pub fn monotonic_time_ns() -> u64 {
    clock_gettime_ns(libc::CLOCK_MONOTONIC)
}

/// Nanoseconds on `CLOCK_REALTIME`.
pub fn realtime_ns() -> u64 {
    clock_gettime_ns(libc::CLOCK_REALTIME)
}

/// Current Unix time in whole seconds.
pub fn unix_time_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current Unix time in milliseconds.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Converts a boot-clocked page timestamp (ns) into Unix milliseconds using
/// the wall−boot offset sampled now. The offset drifts only across
/// suspend/clock-set events, so sampling at conversion time matches what the
/// rest of the system observes.
pub fn boot_ns_to_unix_ms(page_time_ns: u64) -> u64 {
    let bt_now_ms = boot_time_ns() / MS_TO_NS;
    let ut_now_ms = unix_time_s() * S_TO_MS;
    ut_now_ms.saturating_sub(bt_now_ms) + page_time_ns / MS_TO_NS
}
