// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-CPU ring-buffer rebalancing. Busy CPUs lose history faster than idle
//! ones under a uniform buffer split, so a fixed expansion pool is
//! redistributed proportionally to each CPU's squared byte rate.

use tracing::{debug, error};

use libkt_common::tracefs::TraceFs;

/// Expansion pool granted per CPU when any CPU is loaded, KiB.
const EXPANSION_SIZE_KB: u64 = 6 * 1024;
/// Byte rate above which the expansion pool is unlocked, bytes/second.
const LOW_THRESHOLD: f64 = 400.0 * 1024.0;
/// Unconditional per-CPU base, KiB.
const BASE_SIZE_KB: u64 = 12 * 1024;
/// tracefs accepts buffer sizes in 4 KiB page granularity.
const PAGE_KB: u64 = 4;

#[derive(Debug, Default, Clone)]
struct TraceStatsInfo {
    oldest_ts: f64,
    now_ts: f64,
    bytes: f64,
    average: f64,
    /// Squared average: the load weight used for distribution.
    freq: f64,
}

/// One balancing round's view of the per-CPU ring buffers.
pub(crate) struct DynamicBuffer {
    tracefs: TraceFs,
    cpu_nums: usize,
    stats: Vec<TraceStatsInfo>,
    total_load: f64,
    max_average: f64,
}

impl DynamicBuffer {
    pub(crate) fn new(tracefs: TraceFs, cpu_nums: usize) -> Self {
        Self {
            tracefs,
            cpu_nums,
            stats: Vec::new(),
            total_load: 0.0,
            max_average: 0.0,
        }
    }

    fn per_cpu_stats(&self, cpu: usize) -> Option<TraceStatsInfo> {
        let node = TraceFs::per_cpu_node(cpu, "stats");
        let contents = match self.tracefs.read_node(&node) {
            Ok(contents) => contents,
            Err(err) => {
                error!(cpu, %err, "failed to read per-cpu stats");
                return None;
            }
        };
        let mut info = TraceStatsInfo::default();
        for line in contents.lines() {
            if let Some(value) = line.strip_prefix("oldest event ts: ") {
                info.oldest_ts = value.trim().parse().unwrap_or(0.0);
            } else if let Some(value) = line.strip_prefix("now ts: ") {
                info.now_ts = value.trim().parse().unwrap_or(0.0);
            } else if let Some(value) = line.strip_prefix("bytes: ") {
                info.bytes = value.trim().parse().unwrap_or(0.0);
            }
        }
        Some(info)
    }

    fn update_trace_load(&mut self) -> bool {
        self.stats.clear();
        self.total_load = 0.0;
        self.max_average = 0.0;
        for cpu in 0..self.cpu_nums {
            let Some(mut info) = self.per_cpu_stats(cpu) else {
                return false;
            };
            let duration = (info.now_ts - info.oldest_ts).floor();
            if duration <= 0.0 {
                error!(
                    cpu,
                    now_ts = info.now_ts,
                    oldest_ts = info.oldest_ts,
                    "degenerate stats window"
                );
                return false;
            }
            info.average = info.bytes / duration;
            self.max_average = self.max_average.max(info.average);
            info.freq = info.average * info.average;
            self.total_load += info.freq;
            self.stats.push(info);
        }
        true
    }

    /// New per-CPU buffer sizes in KiB, one entry per CPU, rounded down to
    /// the tracefs page granularity. Empty when the stats are unusable.
    pub(crate) fn calculate_buffer_size(&mut self) -> Vec<u64> {
        if !self.update_trace_load() || self.stats.len() != self.cpu_nums {
            return Vec::new();
        }
        let total_bonus = if self.max_average > LOW_THRESHOLD {
            EXPANSION_SIZE_KB * self.cpu_nums as u64
        } else {
            0
        };
        self.stats
            .iter()
            .map(|info| {
                let share = if self.total_load > 0.0 {
                    ((info.freq / self.total_load) * total_bonus as f64).floor() as u64
                } else {
                    0
                };
                let new_size = BASE_SIZE_KB + share;
                debug!(new_size, "balanced cpu buffer size");
                new_size / PAGE_KB * PAGE_KB
            })
            .collect()
    }
}
