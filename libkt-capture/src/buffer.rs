// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, sharded block pool feeding the producer/consumer pair inside the
//! asynchronous dump worker. The read thread is the only producer of blocks
//! and the write thread the only consumer, so block contents need no locking
//! on the hot path; the rw-lock guards only map reshaping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, warn};

use libkt_common::MutexExt;

pub const DEFAULT_BLOCK_SZ: usize = 10 * 1024 * 1024; // 10 MiB
pub const DEFAULT_MAX_TOTAL_SZ: usize = 300 * 1024 * 1024; // 300 MiB

/// Append-only byte block bound to one CPU. Single-writer by construction:
/// one CPU maps to one block slot at a time inside the read thread.
#[derive(Debug)]
pub struct BufferBlock {
    pub cpu: usize,
    data: Vec<u8>,
    used_bytes: usize,
}

impl BufferBlock {
    fn new(cpu: usize, size: usize) -> Self {
        Self {
            cpu,
            data: vec![0; size],
            used_bytes: 0,
        }
    }

    pub fn free_bytes(&self) -> usize {
        self.data.len() - self.used_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Copies `src` after the last appended byte. Fails when the block
    /// cannot hold the data; the caller is expected to allocate a new block.
    pub fn append(&mut self, src: &[u8]) -> bool {
        if self.free_bytes() < src.len() {
            error!(
                cpu = self.cpu,
                free = self.free_bytes(),
                len = src.len(),
                "cannot append more data to block"
            );
            return false;
        }
        self.data[self.used_bytes..self.used_bytes + src.len()].copy_from_slice(src);
        self.used_bytes += src.len();
        true
    }

    /// The filled prefix of the block.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.used_bytes]
    }
}

pub type BufferBlockRef = Arc<Mutex<BufferBlock>>;

/// The process-wide block pool. All sizes are bytes.
#[derive(Debug)]
pub struct TraceBufferManager {
    max_total_sz: usize,
    block_sz: usize,
    cur_total_sz: AtomicUsize,
    task_buffers: RwLock<HashMap<u64, Vec<BufferBlockRef>>>,
}

impl Default for TraceBufferManager {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SZ, DEFAULT_MAX_TOTAL_SZ)
    }
}

impl TraceBufferManager {
    pub fn new(block_sz: usize, max_total_sz: usize) -> Self {
        Self {
            max_total_sz,
            block_sz,
            cur_total_sz: AtomicUsize::new(0),
            task_buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Reserves `block_sz` bytes against the global cap. The compare-exchange
    /// loop keeps the invariant `cur_total_sz ≤ max_total_sz` without taking
    /// the map lock.
    fn try_reserve(&self, task_id: u64) -> bool {
        let mut cur = self.cur_total_sz.load(Ordering::Relaxed);
        loop {
            let desired = cur + self.block_sz;
            if desired > self.max_total_sz {
                error!(task_id, cur, "cannot allocate more blocks");
                return false;
            }
            match self.cur_total_sz.compare_exchange_weak(
                cur,
                desired,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Allocates one block for `task_id`, or `None` when another block would
    /// exceed the global byte cap.
    pub fn allocate_block(&self, task_id: u64, cpu: usize) -> Option<BufferBlockRef> {
        if !self.try_reserve(task_id) {
            return None;
        }
        let block = Arc::new(Mutex::new(BufferBlock::new(cpu, self.block_sz)));
        #[allow(clippy::unwrap_used)]
        self.task_buffers
            .write()
            .unwrap()
            .entry(task_id)
            .or_default()
            .push(Arc::clone(&block));
        Some(block)
    }

    /// Drops every block owned by `task_id` and returns the bytes to the
    /// global budget. The subtraction happens after the map lock is
    /// released, mirroring the allocation ordering.
    pub fn release_task_blocks(&self, task_id: u64) {
        let released = {
            #[allow(clippy::unwrap_used)]
            let mut buffers = self.task_buffers.write().unwrap();
            match buffers.remove(&task_id) {
                Some(list) => list.len() * self.block_sz,
                None => return,
            }
        };
        self.cur_total_sz.fetch_sub(released, Ordering::Relaxed);
    }

    /// The task's blocks in insertion order.
    pub fn task_buffers(&self, task_id: u64) -> Vec<BufferBlockRef> {
        #[allow(clippy::unwrap_used)]
        let buffers = self.task_buffers.read().unwrap();
        match buffers.get(&task_id) {
            Some(list) => list.clone(),
            None => {
                warn!(task_id, "task not found in buffer pool");
                Vec::new()
            }
        }
    }

    pub fn task_total_used_bytes(&self, task_id: u64) -> usize {
        #[allow(clippy::unwrap_used)]
        let buffers = self.task_buffers.read().unwrap();
        buffers
            .get(&task_id)
            .map(|list| list.iter().map(|b| b.lock_or_panic().used_bytes()).sum())
            .unwrap_or(0)
    }

    pub fn current_total_size(&self) -> usize {
        self.cur_total_sz.load(Ordering::Relaxed)
    }

    pub fn block_size(&self) -> usize {
        self.block_sz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_manager() -> TraceBufferManager {
        TraceBufferManager::new(1024, 3 * 1024)
    }

    #[test]
    fn test_allocation_respects_global_cap() {
        let mgr = small_manager();
        assert!(mgr.allocate_block(1, 0).is_some());
        assert!(mgr.allocate_block(1, 1).is_some());
        assert!(mgr.allocate_block(2, 0).is_some());
        // A fourth block would exceed max_total_sz across all live tasks.
        assert!(mgr.allocate_block(2, 1).is_none());
        assert_eq!(mgr.current_total_size(), 3 * 1024);
    }

    #[test]
    fn test_release_returns_budget() {
        let mgr = small_manager();
        mgr.allocate_block(1, 0);
        mgr.allocate_block(1, 1);
        mgr.allocate_block(2, 0);
        mgr.release_task_blocks(1);
        assert_eq!(mgr.current_total_size(), 1024);
        assert!(mgr.allocate_block(3, 0).is_some());
        assert!(mgr.allocate_block(3, 1).is_some());
        assert!(mgr.allocate_block(3, 2).is_none());
    }

    #[test]
    fn test_release_unknown_task_is_noop() {
        let mgr = small_manager();
        mgr.allocate_block(1, 0);
        mgr.release_task_blocks(99);
        assert_eq!(mgr.current_total_size(), 1024);
    }

    #[test]
    fn test_block_append_bounds() {
        let mgr = TraceBufferManager::new(16, 64);
        let block = mgr.allocate_block(1, 0).unwrap();
        let mut block = block.lock_or_panic();
        assert!(block.append(&[1; 10]));
        assert_eq!(block.free_bytes(), 6);
        assert!(!block.append(&[2; 7]));
        assert!(block.append(&[2; 6]));
        assert_eq!(block.used_bytes(), 16);
        assert_eq!(&block.payload()[..10], &[1; 10]);
    }

    #[test]
    fn test_used_bytes_accounting() {
        let mgr = TraceBufferManager::new(32, 128);
        let a = mgr.allocate_block(1, 0).unwrap();
        let b = mgr.allocate_block(1, 1).unwrap();
        a.lock_or_panic().append(&[0; 12]);
        b.lock_or_panic().append(&[0; 20]);
        assert_eq!(mgr.task_total_used_bytes(1), 32);
        assert_eq!(mgr.task_total_used_bytes(42), 0);
    }

    #[test]
    fn test_task_buffers_preserve_insertion_order() {
        let mgr = TraceBufferManager::new(8, 64);
        for cpu in 0..4 {
            mgr.allocate_block(1, cpu);
        }
        let cpus: Vec<usize> = mgr
            .task_buffers(1)
            .iter()
            .map(|b| b.lock_or_panic().cpu)
            .collect();
        assert_eq!(cpus, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_concurrent_allocation_never_exceeds_cap() {
        let mgr = Arc::new(TraceBufferManager::new(64, 1024));
        let handles: Vec<_> = (0..8)
            .map(|task| {
                let mgr = Arc::clone(&mgr);
                std::thread::spawn(move || {
                    let mut got = 0;
                    while mgr.allocate_block(task, 0).is_some() {
                        got += 1;
                    }
                    got
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 16);
        assert_eq!(mgr.current_total_size(), 1024);
    }
}
