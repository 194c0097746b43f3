// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Process-wide shared state: the connection-id allocator and the
//! send-buffer pool. Both live in an explicit [`NetContext`] handed to
//! connectors and listeners rather than in ambient globals, so tests can
//! run isolated worlds side by side.

use std::hint;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::thread;

/// A bounded stack of reusable send buffers.
///
/// The limit starts at the number of CPU cores and grows by a fixed
/// factor per open connection. Exhaustion is not a hard wall: an acquirer
/// spins briefly hoping for a release and then allocates anyway, because
/// stalling a send forever over a buffer is worse than one extra
/// allocation.
pub struct SendBufferPool {
    stack: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
    connections: AtomicUsize,
    base_limit: usize,
    auto_size_factor: usize,
}

const ACQUIRE_SPINS: usize = 64;

impl SendBufferPool {
    pub fn new(base_limit: usize, auto_size_factor: usize) -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            base_limit,
            auto_size_factor,
        }
    }

    fn limit(&self) -> usize {
        self.base_limit + self.auto_size_factor * self.connections.load(Ordering::Relaxed)
    }

    pub fn acquire(&self) -> Vec<u8> {
        for spin in 0.. {
            if let Some(buffer) = self.stack.lock().expect("pool lock poisoned").pop() {
                self.outstanding.fetch_add(1, Ordering::Relaxed);
                return buffer;
            }
            if self.outstanding.load(Ordering::Relaxed) < self.limit() || spin >= ACQUIRE_SPINS {
                break;
            }
            hint::spin_loop();
            if spin % 16 == 15 {
                thread::yield_now();
            }
        }

        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Vec::new()
    }

    pub fn release(&self, mut buffer: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        buffer.clear();
        let mut stack = self.stack.lock().expect("pool lock poisoned");
        if stack.len() < self.limit() {
            stack.push(buffer);
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Explicit registry of the process-wide resources connections share.
pub struct NetContext {
    next_connection_id: AtomicI32,
    pool: SendBufferPool,
}

impl Default for NetContext {
    fn default() -> Self {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            next_connection_id: AtomicI32::new(0),
            pool: SendBufferPool::new(cores, 1),
        }
    }
}

impl NetContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next connection id. Zero is never returned; it
    /// marks connectionless datagrams.
    pub(crate) fn next_connection_id(&self) -> i32 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert!(id != 0);
        id
    }

    pub fn pool(&self) -> &SendBufferPool {
        &self.pool
    }
}
