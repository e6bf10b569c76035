// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A FIFO bounded by bytes of payload rather than item count, connecting
//! the downloader to the uploader pool. Clip sizes vary by orders of
//! magnitude, so bounding by item count would either starve the buffer at
//! small clips or blow out memory at large ones.
//!
//! Grounded on the Python `VideoQueue` (a subclass of `asyncio.Queue`
//! overriding its size accounting): one oversized item is rejected
//! immediately rather than deadlocking forever waiting for capacity it can
//! never have.

use base::strutil::human_size;
use base::{bail, Error};
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

use crate::in_flight::InFlightGuard;

struct State<T> {
    queue: VecDeque<(T, bytes::Bytes, InFlightGuard)>,
    bytes: u64,
}

pub struct ClipBuffer<T> {
    capacity: u64,
    state: Mutex<State<T>>,
    space_freed: Notify,
    item_added: Notify,
}

impl<T> ClipBuffer<T> {
    pub fn new(capacity: u64) -> Self {
        ClipBuffer {
            capacity,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                bytes: 0,
            }),
            space_freed: Notify::new(),
            item_added: Notify::new(),
        }
    }

    /// Blocks until there's room for `bytes`, then enqueues it. Returns an
    /// error immediately, without blocking, if `bytes` alone exceeds
    /// capacity -- that item can never fit, however long we wait.
    pub async fn put(&self, item: T, data: bytes::Bytes, guard: InFlightGuard) -> Result<(), Error> {
        let len = data.len() as u64;
        if len > self.capacity {
            bail!(
                InvalidArgument,
                msg(
                    "clip of {} exceeds buffer capacity of {}",
                    human_size(len),
                    human_size(self.capacity)
                )
            );
        }
        loop {
            {
                let mut state = self.state.lock().await;
                if state.bytes + len <= self.capacity {
                    state.bytes += len;
                    state.queue.push_back((item, data, guard));
                    drop(state);
                    self.item_added.notify_one();
                    return Ok(());
                }
            }
            self.space_freed.notified().await;
        }
    }

    /// Blocks until an item is available, then dequeues the oldest one.
    pub async fn get(&self) -> (T, bytes::Bytes, InFlightGuard) {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some((item, data, guard)) = state.queue.pop_front() {
                    state.bytes -= data.len() as u64;
                    drop(state);
                    self.space_freed.notify_one();
                    return (item, data, guard);
                }
            }
            self.item_added.notified().await;
        }
    }

    pub async fn size_bytes(&self) -> u64 {
        self.state.lock().await.bytes
    }

    pub async fn size_items(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
