// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-event download-failure counter, Downloader-private (spec §3). Entries
//! self-expire after 12 hours so an event id that once misbehaved doesn't
//! stay permanently one failure away from blacklisting.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

const TTL: Duration = Duration::from_secs(12 * 3600);

/// Promote to `record_ignored` once an id's tally reaches this many failures.
pub const BLACKLIST_THRESHOLD: u32 = 10;

struct Entry {
    attempts: u32,
    first_seen: Instant,
}

#[derive(Default)]
pub struct FailureTally {
    entries: Mutex<HashMap<String, Entry>>,
}

impl FailureTally {
    pub fn new() -> Self {
        FailureTally::default()
    }

    /// Records one more failure for `id` and returns the tally after this
    /// failure. A tally older than the TTL is treated as fresh.
    pub fn record_failure(&self, id: &str) -> u32 {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(id.to_string()).or_insert(Entry {
            attempts: 0,
            first_seen: now,
        });
        if now.duration_since(entry.first_seen) > TTL {
            entry.attempts = 0;
            entry.first_seen = now;
        }
        entry.attempts += 1;
        entry.attempts
    }

    /// Clears `id`'s tally on a successful download.
    pub fn clear(&self, id: &str) {
        self.entries.lock().remove(id);
    }
}
