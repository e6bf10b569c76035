// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tracks event ids currently somewhere between the download queue and a
//! successful (or abandoned) upload, so the reconciler doesn't re-enqueue
//! work the pipeline is already doing.
//!
//! Unlike the Python original (which peeked at `asyncio.Queue._queue`
//! internals directly), we can't introspect a tokio channel's contents, so
//! membership is tracked explicitly via an RAII guard threaded alongside
//! each event through the downloader, clip buffer, and uploader. The
//! reconciler's use of this set is inherently racy with respect to the
//! in-process pipeline state (see spec design notes); an occasional
//! duplicate enqueue is harmless because the ledger dedups before a second
//! write would ever happen.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct InFlight(Arc<Mutex<HashSet<String>>>);

/// Keeps `id` marked in-flight until dropped.
pub struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlight {
    pub fn new() -> Self {
        InFlight(Arc::new(Mutex::new(HashSet::new())))
    }

    /// Marks `id` in-flight. Returns `None` if it's already tracked --
    /// callers should treat that as "someone else has this", not re-enqueue.
    pub fn track(&self, id: String) -> Option<InFlightGuard> {
        let mut set = self.0.lock().unwrap();
        if set.insert(id.clone()) {
            Some(InFlightGuard {
                set: self.0.clone(),
                id,
            })
        } else {
            None
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.lock().unwrap().contains(id)
    }

    /// A point-in-time copy of the tracked ids, for the reconciler's
    /// already-in-flight check.
    pub fn snapshot(&self) -> HashSet<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_then_dropping_releases_id() {
        let in_flight = InFlight::new();
        assert!(!in_flight.contains("a"));
        let guard = in_flight.track("a".to_string()).unwrap();
        assert!(in_flight.contains("a"));
        drop(guard);
        assert!(!in_flight.contains("a"));
    }

    #[test]
    fn double_tracking_fails() {
        let in_flight = InFlight::new();
        let _guard = in_flight.track("a".to_string()).unwrap();
        assert!(in_flight.track("a".to_string()).is_none());
    }

    #[test]
    fn snapshot_reflects_current_membership() {
        let in_flight = InFlight::new();
        let guard = in_flight.track("a".to_string()).unwrap();
        assert_eq!(in_flight.snapshot(), HashSet::from(["a".to_string()]));
        drop(guard);
        assert!(in_flight.snapshot().is_empty());
    }
}
