// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A seam over "the current instant" so timing-sensitive pipeline stages
//! (the Downloader's ready-gate, the Reconciler's window math) can be driven
//! by `tokio::time::pause()` in tests instead of real wall-clock time.
//! `jiff::Timestamp::now()` reads the OS clock directly and ignores tokio's
//! paused virtual clock, so components that need to sleep *and* compare
//! against a "now" in the same test take a `Clock` instead.

use std::sync::Arc;

/// The current instant, abstracted so it can be faked in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> jiff::Timestamp;
}

/// The real clock, backed by the OS.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> jiff::Timestamp {
        jiff::Timestamp::now()
    }
}

/// A clock whose `now()` advances in lockstep with `tokio::time`'s virtual
/// clock, anchored to a fixed starting instant. Requires a paused tokio
/// runtime (`#[tokio::test(start_paused = true)]`) to be meaningful --
/// without pausing, this is just a more roundabout `SystemClock`.
pub struct FakeClock {
    base: jiff::Timestamp,
    base_instant: tokio::time::Instant,
}

impl FakeClock {
    pub fn new(base: jiff::Timestamp) -> Self {
        FakeClock {
            base,
            base_instant: tokio::time::Instant::now(),
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> jiff::Timestamp {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.base_instant);
        self.base
            .as_nanosecond()
            .checked_add(elapsed.as_nanos() as i128)
            .and_then(|n| jiff::Timestamp::from_nanosecond(n).ok())
            .unwrap_or(self.base)
    }
}

/// Shorthand for the trait object every pipeline stage actually holds.
pub type SharedClock = Arc<dyn Clock>;
