// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! An optional evenly-spaced rate limiter for the downloader, so a burst of
//! simultaneous motion events across many cameras doesn't hammer the NVR's
//! clip-export endpoint.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

pub struct RateLimiter {
    min_interval: Duration,
    next_allowed: Mutex<Instant>,
}

impl RateLimiter {
    /// `events_per_minute` must be positive.
    pub fn new(events_per_minute: u32) -> Self {
        assert!(events_per_minute > 0);
        let min_interval = Duration::from_secs_f64(60.0 / f64::from(events_per_minute));
        RateLimiter {
            min_interval,
            next_allowed: Mutex::new(Instant::now()),
        }
    }

    /// Blocks until a slot is free, then reserves the next one.
    pub async fn acquire(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        let wait_until = (*next).max(now);
        tokio::time::sleep_until(wait_until).await;
        *next = wait_until + self.min_interval;
    }
}
