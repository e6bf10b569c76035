// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Downloader (spec §4.4): one worker that turns queued events into
//! clip bytes in the ClipBuffer, applying the ready-gate, an optional rate
//! limit, a maximum-length cutoff, bounded fetch retry, and failure-tally
//! blacklisting.

use std::sync::Arc;
use std::time::Duration;

use base::clock::Clock;
use tokio::sync::mpsc;

use crate::clip_buffer::ClipBuffer;
use crate::event::{seconds_between, Event, FetchedClip};
use crate::failure_tally::{FailureTally, BLACKLIST_THRESHOLD};
use crate::in_flight::InFlightGuard;
use crate::nvr_client::NvrClient;
use crate::rate_limiter::RateLimiter;
use crate::storage_tool::LengthProbe;

/// The NVR cuts clips on 5-second keyframe boundaries and needs a little
/// extra pipeline time after an event ends; fetching sooner returns a
/// truncated clip.
const READY_GATE: Duration = Duration::from_millis(7_500);

const FETCH_ATTEMPTS: u32 = 5;
const FETCH_RETRY_SPACING: Duration = Duration::from_secs(1);

/// How long ago `end` was, relative to `now`; zero (not negative) if `end`
/// is in the future.
fn elapsed_since(now: jiff::Timestamp, end: jiff::Timestamp) -> Duration {
    let nanos = now.as_nanosecond() - end.as_nanosecond();
    if nanos <= 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(nanos.min(u64::MAX as i128) as u64)
    }
}

pub struct Downloader {
    nvr: Arc<dyn NvrClient>,
    probe: Option<Arc<dyn LengthProbe>>,
    rate_limiter: Option<RateLimiter>,
    failure_tally: FailureTally,
    ledger: Arc<ledger::Ledger>,
    clip_buffer: Arc<ClipBuffer<FetchedClip>>,
    max_event_length_secs: f64,
    clock: Arc<dyn Clock>,
    shutdown: base::shutdown::Receiver,
}

impl Downloader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nvr: Arc<dyn NvrClient>,
        probe: Option<Arc<dyn LengthProbe>>,
        rate_limiter: Option<RateLimiter>,
        ledger: Arc<ledger::Ledger>,
        clip_buffer: Arc<ClipBuffer<FetchedClip>>,
        max_event_length: jiff::Span,
        clock: Arc<dyn Clock>,
        shutdown: base::shutdown::Receiver,
    ) -> Self {
        Downloader {
            nvr,
            probe,
            rate_limiter,
            failure_tally: FailureTally::new(),
            ledger,
            clip_buffer,
            max_event_length_secs: base::duration::to_std(max_event_length).as_secs_f64(),
            clock,
            shutdown,
        }
    }

    pub async fn run(&self, mut queue: mpsc::Receiver<(Event, InFlightGuard)>) {
        loop {
            tokio::select! {
                _ = self.shutdown.as_future() => return,
                item = queue.recv() => {
                    match item {
                        Some((event, guard)) => self.process(event, guard).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn process(&self, event: Event, guard: InFlightGuard) {
        let Some(end) = event.end else {
            tracing::warn!(id = %event.id, "downloader received an incomplete event; dropping");
            return;
        };

        let tz = self.nvr.timezone();
        let local_start = event.start.to_zoned(tz.clone());
        let local_end = end.to_zoned(tz);

        let elapsed = elapsed_since(self.clock.now(), end);
        if elapsed < READY_GATE {
            tokio::time::sleep(READY_GATE - elapsed).await;
        }

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let duration_seconds = seconds_between(event.start, end);
        if duration_seconds > self.max_event_length_secs {
            tracing::info!(id = %event.id, duration_seconds, "event exceeds max length; ignoring");
            self.ignore(&event, end).await;
            return;
        }

        let data = match self.fetch_with_retry(&event, end).await {
            Some(data) => data,
            None => {
                let id = event.canonical_id();
                let tally = self.failure_tally.record_failure(id);
                if tally >= BLACKLIST_THRESHOLD {
                    tracing::warn!(id, tally, "download failure tally exhausted; blacklisting");
                    self.ignore(&event, end).await;
                } else {
                    tracing::warn!(id, tally, "download failed; leaving for the reconciler");
                }
                return;
            }
        };
        self.failure_tally.clear(event.canonical_id());

        if let Some(probe) = &self.probe {
            match probe.probe_duration_seconds(data.clone()).await {
                Ok(probed) if probed + 0.5 < duration_seconds => {
                    tracing::warn!(
                        id = %event.id,
                        probed_seconds = probed,
                        expected_seconds = duration_seconds,
                        "fetched clip is shorter than the event it covers"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(id = %event.id, error = %e.chain(), "length probe failed; skipping advisory check");
                }
            }
        }

        let clip = FetchedClip {
            event: event.clone(),
            local_start,
            local_end,
        };
        if let Err(e) = self.clip_buffer.put(clip, data, guard).await {
            tracing::warn!(id = %event.id, error = %e.chain(), "clip rejected by buffer");
        }
    }

    async fn fetch_with_retry(&self, event: &Event, end: jiff::Timestamp) -> Option<bytes::Bytes> {
        for attempt in 0..FETCH_ATTEMPTS {
            match self.nvr.get_camera_video(&event.camera_id, event.start, end).await {
                Ok(data) => return Some(data),
                Err(e) => {
                    tracing::warn!(id = %event.id, attempt, error = %e.chain(), "clip fetch failed");
                    if attempt + 1 < FETCH_ATTEMPTS {
                        tokio::time::sleep(FETCH_RETRY_SPACING).await;
                    }
                }
            }
        }
        None
    }

    async fn ignore(&self, event: &Event, end: jiff::Timestamp) {
        if let Err(e) = self.ledger.record_ignored(
            event.canonical_id(),
            event.event_type.as_str(),
            &event.camera_id,
            event.start,
            end,
        ) {
            tracing::error!(id = %event.id, error = %e.chain(), "failed to record ignored event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::in_flight::InFlight;
    use async_trait::async_trait;
    use base::clock::FakeClock;
    use tokio::sync::{watch, Mutex};

    struct MockNvr {
        tz: jiff::tz::TimeZone,
        video_results: Mutex<Vec<Result<bytes::Bytes, ()>>>,
        fetch_calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl NvrClient for MockNvr {
        async fn update(&self, _force: bool) -> Result<(), base::Error> {
            Ok(())
        }
        async fn camera_name(&self, _camera_id: &str) -> Result<String, base::Error> {
            Ok("cam".to_string())
        }
        fn timezone(&self) -> jiff::tz::TimeZone {
            self.tz.clone()
        }
        async fn wait_connected(&self) {}
        fn subscribe_events(&self) -> mpsc::Receiver<crate::nvr_client::EventUpdate> {
            mpsc::channel(1).1
        }
        fn subscribe_connection_state(&self) -> watch::Receiver<crate::nvr_client::ConnectionState> {
            watch::channel(crate::nvr_client::ConnectionState::Connected).1
        }
        async fn get_events(
            &self,
            _start: jiff::Timestamp,
            _end: jiff::Timestamp,
            _limit: u32,
        ) -> Result<Vec<Event>, base::Error> {
            Ok(Vec::new())
        }
        async fn get_camera_video(
            &self,
            _camera_id: &str,
            _start: jiff::Timestamp,
            _end: jiff::Timestamp,
        ) -> Result<bytes::Bytes, base::Error> {
            self.fetch_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut results = self.video_results.lock().await;
            match results.pop() {
                Some(Ok(b)) => Ok(b),
                _ => Err(base::err!(Unavailable, msg("mock fetch failure"))),
            }
        }
    }

    fn sample_event() -> Event {
        Event {
            id: "a".to_string(),
            event_type: EventType::Motion,
            camera_id: "cam1".to_string(),
            smart_detect_types: Vec::new(),
            start: jiff::Timestamp::from_second(1_700_000_000).unwrap(),
            end: Some(jiff::Timestamp::from_second(1_700_000_005).unwrap()),
        }
    }

    fn downloader_with(
        nvr: Arc<dyn NvrClient>,
        ledger: Arc<ledger::Ledger>,
        max_event_length: &str,
    ) -> (Downloader, Arc<ClipBuffer<FetchedClip>>, Arc<FakeClock>) {
        let clip_buffer = Arc::new(ClipBuffer::new(1024 * 1024));
        let clock = Arc::new(FakeClock::new(jiff::Timestamp::from_second(1_700_000_010).unwrap()));
        let d = Downloader::new(
            nvr,
            None,
            None,
            ledger,
            clip_buffer.clone(),
            base::duration::parse(max_event_length).unwrap(),
            clock.clone(),
            base::shutdown::channel().1,
        );
        (d, clip_buffer, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_fetch_lands_in_clip_buffer() {
        let nvr: Arc<dyn NvrClient> = Arc::new(MockNvr {
            tz: jiff::tz::TimeZone::UTC,
            video_results: Mutex::new(vec![Ok(bytes::Bytes::from_static(b"clip"))]),
            fetch_calls: Default::default(),
        });
        let ledger = Arc::new(ledger::Ledger::open_in_memory().unwrap());
        let (downloader, clip_buffer, _clock) = downloader_with(nvr, ledger, "1h");
        let in_flight = InFlight::new();
        let guard = in_flight.track("a".to_string()).unwrap();

        let handle = tokio::spawn({
            let event = sample_event();
            async move { downloader.process(event, guard).await }
        });
        tokio::time::advance(Duration::from_secs(20)).await;
        handle.await.unwrap();

        assert_eq!(clip_buffer.size_items().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_increment_failure_tally_without_blacklisting() {
        let nvr: Arc<dyn NvrClient> = Arc::new(MockNvr {
            tz: jiff::tz::TimeZone::UTC,
            video_results: Mutex::new(Vec::new()),
            fetch_calls: Default::default(),
        });
        let ledger = Arc::new(ledger::Ledger::open_in_memory().unwrap());
        let (downloader, _clip_buffer, _clock) = downloader_with(nvr, ledger.clone(), "1h");
        let in_flight = InFlight::new();
        let guard = in_flight.track("a".to_string()).unwrap();

        let handle = tokio::spawn({
            let event = sample_event();
            async move { downloader.process(event, guard).await }
        });
        tokio::time::advance(Duration::from_secs(30)).await;
        handle.await.unwrap();

        assert!(!ledger.has("a").unwrap(), "one failed pass must not blacklist yet");
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_event_is_recorded_as_ignored() {
        let nvr: Arc<dyn NvrClient> = Arc::new(MockNvr {
            tz: jiff::tz::TimeZone::UTC,
            video_results: Mutex::new(Vec::new()),
            fetch_calls: Default::default(),
        });
        let ledger = Arc::new(ledger::Ledger::open_in_memory().unwrap());
        let (downloader, _clip_buffer, _clock) = downloader_with(nvr, ledger.clone(), "1ms");
        let in_flight = InFlight::new();
        let guard = in_flight.track("a".to_string()).unwrap();

        let handle = tokio::spawn({
            let event = sample_event();
            async move { downloader.process(event, guard).await }
        });
        tokio::time::advance(Duration::from_secs(20)).await;
        handle.await.unwrap();

        assert!(ledger.has("a").unwrap());
    }
}
