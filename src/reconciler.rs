// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Reconciler (spec §4.6): periodically re-lists completed events
//! within a lookback window from the NVR and enqueues any the pipeline
//! hasn't already accounted for, so a push-channel drop never loses an
//! event permanently.

use std::collections::HashMap;
use std::time::Duration;

use std::sync::Arc;
use tokio::sync::mpsc;

use base::clock::Clock;

use crate::event::{Event, EventFilter};
use crate::in_flight::{InFlight, InFlightGuard};
use crate::nvr_client::NvrClient;

const PAGE_SIZE: u32 = 500;

fn next_after(ts: jiff::Timestamp) -> jiff::Timestamp {
    jiff::Timestamp::from_nanosecond(ts.as_nanosecond() + 1).unwrap_or(ts)
}

pub struct Reconciler {
    nvr: Arc<dyn NvrClient>,
    filter: EventFilter,
    ledger: Arc<ledger::Ledger>,
    in_flight: InFlight,
    queue: mpsc::Sender<(Event, InFlightGuard)>,
    retention: jiff::Span,
    interval: Duration,
    skip_missing: bool,
    clock: Arc<dyn Clock>,
    shutdown: base::shutdown::Receiver,
    last_check: Option<jiff::Timestamp>,
    tracked_missing: HashMap<String, Event>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nvr: Arc<dyn NvrClient>,
        filter: EventFilter,
        ledger: Arc<ledger::Ledger>,
        in_flight: InFlight,
        queue: mpsc::Sender<(Event, InFlightGuard)>,
        retention: jiff::Span,
        interval: Duration,
        skip_missing: bool,
        clock: Arc<dyn Clock>,
        shutdown: base::shutdown::Receiver,
    ) -> Self {
        Reconciler {
            nvr,
            filter,
            ledger,
            in_flight,
            queue,
            retention,
            interval,
            skip_missing,
            clock,
            shutdown,
            last_check: None,
            tracked_missing: HashMap::new(),
        }
    }

    pub async fn run(&mut self) {
        loop {
            if let Err(e) = self.pass().await {
                tracing::warn!(error = %e.chain(), "reconciler pass failed; will retry next interval");
            }
            tokio::select! {
                _ = self.shutdown.as_future() => return,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    fn determine_window(&self, now: jiff::Timestamp) -> (jiff::Timestamp, jiff::Timestamp) {
        let retention_floor = base::duration::before(now, self.retention);
        let start = match self.last_check {
            None => retention_floor,
            Some(last) => {
                let lookback_floor = base::duration::before(last, jiff::Span::new().hours(3));
                retention_floor.max(lookback_floor)
            }
        };
        (start, now)
    }

    async fn pass(&mut self) -> Result<(), base::Error> {
        self.nvr.wait_connected().await;
        let now = self.clock.now();
        let (start, end) = self.determine_window(now);

        let fetched = self.fetch_all_pages(start, end).await?;

        let mut existing = self.ledger.all_ids()?;
        existing.extend(self.in_flight.snapshot());

        let mut ongoing_floor: Option<jiff::Timestamp> = None;
        for event in fetched {
            let Some(event_end) = event.end else {
                ongoing_floor = Some(match ongoing_floor {
                    Some(floor) => floor.min(event.start),
                    None => event.start,
                });
                continue;
            };
            let id = event.canonical_id().to_string();
            if existing.contains(&id) {
                continue;
            }
            if !self.filter.wants(&event) {
                continue;
            }
            self.offer(event, event_end).await;
        }

        self.retry_tracked_missing().await?;
        self.last_check = Some(ongoing_floor.unwrap_or(end));
        Ok(())
    }

    /// Pages through `get_events` oldest-first, advancing `start` one
    /// nanosecond past the last event of each page, until a short page
    /// signals there's nothing left.
    async fn fetch_all_pages(
        &self,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<Vec<Event>, base::Error> {
        let mut page_start = start;
        let mut all = Vec::new();
        loop {
            let page = self.nvr.get_events(page_start, end, PAGE_SIZE).await?;
            let page_len = page.len();
            if let Some(last) = page.last() {
                page_start = next_after(last.start);
            }
            all.extend(page);
            if page_len < PAGE_SIZE as usize {
                break;
            }
        }
        Ok(all)
    }

    async fn offer(&mut self, event: Event, event_end: jiff::Timestamp) {
        if self.skip_missing {
            if let Err(e) = self.ledger.record_ignored(
                event.canonical_id(),
                event.event_type.as_str(),
                &event.camera_id,
                event.start,
                event_end,
            ) {
                tracing::error!(id = %event.id, error = %e.chain(), "failed to record skipped-missing event");
            }
            return;
        }
        let id = event.canonical_id().to_string();
        self.tracked_missing.insert(id, event.clone());
        self.try_enqueue(event).await;
    }

    /// Attempts one non-blocking enqueue. On a full queue the event is left
    /// for the next pass (it's still in `tracked_missing`); a successful
    /// send or an already-in-flight event both simply return.
    async fn try_enqueue(&self, event: Event) {
        let id = event.canonical_id().to_string();
        let Some(guard) = self.in_flight.track(id) else {
            return;
        };
        match self.queue.try_send((event, guard)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("download queue closed; reconciler cannot enqueue");
            }
        }
    }

    async fn retry_tracked_missing(&mut self) -> Result<(), base::Error> {
        let done = self.ledger.all_ids()?;
        let previous = std::mem::take(&mut self.tracked_missing);
        for (id, event) in previous {
            if done.contains(&id) {
                continue;
            }
            if self.in_flight.contains(&id) {
                self.tracked_missing.insert(id, event);
                continue;
            }
            self.try_enqueue(event.clone()).await;
            self.tracked_missing.insert(id, event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::nvr_client::{ConnectionState, EventUpdate};
    use async_trait::async_trait;
    use base::clock::FakeClock;
    use tokio::sync::watch;

    struct MockNvr {
        pages: parking_lot::Mutex<std::collections::VecDeque<Vec<Event>>>,
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
            jiff::tz::TimeZone::UTC
        }
        async fn wait_connected(&self) {}
        fn subscribe_events(&self) -> mpsc::Receiver<EventUpdate> {
            mpsc::channel(1).1
        }
        fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
            watch::channel(ConnectionState::Connected).1
        }
        async fn get_events(
            &self,
            _start: jiff::Timestamp,
            _end: jiff::Timestamp,
            _limit: u32,
        ) -> Result<Vec<Event>, base::Error> {
            Ok(self.pages.lock().pop_front().unwrap_or_default())
        }
        async fn get_camera_video(
            &self,
            _camera_id: &str,
            _start: jiff::Timestamp,
            _end: jiff::Timestamp,
        ) -> Result<bytes::Bytes, base::Error> {
            Ok(bytes::Bytes::new())
        }
    }

    fn sample_event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            event_type: EventType::Motion,
            camera_id: "cam1".to_string(),
            smart_detect_types: Vec::new(),
            start: jiff::Timestamp::from_second(1_700_000_000).unwrap(),
            end: Some(jiff::Timestamp::from_second(1_700_000_005).unwrap()),
        }
    }

    fn wanting_filter() -> EventFilter {
        let mut filter = EventFilter::default();
        filter.detection_types.insert("motion".to_string());
        filter
    }

    fn reconciler_with(
        nvr: Arc<dyn NvrClient>,
        ledger: Arc<ledger::Ledger>,
        queue: mpsc::Sender<(Event, InFlightGuard)>,
        skip_missing: bool,
    ) -> Reconciler {
        let clock = Arc::new(FakeClock::new(jiff::Timestamp::from_second(1_700_100_000).unwrap()));
        Reconciler::new(
            nvr,
            wanting_filter(),
            ledger,
            InFlight::new(),
            queue,
            base::duration::parse("30d").unwrap(),
            Duration::from_secs(300),
            skip_missing,
            clock,
            base::shutdown::channel().1,
        )
    }

    #[tokio::test]
    async fn missing_event_is_enqueued_once_across_two_passes() {
        let nvr = Arc::new(MockNvr {
            pages: parking_lot::Mutex::new(std::collections::VecDeque::from([
                vec![sample_event("c")],
                Vec::new(),
            ])),
        });
        let ledger = Arc::new(ledger::Ledger::open_in_memory().unwrap());
        let (queue_tx, mut queue_rx) = mpsc::channel(4);
        let mut reconciler = reconciler_with(nvr, ledger.clone(), queue_tx, false);

        reconciler.pass().await.unwrap();
        let (event, guard) = queue_rx.recv().await.unwrap();
        assert_eq!(event.id, "c");

        // Mark it done, as the downloader/uploader eventually would.
        ledger
            .record_success("c", "motion", "cam1", event.start, event.end.unwrap(), "r", "c.mp4")
            .unwrap();
        drop(guard);

        reconciler.pass().await.unwrap();
        assert!(queue_rx.try_recv().is_err(), "second pass must not re-enqueue a now-backed-up event");
    }

    #[tokio::test]
    async fn already_ledgered_event_is_skipped() {
        let ledger = Arc::new(ledger::Ledger::open_in_memory().unwrap());
        ledger
            .record_success("c", "motion", "cam1", jiff::Timestamp::from_second(0).unwrap(), jiff::Timestamp::from_second(5).unwrap(), "r", "c.mp4")
            .unwrap();
        let nvr = Arc::new(MockNvr {
            pages: parking_lot::Mutex::new(std::collections::VecDeque::from([vec![sample_event("c")]])),
        });
        let (queue_tx, mut queue_rx) = mpsc::channel(4);
        let mut reconciler = reconciler_with(nvr, ledger, queue_tx, false);

        reconciler.pass().await.unwrap();
        assert!(queue_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn skip_missing_mode_records_ignored_instead_of_enqueuing() {
        let nvr = Arc::new(MockNvr {
            pages: parking_lot::Mutex::new(std::collections::VecDeque::from([vec![sample_event("c")]])),
        });
        let ledger = Arc::new(ledger::Ledger::open_in_memory().unwrap());
        let (queue_tx, mut queue_rx) = mpsc::channel(4);
        let mut reconciler = reconciler_with(nvr, ledger.clone(), queue_tx, true);

        reconciler.pass().await.unwrap();
        assert!(queue_rx.try_recv().is_err());
        assert!(ledger.has("c").unwrap());
    }
}
