// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The EventListener (spec §4.3): subscribes to the NVR's push channel,
//! applies the shared wanted-event predicate, and hands completed events to
//! the download queue with cooperative, non-blocking backpressure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::event::{Event, EventFilter};
use crate::in_flight::{InFlight, InFlightGuard};
use crate::nvr_client::{EventUpdate, NvrClient};

/// How long to wait between non-blocking retries of a full download queue.
/// Short enough that the push channel read loop isn't starved long enough to
/// look dead to the NVR.
const BACKPRESSURE_RETRY: Duration = Duration::from_millis(50);

pub struct EventListener {
    nvr: Arc<dyn NvrClient>,
    filter: EventFilter,
    in_flight: InFlight,
    queue: mpsc::Sender<(Event, InFlightGuard)>,
    shutdown: base::shutdown::Receiver,
}

impl EventListener {
    pub fn new(
        nvr: Arc<dyn NvrClient>,
        filter: EventFilter,
        in_flight: InFlight,
        queue: mpsc::Sender<(Event, InFlightGuard)>,
        shutdown: base::shutdown::Receiver,
    ) -> Self {
        EventListener {
            nvr,
            filter,
            in_flight,
            queue,
            shutdown,
        }
    }

    /// Runs until cancelled, re-subscribing to the push channel any time the
    /// underlying subscription ends (the client closes it across a
    /// reconnect).
    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.as_future() => return,
                () = self.run_subscription() => {
                    tracing::warn!("event push-channel subscription ended; resubscribing");
                }
            }
        }
    }

    async fn run_subscription(&self) {
        let mut rx = self.nvr.subscribe_events();
        while let Some(update) = rx.recv().await {
            self.handle_update(update).await;
        }
    }

    async fn handle_update(&self, update: EventUpdate) {
        if !update.changed_data_has_end {
            return;
        }
        let mut event = update.event;
        // The push channel reports ids as `<id>-<cameraId>`; strip here so
        // every downstream consumer (ledger, in-flight set, reconciler)
        // compares canonical ids.
        event.id = event.canonical_id().to_string();

        if !self.filter.wants(&event) {
            return;
        }

        let Some(guard) = self.in_flight.track(event.id.clone()) else {
            tracing::debug!(id = %event.id, "event already in flight; dropping duplicate push update");
            return;
        };

        self.enqueue(event, guard).await;
    }

    async fn enqueue(&self, mut event: Event, mut guard: InFlightGuard) {
        loop {
            match self.queue.try_send((event, guard)) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!("download queue closed; dropping event");
                    return;
                }
                Err(mpsc::error::TrySendError::Full((returned_event, returned_guard))) => {
                    event = returned_event;
                    guard = returned_guard;
                    tokio::task::yield_now().await;
                    tokio::time::sleep(BACKPRESSURE_RETRY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::nvr_client::ConnectionState;
    use async_trait::async_trait;
    use tokio::sync::watch;

    struct MockNvr {
        updates: parking_lot::Mutex<Option<mpsc::Receiver<EventUpdate>>>,
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
            self.updates.lock().take().expect("subscribed more than once in this test")
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
            Ok(Vec::new())
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
            start: jiff::Timestamp::from_second(0).unwrap(),
            end: Some(jiff::Timestamp::from_second(5).unwrap()),
        }
    }

    fn wanting_filter() -> EventFilter {
        let mut filter = EventFilter::default();
        filter.detection_types.insert("motion".to_string());
        filter
    }

    #[tokio::test]
    async fn strips_suffix_and_enqueues_wanted_event() {
        let (update_tx, update_rx) = mpsc::channel(4);
        let nvr = Arc::new(MockNvr {
            updates: parking_lot::Mutex::new(Some(update_rx)),
        });
        let (queue_tx, mut queue_rx) = mpsc::channel(4);
        let listener = EventListener::new(
            nvr,
            wanting_filter(),
            InFlight::new(),
            queue_tx,
            base::shutdown::channel().1,
        );

        let listener_task = tokio::spawn(async move { listener.run().await });

        update_tx
            .send(EventUpdate {
                event: sample_event("d-cam1"),
                changed_data_has_end: true,
            })
            .await
            .unwrap();

        let (event, _guard) = queue_rx.recv().await.unwrap();
        assert_eq!(event.id, "d");

        listener_task.abort();
    }

    #[tokio::test]
    async fn incomplete_changed_data_is_ignored() {
        let (update_tx, update_rx) = mpsc::channel(4);
        let nvr = Arc::new(MockNvr {
            updates: parking_lot::Mutex::new(Some(update_rx)),
        });
        let (queue_tx, mut queue_rx) = mpsc::channel(4);
        let listener = EventListener::new(
            nvr,
            wanting_filter(),
            InFlight::new(),
            queue_tx,
            base::shutdown::channel().1,
        );
        let listener_task = tokio::spawn(async move { listener.run().await });

        update_tx
            .send(EventUpdate {
                event: sample_event("e"),
                changed_data_has_end: false,
            })
            .await
            .unwrap();
        // Give the listener a chance to process, then confirm nothing landed.
        tokio::task::yield_now().await;
        assert!(queue_rx.try_recv().is_err());

        listener_task.abort();
    }

    #[tokio::test]
    async fn duplicate_in_flight_event_is_not_enqueued_twice() {
        let (update_tx, update_rx) = mpsc::channel(4);
        let nvr = Arc::new(MockNvr {
            updates: parking_lot::Mutex::new(Some(update_rx)),
        });
        let (queue_tx, mut queue_rx) = mpsc::channel(4);
        let in_flight = InFlight::new();
        let listener = EventListener::new(
            nvr,
            wanting_filter(),
            in_flight.clone(),
            queue_tx,
            base::shutdown::channel().1,
        );
        let listener_task = tokio::spawn(async move { listener.run().await });

        for _ in 0..2 {
            update_tx
                .send(EventUpdate {
                    event: sample_event("f"),
                    changed_data_has_end: true,
                })
                .await
                .unwrap();
        }

        let (event, _guard) = queue_rx.recv().await.unwrap();
        assert_eq!(event.id, "f");
        tokio::task::yield_now().await;
        assert!(queue_rx.try_recv().is_err(), "second push for the same id must be dropped");

        listener_task.abort();
    }
}
