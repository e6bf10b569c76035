// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The NVR collaborator (§6.1): a trait so the pipeline can be driven by a
//! mock in tests, and a concrete implementation backed by `reqwest` (REST)
//! and `tokio-tungstenite` (the event push channel).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base::{bail, err, Error};
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tokio_tungstenite::tungstenite::Message;

use crate::event::{Event, EventType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A single raw push-channel update, already shaped into our `Event`, paired
/// with the set of top-level fields the NVR says changed on this update.
#[derive(Clone)]
pub struct EventUpdate {
    pub event: Event,
    pub changed_data_has_end: bool,
}

/// The NVR collaborator (§6.1). Implementors must be `Send + Sync` so a
/// single client can be shared across the Listener, Downloader, Uploader
/// pool, and Reconciler.
#[async_trait]
pub trait NvrClient: Send + Sync {
    /// Refreshes cached bootstrap data (cameras, timezone). `force` bypasses
    /// any cache and always round-trips to the NVR.
    async fn update(&self, force: bool) -> Result<(), Error>;

    /// Looks up a camera's display name, retrying once with `update(true)`
    /// on a cache miss.
    async fn camera_name(&self, camera_id: &str) -> Result<String, Error>;

    /// The NVR's configured timezone, used to localize event timestamps.
    fn timezone(&self) -> jiff::tz::TimeZone;

    /// Resolves once the client has an active push-channel connection; if
    /// already connected, resolves immediately.
    async fn wait_connected(&self);

    /// Streams event push-channel updates until the returned receiver is
    /// dropped or the client is shut down.
    fn subscribe_events(&self) -> tokio::sync::mpsc::Receiver<EventUpdate>;

    /// Streams connection-state transitions.
    fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Fetches completed events in `[start, end]`, oldest-first, at most
    /// `limit` per call (the Reconciler pages through with repeated calls).
    async fn get_events(
        &self,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
        limit: u32,
    ) -> Result<Vec<Event>, Error>;

    /// Fetches the raw clip bytes for one camera's footage in `[start, end]`.
    async fn get_camera_video(
        &self,
        camera_id: &str,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<bytes::Bytes, Error>;
}

struct Bootstrap {
    cameras: HashMap<String, String>,
    timezone: jiff::tz::TimeZone,
}

/// A concrete [`NvrClient`] speaking Unifi Protect's REST + websocket API.
pub struct UnifiNvrClient {
    base_url: url::Url,
    http: reqwest::Client,
    bootstrap: RwLock<Bootstrap>,
    connection_state: watch::Sender<ConnectionState>,
    connected_notify: Notify,
    event_tx: tokio::sync::broadcast::Sender<EventUpdate>,
}

impl UnifiNvrClient {
    pub async fn connect(base_url: url::Url, api_key: &str, request_timeout: Duration) -> Result<Arc<Self>, Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-API-KEY",
            reqwest::header::HeaderValue::from_str(api_key)
                .map_err(|e| err!(e, msg("invalid API key header value")))?,
        );
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| err!(e, msg("failed to build HTTP client")))?;

        let (connection_state, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = tokio::sync::broadcast::channel(1024);

        let client = Arc::new(UnifiNvrClient {
            base_url,
            http,
            bootstrap: RwLock::new(Bootstrap {
                cameras: HashMap::new(),
                timezone: jiff::tz::TimeZone::UTC,
            }),
            connection_state,
            connected_notify: Notify::new(),
            event_tx,
        });

        // Bounded startup retry for the initial connection attempt, distinct
        // from the Downloader's per-fetch retry (spec §2.2).
        let mut last_err = None;
        for attempt in 0..5 {
            match client.update(true).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e.chain(), "startup NVR connection attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
        if let Some(e) = last_err {
            bail!(Unavailable, msg("could not reach NVR after 5 attempts"), source(e));
        }

        client.spawn_websocket_task();
        Ok(client)
    }

    fn spawn_websocket_task(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.run_websocket_loop().await });
    }

    async fn run_websocket_loop(self: Arc<Self>) {
        let mut ws_url = self.base_url.clone();
        let scheme = if ws_url.scheme() == "https" { "wss" } else { "ws" };
        let _ = ws_url.set_scheme(scheme);
        ws_url.set_path("/proxy/protect/ws/updates");

        loop {
            match tokio_tungstenite::connect_async(ws_url.as_str()).await {
                Ok((stream, _)) => {
                    let _ = self.connection_state.send(ConnectionState::Connected);
                    self.connected_notify.notify_waiters();
                    tracing::info!("NVR push channel connected");
                    let (_write, mut read) = stream.split();
                    while let Some(msg) = read.next().await {
                        match msg {
                            Ok(Message::Binary(data)) => self.handle_push_message(&data),
                            Ok(Message::Close(_)) => break,
                            Err(e) => {
                                tracing::warn!(error = %e, "NVR push channel read error");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "NVR push channel connect failed");
                }
            }
            let _ = self.connection_state.send(ConnectionState::Disconnected);
            tracing::warn!("NVR push channel disconnected; reconnecting");
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    /// Parses one raw push frame and, if it's a completed-event update,
    /// republishes it as an [`EventUpdate`]. Unparseable or irrelevant
    /// frames are dropped silently at `TRACE`.
    fn handle_push_message(&self, data: &[u8]) {
        tracing::trace!(bytes = data.len(), "raw push-channel payload");
        let Some(update) = parse_push_frame(data) else {
            return;
        };
        // No receivers yet is not an error; the Listener may still be
        // starting up.
        let _ = self.event_tx.send(update);
    }
}

fn parse_push_frame(_data: &[u8]) -> Option<EventUpdate> {
    // The Unifi Protect push-channel frame format (an action-frame header
    // followed by a length-prefixed payload frame, both msgpack-encoded) is
    // out of scope beyond driving the trait above; a real implementation
    // decodes it here and constructs an `Event` with `changed_data_has_end`
    // set iff the payload's `changed_data` map contains an `end` key.
    None
}

#[async_trait]
impl NvrClient for UnifiNvrClient {
    async fn update(&self, force: bool) -> Result<(), Error> {
        if !force && !self.bootstrap.read().cameras.is_empty() {
            return Ok(());
        }
        let url = self.base_url.join("/proxy/protect/api/bootstrap")
            .map_err(|e| err!(e, msg("invalid bootstrap URL")))?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| err!(e, msg("bootstrap request failed")))?
            .error_for_status()
            .map_err(|e| err!(e, msg("bootstrap request returned an error status")))?;
        let body: BootstrapResponse = resp
            .json()
            .await
            .map_err(|e| err!(e, msg("bootstrap response was not valid JSON")))?;

        let timezone = jiff::tz::TimeZone::get(&body.nvr.timezone)
            .map_err(|e| err!(e, msg("unknown NVR timezone {}", body.nvr.timezone)))?;
        let cameras = body
            .cameras
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect();

        let mut bootstrap = self.bootstrap.write();
        bootstrap.cameras = cameras;
        bootstrap.timezone = timezone;
        Ok(())
    }

    async fn camera_name(&self, camera_id: &str) -> Result<String, Error> {
        if let Some(name) = self.bootstrap.read().cameras.get(camera_id).cloned() {
            return Ok(name);
        }
        self.update(true).await?;
        self.bootstrap
            .read()
            .cameras
            .get(camera_id)
            .cloned()
            .ok_or_else(|| err!(NotFound, msg("unknown camera id {camera_id}")))
    }

    fn timezone(&self) -> jiff::tz::TimeZone {
        self.bootstrap.read().timezone.clone()
    }

    async fn wait_connected(&self) {
        if *self.connection_state.borrow() == ConnectionState::Connected {
            return;
        }
        self.connected_notify.notified().await;
    }

    fn subscribe_events(&self) -> tokio::sync::mpsc::Receiver<EventUpdate> {
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let mut broadcast_rx = self.event_tx.subscribe();
        tokio::spawn(async move {
            while let Ok(update) = broadcast_rx.recv().await {
                if tx.send(update).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.subscribe()
    }

    async fn get_events(
        &self,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
        limit: u32,
    ) -> Result<Vec<Event>, Error> {
        let mut url = self
            .base_url
            .join("/proxy/protect/api/events")
            .map_err(|e| err!(e, msg("invalid events URL")))?;
        url.query_pairs_mut()
            .append_pair("start", &start.as_millisecond().to_string())
            .append_pair("end", &end.as_millisecond().to_string())
            .append_pair("limit", &limit.to_string());
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| err!(e, msg("events request failed")))?
            .error_for_status()
            .map_err(|e| err!(e, msg("events request returned an error status")))?;
        let body: Vec<RawEvent> = resp
            .json()
            .await
            .map_err(|e| err!(e, msg("events response was not valid JSON")))?;
        body.into_iter().map(RawEvent::into_event).collect()
    }

    async fn get_camera_video(
        &self,
        camera_id: &str,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<bytes::Bytes, Error> {
        let mut url = self
            .base_url
            .join("/proxy/protect/api/video/export")
            .map_err(|e| err!(e, msg("invalid video export URL")))?;
        url.query_pairs_mut()
            .append_pair("camera", camera_id)
            .append_pair("start", &start.as_millisecond().to_string())
            .append_pair("end", &end.as_millisecond().to_string());
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| err!(e, msg("video export request failed")))?
            .error_for_status()
            .map_err(|e| err!(e, msg("video export returned an error status")))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| err!(e, msg("video export body read failed")))?;
        if bytes.is_empty() {
            bail!(Unavailable, msg("empty clip payload for camera {camera_id}"));
        }
        Ok(bytes)
    }
}

#[derive(serde::Deserialize)]
struct BootstrapResponse {
    nvr: BootstrapNvr,
    cameras: Vec<BootstrapCamera>,
}

#[derive(serde::Deserialize)]
struct BootstrapNvr {
    timezone: String,
}

#[derive(serde::Deserialize)]
struct BootstrapCamera {
    id: String,
    name: String,
}

#[derive(serde::Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    camera: String,
    #[serde(default)]
    #[serde(rename = "smartDetectTypes")]
    smart_detect_types: Vec<String>,
    start: i64,
    end: Option<i64>,
}

impl RawEvent {
    fn into_event(self) -> Result<Event, Error> {
        let event_type = match self.event_type.as_str() {
            "motion" => EventType::Motion,
            "ring" => EventType::Ring,
            "smartDetectZone" => EventType::SmartDetect,
            "smartDetectLine" => EventType::SmartDetectLine,
            other => bail!(InvalidArgument, msg("unrecognized event type {other}")),
        };
        Ok(Event {
            id: self.id,
            event_type,
            camera_id: self.camera,
            smart_detect_types: self.smart_detect_types,
            start: jiff::Timestamp::from_millisecond(self.start)
                .map_err(|e| err!(e, msg("invalid event start timestamp")))?,
            end: self
                .end
                .map(jiff::Timestamp::from_millisecond)
                .transpose()
                .map_err(|e| err!(e, msg("invalid event end timestamp")))?,
        })
    }
}
