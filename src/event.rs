// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The event type shared by every pipeline stage, and the camera/detection
//! filter applied identically by the listener and the reconciler.

use std::collections::HashSet;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Motion,
    Ring,
    SmartDetect,
    SmartDetectLine,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Motion => "motion",
            EventType::Ring => "ring",
            EventType::SmartDetect => "smartDetectZone",
            EventType::SmartDetectLine => "smartDetectLine",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as reported by the NVR, with `end` unset until the event has
/// finished (the NVR updates a previously-sent event in place).
#[derive(Clone, Debug)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub camera_id: String,
    pub smart_detect_types: Vec<String>,
    pub start: jiff::Timestamp,
    pub end: Option<jiff::Timestamp>,
}

impl Event {
    pub fn is_complete(&self) -> bool {
        self.end.is_some()
    }

    /// Strips the `-<cameraId>` suffix the push channel appends to some
    /// event ids but the REST API never reports, so all downstream code
    /// (the ledger, the in-flight set, the reconciler) compares apples to
    /// apples.
    pub fn canonical_id(&self) -> &str {
        match self.id.split_once('-') {
            Some((id, suffix)) if suffix == self.camera_id => id,
            _ => &self.id,
        }
    }
}

/// Elapsed time between two instants, in fractional seconds.
pub fn seconds_between(start: jiff::Timestamp, end: jiff::Timestamp) -> f64 {
    (end.as_nanosecond() - start.as_nanosecond()) as f64 / 1_000_000_000.0
}

/// An event paired with its timestamps localized to the NVR's timezone.
/// The Downloader performs this conversion once (spec design note: "localize
/// at the Downloader and never re-convert in the Uploader"), so the path
/// template always renders the same local date/time the NVR's own UI shows.
#[derive(Clone, Debug)]
pub struct FetchedClip {
    pub event: Event,
    pub local_start: jiff::Zoned,
    pub local_end: jiff::Zoned,
}

/// The camera/detection-type filter shared by [`crate::listener::EventListener`]
/// and [`crate::reconciler::Reconciler`].
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub detection_types: HashSet<String>,
    pub only_cameras: HashSet<String>,
    pub ignore_cameras: HashSet<String>,
}

impl EventFilter {
    /// Returns whether `event` should be backed up, per spec §4.8.
    pub fn wants(&self, event: &Event) -> bool {
        if event.end.is_none() {
            return false;
        }
        if self.ignore_cameras.contains(&event.camera_id) {
            return false;
        }
        if !self.only_cameras.is_empty() && !self.only_cameras.contains(&event.camera_id) {
            return false;
        }
        match event.event_type {
            EventType::Motion => self.detection_types.contains("motion"),
            EventType::Ring => self.detection_types.contains("ring"),
            EventType::SmartDetectLine => self.detection_types.contains("line"),
            EventType::SmartDetect => event
                .smart_detect_types
                .iter()
                .all(|t| self.detection_types.contains(t)),
        }
    }
}
