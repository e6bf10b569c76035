// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Uploader (spec §4.5): one of a pool of N workers, each dequeuing
//! fetched clips from the shared ClipBuffer, rendering the destination
//! path, and streaming the bytes to every configured remote.

use std::sync::Arc;

use crate::clip_buffer::ClipBuffer;
use crate::event::{seconds_between, FetchedClip};
use crate::nvr_client::NvrClient;
use crate::path_template::{detection_type_field, FieldContext, PathTemplate};
use crate::storage_tool::{Destination, StorageTool};

pub struct Uploader {
    worker_index: usize,
    storage: Arc<dyn StorageTool>,
    nvr: Arc<dyn NvrClient>,
    destinations: Arc<[Destination]>,
    template: Arc<PathTemplate>,
    ledger: Arc<ledger::Ledger>,
    clip_buffer: Arc<ClipBuffer<FetchedClip>>,
    shutdown: base::shutdown::Receiver,
}

impl Uploader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_index: usize,
        storage: Arc<dyn StorageTool>,
        nvr: Arc<dyn NvrClient>,
        destinations: Arc<[Destination]>,
        template: Arc<PathTemplate>,
        ledger: Arc<ledger::Ledger>,
        clip_buffer: Arc<ClipBuffer<FetchedClip>>,
        shutdown: base::shutdown::Receiver,
    ) -> Self {
        Uploader {
            worker_index,
            storage,
            nvr,
            destinations,
            template,
            ledger,
            clip_buffer,
            shutdown,
        }
    }

    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.as_future() => return,
                (clip, data, _guard) = self.clip_buffer.get() => {
                    self.process(clip, data).await;
                }
            }
        }
    }

    async fn process(&self, clip: FetchedClip, data: bytes::Bytes) {
        let event = &clip.event;
        let Some(end) = event.end else {
            tracing::warn!(worker = self.worker_index, id = %event.id, "uploader received an incomplete event; dropping");
            return;
        };

        let camera_name = match self.nvr.camera_name(&event.camera_id).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(
                    worker = self.worker_index,
                    id = %event.id,
                    error = %e.chain(),
                    "camera name lookup failed; falling back to the camera id"
                );
                event.camera_id.clone()
            }
        };
        let detection_type = detection_type_field(event.event_type, &event.smart_detect_types);
        let duration_seconds = seconds_between(event.start, end);

        let ctx = FieldContext {
            event,
            local_start: &clip.local_start,
            local_end: &clip.local_end,
            duration_seconds,
            detection_type,
            camera_name,
        };
        let rendered = match self.template.render(&ctx) {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(worker = self.worker_index, id = %event.id, error = %e.chain(), "failed to render destination path");
                return;
            }
        };

        for dest in self.destinations.iter() {
            let object_ref = dest.object_ref(&rendered);
            match self.storage.rcat(&object_ref, data.clone()).await {
                Ok(()) => {
                    if let Err(e) = self.ledger.record_success(
                        event.canonical_id(),
                        event.event_type.as_str(),
                        &event.camera_id,
                        event.start,
                        end,
                        &dest.remote,
                        &rendered,
                    ) {
                        tracing::error!(
                            worker = self.worker_index,
                            id = %event.id,
                            remote = %dest.remote,
                            error = %e.chain(),
                            "upload succeeded but ledger write failed"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        worker = self.worker_index,
                        id = %event.id,
                        remote = %dest.remote,
                        error = %e.chain(),
                        "upload failed; leaving for the reconciler"
                    );
                }
            }
        }
    }
}
