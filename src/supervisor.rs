// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wires the collaborators constructed from [`crate::cmds::run::config::ConfigFile`]
//! into the running pipeline (spec §2, §4.1) and drives it until the shared
//! shutdown signal fires, then gives every task a bounded grace period to
//! wind down before returning.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base::clock::{Clock, SystemClock};
use base::{bail, err, Error};

use crate::clip_buffer::ClipBuffer;
use crate::cmds::run::config::ConfigFile;
use crate::downloader::Downloader;
use crate::event::{Event, EventFilter, FetchedClip};
use crate::in_flight::{InFlight, InFlightGuard};
use crate::listener::EventListener;
use crate::notifier::{LoggingNotifier, Notifier};
use crate::nvr_client::{NvrClient, UnifiNvrClient};
use crate::path_template::PathTemplate;
use crate::rate_limiter::RateLimiter;
use crate::reconciler::Reconciler;
use crate::retention::RetentionPurger;
use crate::storage_tool::{Destination, FfprobeTool, LengthProbe, RcloneTool, StorageTool};
use crate::uploader::Uploader;

/// How long running tasks get to notice the shutdown signal and exit on
/// their own before the supervisor gives up waiting on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn parse_destinations(config: &ConfigFile) -> Result<Arc<[Destination]>, Error> {
    let parsed: Result<Vec<Destination>, Error> =
        config.destinations.iter().map(|raw| Destination::parse(raw)).collect();
    Ok(Arc::from(parsed?))
}

fn build_filter(config: &ConfigFile) -> EventFilter {
    EventFilter {
        detection_types: config.detection_types.iter().cloned().collect::<HashSet<_>>(),
        only_cameras: config.only_cameras.iter().cloned().collect::<HashSet<_>>(),
        ignore_cameras: config.ignore_cameras.iter().cloned().collect::<HashSet<_>>(),
    }
}

/// Verifies every configured destination's remote is known to the storage
/// tool and that its base path exists, before any pipeline task starts
/// (spec §2.2: a misconfigured remote is a startup failure, not a runtime
/// retry loop).
async fn validate_destinations(storage: &dyn StorageTool, destinations: &[Destination]) -> Result<(), Error> {
    let remotes = storage.listremotes().await?;
    for dest in destinations {
        if !remotes.iter().any(|r| r == &dest.remote_prefix()) {
            bail!(
                FailedPrecondition,
                msg("destination remote {:?} is not configured in the storage tool", dest.remote)
            );
        }
        storage.mkdir(&dest.full()).await?;
    }
    Ok(())
}

/// Builds every collaborator from `config`, spawns the pipeline tasks, and
/// blocks until `shutdown` fires and every task has wound down (or the
/// grace period elapses).
pub async fn run(
    config: &ConfigFile,
    skip_missing: bool,
    shutdown: base::shutdown::Receiver,
) -> Result<(), Error> {
    config.validate()?;

    let destinations = parse_destinations(config)?;
    let filter = build_filter(config);
    let retention = base::duration::parse(&config.retention)?;
    let purge_interval = base::duration::to_std(base::duration::parse(&config.purge_interval)?);
    let reconcile_interval = base::duration::to_std(base::duration::parse(&config.reconcile_interval)?);
    let max_event_length = base::duration::parse(&config.max_event_length)?;
    let request_timeout = base::duration::to_std(base::duration::parse(&config.nvr_request_timeout)?);
    let clip_buffer_capacity = base::strutil::decode_size(&config.clip_buffer_capacity)
        .map_err(|()| err!(InvalidArgument, msg("invalid clipBufferCapacity {:?}", config.clip_buffer_capacity)))?
        as u64;
    let template = Arc::new(PathTemplate::parse(&config.path_template)?);
    let rate_limiter = config.rate_limit_events_per_minute.map(RateLimiter::new);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let base_url = url::Url::parse(&config.nvr_base_url)
        .map_err(|e| err!(e, msg("invalid nvrBaseUrl {:?}", config.nvr_base_url)))?;
    let nvr: Arc<dyn NvrClient> =
        UnifiNvrClient::connect(base_url, &config.nvr_api_key, request_timeout).await?;

    let storage: Arc<dyn StorageTool> = Arc::new(RcloneTool::new(
        config.storage_tool_binary.clone(),
        config.storage_rcat_args.clone(),
        config.storage_delete_args.clone(),
    ));
    validate_destinations(storage.as_ref(), &destinations).await?;

    let probe: Option<Arc<dyn LengthProbe>> = match &config.length_probe_binary {
        Some(binary) => FfprobeTool::detect(binary).await.map(|t| Arc::new(t) as Arc<dyn LengthProbe>),
        None => None,
    };

    let ledger = Arc::new(ledger::Ledger::open(&config.ledger_path)?);
    tracing::info!(size = %ledger.describe_size(), "ledger opened");

    let notifier = LoggingNotifier;
    notifier.notify("Starting", "protect-archiver is starting up").await;

    let in_flight = InFlight::new();
    let clip_buffer = Arc::new(ClipBuffer::<FetchedClip>::new(clip_buffer_capacity));
    let (queue_tx, queue_rx) = tokio::sync::mpsc::channel::<(Event, InFlightGuard)>(config.download_queue_capacity);

    let mut handles = Vec::new();

    let listener = EventListener::new(nvr.clone(), filter.clone(), in_flight.clone(), queue_tx.clone(), shutdown.clone());
    handles.push(tokio::spawn(async move { listener.run().await }));

    let downloader = Downloader::new(
        nvr.clone(),
        probe,
        rate_limiter,
        ledger.clone(),
        clip_buffer.clone(),
        max_event_length,
        clock.clone(),
        shutdown.clone(),
    );
    handles.push(tokio::spawn(async move { downloader.run(queue_rx).await }));

    for worker_index in 0..config.uploader_workers {
        let uploader = Uploader::new(
            worker_index,
            storage.clone(),
            nvr.clone(),
            destinations.clone(),
            template.clone(),
            ledger.clone(),
            clip_buffer.clone(),
            shutdown.clone(),
        );
        handles.push(tokio::spawn(async move { uploader.run().await }));
    }

    let mut reconciler = Reconciler::new(
        nvr.clone(),
        filter.clone(),
        ledger.clone(),
        in_flight.clone(),
        queue_tx.clone(),
        retention,
        reconcile_interval,
        skip_missing,
        clock.clone(),
        shutdown.clone(),
    );
    handles.push(tokio::spawn(async move { reconciler.run().await }));

    let purger = RetentionPurger::new(
        storage.clone(),
        ledger.clone(),
        destinations.clone(),
        retention,
        purge_interval,
        clock.clone(),
        shutdown.clone(),
    );
    handles.push(tokio::spawn(async move { purger.run().await }));

    drop(queue_tx);

    shutdown.as_future().await;
    match tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles)).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!("shutdown grace period elapsed with tasks still running; exiting anyway");
        }
    }
    Ok(())
}
