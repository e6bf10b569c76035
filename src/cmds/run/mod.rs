// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `run` subcommand: reads the TOML config, then drives the pipeline
//! until a shutdown signal arrives (spec §2, §7).

pub mod config;

use std::path::PathBuf;

use base::{bail, Error};
use bpaf::Bpaf;
use tokio::signal::unix::{signal, SignalKind};

use config::ConfigFile;

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/protect-archiver.toml")
}

#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the TOML config file.
    #[bpaf(long("config"), argument::<PathBuf>("PATH"), fallback(default_config_path()), debug_fallback())]
    config: PathBuf,

    /// Record events the NVR reports but the download queue can't currently
    /// accept as permanently ignored, instead of retrying them forever.
    #[bpaf(long("skip-missing"))]
    skip_missing: bool,
}

fn read_config(path: &std::path::Path) -> Result<ConfigFile, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| base::err!(e, msg("failed to read config file {}", path.display())))?;
    let config: ConfigFile = toml::from_str(&raw)
        .map_err(|e| base::err!(InvalidArgument, msg("invalid config file {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = read_config(&args.config)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    let rt = builder.build().map_err(|e| base::err!(e, msg("failed to start the async runtime")))?;
    let result = rt.block_on(async_run(args.skip_missing, &config));
    rt.shutdown_background();
    result
}

/// Runs the pipeline, translating the first SIGINT/SIGTERM into a graceful
/// shutdown and a second one during the grace period into an immediate,
/// hard failure.
async fn async_run(skip_missing: bool, config: &ConfigFile) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    let mut int = signal(SignalKind::interrupt()).map_err(|e| base::err!(e, msg("failed to install SIGINT handler")))?;
    let mut term = signal(SignalKind::terminate()).map_err(|e| base::err!(e, msg("failed to install SIGTERM handler")))?;

    tokio::pin! {
        let inner = crate::supervisor::run(config, skip_missing, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            tracing::info!("received SIGINT; shutting down gracefully");
            shutdown_tx.take();
        }
        _ = term.recv() => {
            tracing::info!("received SIGTERM; shutting down gracefully");
            shutdown_tx.take();
        }
        result = &mut inner => return result.map(|()| 0),
    }

    tokio::select! {
        _ = int.recv() => bail!(Aborted, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Aborted, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result.map(|()| 0),
    }
}
