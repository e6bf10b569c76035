// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{Error, ErrorKind};
use bpaf::{Bpaf, Parser};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod clip_buffer;
mod cmds;
mod downloader;
mod event;
mod failure_tally;
mod in_flight;
mod listener;
mod notifier;
mod nvr_client;
mod path_template;
mod rate_limiter;
mod reconciler;
mod retention;
mod storage_tool;
mod supervisor;
mod uploader;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// protect-archiver: backs up Unifi Protect camera clips to remote storage.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
enum Args {
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Run(a) => cmds::run::run(a),
        }
    }
}

/// Misconfiguration the operator must fix before the process can run at all
/// (spec §7): reported as exit code 200 instead of the generic 1, so it's
/// distinguishable in a supervisor/systemd unit's restart policy.
const MISCONFIGURATION_EXIT_CODE: i32 = 200;

fn exit_code_for(e: &Error) -> i32 {
    match e.kind() {
        ErrorKind::InvalidArgument | ErrorKind::FailedPrecondition => MISCONFIGURATION_EXIT_CODE,
        _ => 1,
    }
}

fn main() {
    // If using the clock will fail, find out now, before trying to log
    // anything with timestamps.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(exit_code_for(&e));
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
