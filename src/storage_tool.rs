// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The storage tool (§6.2) and length-probe (§6.3) collaborators: trait
//! seams so the pipeline is testable without real subprocesses, and
//! concrete implementations that shell out to an rclone-flavored binary and
//! an ffprobe-flavored binary, respectively.

use std::process::Stdio;

use async_trait::async_trait;
use base::{bail, err, Error};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// A parsed `remote:basePath` destination string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub remote: String,
    pub base_path: String,
}

impl Destination {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let (remote, base_path) = raw.split_once(':').ok_or_else(|| {
            err!(InvalidArgument, msg("destination {raw:?} is missing a `remote:` prefix"))
        })?;
        if remote.is_empty() {
            bail!(InvalidArgument, msg("destination {raw:?} has an empty remote name"));
        }
        Ok(Destination {
            remote: remote.to_string(),
            base_path: base_path.trim_end_matches('/').to_string(),
        })
    }

    /// `remote:basePath`, as understood by `mkdir`/`rmdirs`.
    pub fn full(&self) -> String {
        format!("{}:{}", self.remote, self.base_path)
    }

    /// `remote:basePath/rendered`, the object a clip is streamed to.
    pub fn object_ref(&self, rendered_path: &str) -> String {
        format!("{}:{}/{}", self.remote, self.base_path, rendered_path)
    }

    /// The listremotes line this destination's remote should match
    /// (rclone reports remotes with a trailing colon, one per line).
    pub fn remote_prefix(&self) -> String {
        format!("{}:", self.remote)
    }
}

/// The external storage tool (§6.2), invoked as a subprocess per operation.
#[async_trait]
pub trait StorageTool: Send + Sync {
    async fn listremotes(&self) -> Result<Vec<String>, Error>;
    async fn mkdir(&self, destination: &str) -> Result<(), Error>;
    async fn rcat(&self, object_ref: &str, data: bytes::Bytes) -> Result<(), Error>;
    async fn delete(&self, object_ref: &str) -> Result<(), Error>;
    async fn rmdirs(&self, destination: &str) -> Result<(), Error>;
}

/// An rclone-flavored concrete [`StorageTool`].
pub struct RcloneTool {
    binary: String,
    rcat_args: Vec<String>,
    delete_args: Vec<String>,
}

impl RcloneTool {
    pub fn new(binary: impl Into<String>, rcat_args: Vec<String>, delete_args: Vec<String>) -> Self {
        RcloneTool {
            binary: binary.into(),
            rcat_args,
            delete_args,
        }
    }

    /// Spawns `binary args...`, optionally streaming `stdin_data` in, and
    /// fails unless the process exits zero. Logs stderr on failure so the
    /// caller's error message doesn't need to repeat it.
    async fn run(&self, args: &[&str], stdin_data: Option<bytes::Bytes>) -> Result<Vec<u8>, Error> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(if stdin_data.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| err!(e, msg("failed to spawn {} {:?}", self.binary, args)))?;

        if let Some(data) = stdin_data {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin
                .write_all(&data)
                .await
                .map_err(|e| err!(e, msg("failed to write clip bytes to {} stdin", self.binary)))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| err!(e, msg("failed to wait for {}", self.binary)))?;
        if !output.status.success() {
            tracing::warn!(
                tool = %self.binary,
                args = ?args,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "storage tool exited non-zero"
            );
            bail!(
                Unavailable,
                msg("{} {:?} exited with {}", self.binary, args, output.status)
            );
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl StorageTool for RcloneTool {
    async fn listremotes(&self) -> Result<Vec<String>, Error> {
        let stdout = self.run(&["listremotes"], None).await?;
        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn mkdir(&self, destination: &str) -> Result<(), Error> {
        self.run(&["mkdir", destination], None).await?;
        Ok(())
    }

    async fn rcat(&self, object_ref: &str, data: bytes::Bytes) -> Result<(), Error> {
        let mut args: Vec<&str> = vec!["rcat"];
        args.extend(self.rcat_args.iter().map(String::as_str));
        args.push(object_ref);
        self.run(&args, Some(data)).await?;
        Ok(())
    }

    async fn delete(&self, object_ref: &str) -> Result<(), Error> {
        let mut args: Vec<&str> = vec!["delete"];
        args.extend(self.delete_args.iter().map(String::as_str));
        args.push(object_ref);
        self.run(&args, None).await?;
        Ok(())
    }

    async fn rmdirs(&self, destination: &str) -> Result<(), Error> {
        self.run(&["rmdirs", "--leave-root", destination], None).await?;
        Ok(())
    }
}

/// The optional length-probe tool (§6.3): reads a clip from stdin, reports
/// its duration. Its absence degrades cleanly (the Downloader skips the
/// advisory length check).
#[async_trait]
pub trait LengthProbe: Send + Sync {
    async fn probe_duration_seconds(&self, data: bytes::Bytes) -> Result<f64, Error>;
}

/// An ffprobe-flavored concrete [`LengthProbe`].
pub struct FfprobeTool {
    binary: String,
}

#[derive(serde::Deserialize)]
struct ProbeOutput {
    streams: Vec<ProbeStream>,
}

#[derive(serde::Deserialize)]
struct ProbeStream {
    duration: String,
}

impl FfprobeTool {
    /// Returns `None` if `binary` isn't runnable (not found on `PATH`, or
    /// refuses to start), so startup can degrade to "no probe configured"
    /// instead of failing.
    pub async fn detect(binary: &str) -> Option<Self> {
        match Command::new(binary).arg("-version").output().await {
            Ok(output) if output.status.success() => Some(FfprobeTool { binary: binary.to_string() }),
            Ok(output) => {
                tracing::warn!(%binary, status = %output.status, "length-probe binary present but failed -version; disabling advisory length check");
                None
            }
            Err(e) => {
                tracing::info!(%binary, error = %e, "length-probe binary not found; advisory length check disabled");
                None
            }
        }
    }
}

#[async_trait]
impl LengthProbe for FfprobeTool {
    async fn probe_duration_seconds(&self, data: bytes::Bytes) -> Result<f64, Error> {
        let mut child = Command::new(&self.binary)
            .args(["-v", "quiet", "-show_streams", "-select_streams", "v:0", "-of", "json", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| err!(e, msg("failed to spawn {}", self.binary)))?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin
            .write_all(&data)
            .await
            .map_err(|e| err!(e, msg("failed to write clip bytes to {} stdin", self.binary)))?;
        drop(stdin);

        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut raw = Vec::new();
        stdout
            .read_to_end(&mut raw)
            .await
            .map_err(|e| err!(e, msg("failed to read {} output", self.binary)))?;
        let status = child
            .wait()
            .await
            .map_err(|e| err!(e, msg("failed to wait for {}", self.binary)))?;
        if !status.success() {
            bail!(Unavailable, msg("{} exited with {}", self.binary, status));
        }

        let parsed: ProbeOutput = serde_json::from_slice(&raw)
            .map_err(|e| err!(e, msg("{} produced unparseable output", self.binary)))?;
        let stream = parsed
            .streams
            .first()
            .ok_or_else(|| err!(Unavailable, msg("{} reported no video stream", self.binary)))?;
        stream
            .duration
            .parse::<f64>()
            .map_err(|e| err!(e, msg("{} reported a non-numeric duration", self.binary)))
    }
}
