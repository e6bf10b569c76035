// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `run` subcommand's TOML config file, mirroring the shape (camelCase
//! fields, `#[serde(default = "...")]` fallbacks) of the teacher's own
//! `ConfigFile`.

use std::path::PathBuf;

use base::Error;
use serde::Deserialize;

fn default_ledger_path() -> PathBuf {
    PathBuf::from("/var/lib/protect-archiver/ledger.db")
}
fn default_request_timeout() -> String {
    "10s".to_string()
}
fn default_retention() -> String {
    "30d".to_string()
}
fn default_purge_interval() -> String {
    "1d".to_string()
}
fn default_reconcile_interval() -> String {
    "5m".to_string()
}
fn default_max_event_length() -> String {
    "2m".to_string()
}
fn default_clip_buffer_capacity() -> String {
    "256M".to_string()
}
fn default_uploader_workers() -> usize {
    2
}
fn default_path_template() -> String {
    "{camera_name}/{event.start}_{detection_type}.mp4".to_string()
}
fn default_storage_tool_binary() -> String {
    "rclone".to_string()
}
fn default_length_probe_binary() -> Option<String> {
    Some("ffprobe".to_string())
}
fn default_detection_types() -> Vec<String> {
    vec!["motion".to_string(), "ring".to_string()]
}
fn default_download_queue_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub nvr_base_url: String,
    pub nvr_api_key: String,
    #[serde(default = "default_request_timeout")]
    pub nvr_request_timeout: String,

    /// `remote:basePath` strings, one per rclone-style destination.
    pub destinations: Vec<String>,

    #[serde(default = "default_retention")]
    pub retention: String,
    #[serde(default = "default_purge_interval")]
    pub purge_interval: String,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: String,
    #[serde(default = "default_max_event_length")]
    pub max_event_length: String,

    #[serde(default = "default_detection_types")]
    pub detection_types: Vec<String>,
    #[serde(default)]
    pub only_cameras: Vec<String>,
    #[serde(default)]
    pub ignore_cameras: Vec<String>,

    /// Byte-size grammar (e.g. `"256M"`), decoded by
    /// [`base::strutil::decode_size`].
    #[serde(default = "default_clip_buffer_capacity")]
    pub clip_buffer_capacity: String,
    #[serde(default = "default_uploader_workers")]
    pub uploader_workers: usize,
    #[serde(default = "default_download_queue_capacity")]
    pub download_queue_capacity: usize,
    #[serde(default = "default_path_template")]
    pub path_template: String,
    #[serde(default)]
    pub rate_limit_events_per_minute: Option<u32>,

    #[serde(default = "default_storage_tool_binary")]
    pub storage_tool_binary: String,
    #[serde(default)]
    pub storage_rcat_args: Vec<String>,
    #[serde(default)]
    pub storage_delete_args: Vec<String>,
    #[serde(default = "default_length_probe_binary")]
    pub length_probe_binary: Option<String>,

    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
}

impl ConfigFile {
    /// Fails fast on configuration combinations the pipeline can't safely
    /// run with (spec §7: fatal at startup, distinct exit code).
    pub fn validate(&self) -> Result<(), Error> {
        if !self.only_cameras.is_empty() && !self.ignore_cameras.is_empty() {
            return Err(base::err!(
                InvalidArgument,
                msg("onlyCameras and ignoreCameras are mutually exclusive")
            ));
        }
        if self.destinations.is_empty() {
            return Err(base::err!(InvalidArgument, msg("at least one destination is required")));
        }
        if self.uploader_workers == 0 {
            return Err(base::err!(InvalidArgument, msg("uploaderWorkers must be at least 1")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        nvrBaseUrl = "https://nvr.example.com"
        nvrApiKey = "secret"
        destinations = ["gdrive:backups"]
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: ConfigFile = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.nvr_base_url, "https://nvr.example.com");
        assert_eq!(config.retention, "30d");
        assert_eq!(config.uploader_workers, 2);
        assert_eq!(config.detection_types, vec!["motion".to_string(), "ring".to_string()]);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_both_camera_filters_set() {
        let mut config: ConfigFile = toml::from_str(minimal_toml()).unwrap();
        config.only_cameras.push("cam1".to_string());
        config.ignore_cameras.push("cam2".to_string());
        config.validate().unwrap_err();
    }

    #[test]
    fn rejects_no_destinations() {
        let mut config: ConfigFile = toml::from_str(minimal_toml()).unwrap();
        config.destinations.clear();
        config.validate().unwrap_err();
    }
}
