// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The on-disk record of which events have been backed up (or permanently
//! ignored), backed by a small SQLite database. See `schema.sql`.

mod ledger;

pub use crate::ledger::{BackupRecord, ExpiredEvent, Ledger};
