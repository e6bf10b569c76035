// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The RetentionPurger (spec §4.7): periodically deletes remote objects
//! past the retention window and, only once the remote side is confirmed
//! gone, removes the corresponding Ledger row.

use std::sync::Arc;
use std::time::Duration;

use base::clock::Clock;

use crate::storage_tool::{Destination, StorageTool};

pub struct RetentionPurger {
    storage: Arc<dyn StorageTool>,
    ledger: Arc<ledger::Ledger>,
    destinations: Arc<[Destination]>,
    retention: jiff::Span,
    purge_interval: Duration,
    clock: Arc<dyn Clock>,
    shutdown: base::shutdown::Receiver,
}

impl RetentionPurger {
    pub fn new(
        storage: Arc<dyn StorageTool>,
        ledger: Arc<ledger::Ledger>,
        destinations: Arc<[Destination]>,
        retention: jiff::Span,
        purge_interval: Duration,
        clock: Arc<dyn Clock>,
        shutdown: base::shutdown::Receiver,
    ) -> Self {
        RetentionPurger {
            storage,
            ledger,
            destinations,
            retention,
            purge_interval,
            clock,
            shutdown,
        }
    }

    pub async fn run(&self) {
        loop {
            if let Err(e) = self.pass().await {
                tracing::error!(error = %e.chain(), "retention purge pass failed");
            }
            tokio::select! {
                _ = self.shutdown.as_future() => return,
                () = tokio::time::sleep(self.purge_interval) => {}
            }
        }
    }

    async fn pass(&self) -> Result<(), base::Error> {
        let cutoff = base::duration::before(self.clock.now(), self.retention);
        let expired = self.ledger.expired_before(cutoff)?;
        let mut any_deleted = false;

        for event in expired {
            let mut all_backups_gone = true;
            for backup in &event.backups {
                let object_ref = self.object_ref_for(&backup.remote, &backup.path);
                match self.storage.delete(&object_ref).await {
                    Ok(()) => any_deleted = true,
                    Err(e) => {
                        tracing::warn!(
                            id = %event.id,
                            remote = %backup.remote,
                            error = %e.chain(),
                            "failed to delete expired backup; will retry next purge"
                        );
                        all_backups_gone = false;
                    }
                }
            }
            if all_backups_gone {
                if let Err(e) = self.ledger.delete_event(&event.id) {
                    tracing::error!(id = %event.id, error = %e.chain(), "failed to delete ledger row after purging backups");
                }
            }
        }

        if any_deleted {
            for dest in self.destinations.iter() {
                if let Err(e) = self.storage.rmdirs(&dest.full()).await {
                    tracing::warn!(remote = %dest.remote, error = %e.chain(), "failed to prune empty directories");
                }
            }
        }
        Ok(())
    }

    /// Rebuilds the full `remote:basePath/path` object reference for a
    /// stored backup, using whichever configured destination matches its
    /// remote. Falls back to a bare `remote:path` if the destination was
    /// since removed from config -- best effort, logged by the caller on
    /// delete failure.
    fn object_ref_for(&self, remote: &str, path: &str) -> String {
        match self.destinations.iter().find(|d| d.remote == remote) {
            Some(dest) => dest.object_ref(path),
            None => format!("{remote}:{path}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base::clock::FakeClock;

    #[derive(Default)]
    struct MockStorage {
        deleted: parking_lot::Mutex<Vec<String>>,
        rmdirs_calls: parking_lot::Mutex<Vec<String>>,
        fail_delete_for: Vec<String>,
    }

    #[async_trait]
    impl StorageTool for MockStorage {
        async fn listremotes(&self) -> Result<Vec<String>, base::Error> {
            Ok(Vec::new())
        }
        async fn mkdir(&self, _destination: &str) -> Result<(), base::Error> {
            Ok(())
        }
        async fn rcat(&self, _object_ref: &str, _data: bytes::Bytes) -> Result<(), base::Error> {
            Ok(())
        }
        async fn delete(&self, object_ref: &str) -> Result<(), base::Error> {
            if self.fail_delete_for.iter().any(|p| object_ref == p) {
                return Err(base::err!(Unavailable, msg("mock delete failure")));
            }
            self.deleted.lock().push(object_ref.to_string());
            Ok(())
        }
        async fn rmdirs(&self, destination: &str) -> Result<(), base::Error> {
            self.rmdirs_calls.lock().push(destination.to_string());
            Ok(())
        }
    }

    fn ts(secs: i64) -> jiff::Timestamp {
        jiff::Timestamp::from_second(secs).unwrap()
    }

    #[tokio::test]
    async fn expired_event_is_deleted_remotely_then_from_ledger() {
        let storage = Arc::new(MockStorage::default());
        let ledger = Arc::new(ledger::Ledger::open_in_memory().unwrap());
        ledger
            .record_success("b", "motion", "cam1", ts(0), ts(10), "gdrive", "cam1/b.mp4")
            .unwrap();
        let destinations: Arc<[Destination]> = Arc::from(vec![Destination::parse("gdrive:backups").unwrap()]);
        let clock = Arc::new(FakeClock::new(ts(1_000_000)));
        let purger = RetentionPurger::new(
            storage.clone(),
            ledger.clone(),
            destinations,
            base::duration::parse("1h").unwrap(),
            Duration::from_secs(86400),
            clock,
            base::shutdown::channel().1,
        );

        purger.pass().await.unwrap();

        assert_eq!(*storage.deleted.lock(), vec!["gdrive:backups/cam1/b.mp4".to_string()]);
        assert_eq!(*storage.rmdirs_calls.lock(), vec!["gdrive:backups".to_string()]);
        assert!(!ledger.has("b").unwrap());
    }

    #[tokio::test]
    async fn failed_delete_leaves_the_ledger_row_for_next_pass() {
        let storage = Arc::new(MockStorage {
            fail_delete_for: vec!["gdrive:backups/cam1/b.mp4".to_string()],
            ..Default::default()
        });
        let ledger = Arc::new(ledger::Ledger::open_in_memory().unwrap());
        ledger
            .record_success("b", "motion", "cam1", ts(0), ts(10), "gdrive", "cam1/b.mp4")
            .unwrap();
        let destinations: Arc<[Destination]> = Arc::from(vec![Destination::parse("gdrive:backups").unwrap()]);
        let clock = Arc::new(FakeClock::new(ts(1_000_000)));
        let purger = RetentionPurger::new(
            storage,
            ledger.clone(),
            destinations,
            base::duration::parse("1h").unwrap(),
            Duration::from_secs(86400),
            clock,
            base::shutdown::channel().1,
        );

        purger.pass().await.unwrap();

        assert!(ledger.has("b").unwrap(), "a failed remote delete must not drop the ledger row");
    }

    #[tokio::test]
    async fn nothing_expired_skips_rmdirs() {
        let storage = Arc::new(MockStorage::default());
        let ledger = Arc::new(ledger::Ledger::open_in_memory().unwrap());
        let destinations: Arc<[Destination]> = Arc::from(vec![Destination::parse("gdrive:backups").unwrap()]);
        let clock = Arc::new(FakeClock::new(ts(1_000_000)));
        let purger = RetentionPurger::new(
            storage.clone(),
            ledger,
            destinations,
            base::duration::parse("1h").unwrap(),
            Duration::from_secs(86400),
            clock,
            base::shutdown::channel().1,
        );

        purger.pass().await.unwrap();
        assert!(storage.rmdirs_calls.lock().is_empty());
    }
}
