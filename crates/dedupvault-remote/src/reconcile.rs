//! Reconciliation of the remote listing against local volume records.
//!
//! The backend listing is authoritative. Records that never made it to the
//! backend are removed, confirmed uploads are promoted to `Verified`, and any
//! disagreement that cannot be repaired locally is reported as extra or
//! missing files.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::backend::RemoteEntry;
use crate::config::BackendConfig;
use crate::error::{RemoteError, Result};
use crate::manager::BackendManager;
use crate::volume::{RemoteVolumeRecord, RemoteVolumeState, VolumeStateTracker};

/// Identifies the remote files that belong to this backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeNaming {
    /// Required name prefix.
    pub prefix: String,
    /// Required name suffix; empty accepts any.
    pub suffix: String,
}

impl VolumeNaming {
    /// Naming with the given prefix and suffix.
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Naming taken from `backup_prefix` and `volume_suffix`.
    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.backup_prefix.clone(), config.volume_suffix.clone())
    }

    /// Whether `name` belongs to this backup.
    pub fn matches(&self, name: &str) -> bool {
        name.starts_with(&self.prefix) && name.ends_with(&self.suffix)
    }
}

/// Result of comparing a listing with the local records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteListAnalysis {
    /// Backup files on the backend with no local record.
    pub extra: Vec<RemoteEntry>,
    /// Verified records whose file is absent or has the wrong size.
    pub missing: Vec<RemoteVolumeRecord>,
    /// Records promoted to `Verified`.
    pub verified: usize,
    /// Records removed (temporary volumes and failed uploads).
    pub removed: usize,
}

impl RemoteListAnalysis {
    /// Whether the backend and local records agree.
    pub fn is_consistent(&self) -> bool {
        self.extra.is_empty() && self.missing.is_empty()
    }

    /// Turn any disagreement into [`RemoteError::RemoteListMismatch`].
    pub fn ensure_consistent(&self) -> Result<()> {
        if self.is_consistent() {
            Ok(())
        } else {
            Err(RemoteError::RemoteListMismatch {
                extra: self.extra.len(),
                missing: self.missing.len(),
            })
        }
    }
}

fn size_conflict(record: Option<u64>, remote: Option<u64>) -> bool {
    matches!((record, remote), (Some(a), Some(b)) if a != b)
}

/// Compare `listing` with `records` and repair the tracker where possible.
pub fn analyze(
    listing: &[RemoteEntry],
    records: &[RemoteVolumeRecord],
    naming: &VolumeNaming,
    tracker: &dyn VolumeStateTracker,
) -> Result<RemoteListAnalysis> {
    let mut lookup: BTreeMap<&str, &RemoteEntry> = listing
        .iter()
        .filter(|e| !e.is_folder && naming.matches(&e.name))
        .map(|e| (e.name.as_str(), e))
        .collect();
    let mut analysis = RemoteListAnalysis::default();

    for record in records {
        if record.state == RemoteVolumeState::Temporary {
            debug!(name = %record.name, "removing temporary volume record");
            tracker.remove_remote_volume(&record.name);
            analysis.removed += 1;
            continue;
        }

        let remote = lookup.remove(record.name.as_str());
        match record.state {
            RemoteVolumeState::Deleting | RemoteVolumeState::Deleted => {
                if remote.is_none() && record.state == RemoteVolumeState::Deleting {
                    debug!(name = %record.name, "pending delete already gone");
                    tracker.update_remote_volume(
                        &record.name,
                        RemoteVolumeState::Deleted,
                        None,
                        None,
                    );
                }
                continue;
            }
            _ => {}
        }

        let conflict = match remote {
            None => true,
            Some(entry) => size_conflict(record.size, entry.size),
        };

        if conflict {
            match record.state {
                RemoteVolumeState::Uploading => {
                    info!(name = %record.name, "removing record of failed upload");
                    tracker.remove_remote_volume(&record.name);
                    analysis.removed += 1;
                }
                RemoteVolumeState::Verified => {
                    warn!(
                        name = %record.name,
                        expected_size = ?record.size,
                        remote_size = ?remote.and_then(|e| e.size),
                        "verified volume missing from backend"
                    );
                    analysis.missing.push(record.clone());
                }
                _ => {}
            }
        } else if record.state != RemoteVolumeState::Verified {
            let size = remote.and_then(|e| e.size).or(record.size);
            tracker.update_remote_volume(
                &record.name,
                RemoteVolumeState::Verified,
                size,
                record.hash.clone(),
            );
            analysis.verified += 1;
        }
    }

    analysis.extra = lookup.into_values().cloned().collect();
    for entry in &analysis.extra {
        warn!(name = %entry.name, size = ?entry.size, "extra file on backend");
    }
    info!(
        extra = analysis.extra.len(),
        missing = analysis.missing.len(),
        verified = analysis.verified,
        removed = analysis.removed,
        "remote listing analyzed"
    );
    Ok(analysis)
}

/// List the backend through `manager`, reconcile and fail on any mismatch.
pub async fn verify_remote_list(
    manager: &BackendManager,
    tracker: &dyn VolumeStateTracker,
    naming: &VolumeNaming,
) -> Result<RemoteListAnalysis> {
    let listing = manager.list().await?;
    let records = tracker.remote_volumes();
    let analysis = analyze(&listing, &records, naming, tracker)?;
    analysis.ensure_consistent()?;
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::InMemoryVolumeTracker;
    use proptest::prelude::*;

    fn naming() -> VolumeNaming {
        VolumeNaming::new("duplicati-", "")
    }

    fn run(listing: &[RemoteEntry], tracker: &InMemoryVolumeTracker) -> RemoteListAnalysis {
        let records = tracker.remote_volumes();
        analyze(listing, &records, &naming(), tracker).unwrap()
    }

    #[test]
    fn test_uploaded_volume_becomes_verified() {
        let tracker = InMemoryVolumeTracker::with_records([RemoteVolumeRecord::new(
            "duplicati-a.zip",
            RemoteVolumeState::Uploading,
        )
        .with_size(100)
        .with_hash("h")]);
        let listing = [RemoteEntry::file("duplicati-a.zip", 100)];

        let analysis = run(&listing, &tracker);
        assert!(analysis.is_consistent());
        assert_eq!(analysis.verified, 1);
        let rec = tracker.volume("duplicati-a.zip").unwrap();
        assert_eq!(rec.state, RemoteVolumeState::Verified);
        assert_eq!(rec.size, Some(100));
        assert_eq!(rec.hash.as_deref(), Some("h"));
    }

    #[test]
    fn test_failed_upload_is_removed_not_missing() {
        let tracker = InMemoryVolumeTracker::with_records([RemoteVolumeRecord::new(
            "duplicati-b.zip",
            RemoteVolumeState::Uploading,
        )
        .with_size(50)]);

        let analysis = run(&[], &tracker);
        assert!(analysis.is_consistent());
        assert_eq!(analysis.removed, 1);
        assert!(tracker.volume("duplicati-b.zip").is_none());
    }

    #[test]
    fn test_size_mismatch_and_extra_file_are_reported() {
        let tracker = InMemoryVolumeTracker::with_records([RemoteVolumeRecord::new(
            "duplicati-c.zip",
            RemoteVolumeState::Verified,
        )
        .with_size(10)]);
        let listing = [
            RemoteEntry::file("duplicati-c.zip", 11),
            RemoteEntry::file("duplicati-z.zip", 5),
        ];

        let analysis = run(&listing, &tracker);
        assert_eq!(analysis.missing.len(), 1);
        assert_eq!(analysis.missing[0].name, "duplicati-c.zip");
        assert_eq!(analysis.extra.len(), 1);
        assert_eq!(analysis.extra[0].name, "duplicati-z.zip");
        assert!(matches!(
            analysis.ensure_consistent(),
            Err(RemoteError::RemoteListMismatch { extra: 1, missing: 1 })
        ));
    }

    #[test]
    fn test_temporary_records_are_dropped_without_lookup() {
        let tracker = InMemoryVolumeTracker::with_records([RemoteVolumeRecord::new(
            "duplicati-t.zip",
            RemoteVolumeState::Temporary,
        )]);
        let listing = [RemoteEntry::file("duplicati-t.zip", 1)];

        let analysis = run(&listing, &tracker);
        assert!(tracker.volume("duplicati-t.zip").is_none());
        // The remote file was never consumed.
        assert_eq!(analysis.extra.len(), 1);
    }

    #[test]
    fn test_unknown_sizes_never_conflict() {
        let tracker = InMemoryVolumeTracker::with_records([RemoteVolumeRecord::new(
            "duplicati-u.zip",
            RemoteVolumeState::Uploading,
        )]);
        let listing = [RemoteEntry {
            name: "duplicati-u.zip".to_string(),
            size: None,
            last_modified: None,
            is_folder: false,
        }];

        let analysis = run(&listing, &tracker);
        assert!(analysis.is_consistent());
        let rec = tracker.volume("duplicati-u.zip").unwrap();
        assert_eq!(rec.state, RemoteVolumeState::Verified);
        assert_eq!(rec.size, None);
    }

    #[test]
    fn test_foreign_files_and_folders_are_ignored() {
        let tracker = InMemoryVolumeTracker::new();
        let mut folder = RemoteEntry::file("duplicati-dir", 0);
        folder.is_folder = true;
        let listing = [RemoteEntry::file("other-backup.zip", 9), folder];
        assert!(run(&listing, &tracker).is_consistent());
    }

    #[test]
    fn test_suffix_filter() {
        let naming = VolumeNaming::new("duplicati-", ".aes");
        assert!(naming.matches("duplicati-x.zip.aes"));
        assert!(!naming.matches("duplicati-x.zip"));
        assert_eq!(
            VolumeNaming::from_config(&BackendConfig::default()),
            VolumeNaming::new("duplicati", "")
        );
    }

    #[test]
    fn test_pending_deletes_are_settled() {
        let tracker = InMemoryVolumeTracker::with_records([
            RemoteVolumeRecord::new("duplicati-d1.zip", RemoteVolumeState::Deleting),
            RemoteVolumeRecord::new("duplicati-d2.zip", RemoteVolumeState::Deleting),
            RemoteVolumeRecord::new("duplicati-d3.zip", RemoteVolumeState::Deleted),
        ]);
        let listing = [RemoteEntry::file("duplicati-d2.zip", 4)];

        let analysis = run(&listing, &tracker);
        assert!(analysis.is_consistent());
        assert_eq!(
            tracker.volume("duplicati-d1.zip").unwrap().state,
            RemoteVolumeState::Deleted
        );
        assert_eq!(
            tracker.volume("duplicati-d2.zip").unwrap().state,
            RemoteVolumeState::Deleting
        );
        assert_eq!(
            tracker.volume("duplicati-d3.zip").unwrap().state,
            RemoteVolumeState::Deleted
        );
    }

    #[test]
    fn test_mixed_states_settle_cleanly() {
        let tracker = InMemoryVolumeTracker::with_records([
            RemoteVolumeRecord::new("A", RemoteVolumeState::Verified).with_size(10),
            RemoteVolumeRecord::new("B", RemoteVolumeState::Uploading).with_size(20),
            RemoteVolumeRecord::new("C", RemoteVolumeState::Temporary).with_size(5),
        ]);
        let listing = [RemoteEntry::file("A", 10), RemoteEntry::file("B", 999)];
        let records = tracker.remote_volumes();

        let analysis = analyze(&listing, &records, &VolumeNaming::new("", ""), &tracker).unwrap();
        assert!(analysis.extra.is_empty());
        assert!(analysis.missing.is_empty());
        assert_eq!(analysis.removed, 2);
        assert!(tracker.volume("B").is_none());
        assert!(tracker.volume("C").is_none());
        assert_eq!(tracker.volume("A").unwrap().state, RemoteVolumeState::Verified);
    }

    #[test]
    fn test_verified_volume_absent_from_backend_is_missing() {
        let tracker = InMemoryVolumeTracker::with_records([
            RemoteVolumeRecord::new("A", RemoteVolumeState::Verified).with_size(10),
        ]);
        let records = tracker.remote_volumes();

        let analysis = analyze(&[], &records, &VolumeNaming::new("", ""), &tracker).unwrap();
        assert!(analysis.extra.is_empty());
        assert_eq!(analysis.missing, records);
        // Missing volumes are reported, never repaired.
        assert_eq!(tracker.volume("A").unwrap().state, RemoteVolumeState::Verified);
    }

    fn state_strategy() -> impl Strategy<Value = RemoteVolumeState> {
        prop_oneof![
            Just(RemoteVolumeState::Temporary),
            Just(RemoteVolumeState::Uploading),
            Just(RemoteVolumeState::Verified),
            Just(RemoteVolumeState::Deleting),
            Just(RemoteVolumeState::Deleted),
        ]
    }

    proptest! {
        #[test]
        fn test_prop_every_listed_file_is_accounted_once(
            records in prop::collection::btree_map("[a-f]{1,3}", (state_strategy(), prop::option::of(0u64..4)), 0..12),
            remote in prop::collection::btree_map("[a-f]{1,3}", prop::option::of(0u64..4), 0..12),
        ) {
            let records: Vec<RemoteVolumeRecord> = records
                .into_iter()
                .map(|(name, (state, size))| RemoteVolumeRecord {
                    name: format!("duplicati-{}", name),
                    state,
                    size,
                    hash: None,
                })
                .collect();
            let listing: Vec<RemoteEntry> = remote
                .into_iter()
                .map(|(name, size)| RemoteEntry {
                    name: format!("duplicati-{}", name),
                    size,
                    last_modified: None,
                    is_folder: false,
                })
                .collect();

            let tracker = InMemoryVolumeTracker::with_records(records.clone());
            let analysis = analyze(&listing, &records, &naming(), &tracker).unwrap();

            for entry in &analysis.extra {
                let owner = records.iter().find(|r| r.name == entry.name);
                prop_assert!(owner.map_or(true, |r| r.state == RemoteVolumeState::Temporary));
            }
            for missing in &analysis.missing {
                prop_assert_eq!(missing.state, RemoteVolumeState::Verified);
            }
            for record in tracker.remote_volumes() {
                prop_assert!(record.state != RemoteVolumeState::Temporary);
                prop_assert!(record.state != RemoteVolumeState::Uploading);
            }
        }
    }
}
