use crate::archive::ArchiveStore;
use crate::error::{EaiError, Result};
use crate::fingerprint::content_hash;
use crate::types::{CommitResult, PanelRow, ReleaseTag, SnapshotMeta};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Per-year release state, derived from the CurrentView pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearState {
    NoSnapshot,
    HasProvisional,
    HasFinal,
}

/// Decides, per completed panel run, whether to archive a new snapshot,
/// promote it to CurrentView, or do nothing.
///
/// Comparison is by content hash only. The caller holds the advisory lease
/// for (table, year) around `commit`; this type never reads the clock to
/// decide anything.
pub struct SnapshotManager {
    store: Arc<dyn ArchiveStore>,
}

impl SnapshotManager {
    pub fn new(store: Arc<dyn ArchiveStore>) -> Self {
        Self { store }
    }

    pub async fn state_of(&self, year: i32) -> Result<YearState> {
        Ok(match self.store.current_meta(year).await? {
            None => YearState::NoSnapshot,
            Some(meta) => match meta.release_tag {
                ReleaseTag::Provisional => YearState::HasProvisional,
                ReleaseTag::Final => YearState::HasFinal,
            },
        })
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn commit(
        &self,
        rows: &[PanelRow],
        year: i32,
        release_tag: ReleaseTag,
        source_table_version: Option<String>,
    ) -> Result<CommitResult> {
        let hash = content_hash(rows);
        let current = self.store.current_meta(year).await?;

        let archive = match (&current, release_tag) {
            (None, _) => true,
            (Some(prev), ReleaseTag::Provisional) => match prev.release_tag {
                ReleaseTag::Final => {
                    return Err(EaiError::InvalidTransition {
                        year,
                        detail: format!(
                            "provisional run rejected: year already reconciled as final ({})",
                            prev.content_hash
                        ),
                    });
                }
                ReleaseTag::Provisional => prev.content_hash != hash,
            },
            (Some(prev), ReleaseTag::Final) => match prev.release_tag {
                // The tag itself changed, so a final always supersedes the
                // provisional in CurrentView even on a hash match.
                ReleaseTag::Provisional => true,
                ReleaseTag::Final => {
                    if prev.content_hash != hash {
                        // Minor revision of an already-final year: rare, and
                        // logged apart from a scheduled refresh.
                        warn!(
                            "Final snapshot for year {} revised after reconciliation: {} -> {}",
                            year, prev.content_hash, hash
                        );
                        true
                    } else {
                        false
                    }
                }
            },
        };

        if !archive {
            info!(
                "Snapshot unchanged for year {} ({}); no archive entry written",
                year, release_tag
            );
            return Ok(CommitResult {
                archived: false,
                promoted: false,
                content_hash: hash,
            });
        }

        let meta = SnapshotMeta {
            year,
            release_tag,
            content_hash: hash.clone(),
            created_at: Utc::now(),
            source_table_version,
            row_count: rows.len(),
        };
        self.store.commit_snapshot(&meta, rows).await?;
        info!(
            "Archived and promoted snapshot year={} tag={} rows={}",
            year,
            release_tag,
            rows.len()
        );
        Ok(CommitResult {
            archived: true,
            promoted: true,
            content_hash: hash,
        })
    }
}
