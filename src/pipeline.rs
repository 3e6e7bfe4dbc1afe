use crate::archive::{ArchiveStore, RunRecord};
use crate::config::Config;
use crate::error::{EaiError, Result};
use crate::normalize::{normalize, MalformedGroup};
use crate::panel::build_panel;
use crate::sink::PublicationSink;
use crate::snapshot::SnapshotManager;
use crate::types::{CommitResult, PanelRow, ReleaseTag, SourceClient};
use chrono::Utc;
use metrics::{counter, histogram};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Result of one complete pipeline run for a (table, year, release tag).
#[derive(Debug)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub year: i32,
    pub release_tag: ReleaseTag,
    pub records_fetched: usize,
    pub unknown_dropped: usize,
    pub malformed: Vec<MalformedGroup>,
    pub rows_emitted: usize,
    pub commit: CommitResult,
}

impl PipelineResult {
    /// A run that changed nothing: valid, but distinct from an update for
    /// the external scheduler.
    pub fn is_noop(&self) -> bool {
        !self.commit.archived && !self.commit.promoted
    }
}

/// The batch pipeline: fetch → normalize → build → commit → publish.
///
/// One logical run per invocation. The advisory lease keyed (table, year)
/// makes the snapshot commit the only guarded shared-state boundary; a run
/// that fails anywhere leaves the archive and CurrentView untouched.
pub struct Pipeline {
    config: Config,
    source: Arc<dyn SourceClient>,
    archive: Arc<dyn ArchiveStore>,
    snapshots: SnapshotManager,
    sink: PublicationSink,
}

impl Pipeline {
    pub fn new(config: Config, source: Arc<dyn SourceClient>, archive: Arc<dyn ArchiveStore>) -> Self {
        let snapshots = SnapshotManager::new(archive.clone());
        let sink = PublicationSink::new(&config.sink);
        Self {
            config,
            source,
            archive,
            snapshots,
            sink,
        }
    }

    /// Runs the full pipeline for one year under the advisory lease and
    /// records the outcome in the run ledger.
    #[instrument(skip(self), fields(table = %self.config.source.table))]
    pub async fn run_for_year(&self, year: i32, release_tag: ReleaseTag) -> Result<PipelineResult> {
        let run_id = Uuid::new_v4();
        let holder = run_id.to_string();
        let table = self.config.source.table.clone();
        let started_at = Utc::now();

        if !self.archive.acquire_lease(&table, year, &holder).await? {
            return Err(EaiError::LeaseHeld { table, year });
        }

        counter!("eai_pipeline_runs_total", "table" => table.clone()).increment(1);
        let t_run = std::time::Instant::now();
        let outcome = self.execute(run_id, year, release_tag).await;
        histogram!("eai_pipeline_duration_seconds", "table" => table.clone())
            .record(t_run.elapsed().as_secs_f64());

        let record = match &outcome {
            Ok(result) => RunRecord {
                run_id,
                table: table.clone(),
                year,
                release_tag,
                status: if result.is_noop() { "no_op" } else { "success" }.to_string(),
                records_fetched: result.records_fetched,
                rows_emitted: result.rows_emitted,
                error: None,
                started_at,
                finished_at: Some(Utc::now()),
            },
            Err(e) => RunRecord {
                run_id,
                table: table.clone(),
                year,
                release_tag,
                status: "failed".to_string(),
                records_fetched: 0,
                rows_emitted: 0,
                error: Some(e.to_string()),
                started_at,
                finished_at: Some(Utc::now()),
            },
        };
        if let Err(e) = self.archive.record_run(&record).await {
            warn!("Failed to write run ledger entry: {}", e);
        }
        if let Err(e) = self.archive.release_lease(&table, year, &holder).await {
            warn!("Failed to release lease for {} year {}: {}", table, year, e);
        }
        outcome
    }

    async fn execute(
        &self,
        run_id: Uuid,
        year: i32,
        release_tag: ReleaseTag,
    ) -> Result<PipelineResult> {
        let table = &self.config.source.table;
        info!(
            "Starting {} run for table {} year {}",
            release_tag, table, year
        );

        // Step 1: fetch raw cells.
        let raw_records = self
            .source
            .fetch(table, &self.config.source.region_scope, year..=year)
            .await?;
        counter!("eai_records_fetched_total", "table" => table.clone())
            .increment(raw_records.len() as u64);

        // Step 2: normalize into the tidy relation.
        let known = self.config.known_line_codes();
        let normalized = normalize(&raw_records, &known);
        for group in &normalized.malformed {
            error!(
                "Malformed row group dropped: table={} region={} year={}: {}",
                table, group.region_id, group.year, group.detail
            );
        }
        counter!("eai_malformed_groups_total", "table" => table.clone())
            .increment(normalized.malformed.len() as u64);

        // Step 3: pivot into the panel and compute the composite.
        let panel = build_panel(
            &normalized.observations,
            &self.config.components,
            self.config.panel.formula,
        );
        counter!("eai_rows_emitted_total", "table" => table.clone())
            .increment(panel.rows.len() as u64);

        // An empty panel means the source returned nothing usable for the
        // year. Committing it would promote an empty snapshot over a
        // populated CurrentView, so the run fails and leaves state intact.
        if panel.rows.is_empty() {
            return Err(match normalized.malformed.first() {
                Some(group) => group.to_error(),
                None => EaiError::SourceSchemaMismatch {
                    table: table.clone(),
                    detail: format!(
                        "source returned {} record(s) but no usable rows for year {}",
                        raw_records.len(),
                        year
                    ),
                },
            });
        }

        // Step 4: commit through the snapshot state machine.
        let commit = self
            .snapshots
            .commit(&panel.rows, year, release_tag, Some(table.clone()))
            .await?;
        if !panel.stats.is_empty() {
            self.archive.record_year_stats(run_id, &panel.stats).await?;
        }

        // Step 5: publish the current view. Runs on the no-op path too: the
        // write is an idempotent overwrite, and re-running after a sink
        // outage must repair the sink even though the commit is unchanged.
        self.publish_current().await?;

        Ok(PipelineResult {
            run_id,
            year,
            release_tag,
            records_fetched: raw_records.len(),
            unknown_dropped: normalized.unknown_dropped,
            malformed: normalized.malformed,
            rows_emitted: panel.rows.len(),
            commit,
        })
    }

    /// Historical backfill: one commit per year over an explicit range,
    /// through the same fetch interface as the incremental pull.
    pub async fn backfill(
        &self,
        start_year: i32,
        end_year: i32,
        release_tag: ReleaseTag,
    ) -> Result<Vec<PipelineResult>> {
        let mut results = Vec::new();
        for year in start_year..=end_year {
            results.push(self.run_for_year(year, release_tag).await?);
        }
        Ok(results)
    }

    /// Re-publishes every CurrentView entry to the sink destinations.
    pub async fn publish_current(&self) -> Result<()> {
        publish_current(&self.config, self.archive.as_ref(), &self.sink).await
    }
}

/// Publishes all CurrentView entries. Standalone so the CLI can re-publish
/// without constructing a source client.
pub async fn publish_current(
    config: &Config,
    archive: &dyn ArchiveStore,
    sink: &PublicationSink,
) -> Result<()> {
    let mut entries: Vec<(i32, Vec<PanelRow>)> = Vec::new();
    for year in archive.current_years().await? {
        if let Some(rows) = archive.current_rows(year).await? {
            entries.push((year, rows));
        }
    }
    let component_names: Vec<String> = config.components.iter().map(|c| c.name.clone()).collect();
    sink.publish(&entries, &component_names).await
}
