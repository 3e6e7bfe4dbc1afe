use anyhow::Result;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

use eai_pipeline::archive::{ArchiveStore, InMemoryArchive};
use eai_pipeline::config::Config;
use eai_pipeline::error::EaiError;
use eai_pipeline::pipeline::Pipeline;
use eai_pipeline::types::{PanelRow, RawRecord, ReleaseTag, SourceClient};

/// Source client stub whose record set can be swapped between runs.
struct StubSource {
    records: Mutex<Vec<RawRecord>>,
}

impl StubSource {
    fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    fn set_records(&self, records: Vec<RawRecord>) {
        *self.records.lock().unwrap() = records;
    }
}

#[async_trait::async_trait]
impl SourceClient for StubSource {
    fn source_name(&self) -> &'static str {
        "stub"
    }

    async fn fetch(
        &self,
        _table: &str,
        _region_scope: &str,
        years: RangeInclusive<i32>,
    ) -> eai_pipeline::error::Result<Vec<RawRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| years.contains(&r.year))
            .cloned()
            .collect())
    }
}

fn raw(region: &str, year: i32, line: u32, value: &str) -> RawRecord {
    RawRecord {
        region_id: region.to_string(),
        year,
        line_code: line,
        value: value.to_string(),
        unit: "Thousands of dollars".to_string(),
        status_flag: None,
        revision: None,
    }
}

fn test_config(dir: &Path) -> Config {
    let toml = format!(
        r#"
        [source]
        table = "SAINC7"
        base_url = "http://localhost/unused"
        api_key_env = "BEA_API_KEY"
        region_scope = "COUNTY"

        [[components]]
        name = "earned"
        line_code = 45
        sign = 1.0

        [[components]]
        name = "property"
        line_code = 46
        sign = 1.0

        [[components]]
        name = "transfer"
        line_code = 47
        sign = -1.0

        [panel]
        formula = "share_ratio"

        [schedule]
        provisional_month = 4
        final_month = 11

        [archive]
        root = "{root}"

        [sink]
        snapshot_dir = "{current}"
        relation_path = "{relation}"
        retry_attempts = 2
        retry_base_delay_secs = 0
        "#,
        root = dir.join("archive").display(),
        current = dir.join("current").display(),
        relation = dir.join("current/eai_panel.csv").display(),
    );
    let config_path = dir.join("config.toml");
    std::fs::write(&config_path, toml).unwrap();
    Config::load(config_path.to_str().unwrap()).unwrap()
}

fn first_load_records() -> Vec<RawRecord> {
    vec![
        raw("06037", 2022, 45, "1000"),
        raw("06037", 2022, 46, "500"),
        raw("06037", 2022, 47, "500"),
    ]
}

struct Harness {
    pipeline: Pipeline,
    source: Arc<StubSource>,
    archive: Arc<InMemoryArchive>,
    _dir: tempfile::TempDir,
}

fn harness(records: Vec<RawRecord>) -> Harness {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let source = Arc::new(StubSource::new(records));
    let archive = Arc::new(InMemoryArchive::new());
    let pipeline = Pipeline::new(config, source.clone(), archive.clone());
    Harness {
        pipeline,
        source,
        archive,
        _dir: dir,
    }
}

#[tokio::test]
async fn first_provisional_load_archives_and_publishes() -> Result<()> {
    let h = harness(first_load_records());

    let result = h.pipeline.run_for_year(2022, ReleaseTag::Provisional).await?;
    assert_eq!(result.records_fetched, 3);
    assert_eq!(result.rows_emitted, 1);
    assert!(result.commit.archived);
    assert!(result.commit.promoted);
    assert!(!result.is_noop());

    let rows = h.archive.current_rows(2022).await?.unwrap();
    let row = &rows[0];
    assert_eq!(row.region_id, "06037");
    assert_eq!(row.component_values["earned"], Some(1000.0));
    assert_eq!(row.component_values["property"], Some(500.0));
    assert_eq!(row.component_values["transfer"], Some(500.0));
    // (1000 + 500 - 500) / 2000 under the configured share-ratio formula.
    assert_eq!(row.composite_index, Some(0.5));

    // Sink artifacts landed.
    let artifact = h._dir.path().join("current/eai_panel_2022.json");
    let published: Vec<PanelRow> =
        serde_json::from_str(&std::fs::read_to_string(artifact)?)?;
    assert_eq!(published, rows);
    assert!(h._dir.path().join("current/eai_panel.csv").exists());

    // Run ledger recorded a success.
    let runs = h.archive.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "success");
    Ok(())
}

#[tokio::test]
async fn unchanged_rerun_is_noop_without_duplicate_snapshot() -> Result<()> {
    let h = harness(first_load_records());

    h.pipeline.run_for_year(2022, ReleaseTag::Provisional).await?;
    let second = h.pipeline.run_for_year(2022, ReleaseTag::Provisional).await?;

    assert!(!second.commit.archived);
    assert!(!second.commit.promoted);
    assert!(second.is_noop());
    assert_eq!(h.archive.archived_count(2022), 1);

    let statuses: Vec<String> = h.archive.runs().iter().map(|r| r.status.clone()).collect();
    assert_eq!(statuses, vec!["success", "no_op"]);
    Ok(())
}

#[tokio::test]
async fn reconciliation_revision_keeps_provisional_in_archive() -> Result<()> {
    let h = harness(first_load_records());

    let provisional = h.pipeline.run_for_year(2022, ReleaseTag::Provisional).await?;

    // Final release revises transfers to 600.
    h.source.set_records(vec![
        raw("06037", 2022, 45, "1000"),
        raw("06037", 2022, 46, "500"),
        raw("06037", 2022, 47, "600"),
    ]);
    let final_run = h.pipeline.run_for_year(2022, ReleaseTag::Final).await?;

    assert!(final_run.commit.archived);
    assert!(final_run.commit.promoted);
    assert_ne!(final_run.commit.content_hash, provisional.commit.content_hash);

    // The superseded provisional snapshot stays retrievable under its hash.
    let old = h
        .archive
        .snapshot_rows(2022, &provisional.commit.content_hash)
        .await?
        .unwrap();
    assert_eq!(old[0].component_values["transfer"], Some(500.0));

    let current = h.archive.current_rows(2022).await?.unwrap();
    assert_eq!(current[0].component_values["transfer"], Some(600.0));
    Ok(())
}

#[tokio::test]
async fn provisional_after_final_fails_without_side_effects() -> Result<()> {
    let h = harness(first_load_records());

    h.pipeline.run_for_year(2022, ReleaseTag::Final).await?;
    let err = h
        .pipeline
        .run_for_year(2022, ReleaseTag::Provisional)
        .await
        .unwrap_err();
    assert!(matches!(err, EaiError::InvalidTransition { year: 2022, .. }));

    assert_eq!(h.archive.archived_count(2022), 1);
    let statuses: Vec<String> = h.archive.runs().iter().map(|r| r.status.clone()).collect();
    assert_eq!(statuses, vec!["success", "failed"]);

    // The failed run released its lease; a corrected re-run succeeds.
    h.source.set_records(first_load_records());
    let retry = h.pipeline.run_for_year(2022, ReleaseTag::Final).await?;
    assert!(retry.is_noop());
    Ok(())
}

#[tokio::test]
async fn suppressed_cell_publishes_null_not_zero() -> Result<()> {
    let h = harness(vec![
        raw("06037", 2022, 45, "1000"),
        raw("06037", 2022, 46, "(D)"),
        raw("06037", 2022, 47, "500"),
    ]);

    h.pipeline.run_for_year(2022, ReleaseTag::Provisional).await?;
    let rows = h.archive.current_rows(2022).await?.unwrap();
    let row = &rows[0];
    assert_eq!(row.component_values["earned"], Some(1000.0));
    assert_eq!(row.component_values["property"], None);
    assert_eq!(row.component_values["transfer"], Some(500.0));
    assert_eq!(row.composite_index, None);

    // The relation renders the suppressed component as an empty cell.
    let relation = std::fs::read_to_string(h._dir.path().join("current/eai_panel.csv"))?;
    let data_line = relation.lines().nth(1).unwrap();
    assert!(data_line.starts_with("06037,2022,1000,,500"));
    Ok(())
}

#[tokio::test]
async fn malformed_group_is_reported_and_rest_proceeds() -> Result<()> {
    let mut records = first_load_records();
    // Conflicting duplicate without a revision signal for a second region.
    records.push(raw("06075", 2022, 45, "800"));
    records.push(raw("06075", 2022, 45, "900"));
    records.push(raw("06075", 2022, 46, "100"));
    records.push(raw("06075", 2022, 47, "100"));
    let h = harness(records);

    let result = h.pipeline.run_for_year(2022, ReleaseTag::Provisional).await?;
    assert_eq!(result.malformed.len(), 1);
    assert_eq!(result.malformed[0].region_id, "06075");
    // The clean region still made it through.
    assert_eq!(result.rows_emitted, 1);
    let rows = h.archive.current_rows(2022).await?.unwrap();
    assert_eq!(rows[0].region_id, "06037");
    Ok(())
}

#[tokio::test]
async fn empty_fetch_fails_without_touching_current_view() -> Result<()> {
    let h = harness(first_load_records());
    h.pipeline.run_for_year(2022, ReleaseTag::Provisional).await?;

    // Transient empty-but-successful source response on the re-run.
    h.source.set_records(vec![]);
    let err = h
        .pipeline
        .run_for_year(2022, ReleaseTag::Provisional)
        .await
        .unwrap_err();
    assert!(matches!(err, EaiError::SourceSchemaMismatch { .. }));

    // The populated snapshot and CurrentView survive, as do the artifacts.
    assert_eq!(h.archive.archived_count(2022), 1);
    let rows = h.archive.current_rows(2022).await?.unwrap();
    assert_eq!(rows.len(), 1);
    let artifact = h._dir.path().join("current/eai_panel_2022.json");
    let published: Vec<PanelRow> =
        serde_json::from_str(&std::fs::read_to_string(artifact)?)?;
    assert_eq!(published.len(), 1);

    let statuses: Vec<String> = h.archive.runs().iter().map(|r| r.status.clone()).collect();
    assert_eq!(statuses, vec!["success", "failed"]);
    Ok(())
}

#[tokio::test]
async fn entirely_malformed_input_fails_with_malformed_record() -> Result<()> {
    // The only region's group carries a conflicting unordered duplicate, so
    // nothing usable remains after rejection.
    let h = harness(vec![
        raw("06037", 2022, 45, "800"),
        raw("06037", 2022, 45, "900"),
        raw("06037", 2022, 46, "500"),
    ]);

    let err = h
        .pipeline
        .run_for_year(2022, ReleaseTag::Provisional)
        .await
        .unwrap_err();
    assert!(matches!(err, EaiError::MalformedRecord { year: 2022, .. }));
    assert_eq!(h.archive.archived_count(2022), 0);
    assert!(h.archive.current_rows(2022).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn backfill_commits_each_year_independently() -> Result<()> {
    let mut records = Vec::new();
    for year in 2020..=2022 {
        records.push(raw("06037", year, 45, "1000"));
        records.push(raw("06037", year, 46, "500"));
        records.push(raw("06037", year, 47, "500"));
    }
    let h = harness(records);

    let results = h
        .pipeline
        .backfill(2020, 2022, ReleaseTag::Provisional)
        .await?;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.commit.archived));
    for year in 2020..=2022 {
        assert!(h.archive.current_rows(year).await?.is_some());
        assert!(h
            ._dir
            .path()
            .join(format!("current/eai_panel_{year}.json"))
            .exists());
    }
    Ok(())
}

#[tokio::test]
async fn content_hash_ignores_record_order() -> Result<()> {
    let h = harness(first_load_records());
    let first = h.pipeline.run_for_year(2022, ReleaseTag::Provisional).await?;

    let mut reversed = first_load_records();
    reversed.reverse();
    h.source.set_records(reversed);
    let second = h.pipeline.run_for_year(2022, ReleaseTag::Provisional).await?;

    assert_eq!(first.commit.content_hash, second.commit.content_hash);
    assert!(second.is_noop());
    Ok(())
}

#[tokio::test]
async fn held_lease_blocks_second_run() -> Result<()> {
    let h = harness(first_load_records());
    assert!(h.archive.acquire_lease("SAINC7", 2022, "other-run").await?);

    let err = h
        .pipeline
        .run_for_year(2022, ReleaseTag::Provisional)
        .await
        .unwrap_err();
    assert!(matches!(err, EaiError::LeaseHeld { year: 2022, .. }));
    assert_eq!(h.archive.archived_count(2022), 0);

    h.archive.release_lease("SAINC7", 2022, "other-run").await?;
    let result = h.pipeline.run_for_year(2022, ReleaseTag::Provisional).await?;
    assert!(result.commit.archived);
    Ok(())
}
