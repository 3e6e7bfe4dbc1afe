use crate::config::SinkConfig;
use crate::error::{EaiError, Result};
use crate::types::PanelRow;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Writes the promoted CurrentView panel to the durable destinations read by
/// the display layers: one JSON snapshot artifact per year and one delimited
/// materialized relation across years.
///
/// Safe to invoke repeatedly with identical input. Every artifact is staged
/// to a temp path and swapped with an atomic rename, so a reader never sees
/// a half-written file and a failed publish leaves the last good artifacts
/// live. Historical snapshot archives are never touched here.
pub struct PublicationSink {
    snapshot_dir: PathBuf,
    relation_path: PathBuf,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl PublicationSink {
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            snapshot_dir: PathBuf::from(&config.snapshot_dir),
            relation_path: PathBuf::from(&config.relation_path),
            retry_attempts: config.retry_attempts.max(1),
            retry_base_delay: Duration::from_secs(config.retry_base_delay_secs),
        }
    }

    #[instrument(skip(self, entries), fields(years = entries.len()))]
    pub async fn publish(
        &self,
        entries: &[(i32, Vec<PanelRow>)],
        component_names: &[String],
    ) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry_attempts {
            match self.write_all(entries, component_names) {
                Ok(()) => {
                    info!(
                        "Published {} year artifact(s) and relation {}",
                        entries.len(),
                        self.relation_path.display()
                    );
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        "Publish failed: {} (attempt {}/{})",
                        last_error, attempt, self.retry_attempts
                    );
                }
            }
            if attempt < self.retry_attempts {
                tokio::time::sleep(self.retry_base_delay * 2u32.saturating_pow(attempt - 1))
                    .await;
            }
        }
        Err(EaiError::SinkUnavailable {
            attempts: self.retry_attempts,
            message: last_error,
        })
    }

    fn write_all(
        &self,
        entries: &[(i32, Vec<PanelRow>)],
        component_names: &[String],
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.snapshot_dir)?;
        for (year, rows) in entries {
            let path = self.snapshot_dir.join(format!("eai_panel_{year}.json"));
            let json = serde_json::to_string_pretty(rows)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            write_atomic(&path, json.as_bytes())?;
        }

        if let Some(parent) = self.relation_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let relation = render_relation(entries, component_names);
        write_atomic(&self.relation_path, relation.as_bytes())?;
        Ok(())
    }
}

/// Stage-then-rename; rename within one directory is atomic on POSIX.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn render_relation(entries: &[(i32, Vec<PanelRow>)], component_names: &[String]) -> String {
    let mut out = String::from("region_id,year");
    for name in component_names {
        out.push(',');
        out.push_str(name);
    }
    for name in component_names {
        out.push(',');
        out.push_str(name);
        out.push_str("_share");
    }
    out.push_str(",composite_index\n");

    let mut all_rows: Vec<&PanelRow> = entries.iter().flat_map(|(_, rows)| rows.iter()).collect();
    all_rows.sort_by(|a, b| {
        a.region_id
            .cmp(&b.region_id)
            .then_with(|| a.year.cmp(&b.year))
    });

    for row in all_rows {
        out.push_str(&row.region_id);
        out.push(',');
        out.push_str(&row.year.to_string());
        for name in component_names {
            out.push(',');
            push_cell(&mut out, row.component_values.get(name).copied().flatten());
        }
        for name in component_names {
            out.push(',');
            push_cell(&mut out, row.shares.get(name).copied().flatten());
        }
        out.push(',');
        push_cell(&mut out, row.composite_index);
        out.push('\n');
    }
    out
}

fn push_cell(out: &mut String, value: Option<f64>) {
    if let Some(v) = value {
        out.push_str(&v.to_string());
    }
    // Null cells stay empty.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_rows() -> Vec<PanelRow> {
        let mut components = BTreeMap::new();
        components.insert("earned".to_string(), Some(1000.0));
        components.insert("property".to_string(), None);
        components.insert("transfer".to_string(), Some(500.0));
        let mut shares = BTreeMap::new();
        shares.insert("earned".to_string(), None);
        shares.insert("property".to_string(), None);
        shares.insert("transfer".to_string(), None);
        vec![PanelRow {
            region_id: "06037".to_string(),
            year: 2022,
            component_values: components,
            shares,
            composite_index: None,
        }]
    }

    fn sink(dir: &Path) -> PublicationSink {
        PublicationSink::new(&SinkConfig {
            snapshot_dir: dir.join("current").to_string_lossy().into_owned(),
            relation_path: dir.join("current/eai_panel.csv").to_string_lossy().into_owned(),
            retry_attempts: 2,
            retry_base_delay_secs: 0,
        })
    }

    #[tokio::test]
    async fn publishes_artifacts_and_relation() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let names = vec![
            "earned".to_string(),
            "property".to_string(),
            "transfer".to_string(),
        ];

        let entries = vec![(2022, sample_rows())];
        sink.publish(&entries, &names).await.unwrap();

        let artifact = dir.path().join("current/eai_panel_2022.json");
        assert!(artifact.exists());
        let rows: Vec<PanelRow> =
            serde_json::from_str(&std::fs::read_to_string(artifact).unwrap()).unwrap();
        assert_eq!(rows[0].region_id, "06037");

        let relation = std::fs::read_to_string(dir.path().join("current/eai_panel.csv")).unwrap();
        let mut lines = relation.lines();
        assert_eq!(
            lines.next().unwrap(),
            "region_id,year,earned,property,transfer,earned_share,property_share,transfer_share,composite_index"
        );
        // Null components are empty cells, not zeros.
        assert_eq!(lines.next().unwrap(), "06037,2022,1000,,500,,,,");
    }

    #[tokio::test]
    async fn republish_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let names = vec!["earned".to_string()];
        let entries = vec![(2022, sample_rows())];

        sink.publish(&entries, &names).await.unwrap();
        let first = std::fs::read_to_string(dir.path().join("current/eai_panel.csv")).unwrap();
        sink.publish(&entries, &names).await.unwrap();
        let second = std::fs::read_to_string(dir.path().join("current/eai_panel.csv")).unwrap();
        assert_eq!(first, second);

        // No staging leftovers.
        assert!(!dir.path().join("current/eai_panel.tmp").exists());
    }
}
