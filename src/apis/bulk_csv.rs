use crate::constants::BULK_CSV_SOURCE;
use crate::error::{EaiError, Result};
use crate::types::{RawRecord, SourceClient};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use tracing::{info, instrument, warn};

/// Source client over a BEA bulk CSV extract.
///
/// The bulk files are wide: one row per (region, line code) with one column
/// per year. Used for offline historical backfills; the API client covers
/// scheduled pulls.
pub struct BulkCsvSource {
    path: PathBuf,
}

impl BulkCsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Minimal quoted-field splitter; the bulk files quote names containing
    /// commas ("Autauga, AL") but are otherwise plain.
    fn split_line(line: &str) -> Vec<String> {
        let mut fields = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        for c in line.chars() {
            match c {
                '"' => in_quotes = !in_quotes,
                ',' if !in_quotes => {
                    fields.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(c),
            }
        }
        fields.push(current.trim().to_string());
        fields
    }
}

#[async_trait::async_trait]
impl SourceClient for BulkCsvSource {
    fn source_name(&self) -> &'static str {
        BULK_CSV_SOURCE
    }

    #[instrument(skip(self), fields(table = %table, path = %self.path.display()))]
    async fn fetch(
        &self,
        table: &str,
        _region_scope: &str,
        years: RangeInclusive<i32>,
    ) -> Result<Vec<RawRecord>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            EaiError::SourceUnavailable {
                attempts: 1,
                message: format!("failed to read {}: {}", self.path.display(), e),
            }
        })?;

        let mut lines = content.lines();
        let header = lines.next().ok_or_else(|| EaiError::SourceSchemaMismatch {
            table: table.to_string(),
            detail: "bulk file is empty".to_string(),
        })?;
        let columns = Self::split_line(header);

        let index_of = |name: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(name));
        let fips_idx = index_of("GeoFIPS").ok_or_else(|| EaiError::SourceSchemaMismatch {
            table: table.to_string(),
            detail: "bulk file missing GeoFIPS column".to_string(),
        })?;
        let line_idx = index_of("LineCode").ok_or_else(|| EaiError::SourceSchemaMismatch {
            table: table.to_string(),
            detail: "bulk file missing LineCode column".to_string(),
        })?;
        let table_idx = index_of("TableName");
        let unit_idx = index_of("Unit");

        // Year columns: every header that parses as a calendar year.
        let year_columns: HashMap<usize, i32> = columns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.parse::<i32>().ok().map(|y| (i, y)))
            .filter(|(_, y)| years.contains(y))
            .collect();
        if year_columns.is_empty() {
            return Err(EaiError::SourceSchemaMismatch {
                table: table.to_string(),
                detail: format!("bulk file has no year columns within {:?}", years),
            });
        }

        let mut records = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let fields = Self::split_line(line);
            if fields.len() < columns.len() {
                // Bulk files end with free-text footnote lines.
                continue;
            }
            if let Some(ti) = table_idx {
                if !fields[ti].is_empty() && fields[ti] != table {
                    return Err(EaiError::SourceSchemaMismatch {
                        table: table.to_string(),
                        detail: format!("bulk file row is for table '{}'", fields[ti]),
                    });
                }
            }
            let region_id = fields[fips_idx].trim().to_string();
            let line_code = match fields[line_idx].parse::<u32>() {
                Ok(code) => code,
                Err(_) => {
                    warn!("Skipping row with non-numeric line code: {}", fields[line_idx]);
                    continue;
                }
            };
            let unit = unit_idx.map(|i| fields[i].clone()).unwrap_or_default();

            for (&col, &year) in &year_columns {
                records.push(RawRecord {
                    region_id: region_id.clone(),
                    year,
                    line_code,
                    value: fields[col].clone(),
                    unit: unit.clone(),
                    status_flag: None,
                    // Bulk extracts carry no revision signal.
                    revision: None,
                });
            }
        }

        info!(
            "Read {} raw cells from bulk file {}",
            records.len(),
            self.path.display()
        );
        Ok(records)
    }
}
