use crate::config::SourceConfig;
use crate::constants::BEA_API_SOURCE;
use crate::error::{EaiError, Result};
use crate::types::{RawRecord, SourceClient};
use serde_json::Value;
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Client for the BEA Regional statistics API.
///
/// Issues one GetData request per year and passes cell text, units and note
/// markers through verbatim; classification happens in the normalizer.
pub struct BeaApiSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    line_codes: Vec<u32>,
    retry_attempts: u32,
    retry_base_delay: Duration,
    fetch_concurrency: usize,
}

impl BeaApiSource {
    pub fn new(config: &SourceConfig, line_codes: Vec<u32>) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            EaiError::Config(format!(
                "environment variable {} is required for the BEA API",
                config.api_key_env
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key,
            line_codes,
            retry_attempts: config.retry_attempts.max(1),
            retry_base_delay: Duration::from_secs(config.retry_base_delay_secs),
            fetch_concurrency: config.fetch_concurrency.max(1),
        })
    }

    /// One GetData call with bounded exponential backoff on transient failures.
    async fn fetch_year_with_retry(
        client: reqwest::Client,
        base_url: String,
        api_key: String,
        table: String,
        region_scope: String,
        line_codes: String,
        year: i32,
        attempts: u32,
        base_delay: Duration,
    ) -> Result<Vec<RawRecord>> {
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let request = client.get(&base_url).query(&[
                ("method", "GetData"),
                ("datasetname", "Regional"),
                ("TableName", table.as_str()),
                ("LineCode", line_codes.as_str()),
                ("Year", &year.to_string()),
                ("GeoFips", region_scope.as_str()),
                ("ResultFormat", "JSON"),
                ("UserID", api_key.as_str()),
            ]);

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    // A truncated or garbled body is as transient as a
                    // refused connection; only a well-formed response that
                    // fails envelope validation aborts the retry loop.
                    match response.json::<Value>().await {
                        Ok(body) => return Self::parse_response(&table, year, &body),
                        Err(e) => {
                            last_error = format!("body read failed: {e}");
                            warn!(
                                "BEA request for year {} failed: {} (attempt {}/{})",
                                year, last_error, attempt, attempts
                            );
                        }
                    }
                }
                Ok(response) => {
                    last_error = format!("HTTP status {}", response.status().as_u16());
                    warn!(
                        "BEA request for year {} failed with {} (attempt {}/{})",
                        year, last_error, attempt, attempts
                    );
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        "BEA request for year {} failed: {} (attempt {}/{})",
                        year, last_error, attempt, attempts
                    );
                }
            }

            if attempt < attempts {
                let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
        }

        Err(EaiError::SourceUnavailable {
            attempts,
            message: format!("year {}: {}", year, last_error),
        })
    }

    /// Validates the BEAAPI/Results/Data envelope and maps each cell to a
    /// RawRecord. A missing envelope means the source changed shape, which
    /// is fatal for the run rather than retryable.
    fn parse_response(table: &str, year: i32, body: &Value) -> Result<Vec<RawRecord>> {
        let results = body
            .get("BEAAPI")
            .and_then(|v| v.get("Results"))
            .ok_or_else(|| EaiError::SourceSchemaMismatch {
                table: table.to_string(),
                detail: "response missing BEAAPI.Results envelope".to_string(),
            })?;

        if let Some(error) = results.get("Error") {
            return Err(EaiError::SourceSchemaMismatch {
                table: table.to_string(),
                detail: format!("source reported error: {error}"),
            });
        }

        let data = results
            .get("Data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EaiError::SourceSchemaMismatch {
                table: table.to_string(),
                detail: "response missing Results.Data array".to_string(),
            })?;

        let mut records = Vec::with_capacity(data.len());
        for cell in data {
            match Self::parse_cell(table, year, cell) {
                Some(record) => records.push(record),
                None => {
                    debug!("Skipping unparseable cell: {}", cell);
                }
            }
        }
        Ok(records)
    }

    fn parse_cell(table: &str, default_year: i32, cell: &Value) -> Option<RawRecord> {
        let region_id = cell.get("GeoFips")?.as_str()?.trim().to_string();
        let year = cell
            .get("TimePeriod")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(default_year);
        let line_code = Self::line_code_of(table, cell)?;
        let value = cell.get("DataValue")?.as_str()?.trim().to_string();
        let unit = cell
            .get("CL_UNIT")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let status_flag = cell
            .get("NoteRef")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let revision = cell
            .get("Revision")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u32>().ok());

        Some(RawRecord {
            region_id,
            year,
            line_code,
            value,
            unit,
            status_flag,
            revision,
        })
    }

    /// The API reports the series either as a bare LineCode or as a
    /// "TABLE-CODE" compound in the Code field.
    fn line_code_of(table: &str, cell: &Value) -> Option<u32> {
        if let Some(code) = cell.get("LineCode") {
            if let Some(n) = code.as_u64() {
                return Some(n as u32);
            }
            if let Some(s) = code.as_str() {
                if let Ok(n) = s.parse::<u32>() {
                    return Some(n);
                }
            }
        }
        let compound = cell.get("Code")?.as_str()?;
        let suffix = compound.strip_prefix(table).and_then(|s| s.strip_prefix('-'))?;
        suffix.parse::<u32>().ok()
    }
}

#[async_trait::async_trait]
impl SourceClient for BeaApiSource {
    fn source_name(&self) -> &'static str {
        BEA_API_SOURCE
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn fetch(
        &self,
        table: &str,
        region_scope: &str,
        years: RangeInclusive<i32>,
    ) -> Result<Vec<RawRecord>> {
        let line_codes = self
            .line_codes
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let year_list: Vec<i32> = years.collect();
        let mut all_records = Vec::new();

        // Per-year fetches run through a bounded set of concurrent requests.
        // This is a throughput optimization only; downstream stages never
        // depend on arrival order.
        for chunk in year_list.chunks(self.fetch_concurrency) {
            let mut join_set = tokio::task::JoinSet::new();
            for &year in chunk {
                join_set.spawn(Self::fetch_year_with_retry(
                    self.client.clone(),
                    self.base_url.clone(),
                    self.api_key.clone(),
                    table.to_string(),
                    region_scope.to_string(),
                    line_codes.clone(),
                    year,
                    self.retry_attempts,
                    self.retry_base_delay,
                ));
            }
            while let Some(joined) = join_set.join_next().await {
                let records = joined.map_err(|e| EaiError::SourceUnavailable {
                    attempts: self.retry_attempts,
                    message: format!("fetch task panicked: {e}"),
                })??;
                all_records.extend(records);
            }
        }

        info!(
            "Fetched {} raw cells from {} for {} year(s)",
            all_records.len(),
            table,
            year_list.len()
        );
        Ok(all_records)
    }
}
