use crate::constants::{NOT_AVAILABLE_MARKERS, SUPPRESSED_MARKERS};
use crate::error::EaiError;
use crate::types::{RawRecord, TidyObservation};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument, warn};

/// One (region, year) group rejected during normalization. The rest of the
/// run proceeds; rejected groups are reported, never silently dropped.
#[derive(Debug, Clone)]
pub struct MalformedGroup {
    pub region_id: String,
    pub year: i32,
    pub detail: String,
}

impl MalformedGroup {
    /// Promotes the report to the run-fatal error used when no usable rows
    /// remain after group rejection.
    pub fn to_error(&self) -> EaiError {
        EaiError::MalformedRecord {
            region_id: self.region_id.clone(),
            year: self.year,
            detail: self.detail.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub observations: Vec<TidyObservation>,
    pub unknown_dropped: usize,
    pub malformed: Vec<MalformedGroup>,
}

#[derive(Debug, Clone)]
struct Cell {
    revision: Option<u32>,
    value: Option<f64>,
    is_suppressed: bool,
    raw: String,
}

/// Converts raw source cells into the canonical tidy relation.
///
/// Unknown line codes are dropped with a warning (sources add informational
/// lines over time). Duplicate (region, year, line) cells are resolved by the
/// source-reported revision ordinal; a conflicting duplicate without an
/// ordering signal invalidates its whole (region, year) group.
#[instrument(skip(records, known_line_codes), fields(records = records.len()))]
pub fn normalize(records: &[RawRecord], known_line_codes: &[u32]) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();
    let mut cells: BTreeMap<(String, i32, u32), Vec<Cell>> = BTreeMap::new();

    for record in records {
        if !known_line_codes.contains(&record.line_code) {
            debug!(
                "Dropping unknown line code {} for region {} year {}",
                record.line_code, record.region_id, record.year
            );
            outcome.unknown_dropped += 1;
            continue;
        }
        let cell = classify_cell(record);
        cells
            .entry((record.region_id.clone(), record.year, record.line_code))
            .or_default()
            .push(cell);
    }
    if outcome.unknown_dropped > 0 {
        warn!(
            "Dropped {} record(s) with unconfigured line codes",
            outcome.unknown_dropped
        );
    }

    let mut rejected_groups: BTreeSet<(String, i32)> = BTreeSet::new();
    let mut resolved: Vec<TidyObservation> = Vec::new();

    for ((region_id, year, line_code), mut candidates) in cells {
        if rejected_groups.contains(&(region_id.clone(), year)) {
            continue;
        }
        match resolve_duplicates(&mut candidates) {
            Ok(cell) => resolved.push(TidyObservation {
                region_id,
                year,
                line_code,
                value: cell.value,
                is_suppressed: cell.is_suppressed,
            }),
            Err(detail) => {
                warn!(
                    "Rejecting group region={} year={}: {}",
                    region_id, year, detail
                );
                rejected_groups.insert((region_id.clone(), year));
                outcome.malformed.push(MalformedGroup {
                    region_id,
                    year,
                    detail: format!("line {}: {}", line_code, detail),
                });
            }
        }
    }

    // A rejection can land after some of its group was already resolved.
    resolved.retain(|obs| !rejected_groups.contains(&(obs.region_id.clone(), obs.year)));
    outcome.observations = resolved;
    outcome
}

fn classify_cell(record: &RawRecord) -> Cell {
    let raw = record.value.trim();
    if SUPPRESSED_MARKERS.contains(&raw) {
        return Cell {
            revision: record.revision,
            value: None,
            is_suppressed: true,
            raw: raw.to_string(),
        };
    }
    if raw.is_empty() || NOT_AVAILABLE_MARKERS.contains(&raw) {
        return Cell {
            revision: record.revision,
            value: None,
            is_suppressed: false,
            raw: raw.to_string(),
        };
    }
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    match cleaned.parse::<f64>() {
        Ok(v) => Cell {
            revision: record.revision,
            value: Some(v),
            is_suppressed: false,
            raw: raw.to_string(),
        },
        // Unparseable text is neither a number nor a known marker; carry it
        // forward as a parse failure resolved at the group level.
        Err(_) => Cell {
            revision: record.revision,
            value: None,
            is_suppressed: false,
            raw: format!("!unparseable:{raw}"),
        },
    }
}

/// Later source revision wins. Collisions without an ordering signal are a
/// hard error for the group; silent overwrite is forbidden.
fn resolve_duplicates(candidates: &mut Vec<Cell>) -> std::result::Result<Cell, String> {
    if let Some(bad) = candidates.iter().find(|c| c.raw.starts_with("!unparseable:")) {
        return Err(format!(
            "cell value '{}' is neither numeric nor a known marker",
            bad.raw.trim_start_matches("!unparseable:")
        ));
    }
    if candidates.len() == 1 {
        return Ok(candidates.remove(0));
    }

    // Byte-identical duplicates are harmless.
    if candidates.iter().all(|c| c.raw == candidates[0].raw) {
        return Ok(candidates.remove(0));
    }

    if candidates.iter().all(|c| c.revision.is_some()) {
        candidates.sort_by_key(|c| c.revision);
        let winner = candidates.pop().expect("non-empty candidate list");
        let runner_up = candidates.last().expect("at least two candidates");
        if runner_up.revision == winner.revision && runner_up.raw != winner.raw {
            return Err(format!(
                "conflicting duplicates share revision {:?} ('{}' vs '{}')",
                winner.revision, runner_up.raw, winner.raw
            ));
        }
        return Ok(winner);
    }

    Err(format!(
        "{} conflicting duplicates without a revision ordering",
        candidates.len()
    ))
}
