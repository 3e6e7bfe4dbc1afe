use crate::config::{ComponentSpec, CompositeFormula};
use crate::types::{PanelRow, TidyObservation, YearStats};
use std::collections::BTreeMap;
use tracing::{info, instrument};

#[derive(Debug, Default)]
pub struct PanelOutcome {
    pub rows: Vec<PanelRow>,
    /// Per-year cross-region share statistics; populated only by the
    /// z-score formula.
    pub stats: Vec<YearStats>,
}

/// Pivots the tidy relation into wide per-entity rows and computes the
/// composite index.
///
/// The component map is declarative: each configured component takes the
/// value of exactly one line code, or stays null when that cell is absent or
/// suppressed. No branch anywhere inspects a component name, so adding a
/// fourth component is a config change only. Regions with short histories
/// are still emitted; temporal filtering belongs to the display layer.
#[instrument(skip(observations, components), fields(observations = observations.len()))]
pub fn build_panel(
    observations: &[TidyObservation],
    components: &[ComponentSpec],
    formula: CompositeFormula,
) -> PanelOutcome {
    // Pivot: (region, year) -> line_code -> observation.
    let mut groups: BTreeMap<(String, i32), BTreeMap<u32, &TidyObservation>> = BTreeMap::new();
    for obs in observations {
        groups
            .entry((obs.region_id.clone(), obs.year))
            .or_default()
            .insert(obs.line_code, obs);
    }

    let mut rows: Vec<PanelRow> = Vec::with_capacity(groups.len());
    for ((region_id, year), lines) in groups {
        let mut component_values: BTreeMap<String, Option<f64>> = BTreeMap::new();
        for spec in components {
            let value = match lines.get(&spec.line_code) {
                Some(obs) if obs.is_suppressed => {
                    // Substitution from a secondary source is an explicit,
                    // configured operation; absent one, the cell stays null
                    // and the gap is logged for audit.
                    info!(
                        "Suppressed cell left null: region={} year={} component={}",
                        region_id, year, spec.name
                    );
                    None
                }
                Some(obs) => obs.value,
                None => None,
            };
            component_values.insert(spec.name.clone(), value);
        }

        let shares = compute_shares(&component_values);
        rows.push(PanelRow {
            region_id,
            year,
            component_values,
            shares,
            composite_index: None,
        });
    }

    let stats = match formula {
        CompositeFormula::ShareRatio => {
            for row in &mut rows {
                row.composite_index = share_ratio(&row.component_values, components);
            }
            Vec::new()
        }
        CompositeFormula::Zscore => apply_zscore(&mut rows, components),
    };

    PanelOutcome { rows, stats }
}

/// Per-component share of the unsigned row total. Null inputs and zero
/// totals propagate as null, never as an exception.
fn compute_shares(values: &BTreeMap<String, Option<f64>>) -> BTreeMap<String, Option<f64>> {
    let total = row_total(values);
    values
        .iter()
        .map(|(name, value)| {
            let share = match (value, total) {
                (Some(v), Some(t)) if t != 0.0 => Some(v / t),
                _ => None,
            };
            (name.clone(), share)
        })
        .collect()
}

fn row_total(values: &BTreeMap<String, Option<f64>>) -> Option<f64> {
    let mut total = 0.0;
    for value in values.values() {
        total += (*value)?;
    }
    Some(total)
}

/// Signed component sum over the unsigned total.
fn share_ratio(
    values: &BTreeMap<String, Option<f64>>,
    components: &[ComponentSpec],
) -> Option<f64> {
    let total = row_total(values)?;
    if total == 0.0 {
        return None;
    }
    let mut numerator = 0.0;
    for spec in components {
        numerator += spec.sign * values.get(&spec.name).copied().flatten()?;
    }
    Some(numerator / total)
}

/// Signed combination of per-year cross-region share z-scores, scaled by
/// sqrt(component count). Rows with any null share are excluded from the
/// statistics and get a null composite.
fn apply_zscore(rows: &mut [PanelRow], components: &[ComponentSpec]) -> Vec<YearStats> {
    let mut years: Vec<i32> = rows.iter().map(|r| r.year).collect();
    years.sort_unstable();
    years.dedup();

    let mut all_stats = Vec::with_capacity(years.len());
    for year in years {
        let complete: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.year == year && r.shares.values().all(|s| s.is_some()))
            .map(|(i, _)| i)
            .collect();

        let mut share_means: BTreeMap<String, f64> = BTreeMap::new();
        let mut share_stddevs: BTreeMap<String, f64> = BTreeMap::new();
        let n = complete.len();
        if n >= 2 {
            for spec in components {
                let values: Vec<f64> = complete
                    .iter()
                    .map(|&i| rows[i].shares[&spec.name].expect("complete row"))
                    .collect();
                let mean = values.iter().sum::<f64>() / n as f64;
                let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                    / (n as f64 - 1.0);
                share_means.insert(spec.name.clone(), mean);
                share_stddevs.insert(spec.name.clone(), variance.sqrt());
            }
        }

        for (i, row) in rows.iter_mut().enumerate() {
            if row.year != year {
                continue;
            }
            row.composite_index = if complete.contains(&i) && n >= 2 {
                zscore_composite(row, components, &share_means, &share_stddevs)
            } else {
                None
            };
        }

        all_stats.push(YearStats {
            year,
            region_count: n,
            share_means,
            share_stddevs,
        });
    }
    all_stats
}

fn zscore_composite(
    row: &PanelRow,
    components: &[ComponentSpec],
    means: &BTreeMap<String, f64>,
    stddevs: &BTreeMap<String, f64>,
) -> Option<f64> {
    let mut sum = 0.0;
    for spec in components {
        let share = row.shares.get(&spec.name).copied().flatten()?;
        let std = *stddevs.get(&spec.name)?;
        if std == 0.0 {
            return None;
        }
        sum += spec.sign * (share - means[&spec.name]) / std;
    }
    Some(sum / (components.len() as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ComponentSpec> {
        vec![
            ComponentSpec {
                name: "earned".to_string(),
                line_code: 45,
                sign: 1.0,
            },
            ComponentSpec {
                name: "property".to_string(),
                line_code: 46,
                sign: 1.0,
            },
            ComponentSpec {
                name: "transfer".to_string(),
                line_code: 47,
                sign: -1.0,
            },
        ]
    }

    fn obs(region: &str, line: u32, value: Option<f64>, suppressed: bool) -> TidyObservation {
        TidyObservation {
            region_id: region.to_string(),
            year: 2022,
            line_code: line,
            value,
            is_suppressed: suppressed,
        }
    }

    #[test]
    fn pivots_into_configured_components() {
        let observations = vec![
            obs("06037", 45, Some(1000.0), false),
            obs("06037", 46, Some(500.0), false),
            obs("06037", 47, Some(500.0), false),
        ];
        let outcome = build_panel(&observations, &specs(), CompositeFormula::ShareRatio);
        assert_eq!(outcome.rows.len(), 1);

        let row = &outcome.rows[0];
        assert_eq!(row.component_values["earned"], Some(1000.0));
        assert_eq!(row.component_values["property"], Some(500.0));
        assert_eq!(row.component_values["transfer"], Some(500.0));
        // (1000 + 500 - 500) / 2000
        assert_eq!(row.composite_index, Some(0.5));
        assert_eq!(row.shares["earned"], Some(0.5));
    }

    #[test]
    fn suppressed_component_is_null_and_poisons_composite() {
        let observations = vec![
            obs("06037", 45, Some(1000.0), false),
            obs("06037", 46, None, true),
            obs("06037", 47, Some(500.0), false),
        ];
        let outcome = build_panel(&observations, &specs(), CompositeFormula::ShareRatio);
        let row = &outcome.rows[0];
        assert_eq!(row.component_values["property"], None);
        assert_eq!(row.composite_index, None);
    }

    #[test]
    fn missing_component_is_null_not_omitted() {
        let observations = vec![
            obs("06037", 45, Some(1000.0), false),
            obs("06037", 47, Some(500.0), false),
        ];
        let outcome = build_panel(&observations, &specs(), CompositeFormula::ShareRatio);
        let row = &outcome.rows[0];
        assert_eq!(row.component_values.len(), 3);
        assert!(row.component_values.contains_key("property"));
        assert_eq!(row.component_values["property"], None);
        assert_eq!(row.composite_index, None);
    }

    #[test]
    fn zero_total_yields_null_composite() {
        let observations = vec![
            obs("06037", 45, Some(0.0), false),
            obs("06037", 46, Some(0.0), false),
            obs("06037", 47, Some(0.0), false),
        ];
        let outcome = build_panel(&observations, &specs(), CompositeFormula::ShareRatio);
        assert_eq!(outcome.rows[0].composite_index, None);
        assert_eq!(outcome.rows[0].shares["earned"], None);
    }

    #[test]
    fn zscore_formula_captures_year_stats() {
        let mut observations = Vec::new();
        for (region, earned, property, transfer) in [
            ("06037", 1000.0, 500.0, 500.0),
            ("06075", 800.0, 900.0, 300.0),
            ("06001", 600.0, 200.0, 1200.0),
        ] {
            observations.push(obs(region, 45, Some(earned), false));
            observations.push(obs(region, 46, Some(property), false));
            observations.push(obs(region, 47, Some(transfer), false));
        }
        let outcome = build_panel(&observations, &specs(), CompositeFormula::Zscore);
        assert_eq!(outcome.rows.len(), 3);
        assert!(outcome.rows.iter().all(|r| r.composite_index.is_some()));
        assert_eq!(outcome.stats.len(), 1);
        assert_eq!(outcome.stats[0].region_count, 3);
        // Z-scores sum to zero across regions, per component.
        let mean = outcome.stats[0].share_means["earned"];
        assert!(mean > 0.0 && mean < 1.0);

        // The transfer-heavy region scores lowest.
        let by_region = |id: &str| {
            outcome
                .rows
                .iter()
                .find(|r| r.region_id == id)
                .unwrap()
                .composite_index
                .unwrap()
        };
        assert!(by_region("06001") < by_region("06037"));
        assert!(by_region("06001") < by_region("06075"));
    }

    #[test]
    fn zscore_with_single_region_is_null() {
        let observations = vec![
            obs("06037", 45, Some(1000.0), false),
            obs("06037", 46, Some(500.0), false),
            obs("06037", 47, Some(500.0), false),
        ];
        let outcome = build_panel(&observations, &specs(), CompositeFormula::Zscore);
        assert_eq!(outcome.rows[0].composite_index, None);
    }
}
