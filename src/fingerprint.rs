use crate::types::PanelRow;
use sha2::{Digest, Sha256};

/// Deterministic content hash over a full panel row set.
///
/// Rows are sorted by (region_id, year) and serialized to a canonical string
/// before hashing, so any permutation of the input produces the same digest.
/// Comparison between runs is by this hash only, never by timing or counts.
pub fn content_hash(rows: &[PanelRow]) -> String {
    let mut sorted: Vec<&PanelRow> = rows.iter().collect();
    sorted.sort_by(|a, b| {
        a.region_id
            .cmp(&b.region_id)
            .then_with(|| a.year.cmp(&b.year))
    });

    let mut s = String::new();
    for row in sorted {
        s.push_str(&row.region_id);
        s.push('|');
        s.push_str(&row.year.to_string());
        // BTreeMap iteration keeps component order stable.
        for (name, value) in &row.component_values {
            s.push('|');
            s.push_str(name);
            s.push('=');
            push_value(&mut s, *value);
        }
        s.push('|');
        push_value(&mut s, row.composite_index);
        s.push('\n');
    }

    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

fn push_value(s: &mut String, value: Option<f64>) {
    match value {
        // Display renders the shortest round-trippable form, stable across
        // runs for the same bits.
        Some(v) => s.push_str(&v.to_string()),
        None => s.push_str("null"),
    }
}
