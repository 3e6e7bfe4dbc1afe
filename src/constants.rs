/// Source identifiers
pub const BEA_API_SOURCE: &str = "bea_api";
pub const BULK_CSV_SOURCE: &str = "bulk_csv";

/// Cell markers the source uses for suppressed and unavailable values.
/// Suppressed cells become null-with-flag observations; unavailable cells
/// become plain nulls.
pub const SUPPRESSED_MARKERS: &[&str] = &["(D)", "(S)"];
pub const NOT_AVAILABLE_MARKERS: &[&str] = &["(NA)", "(NM)", "(L)"];
