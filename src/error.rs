use thiserror::Error;

#[derive(Error, Debug)]
pub enum EaiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("Source unavailable after {attempts} attempts: {message}")]
    SourceUnavailable { attempts: u32, message: String },

    #[error("Source schema mismatch for table '{table}': {detail}")]
    SourceSchemaMismatch { table: String, detail: String },

    #[error("Malformed record for region {region_id}, year {year}: {detail}")]
    MalformedRecord {
        region_id: String,
        year: i32,
        detail: String,
    },

    #[error("Invalid snapshot transition for year {year}: {detail}")]
    InvalidTransition { year: i32, detail: String },

    #[error("Sink unavailable after {attempts} attempts: {message}")]
    SinkUnavailable { attempts: u32, message: String },

    #[error("Pipeline run for table '{table}' year {year} is already in flight")]
    LeaseHeld { table: String, year: i32 },
}

pub type Result<T> = std::result::Result<T, EaiError>;
