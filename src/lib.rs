pub mod apis;
pub mod archive;
pub mod config;
pub mod constants;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod normalize;
pub mod panel;
pub mod pipeline;
pub mod sink;
pub mod snapshot;
pub mod types;
