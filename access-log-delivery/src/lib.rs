pub mod config;
pub mod delivery;
pub mod error;
pub mod metrics_consts;
