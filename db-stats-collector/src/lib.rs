pub mod broker;
pub mod collector;
pub mod config;
pub mod metrics_consts;
