pub mod aggregate;
pub mod config;
pub mod error;
pub mod keylist;
pub mod metrics_consts;
pub mod output;
pub mod plugins;
pub mod processor;
pub mod publish;
