use std::fmt;
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Parse a configured time zone name, falling back to `default` with a warning
pub fn parse_time_zone(key: &str, value: &str, default: Tz) -> Tz {
    match value.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("Invalid parameter {key}: {value}, using default {default}");
            default
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    #[default]
    Csv,
    Json,
}

impl FormatType {
    pub fn extension(&self) -> &'static str {
        match self {
            FormatType::Csv => "csv",
            FormatType::Json => "json",
        }
    }

    /// Parse a configured output format, falling back to `default` with a warning
    pub fn parse_or(key: &str, value: &str, default: FormatType) -> FormatType {
        match value.parse() {
            Ok(format) => format,
            Err(_) => {
                warn!(
                    "Invalid parameter {key}: {}, using default {default}",
                    value.to_lowercase()
                );
                default
            }
        }
    }
}

impl FromStr for FormatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(FormatType::Csv),
            "json" => Ok(FormatType::Json),
            other => Err(format!("unknown format type {other}")),
        }
    }
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Comma separated config value, trimmed, empty entries dropped
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Values the storage cluster treats as "true" in metadata and config
pub fn is_true_value(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on" | "t" | "y"
    )
}
