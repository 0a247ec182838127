use chrono::{TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use common_logs::access_line::{AccessLogLine, AccessLogParser};
use common_logs::stream::LineStream;
use tracing::{debug, warn};

use super::{add_raw, AggregationKey, LogPlugin, PartialStatistics, PluginError, RawStats};
use crate::keylist::KeylistMapping;

const SOURCE_KEYS: [&str; 2] = ["service", "public"];
const LEVEL_KEYS: [&str; 3] = ["account", "container", "object"];
const VERB_KEYS: [&str; 6] = ["GET", "PUT", "POST", "DELETE", "HEAD", "COPY"];
const CODE_KEYS: [&str; 3] = ["2xx", "4xx", "5xx"];

/// Listing query parameter to the raw field counting it
const QUERY_FIELDS: [(&str, &str); 5] = [
    ("format", "format_query"),
    ("marker", "marker_query"),
    ("prefix", "prefix_query"),
    ("delimiter", "delimiter_query"),
    ("path", "path_query"),
];

#[derive(Debug, Clone)]
pub struct AccessPluginConfig {
    pub server_name: String,
    /// Load balancer addresses whose traffic counts as service traffic
    pub lb_private_ips: Vec<String>,
    /// Client addresses whose traffic counts as service traffic
    pub service_ips: Vec<String>,
    /// Fraction of bad lines above which a file gets a warning
    pub warn_percent: f64,
}

impl Default for AccessPluginConfig {
    fn default() -> Self {
        Self {
            server_name: "proxy-server".to_string(),
            lb_private_ips: Vec::new(),
            service_ips: Vec::new(),
            warn_percent: 0.8,
        }
    }
}

/// Bandwidth and request counts from proxy access logs
pub struct AccessPlugin {
    config: AccessPluginConfig,
    parser: AccessLogParser,
    time_zone: Tz,
}

fn request_field(source: &str, level: &str, verb: &str, code: &str) -> String {
    format!("{source}.{level}.{verb}.{code}")
}

impl AccessPlugin {
    pub fn new(config: AccessPluginConfig, time_zone: Tz) -> Self {
        Self {
            parser: AccessLogParser::new(config.server_name.clone()),
            config,
            time_zone,
        }
    }

    fn source(&self, line: &AccessLogLine) -> &'static str {
        if self.config.lb_private_ips.contains(&line.lb_ip)
            || self.config.service_ips.contains(&line.client_ip)
            || line.is_internal()
        {
            "service"
        } else {
            "public"
        }
    }

    fn record(&self, stats: &mut RawStats, line: &AccessLogLine) {
        let source = self.source(line);
        add_raw(stats, format!("{source}.bytes_out"), line.bytes_out);
        add_raw(stats, format!("{source}.bytes_in"), line.bytes_in);

        let params: Vec<&str> = line.listing_params().collect();
        for (param, field) in QUERY_FIELDS {
            add_raw(stats, field, u64::from(params.contains(&param)));
        }

        let code = format!("{}xx", line.code / 100);
        add_raw(
            stats,
            request_field(source, line.op_level(), &line.method, &code),
            1,
        );
    }
}

impl LogPlugin for AccessPlugin {
    fn name(&self) -> &'static str {
        "access"
    }

    fn json_group(&self) -> &'static str {
        "access_stats"
    }

    fn parse(
        &self,
        lines: LineStream,
        account: &str,
        container: &str,
        object_name: &str,
    ) -> Result<PartialStatistics, PluginError> {
        let mut hourly = PartialStatistics::new();
        let mut total_lines: usize = 0;
        let mut bad_lines: usize = 0;
        for raw in lines {
            let raw = raw?;
            total_lines += 1;
            let line = match self.parser.parse(&raw) {
                Ok(line) => line,
                Err(e) => {
                    debug!("Bad line data: {e}: {raw:?}");
                    bad_lines += 1;
                    continue;
                }
            };

            let utc_hour = line
                .timestamp
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .unwrap_or(line.timestamp);
            let local = Utc
                .from_utc_datetime(&utc_hour)
                .with_timezone(&self.time_zone);
            let key = AggregationKey::from_datetime(line.account.clone(), &local);
            self.record(hourly.entry(key).or_default(), &line);
        }

        if bad_lines as f64 > total_lines as f64 * self.config.warn_percent {
            warn!(
                "I found a bunch of bad lines in {account}/{container}/{object_name} ({bad_lines} bad, {total_lines} total)"
            );
        }
        Ok(hourly)
    }

    fn keylist_mapping(&self) -> KeylistMapping {
        let mut mapping = KeylistMapping::new()
            .single("service_bw_in", "service.bytes_in")
            .single("service_bw_out", "service.bytes_out")
            .single("public_bw_in", "public.bytes_in")
            .single("public_bw_out", "public.bytes_out");
        for (_, field) in QUERY_FIELDS {
            mapping = mapping.single(field, field);
        }

        for source in SOURCE_KEYS {
            for level in LEVEL_KEYS {
                for verb in VERB_KEYS {
                    for code in CODE_KEYS {
                        let raw = request_field(source, level, verb, code);
                        mapping.add_to_set(&format!("{level}_requests"), raw.clone());
                        mapping.add_to_set(&format!("{source}_request"), raw.clone());
                        mapping.add_to_set(verb, raw.clone());
                        mapping.add_to_set(code, raw.clone());
                        mapping.add_to_set("ops_count", raw);
                    }
                }
            }
        }
        mapping
    }
}

#[cfg(test)]
mod tests {
    use common_logs::stream::lines_from_bytes;

    use super::*;
    use crate::keylist::MappingTarget;

    fn line(
        client_ip: &str,
        lb_ip: &str,
        request: &str,
        method: &str,
        code: &str,
        log_source: &str,
    ) -> String {
        format!(
            "Jan  1 05:30:15 x proxy-server {client_ip} {lb_ip} 01/Jan/2024/05/30/15 {method} {request} HTTP/1.0 {code} - curl AUTH_tk 6 95 - tx1 - 0.005 {log_source}"
        )
    }

    fn parse(plugin: &AccessPlugin, lines: &[String]) -> PartialStatistics {
        let body = lines.join("\n").into_bytes();
        plugin
            .parse(lines_from_bytes(body, false), "stats", "log_data", "2024/01/01/05/a.gz")
            .unwrap()
    }

    #[test]
    fn test_counts_requests_and_bandwidth() {
        let config = AccessPluginConfig {
            lb_private_ips: vec!["10.0.0.1".to_string()],
            ..Default::default()
        };
        let plugin = AccessPlugin::new(config, Tz::UTC);
        let stats = parse(
            &plugin,
            &[
                line("1.2.3.4", "4.5.6.7", "/v1/a1/c1/o1", "GET", "200", "-"),
                line("1.2.3.4", "4.5.6.7", "/v1/a1/c1/o2", "GET", "404", "-"),
                line("1.2.3.4", "10.0.0.1", "/v1/a1/c1?format=json", "PUT", "201", "-"),
                "garbage".to_string(),
            ],
        );

        let key = AggregationKey::new("a1", 2024, 1, 1, 5);
        let raw = &stats[&key];
        assert_eq!(raw["public.object.GET.2xx"], 1);
        assert_eq!(raw["public.object.GET.4xx"], 1);
        assert_eq!(raw["service.container.PUT.2xx"], 1);
        assert_eq!(raw["public.bytes_out"], 190);
        assert_eq!(raw["service.bytes_in"], 6);
        assert_eq!(raw["format_query"], 1);
        assert_eq!(raw["prefix_query"], 0);
    }

    #[test]
    fn test_hours_follow_time_zone() {
        let plugin = AccessPlugin::new(AccessPluginConfig::default(), Tz::Asia__Tokyo);
        let stats = parse(
            &plugin,
            &[line("1.2.3.4", "4.5.6.7", "/v1/a1", "HEAD", "204", "-")],
        );
        let keys: Vec<&AggregationKey> = stats.keys().collect();
        assert_eq!(keys, vec![&AggregationKey::new("a1", 2024, 1, 1, 14)]);
    }

    #[test]
    fn test_internal_log_source_is_service_traffic() {
        let plugin = AccessPlugin::new(AccessPluginConfig::default(), Tz::UTC);
        let stats = parse(
            &plugin,
            &[line("1.2.3.4", "4.5.6.7", "/v1/a1", "GET", "200", "10.1.1.1")],
        );
        let raw = stats.values().next().unwrap();
        assert_eq!(raw["service.account.GET.2xx"], 1);
    }

    #[test]
    fn test_keylist_mapping_shape() {
        let plugin = AccessPlugin::new(AccessPluginConfig::default(), Tz::UTC);
        let mapping = plugin.keylist_mapping();

        let Some(MappingTarget::Set(ops)) = mapping.get("ops_count") else {
            panic!("ops_count should map to a set");
        };
        assert_eq!(ops.len(), 2 * 3 * 6 * 3);
        let Some(MappingTarget::Set(gets)) = mapping.get("GET") else {
            panic!("GET should map to a set");
        };
        assert_eq!(gets.len(), 2 * 3 * 3);
        assert_eq!(
            mapping.get("public_bw_in"),
            Some(&MappingTarget::Single("public.bytes_in".to_string()))
        );
        assert!(mapping.contains("object_requests"));
        assert!(mapping.contains("service_request"));
        assert!(mapping.contains("path_query"));
    }
}
