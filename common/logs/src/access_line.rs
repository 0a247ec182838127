use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

/// Bytes of syslog prefix in front of every proxy access log line
const SYSLOG_PREFIX_LEN: usize = 16;
const FIELD_COUNT: usize = 18;

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Query parameters that are counted as "listing" requests
pub const LISTING_PARAMS: [&str; 7] = [
    "path",
    "limit",
    "format",
    "delimiter",
    "marker",
    "end_marker",
    "prefix",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    #[error("line has {0} fields, expected at least {FIELD_COUNT}")]
    TooShort(usize),
    #[error("bad server name: found {found}, expected {expected}")]
    WrongServer { found: String, expected: String },
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("unexpected version string: found {0}, expected v1")]
    WrongVersion(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("invalid {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },
}

/// One proxy-server access log line, already URL-unquoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogLine {
    pub client_ip: String,
    pub lb_ip: String,
    /// Request time, always UTC in the logs
    pub timestamp: NaiveDateTime,
    pub method: String,
    /// Path part of the request, without the query string
    pub request: String,
    pub query: Option<String>,
    pub http_version: String,
    pub code: u16,
    pub referrer: String,
    pub user_agent: String,
    pub auth_token: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub etag: String,
    pub trans_id: String,
    pub headers: String,
    pub processing_time: String,
    pub account: String,
    pub container: Option<String>,
    pub object: Option<String>,
    /// Set by internal proxies; `-` or absent for client traffic
    pub log_source: Option<String>,
}

impl AccessLogLine {
    /// Listing parameters present in the query string, each counted once per request
    pub fn listing_params(&self) -> impl Iterator<Item = &str> {
        let mut seen: Vec<&str> = Vec::new();
        for arg in self.query.as_deref().unwrap_or_default().split('&') {
            let key = arg.split_once('=').map_or(arg, |(k, _)| k);
            if LISTING_PARAMS.contains(&key) && !seen.contains(&key) {
                seen.push(key);
            }
        }
        seen.into_iter()
    }

    pub fn is_internal(&self) -> bool {
        self.log_source.as_deref().is_some_and(|s| s != "-")
    }

    /// `account`, `container` or `object`, depending on how deep the path goes
    pub fn op_level(&self) -> &'static str {
        match (&self.container, &self.object) {
            (None, _) => "account",
            (Some(_), None) => "container",
            (Some(_), Some(_)) => "object",
        }
    }

    /// Common Log Format rendering, with the client ip replaced if hidden
    pub fn to_clf(&self, hidden_ips: &[String]) -> String {
        let client_ip = if hidden_ips.iter().any(|ip| ip == &self.client_ip) {
            "0.0.0.0"
        } else {
            self.client_ip.as_str()
        };
        let request = match &self.query {
            Some(query) => format!("{}?{query}", self.request),
            None => self.request.clone(),
        };
        format!(
            "{client_ip} - - [{}] \"{} {request} {}\" {} {} \"{}\" \"{}\"",
            self.timestamp.format("%d/%m/%Y:%H:%M:%S +0000"),
            self.method,
            self.http_version,
            self.code,
            self.bytes_out,
            self.referrer,
            self.user_agent,
        )
    }
}

#[derive(Debug, Clone)]
pub struct AccessLogParser {
    server_name: String,
}

impl AccessLogParser {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }

    pub fn parse(&self, raw: &str) -> Result<AccessLogLine, LineError> {
        let split: Vec<&str> = raw
            .get(SYSLOG_PREFIX_LEN..)
            .unwrap_or_default()
            .split(' ')
            .collect();
        if split.len() < FIELD_COUNT {
            return Err(LineError::TooShort(split.len()));
        }
        let log_source = split.get(FIELD_COUNT).map(|s| s.to_string());
        let mut fields = split[..FIELD_COUNT].iter().map(|f| unquote(f));
        let mut next = || fields.next().unwrap_or_default();
        let _unused = next();
        let server = next();
        if server != self.server_name {
            return Err(LineError::WrongServer {
                found: server,
                expected: self.server_name.clone(),
            });
        }
        let client_ip = next();
        let lb_ip = next();
        let timestamp = next();
        let method = next();
        let request = next();
        let http_version = next();
        let code = next();
        let referrer = next();
        let user_agent = next();
        let auth_token = next();
        let bytes_in = next();
        let bytes_out = next();
        let etag = next();
        let trans_id = next();
        let headers = next();
        let processing_time = next();

        let request = request.split('#').next().unwrap_or_default();
        let (path, query) = match request.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (request.to_string(), None),
        };
        let query = query.filter(|q| !q.is_empty());
        let (version, account, container, object) = split_path(&path)?;
        if version != "v1" {
            return Err(LineError::WrongVersion(version));
        }

        Ok(AccessLogLine {
            timestamp: parse_timestamp(&timestamp)?,
            code: code.parse().map_err(|_| LineError::InvalidNumber {
                field: "code",
                value: code.clone(),
            })?,
            bytes_in: parse_bytes("bytes_in", &bytes_in)?,
            bytes_out: parse_bytes("bytes_out", &bytes_out)?,
            client_ip,
            lb_ip,
            method,
            request: path,
            query,
            http_version,
            referrer,
            user_agent,
            auth_token,
            etag,
            trans_id,
            headers,
            processing_time,
            account,
            container,
            object,
            log_source,
        })
    }
}

fn unquote(field: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(field.as_bytes())).into_owned()
}

fn parse_bytes(field: &'static str, value: &str) -> Result<u64, LineError> {
    value
        .replace('-', "0")
        .parse()
        .map_err(|_| LineError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

/// `/version/account[/container[/object...]]`; the object keeps any further slashes.
/// Empty container or object segments count as absent.
fn split_path(path: &str) -> Result<(String, String, Option<String>, Option<String>), LineError> {
    let invalid = || LineError::InvalidPath(path.to_string());
    let segments: Vec<&str> = path.splitn(5, '/').collect();
    if segments.len() < 3 || !segments[0].is_empty() || segments[1..3].contains(&"") {
        return Err(invalid());
    }
    let non_empty = |i: usize| {
        segments
            .get(i)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };
    Ok((
        segments[1].to_string(),
        segments[2].to_string(),
        non_empty(3),
        non_empty(3).and(non_empty(4)),
    ))
}

/// `dd/Mon/yyyy/HH/MM/SS`
fn parse_timestamp(value: &str) -> Result<NaiveDateTime, LineError> {
    let invalid = || LineError::InvalidTimestamp(value.to_string());
    let parts: Vec<&str> = value.split('/').collect();
    let [day, month, year, hour, minute, second] = parts[..] else {
        return Err(invalid());
    };
    let month = MONTHS
        .iter()
        .position(|m| *m == month)
        .and_then(|i| u32::try_from(i + 1).ok())
        .ok_or_else(invalid)?;
    let number = |s: &str| s.parse::<u32>().map_err(|_| invalid());
    let date = NaiveDate::from_ymd_opt(year.parse().map_err(|_| invalid())?, month, number(day)?)
        .ok_or_else(invalid)?;
    date.and_hms_opt(number(hour)?, number(minute)?, number(second)?)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access_line(
        server: &str,
        request: &str,
        method: &str,
        code: &str,
        log_source: Option<&str>,
    ) -> String {
        let mut fields = vec![
            "x".to_string(),
            server.to_string(),
            "1.2.3.4".to_string(),
            "4.5.6.7".to_string(),
            "01/Jan/2024/05/30/15".to_string(),
            method.to_string(),
            request.to_string(),
            "HTTP/1.0".to_string(),
            code.to_string(),
            "-".to_string(),
            "curl/7.0".to_string(),
            "AUTH_tk".to_string(),
            "6".to_string(),
            "95".to_string(),
            "-".to_string(),
            "tx123".to_string(),
            "-".to_string(),
            "0.0050".to_string(),
        ];
        if let Some(source) = log_source {
            fields.push(source.to_string());
        }
        format!("Jan  1 05:30:15 {}", fields.join(" "))
    }

    fn parser() -> AccessLogParser {
        AccessLogParser::new("proxy-server")
    }

    #[test]
    fn test_parse_object_request() {
        let raw = access_line("proxy-server", "/v1/a1/c1/o1/nested", "GET", "200", None);
        let line = parser().parse(&raw).unwrap();

        assert_eq!(line.account, "a1");
        assert_eq!(line.container.as_deref(), Some("c1"));
        assert_eq!(line.object.as_deref(), Some("o1/nested"));
        assert_eq!(line.op_level(), "object");
        assert_eq!(line.code, 200);
        assert_eq!(line.bytes_in, 6);
        assert_eq!(line.bytes_out, 95);
        assert_eq!(
            line.timestamp,
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(5, 30, 15)
                .unwrap()
        );
        assert!(!line.is_internal());
    }

    #[test]
    fn test_parse_listing_query() {
        let raw = access_line(
            "proxy-server",
            "/v1/a1/c1%3Fformat%3Djson%26prefix%3Dabc%26unknown%3D1%26format%3Dxml",
            "GET",
            "200",
            Some("-"),
        );
        let line = parser().parse(&raw).unwrap();

        assert_eq!(line.request, "/v1/a1/c1");
        assert_eq!(line.op_level(), "container");
        let params: Vec<&str> = line.listing_params().collect();
        assert_eq!(params, vec!["format", "prefix"]);
        assert!(!line.is_internal());
    }

    #[test]
    fn test_account_level_and_dash_bytes() {
        let raw = access_line("proxy-server", "/v1/a1", "HEAD", "204", Some("10.0.0.1"));
        let line = parser().parse(&raw).unwrap();
        assert_eq!(line.op_level(), "account");
        assert!(line.is_internal());

        let raw = raw.replace(" 6 95 ", " - - ");
        let dashed = parser().parse(&raw).unwrap();
        assert_eq!(dashed.bytes_in, 0);
        assert_eq!(dashed.bytes_out, 0);
    }

    #[test]
    fn test_rejects_bad_lines() {
        let p = parser();
        assert!(matches!(p.parse("too short"), Err(LineError::TooShort(_))));
        assert!(matches!(
            p.parse(&access_line("object-server", "/v1/a1/c1", "GET", "200", None)),
            Err(LineError::WrongServer { .. })
        ));
        assert!(matches!(
            p.parse(&access_line("proxy-server", "/v2/a1/c1", "GET", "200", None)),
            Err(LineError::WrongVersion(_))
        ));
        assert!(matches!(
            p.parse(&access_line("proxy-server", "/v1", "GET", "200", None)),
            Err(LineError::InvalidPath(_))
        ));
        assert!(matches!(
            p.parse(&access_line("proxy-server", "v1/a1", "GET", "200", None)),
            Err(LineError::InvalidPath(_))
        ));
        assert!(matches!(
            p.parse(&access_line("proxy-server", "/v1/a1", "GET", "abc", None)),
            Err(LineError::InvalidNumber { field: "code", .. })
        ));
    }

    #[test]
    fn test_clf_hides_configured_ips() {
        let raw = access_line("proxy-server", "/v1/a1/c1/o1", "PUT", "201", None);
        let line = parser().parse(&raw).unwrap();

        assert_eq!(
            line.to_clf(&[]),
            "1.2.3.4 - - [01/01/2024:05:30:15 +0000] \"PUT /v1/a1/c1/o1 HTTP/1.0\" 201 95 \"-\" \"curl/7.0\""
        );
        assert!(line
            .to_clf(&["1.2.3.4".to_string()])
            .starts_with("0.0.0.0 - - "));
    }
    #[test]
    fn test_clf_keeps_query_string() {
        let raw = access_line(
            "proxy-server",
            "/v1/a1/c1?prefix=logs/&format=json",
            "GET",
            "200",
            None,
        );
        let line = parser().parse(&raw).unwrap();
        assert_eq!(line.request, "/v1/a1/c1");

        assert_eq!(
            line.to_clf(&[]),
            "1.2.3.4 - - [01/01/2024:05:30:15 +0000] \"GET /v1/a1/c1?prefix=logs/&format=json HTTP/1.0\" 200 95 \"-\" \"curl/7.0\""
        );
    }
}
