use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use common_s3::{ObjectStore, S3Error};
use metrics::counter;
use tracing::{debug, info};

use crate::metrics_consts::FILES_ENUMERATED_COUNTER;
use crate::{Ledger, SourceIdentity};

/// How far back a run looks for log objects, in hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookbackWindow {
    /// 0 disables both bounds
    pub hours: u32,
    /// Span of the window starting `hours` ago; 0 leaves the end open
    pub window: u32,
}

/// Hour-truncated local times bounding a listing. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListingBounds {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl LookbackWindow {
    pub fn new(hours: u32, window: u32) -> Self {
        Self { hours, window }
    }

    pub fn bounds(&self, now: DateTime<Utc>, tz: Tz) -> ListingBounds {
        if self.hours == 0 {
            return ListingBounds::default();
        }
        let local = now.with_timezone(&tz).naive_local();
        let start = truncate_to_hour(local - Duration::hours(i64::from(self.hours)));
        let end = (self.window != 0).then(|| start + Duration::hours(i64::from(self.window)));
        debug!("lookback_start: {start:?}, lookback_end: {end:?}");
        ListingBounds {
            start: Some(start),
            end,
        }
    }
}

fn truncate_to_hour(t: NaiveDateTime) -> NaiveDateTime {
    t.date()
        .and_hms_opt(t.hour(), 0, 0)
        .unwrap_or(t)
}

impl ListingBounds {
    /// Listing markers over `YYYY/MM/DD/HH/...` object names. Listing bounds are
    /// exclusive, so the end hour is bumped by one to keep its objects; 23 becomes
    /// `24`, which still sorts after every object of that day.
    pub fn markers(&self) -> (Option<String>, Option<String>) {
        let marker = self.start.map(|s| s.format("%Y/%m/%d/%H").to_string());
        let end_marker = self
            .end
            .map(|e| format!("{}/{:02}", e.format("%Y/%m/%d"), e.hour() + 1));
        (marker, end_marker)
    }
}

/// One container a plugin reads its logs from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSource {
    pub plugin_name: String,
    pub account: String,
    pub container: String,
}

/// Lists every source container within `bounds` and drops what the ledger has
/// already seen. An identity listed twice is only returned once. Any listing failure
/// fails the whole enumeration.
pub async fn enumerate_work(
    store: &dyn ObjectStore,
    sources: &[LogSource],
    bounds: &ListingBounds,
    ledger: &Ledger,
) -> Result<Vec<SourceIdentity>, S3Error> {
    let (marker, end_marker) = bounds.markers();
    let mut work = Vec::new();
    let mut seen = HashSet::new();
    for source in sources {
        let names = store
            .list_objects(
                &source.account,
                &source.container,
                marker.as_deref(),
                end_marker.as_deref(),
            )
            .await?;
        let before = work.len();
        work.extend(
            names
                .into_iter()
                .map(|name| {
                    SourceIdentity::new(
                        &source.plugin_name,
                        &source.account,
                        &source.container,
                        name,
                    )
                })
                .filter(|identity| !ledger.contains(identity))
                .filter(|identity| seen.insert(identity.clone())),
        );
        info!(
            plugin = %source.plugin_name,
            "loaded {} files to process",
            work.len() - before
        );
    }
    counter!(FILES_ENUMERATED_COUNTER).increment(work.len() as u64);
    Ok(work)
}
