//! Daily aggregate job: query the offline store for yesterday's per-location
//! totals and turn each result row into a record for the daily feature group.

use std::sync::Arc;

use chrono::{DateTime, Days, FixedOffset, NaiveTime, TimeZone, Utc};
use tracing::info;

use crate::{
    decode::{QueryRow, RawEnvelope},
    errors::{RelayError, RelayResult},
    ids::FeedPosition,
    timestamp::format_canonical,
};

pub const LOCATION_WITH_DATE: &str = "location_with_date";
pub const EVENT_TIME: &str = "event_time";
pub const COUNT: &str = "count";

/// Analytic query engine. Runs one statement and returns its rows.
#[async_trait::async_trait]
pub trait QueryEngine: Send + Sync {
    async fn run(&self, sql: &str) -> anyhow::Result<Vec<QueryRow>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateWindow {
    /// `YYYYMMDD` of the aggregated day.
    pub aggr_date: String,
    pub start: String,
    pub end: String,
}

impl AggregateWindow {
    /// The calendar day before `now`, with day boundaries taken in `offset`.
    pub fn previous_day(now: DateTime<Utc>, offset: FixedOffset) -> RelayResult<Self> {
        let local_day = now.with_timezone(&offset).date_naive();
        let day = local_day
            .checked_sub_days(Days::new(1))
            .ok_or(RelayError::Window("date out of range"))?;

        let bound = |t: NaiveTime| -> RelayResult<String> {
            offset
                .from_local_datetime(&day.and_time(t))
                .single()
                .map(|dt| format_canonical(dt.with_timezone(&Utc)))
                .ok_or(RelayError::Window("ambiguous day boundary"))
        };
        let end_of_day = NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
            .ok_or(RelayError::Window("invalid end of day"))?;

        Ok(Self {
            aggr_date: day.format("%Y%m%d").to_string(),
            start: bound(NaiveTime::MIN)?,
            end: bound(end_of_day)?,
        })
    }
}

pub fn daily_count_query(table: &str, window: &AggregateWindow) -> RelayResult<String> {
    if table.is_empty() || table.contains(['"', '\'', ';']) {
        return Err(RelayError::InvalidConfig("invalid source table name"));
    }
    Ok(format!(
        "SELECT countycode, '{date}' AS aggr_date, SUM(smscount) AS sum_count, MAX(eventtime) AS eventtime \
         FROM \"{table}\" \
         GROUP BY countycode \
         HAVING MAX(eventtime) BETWEEN '{start}' AND '{end}'",
        date = window.aggr_date,
        start = window.start,
        end = window.end,
    ))
}

/// Maps query rows to relay envelopes. A row lacking the key columns still
/// produces an envelope, without `location_with_date`, so it fails on its own.
pub fn rows_to_envelopes(rows: Vec<QueryRow>) -> Vec<RawEnvelope> {
    rows.into_iter()
        .enumerate()
        .map(|(i, row)| {
            let mut out = QueryRow::new();
            if let (Some(code), Some(date)) = (row.get("countycode"), row.get("aggr_date")) {
                out.insert(LOCATION_WITH_DATE.to_string(), format!("{code}#{date}"));
            }
            if let Some(t) = row.get("eventtime") {
                out.insert(EVENT_TIME.to_string(), t.clone());
            }
            if let Some(n) = row.get("sum_count") {
                out.insert(COUNT.to_string(), n.clone());
            }
            RawEnvelope::row(FeedPosition::new(format!("row-{i}")), out)
        })
        .collect()
}

pub struct AggregateJob {
    engine: Arc<dyn QueryEngine>,
    table: String,
    offset: FixedOffset,
}

impl AggregateJob {
    pub fn new(engine: Arc<dyn QueryEngine>, table: impl Into<String>, offset: FixedOffset) -> Self {
        Self { engine, table: table.into(), offset }
    }

    /// Runs the daily query. A failed query aborts the invocation.
    pub async fn collect(&self, now: DateTime<Utc>) -> RelayResult<Vec<RawEnvelope>> {
        let window = AggregateWindow::previous_day(now, self.offset)?;
        let sql = daily_count_query(&self.table, &window)?;
        info!(table = %self.table, start = %window.start, end = %window.end, "running aggregate query");

        let rows = self.engine.run(&sql).await.map_err(RelayError::Query)?;
        info!(rows = rows.len(), "aggregate query finished");
        Ok(rows_to_envelopes(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use crate::model::EventKind;
    use std::sync::Mutex;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    #[test]
    fn test_previous_day_in_offset() {
        // 2024-09-02 01:00 in +09:00 is still 2024-09-01 in UTC
        let now = Utc.with_ymd_and_hms(2024, 9, 1, 16, 0, 0).unwrap();
        let w = AggregateWindow::previous_day(now, kst()).unwrap();
        assert_eq!(w.aggr_date, "20240901");
        assert_eq!(w.start, "2024-08-31T15:00:00.000Z");
        assert_eq!(w.end, "2024-09-01T14:59:59.999Z");
    }

    #[test]
    fn test_previous_day_utc() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 30, 0).unwrap();
        let w = AggregateWindow::previous_day(now, FixedOffset::east_opt(0).unwrap()).unwrap();
        assert_eq!(w.aggr_date, "20240229");
        assert_eq!(w.start, "2024-02-29T00:00:00.000Z");
    }

    #[test]
    fn test_window_underflow_is_not_a_config_error() {
        let now = DateTime::<Utc>::MIN_UTC;
        let err = AggregateWindow::previous_day(now, FixedOffset::east_opt(0).unwrap()).unwrap_err();
        assert!(matches!(err, RelayError::Window(_)));
    }

    #[test]
    fn test_query_text() {
        let w = AggregateWindow {
            aggr_date: "20240901".into(),
            start: "s".into(),
            end: "e".into(),
        };
        let sql = daily_count_query("country_table", &w).unwrap();
        assert!(sql.contains("FROM \"country_table\""));
        assert!(sql.contains("'20240901' AS aggr_date"));
        assert!(sql.contains("BETWEEN 's' AND 'e'"));
        assert!(daily_count_query("x\"; DROP", &w).is_err());
    }

    #[test]
    fn test_rows_to_envelopes() {
        let mut good = QueryRow::new();
        good.insert("countycode".into(), "loc0001".into());
        good.insert("aggr_date".into(), "20240901".into());
        good.insert("sum_count".into(), "42".into());
        good.insert("eventtime".into(), "2024-09-01T10:00:00.000".into());
        let mut partial = QueryRow::new();
        partial.insert("sum_count".into(), "1".into());

        let envs = rows_to_envelopes(vec![good, partial]);
        assert_eq!(envs.len(), 2);

        let ev = decode(&envs[0]).unwrap();
        assert_eq!(ev.kind(), EventKind::Create);
        assert_eq!(ev.field(LOCATION_WITH_DATE).and_then(|v| v.as_str()), Some("loc0001#20240901"));
        assert_eq!(ev.field(COUNT).and_then(|v| v.as_str()), Some("42"));

        let ev = decode(&envs[1]).unwrap();
        assert!(ev.field(LOCATION_WITH_DATE).is_none());
    }

    struct FakeEngine {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl QueryEngine for FakeEngine {
        async fn run(&self, sql: &str) -> anyhow::Result<Vec<QueryRow>> {
            self.seen.lock().unwrap().push(sql.to_string());
            if self.fail {
                anyhow::bail!("query cancelled");
            }
            let mut row = QueryRow::new();
            row.insert("countycode".into(), "loc0002".into());
            row.insert("aggr_date".into(), "20240901".into());
            row.insert("sum_count".into(), "7".into());
            Ok(vec![row])
        }
    }

    #[tokio::test]
    async fn test_job_collects_rows() {
        let engine = Arc::new(FakeEngine { seen: Mutex::new(vec![]), fail: false });
        let job = AggregateJob::new(engine.clone(), "country_table", kst());
        let now = Utc.with_ymd_and_hms(2024, 9, 2, 3, 0, 0).unwrap();

        let envs = job.collect(now).await.unwrap();
        assert_eq!(envs.len(), 1);
        assert!(engine.seen.lock().unwrap()[0].contains("'20240901'"));
    }

    #[tokio::test]
    async fn test_job_query_failure_is_fatal() {
        let engine = Arc::new(FakeEngine { seen: Mutex::new(vec![]), fail: true });
        let job = AggregateJob::new(engine, "country_table", kst());
        let err = job.collect(Utc::now()).await.unwrap_err();
        assert!(matches!(err, RelayError::Query(_)));
    }
}
