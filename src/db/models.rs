//! Document model types.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::document::{to_fields, Document, Fields, StoreError};
use super::timefmt;
use crate::probe::PingOutcome;

/// Highest scheduling shard key.
pub const MAX_SHARD_KEY: u8 = 9;

/// A URL registered for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredUrl {
    #[serde(skip)]
    pub id: String,
    pub user_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub is_enabled: bool,
    pub node_id: String,
    pub shard_key: u8,
    /// Minutes between probes.
    #[serde(default)]
    pub ping_interval: Option<u32>,
    #[serde(default, with = "timefmt::option")]
    pub last_ping_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_ping_status: Option<PingStatus>,
    #[serde(default)]
    pub last_ping_status_code: Option<u16>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub total_pings: u64,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(with = "timefmt")]
    pub next_ping_time: DateTime<Utc>,
}

impl MonitoredUrl {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut url: MonitoredUrl = serde_json::from_value(Value::Object(doc.fields.clone()))?;
        url.id = doc.id.clone();
        Ok(url)
    }

    #[cfg(test)]
    pub fn to_fields(&self) -> Result<Fields, StoreError> {
        to_fields(self)
    }

    /// The URL's own interval; missing or zero falls back to `default_minutes`.
    pub fn interval_minutes(&self, default_minutes: u32) -> u32 {
        self.ping_interval
            .filter(|m| *m > 0)
            .unwrap_or(default_minutes)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_ping_time <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Success,
    Error,
    Warning,
    Info,
}

/// One line in a URL's log ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(with = "timefmt")]
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: LogType,
}

impl LogEntry {
    pub fn from_outcome(outcome: &PingOutcome) -> Self {
        Self {
            timestamp: outcome.timestamp,
            message: outcome.log_message(),
            kind: if outcome.success {
                LogType::Success
            } else {
                LogType::Error
            },
        }
    }
}

/// Append `entry` and evict the oldest entries beyond `cap`.
pub fn push_log(logs: &mut Vec<LogEntry>, entry: LogEntry, cap: usize) {
    logs.push(entry);
    if logs.len() > cap {
        let excess = logs.len() - cap;
        logs.drain(..excess);
    }
}

/// Partial update written to a URL document after a probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlUpdate {
    #[serde(with = "timefmt")]
    pub last_ping_time: DateTime<Utc>,
    pub last_ping_status: PingStatus,
    pub last_ping_status_code: u16,
    pub last_response_time: u64,
    #[serde(with = "timefmt")]
    pub next_ping_time: DateTime<Utc>,
    pub success_count: u64,
    pub total_pings: u64,
    /// Written as `null` on success so a stale error is cleared.
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<LogEntry>>,
}

impl UrlUpdate {
    /// Compute the new scheduling state of `url` after `outcome`.
    ///
    /// With `log_cap` set, the outcome's log line is appended to the URL's
    /// existing logs, keeping at most `log_cap` entries.
    pub fn from_outcome(
        url: &MonitoredUrl,
        outcome: &PingOutcome,
        default_interval: u32,
        log_cap: Option<usize>,
    ) -> Self {
        let interval = url.interval_minutes(default_interval);
        let logs = log_cap.map(|cap| {
            let mut logs = url.logs.clone();
            push_log(&mut logs, LogEntry::from_outcome(outcome), cap);
            logs
        });

        Self {
            last_ping_time: outcome.timestamp,
            last_ping_status: if outcome.success {
                PingStatus::Success
            } else {
                PingStatus::Error
            },
            last_ping_status_code: outcome.status,
            last_response_time: outcome.response_time,
            next_ping_time: outcome.timestamp + ChronoDuration::minutes(interval as i64),
            success_count: url.success_count + u64::from(outcome.success),
            total_pings: url.total_pings + 1,
            last_error: outcome.error.clone(),
            logs,
        }
    }

    pub fn to_fields(&self) -> Result<Fields, StoreError> {
        to_fields(self)
    }
}

/// Probe history of one URL within a result shard.
///
/// The three sequences are index-aligned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlSeries {
    pub url_id: String,
    #[serde(default)]
    pub timestamps: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<u16>,
    #[serde(default)]
    pub response_times: Vec<u64>,
}

impl UrlSeries {
    fn new(url_id: &str) -> Self {
        Self {
            url_id: url_id.to_string(),
            timestamps: Vec::new(),
            statuses: Vec::new(),
            response_times: Vec::new(),
        }
    }

    fn push(&mut self, outcome: &PingOutcome, history_cap: usize) {
        self.align();
        self.timestamps.push(timefmt::format(&outcome.timestamp));
        self.statuses.push(outcome.status);
        self.response_times.push(outcome.response_time);
        self.keep_latest(history_cap);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Drop the oldest entries of all three sequences beyond `cap`.
    fn keep_latest(&mut self, cap: usize) {
        let cap = cap.max(1);
        if self.timestamps.len() > cap {
            let excess = self.timestamps.len() - cap;
            self.timestamps.drain(..excess);
            self.statuses.drain(..excess);
            self.response_times.drain(..excess);
        }
    }

    /// Repair sequences written by other writers so that they line up again.
    ///
    /// Series without any response times carry no latency, so zeros stand in
    /// for them. Otherwise every sequence loses its oldest entries down to the
    /// shortest one; the newest entries are always kept.
    fn align(&mut self) {
        if self.response_times.is_empty() {
            self.response_times = vec![0; self.timestamps.len()];
        }
        let len = self
            .timestamps
            .len()
            .min(self.statuses.len())
            .min(self.response_times.len());
        let tsx = self.timestamps.len() - len;
        self.timestamps.drain(..tsx);
        let sx = self.statuses.len() - len;
        self.statuses.drain(..sx);
        let rx = self.response_times.len() - len;
        self.response_times.drain(..rx);
    }
}

/// All probe results of one user for one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultShard {
    pub user_id: String,
    pub date: String,
    pub shard_id: String,
    #[serde(default)]
    pub results: Vec<UrlSeries>,
}

impl ResultShard {
    pub fn new(user_id: &str, date: NaiveDate) -> Self {
        Self {
            user_id: user_id.to_string(),
            date: date.format("%Y-%m-%d").to_string(),
            shard_id: Self::shard_id(user_id, date),
            results: Vec::new(),
        }
    }

    /// Document id of a user's shard for `date`.
    pub fn shard_id(user_id: &str, date: NaiveDate) -> String {
        format!("{}_{}", user_id, date.format("%Y-%m-%d"))
    }

    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        Ok(serde_json::from_value(Value::Object(doc.fields.clone()))?)
    }

    pub fn to_fields(&self) -> Result<Fields, StoreError> {
        to_fields(self)
    }

    /// Append an outcome to its URL's series, creating the series if needed.
    ///
    /// Each series keeps at most `history_cap` of its newest entries.
    pub fn append(&mut self, outcome: &PingOutcome, history_cap: usize) {
        match self.results.iter_mut().find(|s| s.url_id == outcome.url_id) {
            Some(series) => series.push(outcome, history_cap),
            None => {
                let mut series = UrlSeries::new(&outcome.url_id);
                series.push(outcome, history_cap);
                self.results.push(series);
            }
        }
    }

    #[cfg(test)]
    pub fn series(&self, url_id: &str) -> Option<&UrlSeries> {
        self.results.iter().find(|s| s.url_id == url_id)
    }
}
