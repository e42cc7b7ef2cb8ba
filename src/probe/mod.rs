//! Probe module for URL monitoring.
//!
//! A probe is a single HTTP GET. Transport failures are not errors here: they
//! come back as an outcome with status 0 and an error description.

mod http;

pub use http::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Which HTTP status codes count as a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuccessRange {
    /// Any response with a status below 400.
    #[serde(rename = "below-400")]
    Below400,
    /// Status in `[200, 400)`.
    #[serde(rename = "200-399")]
    Standard,
}

impl SuccessRange {
    pub fn is_success(self, status: u16) -> bool {
        match self {
            SuccessRange::Below400 => status < 400,
            SuccessRange::Standard => (200..400).contains(&status),
        }
    }
}

impl fmt::Display for SuccessRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessRange::Below400 => write!(f, "below-400"),
            SuccessRange::Standard => write!(f, "200-399"),
        }
    }
}

impl FromStr for SuccessRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "below-400" | "lt400" => Ok(SuccessRange::Below400),
            "200-399" | "2xx-3xx" | "standard" => Ok(SuccessRange::Standard),
            other => Err(format!("unknown success range: {}", other)),
        }
    }
}

/// The result of one probe attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingOutcome {
    pub url_id: String,
    /// HTTP status, or 0 when no response was received.
    pub status: u16,
    pub success: bool,
    pub response_time: u64,
    #[serde(with = "crate::db::timefmt")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PingOutcome {
    /// Outcome for a request that got an HTTP response.
    pub fn response(
        url_id: &str,
        status: u16,
        range: SuccessRange,
        response_time: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            url_id: url_id.to_string(),
            status,
            success: status != 0 && range.is_success(status),
            response_time,
            timestamp,
            error: None,
        }
    }

    /// Outcome for a request that never got a response.
    pub fn transport_failure(
        url_id: &str,
        response_time: u64,
        timestamp: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown transport error".to_string();
        }
        Self {
            url_id: url_id.to_string(),
            status: 0,
            success: false,
            response_time,
            timestamp,
            error: Some(error),
        }
    }

    /// Human readable log line for this outcome.
    pub fn log_message(&self) -> String {
        if self.success {
            format!("Ping successful ({}) - {}ms", self.status, self.response_time)
        } else {
            match &self.error {
                Some(error) => format!("Ping failed: {}", error),
                None => format!("Ping failed: HTTP {}", self.status),
            }
        }
    }
}
