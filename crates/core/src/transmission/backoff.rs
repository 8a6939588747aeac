//! Retry delay computation and backend response parsing.
//!
//! The delay after `n` consecutive failures is `slot * 2^n`, floored at
//! `slot` and capped at `max`. A `Retry-After` value from the server wins
//! over the computed delay as long as it points into the future.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::{
    diagnostics::{DiagnosticEvent, SharedDiagnostics},
    util::{InstantTimeSrc, TimeSource},
};

/// Status codes the pipeline reacts to.
pub mod status {
    pub const SUCCESS: u16 = 200;
    pub const PARTIAL_SUCCESS: u16 = 206;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const TOO_MANY_REQUESTS: u16 = 429;
    pub const TOO_MANY_REQUESTS_OVER_EXTENDED_TIME: u16 = 439;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    /// No response was received at all.
    pub const UNKNOWN_NETWORK_ERROR: u16 = 999;

    /// Transport level failures worth retrying the whole transmission for.
    pub fn is_retryable(code: u16) -> bool {
        matches!(
            code,
            REQUEST_TIMEOUT | INTERNAL_SERVER_ERROR | SERVICE_UNAVAILABLE | UNKNOWN_NETWORK_ERROR
        )
    }

    /// Per-item errors in a partial success response worth resending.
    pub fn is_retryable_item(code: u16) -> bool {
        matches!(
            code,
            REQUEST_TIMEOUT
                | TOO_MANY_REQUESTS
                | TOO_MANY_REQUESTS_OVER_EXTENDED_TIME
                | INTERNAL_SERVER_ERROR
                | SERVICE_UNAVAILABLE
        )
    }
}

pub const DEFAULT_SLOT_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3600);
/// Minimum time between two "backoff enabled" reports without a "disabled" one in between.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(30 * 60);

// 2^20 slots already exceed any sane maximum delay.
const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendResponse {
    pub items_received: i64,
    pub items_accepted: i64,
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub index: i64,
    pub status_code: u16,
    #[serde(default)]
    pub message: Option<String>,
}

/// Parses a backend reply body. Anything but a well formed response object
/// yields `None`.
pub fn parse_backend_response(body: Option<&str>) -> Option<BackendResponse> {
    let body = body?.trim();
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<BackendResponse>(body) {
        Ok(response) => Some(response),
        Err(error) => {
            tracing::debug!(%error, "Ignoring malformed backend response");
            None
        }
    }
}

/// Interprets a `Retry-After` value, either delay-seconds or an HTTP-date.
/// Returns `None` when it cannot be parsed.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        return now.checked_add_signed(chrono::Duration::seconds(seconds));
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

struct BackoffState {
    consecutive_errors: u32,
    last_status_code: Option<u16>,
    current_delay: Duration,
    last_report: Option<Instant>,
    reported: bool,
}

pub struct BackoffLogicManager {
    slot_delay: Duration,
    max_delay: Duration,
    report_interval: Duration,
    state: Mutex<BackoffState>,
    time_source: Arc<dyn TimeSource>,
    diagnostics: SharedDiagnostics,
}

impl BackoffLogicManager {
    pub fn new(diagnostics: SharedDiagnostics) -> Self {
        Self::with_time_source(diagnostics, Arc::new(InstantTimeSrc::new()))
    }

    pub fn with_time_source(diagnostics: SharedDiagnostics, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            slot_delay: DEFAULT_SLOT_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            report_interval: DEFAULT_REPORT_INTERVAL,
            state: Mutex::new(BackoffState {
                consecutive_errors: 0,
                last_status_code: None,
                current_delay: Duration::ZERO,
                last_report: None,
                reported: false,
            }),
            time_source,
            diagnostics,
        }
    }

    pub fn with_delays(mut self, slot_delay: Duration, max_delay: Duration) -> Self {
        self.slot_delay = slot_delay;
        self.max_delay = max_delay.max(slot_delay);
        self
    }

    pub fn slot_delay(&self) -> Duration {
        self.slot_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state.lock().consecutive_errors
    }

    pub fn last_status_code(&self) -> Option<u16> {
        self.state.lock().last_status_code
    }

    /// The delay returned by the last `compute_delay` call.
    pub fn current_delay(&self) -> Duration {
        self.state.lock().current_delay
    }

    /// Records a failed attempt and returns the new consecutive error count.
    pub fn record_failure(&self, status: u16) -> u32 {
        let mut state = self.state.lock();
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.last_status_code = Some(status);
        state.consecutive_errors
    }

    pub fn record_success(&self, status: u16) {
        let mut state = self.state.lock();
        state.consecutive_errors = 0;
        state.last_status_code = Some(status);
    }

    /// Delay before the next attempt given the current error count.
    pub fn compute_delay(&self, retry_after: Option<&str>) -> Duration {
        let consecutive_errors = self.consecutive_errors();
        if let Some(value) = retry_after {
            if parse_retry_after(value, Utc::now()).is_none() {
                self.diagnostics
                    .report(DiagnosticEvent::BackoffRetryAfterUnparsable {
                        value: value.to_owned(),
                    });
            }
        }
        let delay = self.compute_delay_at(consecutive_errors, retry_after, Utc::now());
        self.state.lock().current_delay = delay;
        delay
    }

    /// Pure form of [`Self::compute_delay`].
    pub fn compute_delay_at(
        &self,
        consecutive_errors: u32,
        retry_after: Option<&str>,
        now: DateTime<Utc>,
    ) -> Duration {
        if let Some(retry_at) = retry_after.and_then(|value| parse_retry_after(value, now)) {
            if let Ok(delay) = (retry_at - now).to_std() {
                if !delay.is_zero() {
                    return delay;
                }
            }
        }
        self.exponential_delay(consecutive_errors)
    }

    fn exponential_delay(&self, consecutive_errors: u32) -> Duration {
        let exponent = consecutive_errors.min(MAX_EXPONENT);
        self.slot_delay
            .saturating_mul(1u32 << exponent)
            .clamp(self.slot_delay, self.max_delay)
    }

    /// Reports that backoff kicked in, at most once per report interval
    /// unless it was reported disabled in between.
    pub fn report_backoff_enabled(&self, status: u16, delay: Duration) {
        let now = self.time_source.now();
        let mut state = self.state.lock();
        let interval_elapsed = state
            .last_report
            .map_or(true, |last| now.duration_since(last) >= self.report_interval);
        if !state.reported || interval_elapsed {
            state.reported = true;
            state.last_report = Some(now);
            drop(state);
            self.diagnostics
                .report(DiagnosticEvent::BackoffEnabled { status, delay });
        }
    }

    pub fn report_backoff_disabled(&self) {
        let mut state = self.state.lock();
        if state.reported {
            state.reported = false;
            drop(state);
            self.diagnostics.report(DiagnosticEvent::BackoffDisabled);
        }
    }
}
