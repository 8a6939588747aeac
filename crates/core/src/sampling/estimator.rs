use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::ema::ExponentialMovingAverageCounter;
use crate::{
    config::serde_duration_ms,
    diagnostics::{DiagnosticEvent, SharedDiagnostics},
    item::TelemetryKind,
    util::{InstantTimeSrc, TimeSource},
};

const MIN_MAX_ITEMS_PER_SECOND: f64 = 1e-12;
const MIN_PERCENTAGE: f64 = 1e-6;
const MAX_PERCENTAGE: f64 = 100.0;
const MIN_RATE: f64 = 1.0;
const MAX_RATE: f64 = 1e8;
const MIN_EVALUATION_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MOVING_AVERAGE_RATIO: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SamplingPercentageEstimatorSettings {
    /// Target number of items per second admitted past sampling.
    #[serde(default = "default_max_telemetry_items_per_second")]
    pub max_telemetry_items_per_second: f64,

    #[serde(default = "default_initial_sampling_percentage")]
    pub initial_sampling_percentage: f64,

    #[serde(default = "default_min_sampling_percentage")]
    pub min_sampling_percentage: f64,

    #[serde(default = "default_max_sampling_percentage")]
    pub max_sampling_percentage: f64,

    #[serde(
        default = "default_evaluation_interval",
        rename = "evaluation-interval-ms",
        with = "serde_duration_ms"
    )]
    pub evaluation_interval: Duration,

    /// Time since the last change before the percentage may go up again.
    #[serde(
        default = "default_sampling_percentage_decrease_timeout",
        rename = "sampling-percentage-decrease-timeout-ms",
        with = "serde_duration_ms"
    )]
    pub sampling_percentage_decrease_timeout: Duration,

    /// Time since the last change before the percentage may go down again.
    #[serde(
        default = "default_sampling_percentage_increase_timeout",
        rename = "sampling-percentage-increase-timeout-ms",
        with = "serde_duration_ms"
    )]
    pub sampling_percentage_increase_timeout: Duration,

    #[serde(default = "default_moving_average_ratio")]
    pub moving_average_ratio: f64,

    /// When not empty, only these kinds are sampled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_types: Vec<TelemetryKind>,

    /// Kinds that always pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_types: Vec<TelemetryKind>,
}

fn default_max_telemetry_items_per_second() -> f64 {
    5.0
}

fn default_initial_sampling_percentage() -> f64 {
    100.0
}

fn default_min_sampling_percentage() -> f64 {
    0.1
}

fn default_max_sampling_percentage() -> f64 {
    100.0
}

fn default_evaluation_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_sampling_percentage_decrease_timeout() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_sampling_percentage_increase_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_moving_average_ratio() -> f64 {
    DEFAULT_MOVING_AVERAGE_RATIO
}

impl Default for SamplingPercentageEstimatorSettings {
    fn default() -> Self {
        Self {
            max_telemetry_items_per_second: default_max_telemetry_items_per_second(),
            initial_sampling_percentage: default_initial_sampling_percentage(),
            min_sampling_percentage: default_min_sampling_percentage(),
            max_sampling_percentage: default_max_sampling_percentage(),
            evaluation_interval: default_evaluation_interval(),
            sampling_percentage_decrease_timeout: default_sampling_percentage_decrease_timeout(),
            sampling_percentage_increase_timeout: default_sampling_percentage_increase_timeout(),
            moving_average_ratio: default_moving_average_ratio(),
            included_types: Vec::new(),
            excluded_types: Vec::new(),
        }
    }
}

/// Sampling rate (keep one item out of `rate`) for a percentage.
fn rate_for_percentage(percentage: f64) -> f64 {
    let percentage = if percentage.is_nan() || percentage <= 0.0 {
        MIN_PERCENTAGE
    } else {
        percentage.min(MAX_PERCENTAGE)
    };
    (MAX_PERCENTAGE / percentage).clamp(MIN_RATE, MAX_RATE)
}

impl SamplingPercentageEstimatorSettings {
    pub fn effective_max_telemetry_items_per_second(&self) -> f64 {
        if self.max_telemetry_items_per_second.is_nan() || self.max_telemetry_items_per_second <= 0.0 {
            MIN_MAX_ITEMS_PER_SECOND
        } else {
            self.max_telemetry_items_per_second
        }
    }

    pub fn effective_initial_sampling_rate(&self) -> f64 {
        rate_for_percentage(self.initial_sampling_percentage)
            .clamp(self.effective_min_sampling_rate(), self.effective_max_sampling_rate())
    }

    /// The lowest rate, i.e. the highest percentage allowed.
    pub fn effective_min_sampling_rate(&self) -> f64 {
        rate_for_percentage(self.max_sampling_percentage).min(self.effective_max_sampling_rate())
    }

    /// The highest rate, i.e. the lowest percentage allowed.
    pub fn effective_max_sampling_rate(&self) -> f64 {
        rate_for_percentage(self.min_sampling_percentage)
    }

    pub fn effective_evaluation_interval(&self) -> Duration {
        self.evaluation_interval.max(MIN_EVALUATION_INTERVAL)
    }

    pub fn effective_moving_average_ratio(&self) -> f64 {
        if self.moving_average_ratio > 0.0 && self.moving_average_ratio <= 1.0 {
            self.moving_average_ratio
        } else {
            DEFAULT_MOVING_AVERAGE_RATIO
        }
    }
}

/// Outcome of one estimator run.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingEvaluation {
    /// Items per second that passed sampling, smoothed.
    pub observed_items_per_second: f64,
    /// Estimated items per second produced before sampling.
    pub pre_sampling_items_per_second: f64,
    pub current_percentage: f64,
    pub suggested_percentage: f64,
    pub changed: bool,
}

pub type EvaluationCallback = Arc<dyn Fn(&SamplingEvaluation) + Send + Sync>;

struct EstimatorState {
    rate: f64,
    last_change: Instant,
}

/// Keeps the number of items admitted past sampling near a target rate.
pub struct SamplingPercentageEstimator {
    settings: SamplingPercentageEstimatorSettings,
    counter: ExponentialMovingAverageCounter,
    state: Mutex<EstimatorState>,
    time_source: Arc<dyn TimeSource>,
    callback: Option<EvaluationCallback>,
    diagnostics: SharedDiagnostics,
}

impl SamplingPercentageEstimator {
    pub fn new(settings: SamplingPercentageEstimatorSettings, diagnostics: SharedDiagnostics) -> Self {
        Self::with_time_source(settings, diagnostics, Arc::new(InstantTimeSrc::new()))
    }

    pub fn with_time_source(
        settings: SamplingPercentageEstimatorSettings,
        diagnostics: SharedDiagnostics,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        let state = EstimatorState {
            rate: settings.effective_initial_sampling_rate(),
            last_change: time_source.now(),
        };
        Self {
            counter: ExponentialMovingAverageCounter::new(settings.effective_moving_average_ratio()),
            settings,
            state: Mutex::new(state),
            time_source,
            callback: None,
            diagnostics,
        }
    }

    pub fn with_callback(mut self, callback: EvaluationCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn settings(&self) -> &SamplingPercentageEstimatorSettings {
        &self.settings
    }

    pub fn current_percentage(&self) -> f64 {
        MAX_PERCENTAGE / self.state.lock().rate
    }

    /// Counts one item that passed sampling.
    pub fn record_item(&self) {
        self.counter.increment();
    }

    /// Closes the current interval and moves the sampling rate towards the
    /// one that keeps admitted items at the target, subject to the
    /// hysteresis timeouts.
    pub fn evaluate(&self) -> SamplingEvaluation {
        let interval_secs = self.settings.effective_evaluation_interval().as_secs_f64();
        let observed = self.counter.start_new_interval() / interval_secs;

        let now = self.time_source.now();
        let mut state = self.state.lock();
        let current_rate = state.rate;
        let pre_sampling = observed * current_rate;
        let suggested_rate = (pre_sampling / self.settings.effective_max_telemetry_items_per_second())
            .ceil()
            .clamp(
                self.settings.effective_min_sampling_rate(),
                self.settings.effective_max_sampling_rate(),
            );

        let since_last_change = now.saturating_duration_since(state.last_change);
        let changed = if suggested_rate > current_rate {
            since_last_change >= self.settings.sampling_percentage_increase_timeout
        } else if suggested_rate < current_rate {
            since_last_change >= self.settings.sampling_percentage_decrease_timeout
        } else {
            false
        };
        if changed {
            state.rate = suggested_rate;
            state.last_change = now;
        }
        drop(state);

        let evaluation = SamplingEvaluation {
            observed_items_per_second: observed,
            pre_sampling_items_per_second: pre_sampling,
            current_percentage: MAX_PERCENTAGE / current_rate,
            suggested_percentage: MAX_PERCENTAGE / suggested_rate,
            changed,
        };
        if changed {
            // The counter measures post-sampling volume, which just changed meaning.
            self.counter.reset();
            self.diagnostics
                .report(DiagnosticEvent::SamplingPercentageChanged {
                    from: evaluation.current_percentage,
                    to: evaluation.suggested_percentage,
                });
        }
        if let Some(callback) = &self.callback {
            callback(&evaluation);
        }
        evaluation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{diagnostics::test::RecordingDiagnostics, util::time_source::MockTimeSource};

    fn settings() -> SamplingPercentageEstimatorSettings {
        SamplingPercentageEstimatorSettings {
            max_telemetry_items_per_second: 1.0,
            evaluation_interval: Duration::from_secs(10),
            moving_average_ratio: 1.0,
            ..Default::default()
        }
    }

    fn estimator(
        settings: SamplingPercentageEstimatorSettings,
    ) -> (SamplingPercentageEstimator, MockTimeSource, Arc<RecordingDiagnostics>) {
        let time = MockTimeSource::new(Instant::now());
        let diagnostics = RecordingDiagnostics::shared();
        let estimator = SamplingPercentageEstimator::with_time_source(
            settings,
            diagnostics.clone(),
            Arc::new(time.clone()),
        );
        (estimator, time, diagnostics)
    }

    fn record(estimator: &SamplingPercentageEstimator, items: usize) {
        for _ in 0..items {
            estimator.record_item();
        }
    }

    #[test]
    fn test_settings_are_clamped() {
        let settings = SamplingPercentageEstimatorSettings {
            max_telemetry_items_per_second: -1.0,
            min_sampling_percentage: 0.0,
            max_sampling_percentage: 250.0,
            evaluation_interval: Duration::from_millis(10),
            moving_average_ratio: 3.0,
            ..Default::default()
        };
        assert_eq!(settings.effective_max_telemetry_items_per_second(), 1e-12);
        assert_eq!(settings.effective_max_sampling_rate(), 1e8);
        assert_eq!(settings.effective_min_sampling_rate(), 1.0);
        assert_eq!(settings.effective_evaluation_interval(), Duration::from_secs(1));
        assert_eq!(settings.effective_moving_average_ratio(), 0.25);
    }

    #[test]
    fn test_settings_from_toml() {
        let settings: SamplingPercentageEstimatorSettings = toml::from_str(
            r#"
            max-telemetry-items-per-second = 2.5
            sampling-percentage-increase-timeout-ms = 60000
            excluded-types = ["exception"]
            "#,
        )
        .unwrap();
        assert_eq!(settings.max_telemetry_items_per_second, 2.5);
        assert_eq!(
            settings.sampling_percentage_increase_timeout,
            Duration::from_secs(60)
        );
        assert_eq!(settings.excluded_types, vec![TelemetryKind::Exception]);
        assert_eq!(settings.evaluation_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_overload_lowers_percentage_after_increase_timeout() {
        let (estimator, time, diagnostics) = estimator(settings());

        // 100 items in 10s against a target of 1/s.
        record(&estimator, 100);
        time.advance_time(Duration::from_secs(10));
        let evaluation = estimator.evaluate();
        assert!(!evaluation.changed);
        assert_eq!(evaluation.suggested_percentage, 10.0);
        assert_eq!(estimator.current_percentage(), 100.0);

        time.advance_time(Duration::from_secs(15 * 60));
        record(&estimator, 100);
        let evaluation = estimator.evaluate();
        assert!(evaluation.changed);
        assert_eq!(estimator.current_percentage(), 10.0);
        assert_eq!(diagnostics.count("sampling_percentage_changed"), 1);
    }

    #[test]
    fn test_headroom_raises_percentage_after_decrease_timeout() {
        let (estimator, time, _) = estimator(SamplingPercentageEstimatorSettings {
            initial_sampling_percentage: 10.0,
            ..settings()
        });
        assert_eq!(estimator.current_percentage(), 10.0);

        // Two admitted items in 10s at 10% is 2/s before sampling.
        record(&estimator, 2);
        time.advance_time(Duration::from_secs(60));
        assert!(!estimator.evaluate().changed);

        record(&estimator, 2);
        time.advance_time(Duration::from_secs(60));
        let evaluation = estimator.evaluate();
        assert!(evaluation.changed);
        assert_eq!(estimator.current_percentage(), 50.0);
    }

    #[test]
    fn test_percentage_stays_within_bounds() {
        let (estimator, time, _) = estimator(SamplingPercentageEstimatorSettings {
            min_sampling_percentage: 20.0,
            sampling_percentage_increase_timeout: Duration::ZERO,
            ..settings()
        });
        record(&estimator, 10_000);
        time.advance_time(Duration::from_secs(10));
        assert!(estimator.evaluate().changed);
        assert_eq!(estimator.current_percentage(), 20.0);
    }

    #[test]
    fn test_callback_sees_every_evaluation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (estimator, _, _) = estimator(settings());
        let estimator = estimator.with_callback(Arc::new(move |evaluation: &SamplingEvaluation| {
            sink.lock().push(evaluation.clone());
        }));

        estimator.evaluate();
        estimator.evaluate();
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(seen.lock()[0].current_percentage, 100.0);
    }
}
