use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};

use rand::Rng;
use tokio::task::JoinHandle;

use crate::{
    config::GlobalExecutor,
    diagnostics::{DiagnosticEvent, SharedDiagnostics},
    item::{TelemetryItem, TelemetryKind, TelemetryProcessor},
};

mod ema;
mod estimator;

pub use ema::ExponentialMovingAverageCounter;
pub use estimator::{
    EvaluationCallback, SamplingEvaluation, SamplingPercentageEstimator,
    SamplingPercentageEstimatorSettings,
};

/// Drops a share of sampled kinds so the number of items reaching `next`
/// stays near the configured rate.
///
/// Decisions are deterministic per user (or per operation when there is no
/// user), so correlated items are kept or dropped together.
pub struct AdaptiveSamplingTelemetryProcessor<N> {
    next: N,
    estimator: Arc<SamplingPercentageEstimator>,
    included: HashSet<TelemetryKind>,
    excluded: HashSet<TelemetryKind>,
    diagnostics: SharedDiagnostics,
    evaluation_task: Option<JoinHandle<()>>,
}

impl<N: TelemetryProcessor> AdaptiveSamplingTelemetryProcessor<N> {
    /// Creates the processor and starts evaluating on the settings' cadence.
    pub fn new(estimator: SamplingPercentageEstimator, diagnostics: SharedDiagnostics, next: N) -> Self {
        let mut processor = Self::with_estimator(Arc::new(estimator), diagnostics, next);
        processor.evaluation_task = Some(spawn_evaluation(Arc::downgrade(&processor.estimator)));
        processor
    }

    /// Uses an estimator that the caller evaluates.
    pub fn with_estimator(
        estimator: Arc<SamplingPercentageEstimator>,
        diagnostics: SharedDiagnostics,
        next: N,
    ) -> Self {
        let settings = estimator.settings();
        Self {
            included: settings.included_types.iter().copied().collect(),
            excluded: settings.excluded_types.iter().copied().collect(),
            next,
            estimator,
            diagnostics,
            evaluation_task: None,
        }
    }

    pub fn estimator(&self) -> &Arc<SamplingPercentageEstimator> {
        &self.estimator
    }

    fn is_sampled(&self, kind: TelemetryKind) -> bool {
        kind.supports_sampling()
            && !self.excluded.contains(&kind)
            && (self.included.is_empty() || self.included.contains(&kind))
    }
}

impl<N> Drop for AdaptiveSamplingTelemetryProcessor<N> {
    fn drop(&mut self) {
        if let Some(task) = self.evaluation_task.take() {
            task.abort();
        }
    }
}

impl<N: TelemetryProcessor> TelemetryProcessor for AdaptiveSamplingTelemetryProcessor<N> {
    fn process(&self, mut item: TelemetryItem) {
        if !self.is_sampled(item.kind) {
            self.next.process(item);
            return;
        }
        let percentage = self.estimator.current_percentage();
        if percentage < 100.0 && sampling_score(&item) >= percentage {
            self.diagnostics
                .report(DiagnosticEvent::ItemSampledOut { percentage });
            return;
        }
        item.sampling_percentage = Some(percentage);
        self.estimator.record_item();
        self.next.process(item);
    }
}

fn spawn_evaluation(estimator: Weak<SamplingPercentageEstimator>) -> JoinHandle<()> {
    GlobalExecutor::spawn(async move {
        let period = match estimator.upgrade() {
            Some(estimator) => estimator.settings().effective_evaluation_interval(),
            None => return,
        };
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(estimator) = estimator.upgrade() else {
                break;
            };
            let evaluation = estimator.evaluate();
            tracing::trace!(
                observed = evaluation.observed_items_per_second,
                percentage = evaluation.current_percentage,
                suggested = evaluation.suggested_percentage,
                "sampling evaluated"
            );
        }
    })
}

/// Score in `[0, 100)` compared against the sampling percentage. Items with
/// a score below the percentage are kept.
pub fn sampling_score(item: &TelemetryItem) -> f64 {
    let non_empty = |id: &Option<String>| id.as_deref().filter(|id| !id.is_empty()).map(djb2);
    let hash = non_empty(&item.user_id)
        .or_else(|| non_empty(&item.operation_id))
        .unwrap_or_else(|| rand::rng().random_range(0..i32::MAX));
    f64::from(hash) / (f64::from(i32::MAX) + 1.0) * 100.0
}

/// djb2 over the UTF-16 code units of `input`, repeated to at least eight
/// units, folded to a non-negative `i32`.
fn djb2(input: &str) -> i32 {
    let units: Vec<u16> = input.encode_utf16().collect();
    let mut hash: i32 = 5381;
    if units.is_empty() {
        return hash;
    }
    let mut len = 0;
    while len < 8 {
        for unit in &units {
            hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(i32::from(*unit));
        }
        len += units.len();
    }
    if hash == i32::MIN {
        i32::MAX
    } else {
        hash.abs()
    }
}
