//! Triggers deciding when extensions run and when training stops.

use serde::{Deserialize, Serialize};

use crate::updater::Observation;

/// Fires every `period` iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalTrigger {
    period: usize,
}

impl IntervalTrigger {
    /// Fires when the iteration count is a multiple of `period` (at least 1).
    pub const fn new(period: usize) -> Self {
        Self {
            period: if period == 0 { 1 } else { period },
        }
    }

    /// Fires after every iteration.
    pub const fn every_iteration() -> Self {
        Self::new(1)
    }

    /// The period in iterations.
    pub const fn period(&self) -> usize {
        self.period
    }

    /// Whether the trigger fires at `iteration` (the number of completed updates).
    pub const fn fires(&self, iteration: usize) -> bool {
        iteration > 0 && iteration % self.period == 0
    }
}

/// Stops at a maximum iteration or when a monitored value stops improving.
///
/// Values of `monitor` are averaged between checks; lower is better. Training
/// stops once `patience` consecutive checks fail to improve on the best mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingTrigger {
    monitor: String,
    max_iteration: usize,
    check: IntervalTrigger,
    patience: Option<usize>,
    best: Option<f64>,
    stale_checks: usize,
    sum: f64,
    count: usize,
}

impl EarlyStoppingTrigger {
    /// Creates a trigger. `patience = None` never stops early.
    pub fn new(
        monitor: impl Into<String>,
        max_iteration: usize,
        check_interval: usize,
        patience: Option<usize>,
    ) -> Self {
        Self {
            monitor: monitor.into(),
            max_iteration,
            check: IntervalTrigger::new(check_interval),
            patience: patience.map(|p| p.max(1)),
            best: None,
            stale_checks: 0,
            sum: 0.0,
            count: 0,
        }
    }

    /// Maximum number of iterations.
    pub const fn max_iteration(&self) -> usize {
        self.max_iteration
    }

    /// Best monitored mean seen at a check so far.
    pub const fn best(&self) -> Option<f64> {
        self.best
    }

    /// Continues the monitoring progress of `saved`, keeping this trigger's
    /// limits and monitored key.
    pub fn resume_from(&mut self, saved: Self) {
        self.best = saved.best;
        self.stale_checks = saved.stale_checks;
        self.sum = saved.sum;
        self.count = saved.count;
    }

    /// Consumes the observation of the last iteration and decides whether to stop.
    ///
    /// Must be called once per iteration, with `iteration` updates completed.
    pub fn should_stop(&mut self, iteration: usize, observation: &Observation) -> bool {
        if iteration >= self.max_iteration {
            return true;
        }
        if let Some(value) = observation.get(&self.monitor) {
            self.sum += value;
            self.count += 1;
        }
        if !self.check.fires(iteration) || self.count == 0 {
            return false;
        }

        let mean = self.sum / self.count as f64;
        self.sum = 0.0;
        self.count = 0;
        match self.best {
            Some(best) if mean >= best => self.stale_checks += 1,
            _ => {
                self.best = Some(mean);
                self.stale_checks = 0;
            }
        }

        match self.patience {
            Some(patience) if self.stale_checks >= patience => {
                tracing::info!(
                    iteration,
                    monitor = %self.monitor,
                    best = self.best.unwrap_or(f64::NAN),
                    "early stopping"
                );
                true
            }
            _ => false,
        }
    }
}

/// Snapshot/validation frequency: `iteration / 80` for negative requests.
pub fn resolve_frequency(requested: i64, iteration: usize) -> usize {
    if requested < 0 {
        (iteration / 80).max(1)
    } else {
        (requested as usize).max(1)
    }
}
