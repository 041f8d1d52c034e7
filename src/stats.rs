//! Run diagnostics: a sliding-window convergence tracker for the ELBO estimate
//! and the counters collected during an inference run.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use std::collections::VecDeque;
use std::time::Duration;

use crate::variational::VariationalParameters;

/// Tracks the objective over the last `2 * window` iterations.
///
/// Convergence is declared when the mean of the latest `window` values differs
/// from the mean of the `window` values before them by less than `tol`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveTracker {
    window: usize,
    n: u64,
    mean: f64,
    queue: VecDeque<f64>,
}

impl ObjectiveTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            n: 0,
            mean: 0.0,
            queue: VecDeque::new(),
        }
    }

    fn span(&self) -> usize {
        self.window.saturating_mul(2)
    }

    /// Number of values pushed since construction or the last reset.
    pub fn len(&self) -> u64 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Running mean over every value pushed so far.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn push(&mut self, objective: f64) {
        self.n += 1;
        let n = self.n as f64;
        self.mean = (self.mean * (n - 1.0) + objective) / n;

        if self.window == 0 {
            return;
        }
        if self.queue.len() >= self.span() {
            self.queue.pop_front();
        }
        self.queue.push_back(objective);
    }

    /// Means of the previous and the latest window, once both are full.
    pub fn window_means(&self) -> Option<(f64, f64)> {
        if self.window == 0 || self.queue.len() < self.span() {
            return None;
        }
        let w = self.window as f64;
        let previous: f64 = self.queue.iter().take(self.window).sum::<f64>() / w;
        let latest: f64 = self.queue.iter().skip(self.window).sum::<f64>() / w;
        Some((previous, latest))
    }

    /// A non-positive `tol` never converges.
    pub fn has_converged(&self, tol: f64) -> bool {
        if tol <= 0.0 {
            return false;
        }
        match self.window_means() {
            Some((previous, latest)) => (latest - previous).abs() < tol,
            None => false,
        }
    }
}

/// Periodic snapshot of the parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub iteration: usize,
    pub objective: f64,
    pub parameters: VariationalParameters,
}

/// Counters and traces collected during one run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Diagnostics {
    /// Completed iterations.
    pub iterations: usize,
    /// ELBO estimate of every completed iteration.
    pub objective_trace: Vec<f64>,
    /// Samples dropped because of non-finite terms, over all batches.
    pub n_excluded: usize,
    /// Batches in which every sample was dropped.
    pub n_degenerate: usize,
    /// Batches redrawn after a degenerate batch.
    pub n_retries: usize,
    /// Largest absolute gradient component seen, before clipping.
    pub max_abs_gradient: f64,
    pub trace: Vec<TraceRecord>,
    pub elapsed: Duration,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn final_objective(&self) -> Option<f64> {
        self.objective_trace.last().copied()
    }

    /// Highest ELBO estimate seen, ignoring NaNs.
    pub fn best_objective(&self) -> Option<f64> {
        if self.objective_trace.is_empty() {
            return None;
        }
        let trace = ArrayView1::from(&self.objective_trace);
        Some(*trace.max_skipnan())
    }

    /// Mean of the last `n` objective estimates.
    pub fn mean_recent_objective(&self, n: usize) -> Option<f64> {
        let n = n.min(self.objective_trace.len());
        if n == 0 {
            return None;
        }
        let start = self.objective_trace.len() - n;
        ArrayView1::from(&self.objective_trace[start..]).mean()
    }
}
