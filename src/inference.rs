//! The mean-field variational inference loop.
//!
//! [`MeanFieldVI`] repeatedly draws a batch from the variational family,
//! estimates the ELBO gradient against a [`Target`], and takes an optimizer
//! step. A run ends in one of the [`TerminalStatus`] states and always hands
//! back a [`FinalState`]; failures are reported through the status rather
//! than by truncating the run silently.
//!
//! ```
//! use mini_vi::distributions::Gaussian;
//! use mini_vi::inference::{MeanFieldVI, TerminalStatus, VIConfig};
//! use ndarray::{arr1, arr2};
//!
//! let target = Gaussian::new(arr1(&[1.0, 1.0]), arr2(&[[1.0, 0.1], [0.1, 1.0]])).unwrap();
//! let config = VIConfig::default().set_n_iter(2000).set_seed(42);
//! let mut vi = MeanFieldVI::new(target, config).unwrap();
//! let result = vi.fit();
//! assert_eq!(result.status, TerminalStatus::MaxIterationsReached);
//! assert!((result.parameters.mu[0] - 1.0).abs() < 0.2);
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::distributions::Target;
use crate::error::{VIError, VIResult};
use crate::estimator::{Baseline, EstimatorMode, GradientEstimate, GradientEstimator};
use crate::optimizer::{LearningRate, Optimizer, UpdateRule};
use crate::stats::{Diagnostics, ObjectiveTracker, TraceRecord};
use crate::variational::{MeanFieldGaussian, VariationalParameters};

/// Recognized options of an inference run.
#[derive(Debug, Clone, PartialEq)]
pub struct VIConfig {
    pub n_iter: usize,
    /// Samples per gradient estimate. Must be positive.
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Inverse-decay rate of the step size; `0.0` keeps it constant.
    pub lr_decay: f64,
    /// Maximum joint L2 gradient norm; `f64::INFINITY` disables clipping.
    pub gradient_clip: f64,
    /// `0.0` disables the convergence check.
    pub convergence_tolerance: f64,
    pub convergence_window: usize,
    pub estimator_mode: EstimatorMode,
    pub baseline: Baseline,
    pub analytic_entropy: bool,
    pub update_rule: UpdateRule,
    /// `None` draws a seed from the thread RNG.
    pub random_seed: Option<u64>,
    /// Fresh batches drawn after a degenerate batch before the run fails.
    pub max_degenerate_retries: usize,
    /// Evaluate the target on rayon workers within each iteration.
    pub parallel: bool,
    /// Record a [`TraceRecord`] every `trace_every` iterations; `0` disables.
    pub trace_every: usize,
    /// Emit a debug log record every `report_every` iterations; `0` disables.
    pub report_every: usize,
    /// Wall-clock budget per run, checked between iterations.
    pub deadline: Option<Duration>,
}

impl Default for VIConfig {
    fn default() -> Self {
        Self {
            n_iter: 10_000,
            batch_size: 8,
            learning_rate: 0.05,
            lr_decay: 0.001,
            gradient_clip: 100.0,
            convergence_tolerance: 0.0,
            convergence_window: 100,
            estimator_mode: EstimatorMode::Reparameterization,
            baseline: Baseline::RunningMean { decay: 0.9 },
            analytic_entropy: false,
            update_rule: UpdateRule::Sgd,
            random_seed: None,
            max_degenerate_retries: 10,
            parallel: false,
            trace_every: 0,
            report_every: 1000,
            deadline: None,
        }
    }
}

impl VIConfig {
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn set_n_iter(mut self, n_iter: usize) -> Self {
        self.n_iter = n_iter;
        self
    }

    pub fn set_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn set_learning_rate(mut self, learning_rate: f64, lr_decay: f64) -> Self {
        self.learning_rate = learning_rate;
        self.lr_decay = lr_decay;
        self
    }

    pub fn set_gradient_clip(mut self, gradient_clip: f64) -> Self {
        self.gradient_clip = gradient_clip;
        self
    }

    pub fn set_convergence(mut self, tolerance: f64, window: usize) -> Self {
        self.convergence_tolerance = tolerance;
        self.convergence_window = window;
        self
    }

    pub fn set_estimator(mut self, mode: EstimatorMode) -> Self {
        self.estimator_mode = mode;
        self
    }

    pub fn set_baseline(mut self, baseline: Baseline) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn set_analytic_entropy(mut self, analytic_entropy: bool) -> Self {
        self.analytic_entropy = analytic_entropy;
        self
    }

    pub fn set_update_rule(mut self, rule: UpdateRule) -> Self {
        self.update_rule = rule;
        self
    }

    pub fn set_max_degenerate_retries(mut self, retries: usize) -> Self {
        self.max_degenerate_retries = retries;
        self
    }

    pub fn set_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn set_trace_every(mut self, every: usize) -> Self {
        self.trace_every = every;
        self
    }

    pub fn set_report_every(mut self, every: usize) -> Self {
        self.report_every = every;
        self
    }

    pub fn set_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Step-size schedule implied by `learning_rate` and `lr_decay`.
    pub fn schedule(&self) -> LearningRate {
        if self.lr_decay == 0.0 {
            LearningRate::Constant(self.learning_rate)
        } else {
            LearningRate::InverseDecay {
                lr0: self.learning_rate,
                decay: self.lr_decay,
            }
        }
    }

    pub fn validate(&self) -> VIResult<()> {
        check_run_args(
            self.n_iter,
            self.batch_size,
            self.convergence_tolerance,
            self.convergence_window,
        )?;
        self.schedule().validate()?;
        if self.gradient_clip.is_nan() || self.gradient_clip <= 0.0 {
            return Err(VIError::invalid(format!(
                "gradient_clip must be positive, got {}",
                self.gradient_clip
            )));
        }
        if let Baseline::RunningMean { decay } = self.baseline {
            if !(0.0..=1.0).contains(&decay) {
                return Err(VIError::invalid(format!(
                    "baseline decay must lie in [0, 1], got {decay}"
                )));
            }
        }
        self.update_rule.validate()
    }
}

fn check_run_args(n_iter: usize, batch_size: usize, tol: f64, window: usize) -> VIResult<()> {
    if n_iter == 0 {
        return Err(VIError::invalid("n_iter must be positive"));
    }
    if batch_size == 0 {
        return Err(VIError::invalid("batch_size must be positive"));
    }
    if !(tol.is_finite() && tol >= 0.0) {
        return Err(VIError::invalid(format!(
            "convergence tolerance must be finite and non-negative, got {tol}"
        )));
    }
    if tol > 0.0 && window == 0 {
        return Err(VIError::invalid(
            "convergence window must be positive when a tolerance is set",
        ));
    }
    Ok(())
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalStatus {
    Converged,
    MaxIterationsReached,
    Failed(VIError),
    Cancelled,
    DeadlineExceeded,
}

impl TerminalStatus {
    /// `Converged` or `MaxIterationsReached`.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TerminalStatus::Converged | TerminalStatus::MaxIterationsReached
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunPhase {
    Initialized,
    Running,
    Terminated(TerminalStatus),
}

/// Result of a run: the latest accepted parameters, the run's diagnostics
/// and the terminal status.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalState {
    pub parameters: VariationalParameters,
    pub diagnostics: Diagnostics,
    pub status: TerminalStatus,
}

impl FinalState {
    pub fn mean(&self) -> &ndarray::Array1<f64> {
        &self.parameters.mu
    }

    pub fn std(&self) -> ndarray::Array1<f64> {
        self.parameters.log_sigma.mapv(f64::exp)
    }
}

/// Passed to the reporting callback after every completed iteration.
#[derive(Debug, Clone, Copy)]
pub struct IterationReport<'a> {
    /// One-based index of the completed iteration.
    pub iteration: usize,
    /// ELBO estimate of the batch used in this iteration.
    pub objective: f64,
    /// Parameters after the update.
    pub parameters: &'a VariationalParameters,
    pub gradient_norm: f64,
    pub n_excluded: usize,
}

/// Cooperative cancellation flag shared between the loop and other threads.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the flag so the token can be reused for another run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

type Callback = Box<dyn FnMut(&IterationReport<'_>)>;

/// Mean-field Gaussian variational inference against a fixed target.
pub struct MeanFieldVI<T: Target + Sync> {
    target: T,
    config: VIConfig,
    family: MeanFieldGaussian,
    initial: VariationalParameters,
    estimator: GradientEstimator,
    optimizer: Optimizer,
    tracker: ObjectiveTracker,
    diagnostics: Diagnostics,
    phase: RunPhase,
    pub rng: SmallRng,
    cancel: CancellationToken,
    callback: Option<Callback>,
}

impl<T: Target + Sync> MeanFieldVI<T> {
    /// Validates `config` against `target` and sets up a run starting from
    /// `mu = 0`, `log_sigma = 0`.
    pub fn new(target: T, config: VIConfig) -> VIResult<Self> {
        config.validate()?;
        let dim = target.dim();
        if dim == 0 {
            return Err(VIError::invalid("target dimension must be positive"));
        }
        if config.estimator_mode == EstimatorMode::Reparameterization
            && !target.is_differentiable()
        {
            return Err(VIError::invalid(
                "reparameterization gradients require a differentiable target; \
                 use the score-function estimator",
            ));
        }

        let family = MeanFieldGaussian::new(dim)?;
        let initial = family.parameters().clone();
        let estimator = GradientEstimator::new(config.estimator_mode)
            .with_baseline(config.baseline)
            .with_analytic_entropy(config.analytic_entropy)
            .set_parallel(config.parallel);
        let optimizer = Optimizer::new(config.schedule())
            .with_rule(config.update_rule)
            .with_gradient_clip(config.gradient_clip);
        let seed = config
            .random_seed
            .unwrap_or_else(|| thread_rng().gen::<u64>());

        Ok(Self {
            target,
            tracker: ObjectiveTracker::new(config.convergence_window),
            config,
            family,
            initial,
            estimator,
            optimizer,
            diagnostics: Diagnostics::new(),
            phase: RunPhase::Initialized,
            rng: SmallRng::seed_from_u64(seed),
            cancel: CancellationToken::new(),
            callback: None,
        })
    }

    /// Sets the random seed for subsequent runs.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.config.random_seed = Some(seed);
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Starting point of every run.
    pub fn with_initial_parameters(mut self, params: VariationalParameters) -> VIResult<Self> {
        if params.dim() != self.family.dim() {
            return Err(VIError::DimensionMismatch {
                expected: self.family.dim(),
                found: params.dim(),
            });
        }
        self.family.set_parameters(params.clone())?;
        self.initial = params;
        Ok(self)
    }

    /// Called after every completed iteration.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&IterationReport<'_>) + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle to the token checked between iterations.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &VIConfig {
        &self.config
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    /// Parameters as of the latest accepted update.
    pub fn parameters(&self) -> &VariationalParameters {
        self.family.parameters()
    }

    pub fn family(&self) -> &MeanFieldGaussian {
        &self.family
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Runs with the iteration budget, batch size and convergence settings of
    /// the configuration.
    pub fn fit(&mut self) -> FinalState {
        self.run(
            self.config.n_iter,
            self.config.batch_size,
            self.config.convergence_tolerance,
            self.config.convergence_window,
        )
    }

    /// Runs at most `n_iter` iterations with `batch_size` samples each.
    /// Convergence is checked over two consecutive windows of
    /// `convergence_window` iterations.
    pub fn run(
        &mut self,
        n_iter: usize,
        batch_size: usize,
        convergence_tolerance: f64,
        convergence_window: usize,
    ) -> FinalState {
        self.execute(
            n_iter,
            batch_size,
            convergence_tolerance,
            convergence_window,
            None,
        )
    }

    /// Same as [`MeanFieldVI::run`], with a progress bar showing the current
    /// ELBO estimate.
    pub fn run_progress(
        &mut self,
        n_iter: usize,
        batch_size: usize,
        convergence_tolerance: f64,
        convergence_window: usize,
    ) -> FinalState {
        let pb = ProgressBar::new(n_iter as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
        {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.set_prefix("VI");
        let state = self.execute(
            n_iter,
            batch_size,
            convergence_tolerance,
            convergence_window,
            Some(&pb),
        );
        pb.finish_with_message(format!("{:?}", state.status));
        state
    }

    fn reset_run(&mut self, window: usize) -> VIResult<()> {
        self.family.set_parameters(self.initial.clone())?;
        self.diagnostics = Diagnostics::new();
        self.optimizer.reset();
        self.estimator.reset();
        self.tracker = ObjectiveTracker::new(window);
        if let Some(seed) = self.config.random_seed {
            self.rng = SmallRng::seed_from_u64(seed);
        }
        Ok(())
    }

    fn execute(
        &mut self,
        n_iter: usize,
        batch_size: usize,
        tol: f64,
        window: usize,
        pb: Option<&ProgressBar>,
    ) -> FinalState {
        let start = Instant::now();
        let status = match check_run_args(n_iter, batch_size, tol, window)
            .and_then(|_| self.reset_run(window))
        {
            Ok(()) => {
                self.phase = RunPhase::Running;
                self.iterate(n_iter, batch_size, tol, start, pb)
            }
            Err(e) => {
                warn!("rejecting run: {e}");
                self.diagnostics = Diagnostics::new();
                TerminalStatus::Failed(e)
            }
        };
        self.diagnostics.elapsed = start.elapsed();

        match &status {
            TerminalStatus::Failed(e) => warn!(
                "run failed after {} iterations: {e}",
                self.diagnostics.iterations
            ),
            other => info!(
                "run finished with {:?} after {} iterations, elbo≈{:.4}",
                other,
                self.diagnostics.iterations,
                self.diagnostics.final_objective().unwrap_or(f64::NAN)
            ),
        }

        self.phase = RunPhase::Terminated(status.clone());
        FinalState {
            parameters: self.family.parameters().clone(),
            diagnostics: self.diagnostics.clone(),
            status,
        }
    }

    fn iterate(
        &mut self,
        n_iter: usize,
        batch_size: usize,
        tol: f64,
        start: Instant,
        pb: Option<&ProgressBar>,
    ) -> TerminalStatus {
        for t in 0..n_iter {
            if self.cancel.is_cancelled() {
                return TerminalStatus::Cancelled;
            }
            if let Some(deadline) = self.config.deadline {
                if start.elapsed() >= deadline {
                    return TerminalStatus::DeadlineExceeded;
                }
            }

            let estimate = match self.estimate_with_retries(batch_size) {
                Ok(estimate) => estimate,
                Err(e) => return TerminalStatus::Failed(e),
            };
            let gradient_norm = estimate.norm();
            self.diagnostics.max_abs_gradient =
                self.diagnostics.max_abs_gradient.max(estimate.max_abs());

            let iteration = t + 1;
            if !estimate.is_finite() {
                return TerminalStatus::Failed(VIError::NumericalDivergence { iteration });
            }
            let proposal = match self.optimizer.step(self.family.parameters(), &estimate, t) {
                Ok(params) => params,
                Err(e) => return TerminalStatus::Failed(e),
            };
            // A finite log_sigma can still overflow sigma on the next draw.
            let sigma_overflows = proposal.log_sigma.iter().any(|ls| !ls.exp().is_finite());
            if !proposal.is_finite() || sigma_overflows {
                return TerminalStatus::Failed(VIError::NumericalDivergence { iteration });
            }
            if let Err(e) = self.family.set_parameters(proposal) {
                return TerminalStatus::Failed(e);
            }

            let objective = estimate.objective;
            self.diagnostics.iterations = iteration;
            self.diagnostics.objective_trace.push(objective);
            self.tracker.push(objective);

            if self.config.trace_every > 0 && iteration % self.config.trace_every == 0 {
                self.diagnostics.trace.push(TraceRecord {
                    iteration,
                    objective,
                    parameters: self.family.parameters().clone(),
                });
            }
            if self.config.report_every > 0 && iteration % self.config.report_every == 0 {
                debug!(
                    "iteration {iteration}: elbo≈{objective:.4} running mean {:.4} |grad| {gradient_norm:.3e}",
                    self.tracker.mean()
                );
            }
            if let Some(pb) = pb {
                pb.inc(1);
                pb.set_message(format!("elbo≈{objective:.3}"));
            }
            if let Some(callback) = self.callback.as_mut() {
                callback(&IterationReport {
                    iteration,
                    objective,
                    parameters: self.family.parameters(),
                    gradient_norm,
                    n_excluded: estimate.n_excluded,
                });
            }

            if self.tracker.has_converged(tol) {
                return TerminalStatus::Converged;
            }
        }
        TerminalStatus::MaxIterationsReached
    }

    /// Draws batches until one yields a gradient, up to
    /// `max_degenerate_retries` redraws.
    fn estimate_with_retries(&mut self, batch_size: usize) -> VIResult<GradientEstimate> {
        let mut retries = 0;
        loop {
            let batch = self.family.sample(batch_size, &mut self.rng)?;
            match self.estimator.estimate(&self.family, &self.target, &batch) {
                Ok(estimate) => {
                    if estimate.n_excluded > 0 {
                        self.diagnostics.n_excluded += estimate.n_excluded;
                        warn!(
                            "excluded {} of {} samples with non-finite terms",
                            estimate.n_excluded,
                            batch.len()
                        );
                    }
                    return Ok(estimate);
                }
                Err(VIError::DegenerateGradient { excluded }) => {
                    self.diagnostics.n_degenerate += 1;
                    self.diagnostics.n_excluded += excluded;
                    if retries >= self.config.max_degenerate_retries {
                        return Err(VIError::DegenerateGradient { excluded });
                    }
                    retries += 1;
                    self.diagnostics.n_retries += 1;
                    warn!(
                        "degenerate batch, redrawing ({retries}/{})",
                        self.config.max_degenerate_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
