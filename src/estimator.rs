//! Monte Carlo estimators of the ELBO gradient for a mean-field Gaussian.
//!
//! For each draw `z_i = mu + sigma * eps_i` the per-sample objective is
//! `r_i = log p(z_i) - log q(z_i)`. Two estimators are provided:
//!
//! - **Reparameterization**: differentiates `r_i` through `z_i`. Needs
//!   `grad_z log p(z)` from the target.
//!   `grad_mu = mean(g_i)`, `grad_log_sigma = mean(g_i * sigma * eps_i) + 1`.
//! - **Score function** (REINFORCE): `mean((r_i - b) * grad log q(z_i))`,
//!   with an optional baseline `b` acting as a control variate. Works for
//!   black-box targets.
//!
//! Samples whose term (or gradient) is not finite are dropped from the
//! average. A batch in which every sample is dropped is reported as
//! [`VIError::DegenerateGradient`].

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_stats::QuantileExt;
use rayon::prelude::*;

use crate::distributions::Target;
use crate::error::{VIError, VIResult};
use crate::variational::{MeanFieldGaussian, SampleBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorMode {
    /// Pathwise gradient through `z = mu + sigma * eps`.
    Reparameterization,
    /// Score-function gradient; the target is treated as a black box.
    ScoreFunction,
}

/// Control variate subtracted from the score-function weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Baseline {
    None,
    /// Exponential moving average of previous batch means, weighted by `decay`.
    RunningMean { decay: f64 },
}

/// Gradient of the ELBO w.r.t. `(mu, log_sigma)` for one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientEstimate {
    pub mu: Array1<f64>,
    pub log_sigma: Array1<f64>,
    /// Mean of the finite per-sample objective terms (the ELBO estimate).
    pub objective: f64,
    /// Samples that entered the average.
    pub n_used: usize,
    /// Samples dropped because of non-finite terms.
    pub n_excluded: usize,
}

impl GradientEstimate {
    /// Joint L2 norm over both parameter groups. Components are scaled by the
    /// largest magnitude before squaring, so finite gradients give a finite norm.
    pub fn norm(&self) -> f64 {
        let scale = self.max_abs();
        if scale == 0.0 || !scale.is_finite() {
            return scale;
        }
        let sq: f64 = self
            .mu
            .iter()
            .chain(self.log_sigma.iter())
            .map(|x| (x / scale) * (x / scale))
            .sum();
        scale * sq.sqrt()
    }

    /// Largest absolute component, ignoring NaNs.
    pub fn max_abs(&self) -> f64 {
        let mu = *self.mu.mapv(f64::abs).max_skipnan();
        let log_sigma = *self.log_sigma.mapv(f64::abs).max_skipnan();
        mu.max(log_sigma)
    }

    pub fn is_finite(&self) -> bool {
        self.mu
            .iter()
            .chain(self.log_sigma.iter())
            .all(|x| x.is_finite())
    }

    /// Multiplies both parameter groups by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.mu.mapv_inplace(|x| x * factor);
        self.log_sigma.mapv_inplace(|x| x * factor);
    }
}

/// Stateful gradient estimator. The only state is the running baseline,
/// cleared by [`GradientEstimator::reset`].
#[derive(Debug, Clone, PartialEq)]
pub struct GradientEstimator {
    mode: EstimatorMode,
    baseline: Baseline,
    analytic_entropy: bool,
    parallel: bool,
    running_baseline: Option<f64>,
}

impl GradientEstimator {
    pub fn new(mode: EstimatorMode) -> Self {
        Self {
            mode,
            baseline: Baseline::None,
            analytic_entropy: false,
            parallel: false,
            running_baseline: None,
        }
    }

    pub fn with_baseline(mut self, baseline: Baseline) -> Self {
        self.baseline = baseline;
        self
    }

    /// Replaces `-log q(z_i)` with the closed-form entropy `H[q]`.
    pub fn with_analytic_entropy(mut self, analytic_entropy: bool) -> Self {
        self.analytic_entropy = analytic_entropy;
        self
    }

    /// Evaluates the target on row chunks of the batch across rayon workers.
    pub fn set_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn mode(&self) -> EstimatorMode {
        self.mode
    }

    pub fn reset(&mut self) {
        self.running_baseline = None;
    }

    /// Estimates the ELBO gradient from `batch`, which must have been drawn
    /// from `family`.
    pub fn estimate<T>(
        &mut self,
        family: &MeanFieldGaussian,
        target: &T,
        batch: &SampleBatch,
    ) -> VIResult<GradientEstimate>
    where
        T: Target + Sync,
    {
        let dim = family.dim();
        if target.dim() != dim {
            return Err(VIError::DimensionMismatch {
                expected: dim,
                found: target.dim(),
            });
        }
        if batch.z.ncols() != dim || batch.eps.shape() != batch.z.shape() {
            return Err(VIError::DimensionMismatch {
                expected: dim,
                found: batch.z.ncols(),
            });
        }
        if batch.is_empty() {
            return Err(VIError::invalid("sample batch must be non-empty"));
        }

        match self.mode {
            EstimatorMode::Reparameterization => self.reparameterized(family, target, batch),
            EstimatorMode::ScoreFunction => self.score_function(family, target, batch),
        }
    }

    fn reparameterized<T>(
        &mut self,
        family: &MeanFieldGaussian,
        target: &T,
        batch: &SampleBatch,
    ) -> VIResult<GradientEstimate>
    where
        T: Target + Sync,
    {
        let (log_p, grad_p) = eval_log_prob_grad(target, batch.z.view(), self.parallel)?
            .ok_or_else(|| {
                VIError::invalid("reparameterization gradients require a differentiable target")
            })?;
        let terms = self.objective_terms(family, &log_p, batch);
        let sigma = family.std();
        let dim = family.dim();

        let mut g_mu = Array1::<f64>::zeros(dim);
        let mut g_log_sigma = Array1::<f64>::zeros(dim);
        let mut sum_terms = 0.0;
        let mut n_used = 0;
        for (i, (&term, g)) in terms.iter().zip(grad_p.outer_iter()).enumerate() {
            if !term.is_finite() || g.iter().any(|x| !x.is_finite()) {
                continue;
            }
            g_mu += &g;
            g_log_sigma += &(&g * &batch.eps.row(i) * &sigma);
            sum_terms += term;
            n_used += 1;
        }

        let n_excluded = batch.len() - n_used;
        if n_used == 0 {
            return Err(VIError::DegenerateGradient {
                excluded: n_excluded,
            });
        }
        let n = n_used as f64;
        g_mu /= n;
        // d(-log q)/d log_sigma along the reparameterized path is exactly 1.
        g_log_sigma = g_log_sigma / n + 1.0;

        Ok(GradientEstimate {
            mu: g_mu,
            log_sigma: g_log_sigma,
            objective: sum_terms / n,
            n_used,
            n_excluded,
        })
    }

    fn score_function<T>(
        &mut self,
        family: &MeanFieldGaussian,
        target: &T,
        batch: &SampleBatch,
    ) -> VIResult<GradientEstimate>
    where
        T: Target + Sync,
    {
        let log_p = eval_log_prob(target, batch.z.view(), self.parallel);
        let terms = self.objective_terms(family, &log_p, batch);
        // With the analytic entropy the entropy part is handled in closed form
        // and only log p carries the score weight.
        let base = if self.analytic_entropy {
            log_p
        } else {
            terms.clone()
        };

        let valid: Vec<bool> = terms
            .iter()
            .zip(base.iter())
            .map(|(t, b)| t.is_finite() && b.is_finite())
            .collect();
        let n_used = valid.iter().filter(|&&v| v).count();
        let n_excluded = batch.len() - n_used;
        if n_used == 0 {
            return Err(VIError::DegenerateGradient {
                excluded: n_excluded,
            });
        }
        let n = n_used as f64;

        let base_mean = masked_mean(&base, &valid);
        let b = match self.baseline {
            Baseline::None => 0.0,
            Baseline::RunningMean { .. } => self.running_baseline.unwrap_or(base_mean),
        };
        let weights: Array1<f64> = base
            .iter()
            .zip(valid.iter())
            .map(|(&x, &v)| if v { x - b } else { 0.0 })
            .collect();

        let score_mu = family.score_mu(batch.eps.view());
        let score_log_sigma = family.score_log_sigma(batch.eps.view());
        let g_mu = weights.dot(&score_mu) / n;
        let mut g_log_sigma = weights.dot(&score_log_sigma) / n;
        if self.analytic_entropy {
            g_log_sigma += 1.0;
        }

        if let Baseline::RunningMean { decay } = self.baseline {
            self.running_baseline = Some(match self.running_baseline {
                Some(prev) => decay * prev + (1.0 - decay) * base_mean,
                None => base_mean,
            });
        }

        Ok(GradientEstimate {
            mu: g_mu,
            log_sigma: g_log_sigma,
            objective: masked_mean(&terms, &valid),
            n_used,
            n_excluded,
        })
    }

    /// Per-sample ELBO terms: `log p - log q`, or `log p + H[q]`.
    fn objective_terms(
        &self,
        family: &MeanFieldGaussian,
        log_p: &Array1<f64>,
        batch: &SampleBatch,
    ) -> Array1<f64> {
        if self.analytic_entropy {
            log_p + family.entropy()
        } else {
            log_p - &family.log_prob_batch(batch.z.view())
        }
    }
}

fn masked_mean(values: &Array1<f64>, valid: &[bool]) -> f64 {
    let (sum, count) = values
        .iter()
        .zip(valid)
        .filter(|&(_, &v)| v)
        .fold((0.0, 0usize), |(s, c), (&x, _)| (s + x, c + 1));
    sum / count as f64
}

fn chunk_rows(n_rows: usize) -> usize {
    n_rows.div_ceil(rayon::current_num_threads()).max(1)
}

/// Evaluates `log p` on all rows, optionally splitting the batch into row
/// chunks that are evaluated on the rayon pool. Chunk results are
/// concatenated in order.
pub(crate) fn eval_log_prob<T>(target: &T, zs: ArrayView2<f64>, parallel: bool) -> Array1<f64>
where
    T: Target + Sync,
{
    if !parallel || zs.nrows() < 2 {
        return target.unnorm_log_prob_batch(zs);
    }
    let chunks: Vec<ArrayView2<f64>> = zs
        .axis_chunks_iter(Axis(0), chunk_rows(zs.nrows()))
        .collect();
    let parts: Vec<Array1<f64>> = chunks
        .into_par_iter()
        .map(|chunk| target.unnorm_log_prob_batch(chunk))
        .collect();
    parts.into_iter().flatten().collect()
}

/// Gradient counterpart of [`eval_log_prob`]. Returns `Ok(None)` when the
/// target does not provide gradients.
pub(crate) fn eval_log_prob_grad<T>(
    target: &T,
    zs: ArrayView2<f64>,
    parallel: bool,
) -> VIResult<Option<(Array1<f64>, Array2<f64>)>>
where
    T: Target + Sync,
{
    if !target.is_differentiable() {
        return Ok(None);
    }
    if !parallel || zs.nrows() < 2 {
        return Ok(target.unnorm_log_prob_grad_batch(zs));
    }
    let chunks: Vec<ArrayView2<f64>> = zs
        .axis_chunks_iter(Axis(0), chunk_rows(zs.nrows()))
        .collect();
    let parts: Option<Vec<(Array1<f64>, Array2<f64>)>> = chunks
        .into_par_iter()
        .map(|chunk| target.unnorm_log_prob_grad_batch(chunk))
        .collect();
    let Some(parts) = parts else {
        return Ok(None);
    };
    let log_p: Array1<f64> = parts.iter().flat_map(|(lp, _)| lp.iter().copied()).collect();
    let grads: Vec<ArrayView2<f64>> = parts.iter().map(|(_, g)| g.view()).collect();
    let grad = ndarray::concatenate(Axis(0), &grads)
        .map_err(|e| VIError::invalid(format!("inconsistent gradient chunk shapes: {e}")))?;
    Ok(Some((log_p, grad)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{FnTarget, Gaussian, IsotropicGaussian};
    use crate::variational::VariationalParameters;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, ArrayView1};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn example_target() -> Gaussian {
        Gaussian::new(arr1(&[1.0, 1.0]), arr2(&[[1.0, 0.1], [0.1, 1.0]])).unwrap()
    }

    /// Exact ELBO gradient for q = N(m, diag(s^2)) against p = N(mu, Sigma):
    /// d/dm = -P (m - mu), d/dlog_s = 1 - diag(P) * s^2.
    fn exact_gradient(target: &Gaussian, q: &MeanFieldGaussian) -> (Array1<f64>, Array1<f64>) {
        let p = target.precision();
        let diff = q.mean() - &target.mean;
        let g_mu = -p.dot(&diff);
        let s2 = q.std().mapv(|s| s * s);
        let g_ls = 1.0 - &(p.diag().to_owned() * &s2);
        (g_mu, g_ls)
    }

    fn averaged_estimate(
        estimator: &mut GradientEstimator,
        q: &MeanFieldGaussian,
    ) -> GradientEstimate {
        let target = example_target();
        let mut rng = SmallRng::seed_from_u64(42);
        let batch = q.sample(200_000, &mut rng).unwrap();
        estimator.estimate(q, &target, &batch).unwrap()
    }

    fn offset_family() -> MeanFieldGaussian {
        MeanFieldGaussian::from_parameters(
            VariationalParameters::new(arr1(&[0.0, 2.0]), arr1(&[-0.5, 0.3])).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_reparam_matches_exact_gradient() {
        let q = offset_family();
        let mut est = GradientEstimator::new(EstimatorMode::Reparameterization);
        let g = averaged_estimate(&mut est, &q);
        let (g_mu, g_ls) = exact_gradient(&example_target(), &q);
        assert_abs_diff_eq!(g.mu, g_mu, epsilon = 0.02);
        assert_abs_diff_eq!(g.log_sigma, g_ls, epsilon = 0.02);
        assert_eq!(g.n_used, 200_000);
        assert_eq!(g.n_excluded, 0);
    }

    #[test]
    fn test_score_function_matches_exact_gradient() {
        let q = offset_family();
        let mut est = GradientEstimator::new(EstimatorMode::ScoreFunction);
        let g = averaged_estimate(&mut est, &q);
        let (g_mu, g_ls) = exact_gradient(&example_target(), &q);
        assert_abs_diff_eq!(g.mu, g_mu, epsilon = 0.1);
        assert_abs_diff_eq!(g.log_sigma, g_ls, epsilon = 0.1);
    }

    #[test]
    fn test_score_function_with_entropy_and_baseline() {
        let q = offset_family();
        let mut est = GradientEstimator::new(EstimatorMode::ScoreFunction)
            .with_baseline(Baseline::RunningMean { decay: 0.9 })
            .with_analytic_entropy(true);
        let g = averaged_estimate(&mut est, &q);
        let (g_mu, g_ls) = exact_gradient(&example_target(), &q);
        assert_abs_diff_eq!(g.mu, g_mu, epsilon = 0.1);
        assert_abs_diff_eq!(g.log_sigma, g_ls, epsilon = 0.1);
        assert!(est.running_baseline.is_some());
        est.reset();
        assert!(est.running_baseline.is_none());
    }

    #[test]
    fn test_objective_is_mean_of_terms() {
        let target = IsotropicGaussian::new(arr1(&[0.0, 0.0]), 1.0).unwrap();
        let q = MeanFieldGaussian::new(2).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        let batch = q.sample(5, &mut rng).unwrap();
        let mut est = GradientEstimator::new(EstimatorMode::Reparameterization);
        let g = est.estimate(&q, &target, &batch).unwrap();
        // q equals the target, so every term log p - log q vanishes.
        assert_abs_diff_eq!(g.objective, 0.0, epsilon = 1e-12);
        // grad log p(z) = -z and z = eps, so the mu-gradient is -mean(eps).
        assert_abs_diff_eq!(g.mu, -batch.eps.mean_axis(Axis(0)).unwrap(), epsilon = 1e-12);
    }

    #[test]
    fn test_non_finite_samples_are_excluded() {
        // Negative half-line is outside the support.
        let target = FnTarget::new(1, |z: ArrayView1<f64>| {
            if z[0] < 0.0 {
                f64::NEG_INFINITY
            } else {
                -0.5 * z[0] * z[0]
            }
        });
        let q = MeanFieldGaussian::new(1).unwrap();
        let mut rng = SmallRng::seed_from_u64(5);
        let batch = q.sample(64, &mut rng).unwrap();
        let negatives = batch.z.iter().filter(|&&x| x < 0.0).count();
        let mut est = GradientEstimator::new(EstimatorMode::ScoreFunction);
        let g = est.estimate(&q, &target, &batch).unwrap();
        assert_eq!(g.n_excluded, negatives);
        assert_eq!(g.n_used, 64 - negatives);
        assert!(g.is_finite());
        assert!(g.objective.is_finite());
    }

    #[test]
    fn test_all_excluded_is_degenerate() {
        let target = FnTarget::new(2, |_: ArrayView1<f64>| f64::NEG_INFINITY);
        let q = MeanFieldGaussian::new(2).unwrap();
        let mut rng = SmallRng::seed_from_u64(5);
        let batch = q.sample(8, &mut rng).unwrap();
        let mut est = GradientEstimator::new(EstimatorMode::ScoreFunction);
        assert_eq!(
            est.estimate(&q, &target, &batch),
            Err(VIError::DegenerateGradient { excluded: 8 })
        );
    }

    #[test]
    fn test_reparam_requires_gradient() {
        let target = FnTarget::new(2, |z: ArrayView1<f64>| -z.dot(&z));
        let q = MeanFieldGaussian::new(2).unwrap();
        let mut rng = SmallRng::seed_from_u64(5);
        let batch = q.sample(4, &mut rng).unwrap();
        let mut est = GradientEstimator::new(EstimatorMode::Reparameterization);
        let err = est.estimate(&q, &target, &batch).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_dimension_mismatch() {
        let target = example_target();
        let q = MeanFieldGaussian::new(3).unwrap();
        let mut rng = SmallRng::seed_from_u64(5);
        let batch = q.sample(4, &mut rng).unwrap();
        let mut est = GradientEstimator::new(EstimatorMode::Reparameterization);
        assert_eq!(
            est.estimate(&q, &target, &batch),
            Err(VIError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        );
    }

    #[test]
    fn test_parallel_evaluation_is_identical() {
        let target = example_target();
        let q = offset_family();
        let mut rng = SmallRng::seed_from_u64(11);
        let batch = q.sample(1_001, &mut rng).unwrap();
        for mode in [EstimatorMode::Reparameterization, EstimatorMode::ScoreFunction] {
            let mut seq = GradientEstimator::new(mode);
            let mut par = GradientEstimator::new(mode).set_parallel(true);
            let a = seq.estimate(&q, &target, &batch).unwrap();
            let b = par.estimate(&q, &target, &batch).unwrap();
            assert_eq!((a.n_used, a.n_excluded), (b.n_used, b.n_excluded));
            assert_abs_diff_eq!(a.mu, b.mu, epsilon = 1e-12);
            assert_abs_diff_eq!(a.log_sigma, b.log_sigma, epsilon = 1e-12);
            assert_abs_diff_eq!(a.objective, b.objective, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_norm_scale_and_max_abs() {
        let mut g = GradientEstimate {
            mu: arr1(&[3.0, 0.0]),
            log_sigma: arr1(&[0.0, -4.0]),
            objective: 0.0,
            n_used: 1,
            n_excluded: 0,
        };
        assert_abs_diff_eq!(g.norm(), 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g.max_abs(), 4.0, epsilon = 1e-12);
        g.scale(0.5);
        assert_abs_diff_eq!(g.norm(), 2.5, epsilon = 1e-12);

        let huge = GradientEstimate {
            mu: arr1(&[3e200, 0.0]),
            log_sigma: arr1(&[0.0, -4e200]),
            objective: 0.0,
            n_used: 1,
            n_excluded: 0,
        };
        assert_abs_diff_eq!(huge.norm() / 5e200, 1.0, epsilon = 1e-12);
    }
}
