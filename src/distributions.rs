/*!
Target densities for variational inference.

A target is anything that maps a real vector `z` of a fixed dimension `D` to an
unnormalized log-density `log p(z)`. Targets that can also report
`grad_z log p(z)` advertise it through [`Target::is_differentiable`], which
unlocks the reparameterization-gradient estimator.

This module provides the [`Target`] trait together with:

- [`Gaussian`]: a multivariate Gaussian with full covariance (analytic gradient).
- [`IsotropicGaussian`]: a Gaussian with a shared scalar standard deviation.
- [`FnTarget`]: wraps a plain closure; no gradient.

# Examples

```rust
use mini_vi::distributions::{Gaussian, Target};
use ndarray::{arr1, arr2};

let target = Gaussian::new(arr1(&[1.0, 1.0]), arr2(&[[1.0, 0.1], [0.1, 1.0]])).unwrap();
assert_eq!(target.dim(), 2);
let lp = target.unnorm_log_prob(arr1(&[1.0, 1.0]).view());
assert!(lp.is_finite());
```
*/

use nalgebra as na;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::f64::consts::PI;

use crate::error::{VIError, VIResult};

/// A log-density over `R^D` that the inference loop can fit.
pub trait Target {
    /// Returns the dimension `D` of the support.
    fn dim(&self) -> usize;

    /// Returns the unnormalized log-density at `z`.
    fn unnorm_log_prob(&self, z: ArrayView1<f64>) -> f64;

    /// Evaluates the log-density for every row of `zs` (shape `[N, D]`).
    fn unnorm_log_prob_batch(&self, zs: ArrayView2<f64>) -> Array1<f64> {
        zs.outer_iter().map(|z| self.unnorm_log_prob(z)).collect()
    }

    /// Whether [`Target::unnorm_log_prob_grad_batch`] returns gradients.
    fn is_differentiable(&self) -> bool {
        false
    }

    /// Returns the log-densities (shape `[N]`) and their gradients w.r.t. `z`
    /// (shape `[N, D]`), or `None` if the target is not differentiable.
    fn unnorm_log_prob_grad_batch(
        &self,
        _zs: ArrayView2<f64>,
    ) -> Option<(Array1<f64>, Array2<f64>)> {
        None
    }
}

impl<T: Target + ?Sized> Target for &T {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn unnorm_log_prob(&self, z: ArrayView1<f64>) -> f64 {
        (**self).unnorm_log_prob(z)
    }

    fn unnorm_log_prob_batch(&self, zs: ArrayView2<f64>) -> Array1<f64> {
        (**self).unnorm_log_prob_batch(zs)
    }

    fn is_differentiable(&self) -> bool {
        (**self).is_differentiable()
    }

    fn unnorm_log_prob_grad_batch(
        &self,
        zs: ArrayView2<f64>,
    ) -> Option<(Array1<f64>, Array2<f64>)> {
        (**self).unnorm_log_prob_grad_batch(zs)
    }
}

/**
A multivariate Gaussian `N(mean, cov)` with full covariance.

The precision matrix and the log-normalizer are computed once, from a Cholesky
factorization, when the distribution is constructed. The returned log-density
is normalized.

# Examples

```rust
use mini_vi::distributions::{Gaussian, Target};
use ndarray::{arr1, arr2};

let gauss = Gaussian::new(arr1(&[0.0, 0.0]), arr2(&[[1.0, 0.0], [0.0, 1.0]])).unwrap();
let lp = gauss.unnorm_log_prob(arr1(&[0.0, 0.0]).view());
assert!((lp + (2.0 * std::f64::consts::PI).ln()).abs() < 1e-12);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct Gaussian {
    pub mean: Array1<f64>,
    pub cov: Array2<f64>,
    precision: Array2<f64>,
    log_norm: f64,
}

impl Gaussian {
    /// Creates a Gaussian target. Fails if `cov` is not a symmetric positive
    /// definite `D x D` matrix matching `mean`.
    pub fn new(mean: Array1<f64>, cov: Array2<f64>) -> VIResult<Self> {
        let d = mean.len();
        if d == 0 {
            return Err(VIError::invalid("Gaussian mean must be non-empty"));
        }
        if cov.nrows() != d || cov.ncols() != d {
            return Err(VIError::DimensionMismatch {
                expected: d,
                found: if cov.nrows() != d {
                    cov.nrows()
                } else {
                    cov.ncols()
                },
            });
        }
        if mean.iter().chain(cov.iter()).any(|x| !x.is_finite()) {
            return Err(VIError::invalid("Gaussian parameters must be finite"));
        }
        for i in 0..d {
            for j in 0..i {
                let (a, b) = (cov[[i, j]], cov[[j, i]]);
                if (a - b).abs() > 1e-12 * (1.0 + a.abs().max(b.abs())) {
                    return Err(VIError::invalid("covariance must be symmetric"));
                }
            }
        }

        let cov_na = na::DMatrix::from_fn(d, d, |i, j| cov[[i, j]]);
        let chol = na::Cholesky::new(cov_na)
            .ok_or_else(|| VIError::invalid("covariance must be positive definite"))?;
        let log_det = 2.0 * chol.l().diagonal().iter().map(|x| x.ln()).sum::<f64>();
        let inv = chol.inverse();
        let precision = Array2::from_shape_fn((d, d), |(i, j)| inv[(i, j)]);
        let log_norm = -0.5 * (d as f64 * (2.0 * PI).ln() + log_det);

        Ok(Self {
            mean,
            cov,
            precision,
            log_norm,
        })
    }

    /// Inverse covariance matrix.
    pub fn precision(&self) -> &Array2<f64> {
        &self.precision
    }
}

impl Target for Gaussian {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn unnorm_log_prob(&self, z: ArrayView1<f64>) -> f64 {
        let diff = &z - &self.mean;
        let quad = diff.dot(&self.precision.dot(&diff));
        self.log_norm - 0.5 * quad
    }

    fn unnorm_log_prob_batch(&self, zs: ArrayView2<f64>) -> Array1<f64> {
        let diffs = &zs - &self.mean;
        let quad = (diffs.dot(&self.precision) * &diffs).sum_axis(Axis(1));
        quad.mapv(|q| self.log_norm - 0.5 * q)
    }

    fn is_differentiable(&self) -> bool {
        true
    }

    fn unnorm_log_prob_grad_batch(
        &self,
        zs: ArrayView2<f64>,
    ) -> Option<(Array1<f64>, Array2<f64>)> {
        let diffs = &zs - &self.mean;
        // The precision matrix is symmetric, so diffs * P is the row-wise P * diff.
        let scaled = diffs.dot(&self.precision);
        let quad = (&scaled * &diffs).sum_axis(Axis(1));
        let logp = quad.mapv(|q| self.log_norm - 0.5 * q);
        Some((logp, -scaled))
    }
}

/**
An isotropic Gaussian `N(mean, std^2 I)`.

# Examples

```rust
use mini_vi::distributions::{IsotropicGaussian, Target};
use ndarray::arr1;

let target = IsotropicGaussian::new(arr1(&[0.0, 0.0, 0.0]), 2.0).unwrap();
assert_eq!(target.dim(), 3);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct IsotropicGaussian {
    pub mean: Array1<f64>,
    pub std: f64,
}

impl IsotropicGaussian {
    pub fn new(mean: Array1<f64>, std: f64) -> VIResult<Self> {
        if mean.is_empty() {
            return Err(VIError::invalid("IsotropicGaussian mean must be non-empty"));
        }
        if !(std.is_finite() && std > 0.0) {
            return Err(VIError::invalid(format!(
                "IsotropicGaussian std must be positive and finite, got {std}"
            )));
        }
        Ok(Self { mean, std })
    }

    fn log_norm(&self) -> f64 {
        let d = self.mean.len() as f64;
        -d * self.std.ln() - 0.5 * d * (2.0 * PI).ln()
    }
}

impl Target for IsotropicGaussian {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn unnorm_log_prob(&self, z: ArrayView1<f64>) -> f64 {
        let var = self.std * self.std;
        let sq: f64 = z
            .iter()
            .zip(self.mean.iter())
            .map(|(x, m)| (x - m) * (x - m))
            .sum();
        self.log_norm() - 0.5 * sq / var
    }

    fn is_differentiable(&self) -> bool {
        true
    }

    fn unnorm_log_prob_grad_batch(
        &self,
        zs: ArrayView2<f64>,
    ) -> Option<(Array1<f64>, Array2<f64>)> {
        let var = self.std * self.std;
        let diffs = &zs - &self.mean;
        let log_norm = self.log_norm();
        let logp = diffs
            .mapv(|x| x * x)
            .sum_axis(Axis(1))
            .mapv(|sq| log_norm - 0.5 * sq / var);
        Some((logp, diffs / -var))
    }
}

/// Wraps a closure as a non-differentiable target. Use it for black-box
/// log-densities fitted with the score-function estimator.
///
/// ```rust
/// use mini_vi::distributions::{FnTarget, Target};
/// use ndarray::arr1;
///
/// let target = FnTarget::new(1, |z: ndarray::ArrayView1<f64>| -0.5 * z[0] * z[0]);
/// assert_eq!(target.unnorm_log_prob(arr1(&[2.0]).view()), -2.0);
/// ```
#[derive(Clone)]
pub struct FnTarget<F> {
    dim: usize,
    f: F,
}

impl<F> FnTarget<F>
where
    F: Fn(ArrayView1<f64>) -> f64,
{
    pub fn new(dim: usize, f: F) -> Self {
        Self { dim, f }
    }
}

impl<F> Target for FnTarget<F>
where
    F: Fn(ArrayView1<f64>) -> f64,
{
    fn dim(&self) -> usize {
        self.dim
    }

    fn unnorm_log_prob(&self, z: ArrayView1<f64>) -> f64 {
        (self.f)(z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    fn example_target() -> Gaussian {
        Gaussian::new(arr1(&[1.0, 1.0]), arr2(&[[1.0, 0.1], [0.1, 1.0]])).unwrap()
    }

    #[test]
    fn gauss_log_prob_matches_closed_form() {
        let target = example_target();
        let z = arr1(&[0.5, -0.5]);
        // Inverse of [[1, 0.1], [0.1, 1]] is [[1, -0.1], [-0.1, 1]] / 0.99.
        let (dx, dy) = (z[0] - 1.0, z[1] - 1.0);
        let quad = (dx * dx - 0.2 * dx * dy + dy * dy) / 0.99;
        let expected = -(2.0 * PI).ln() - 0.5 * 0.99_f64.ln() - 0.5 * quad;
        assert_abs_diff_eq!(target.unnorm_log_prob(z.view()), expected, epsilon = 1e-12);
    }

    #[test]
    fn gauss_batch_agrees_with_single() {
        let target = example_target();
        let zs = arr2(&[[0.0, 0.0], [1.0, 2.0], [-3.0, 0.5]]);
        let batch = target.unnorm_log_prob_batch(zs.view());
        for (i, row) in zs.outer_iter().enumerate() {
            assert_abs_diff_eq!(batch[i], target.unnorm_log_prob(row), epsilon = 1e-12);
        }
    }

    #[test]
    fn gauss_gradient_matches_finite_difference() {
        let target = example_target();
        let zs = arr2(&[[0.3, -1.2], [2.0, 0.7]]);
        let (logp, grad) = target.unnorm_log_prob_grad_batch(zs.view()).unwrap();
        let h = 1e-6;
        for (i, row) in zs.outer_iter().enumerate() {
            assert_abs_diff_eq!(logp[i], target.unnorm_log_prob(row), epsilon = 1e-12);
            for j in 0..2 {
                let mut plus = row.to_owned();
                let mut minus = row.to_owned();
                plus[j] += h;
                minus[j] -= h;
                let fd = (target.unnorm_log_prob(plus.view())
                    - target.unnorm_log_prob(minus.view()))
                    / (2.0 * h);
                assert_abs_diff_eq!(grad[[i, j]], fd, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn gauss_rejects_bad_covariance() {
        let not_pd = Gaussian::new(arr1(&[0.0, 0.0]), arr2(&[[1.0, 2.0], [2.0, 1.0]]));
        assert!(matches!(not_pd, Err(VIError::InvalidArgument { .. })));

        let asymmetric = Gaussian::new(arr1(&[0.0, 0.0]), arr2(&[[1.0, 0.5], [0.0, 1.0]]));
        assert!(matches!(asymmetric, Err(VIError::InvalidArgument { .. })));

        let wrong_shape = Gaussian::new(arr1(&[0.0, 0.0, 0.0]), arr2(&[[1.0, 0.0], [0.0, 1.0]]));
        assert!(matches!(
            wrong_shape,
            Err(VIError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn iso_gauss_matches_diagonal_gaussian() {
        let iso = IsotropicGaussian::new(arr1(&[0.5, -1.0, 2.0]), 3.0).unwrap();
        let full = Gaussian::new(arr1(&[0.5, -1.0, 2.0]), Array2::eye(3) * 9.0).unwrap();
        let zs = arr2(&[[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]]);
        let (lp_iso, g_iso) = iso.unnorm_log_prob_grad_batch(zs.view()).unwrap();
        let (lp_full, g_full) = full.unnorm_log_prob_grad_batch(zs.view()).unwrap();
        assert_abs_diff_eq!(lp_iso, lp_full, epsilon = 1e-10);
        assert_abs_diff_eq!(g_iso, g_full, epsilon = 1e-10);
        assert_abs_diff_eq!(
            iso.unnorm_log_prob_batch(zs.view()),
            lp_full,
            epsilon = 1e-10
        );
    }

    #[test]
    fn fn_target_has_no_gradient() {
        let target = FnTarget::new(2, |z: ArrayView1<f64>| -z.dot(&z));
        assert!(!target.is_differentiable());
        assert!(target
            .unnorm_log_prob_grad_batch(arr2(&[[1.0, 1.0]]).view())
            .is_none());
        assert_eq!(
            target.unnorm_log_prob_batch(arr2(&[[1.0, 1.0], [0.0, 2.0]]).view()),
            arr1(&[-2.0, -4.0])
        );
    }
}
