/*!
# Mean-Field Gaussian Variational Family

`q(z) = prod_i Normal(z_i; mu[i], sigma[i])`, parameterized by a mean vector
`mu` and an unconstrained log-standard-deviation vector `log_sigma`.

Samples are drawn in reparameterized form `z = mu + sigma * eps` with
`eps ~ N(0, I)`, so every draw is a deterministic, differentiable function of
the parameters and the noise. The random source is always supplied by the
caller.

## Example Usage

```rust
use mini_vi::variational::MeanFieldGaussian;
use rand::rngs::SmallRng;
use rand::SeedableRng;

let q = MeanFieldGaussian::new(2).unwrap();
let mut rng = SmallRng::seed_from_u64(42);
let batch = q.sample(16, &mut rng).unwrap();
assert_eq!(batch.z.shape(), &[16, 2]);
let lq = q.log_prob_batch(batch.z.view());
assert_eq!(lq.len(), 16);
```
*/

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::{E, PI};

use crate::error::{VIError, VIResult};

/// Smallest standard deviation used when dividing by `sigma`.
pub const MIN_SIGMA: f64 = 1e-10;

/// Parameters `(mu, log_sigma)` of a mean-field Gaussian, both of length `D`.
#[derive(Debug, Clone, PartialEq)]
pub struct VariationalParameters {
    pub mu: Array1<f64>,
    pub log_sigma: Array1<f64>,
}

impl VariationalParameters {
    /// Creates a parameter pair after checking lengths and finiteness.
    pub fn new(mu: Array1<f64>, log_sigma: Array1<f64>) -> VIResult<Self> {
        if mu.is_empty() {
            return Err(VIError::invalid("variational parameters must be non-empty"));
        }
        if mu.len() != log_sigma.len() {
            return Err(VIError::DimensionMismatch {
                expected: mu.len(),
                found: log_sigma.len(),
            });
        }
        let params = Self { mu, log_sigma };
        if !params.is_finite() {
            return Err(VIError::invalid("variational parameters must be finite"));
        }
        Ok(params)
    }

    /// Standard initialization: `mu = 0`, `log_sigma = 0`.
    pub fn zeros(dim: usize) -> Self {
        Self {
            mu: Array1::zeros(dim),
            log_sigma: Array1::zeros(dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.mu.len()
    }

    pub fn is_finite(&self) -> bool {
        self.mu
            .iter()
            .chain(self.log_sigma.iter())
            .all(|x| x.is_finite())
    }
}

/// A batch of `N` reparameterized draws: row `i` of `z` equals
/// `mu + sigma * eps[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    /// Draws, shape `[N, D]`.
    pub z: Array2<f64>,
    /// Standard-normal noise that produced `z`, shape `[N, D]`.
    pub eps: Array2<f64>,
}

impl SampleBatch {
    pub fn len(&self) -> usize {
        self.z.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.z.nrows() == 0
    }
}

/// Factorized Gaussian approximation.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanFieldGaussian {
    params: VariationalParameters,
}

impl MeanFieldGaussian {
    /// Creates a `dim`-dimensional family at the standard initialization.
    pub fn new(dim: usize) -> VIResult<Self> {
        if dim == 0 {
            return Err(VIError::invalid("dimension must be positive"));
        }
        Ok(Self {
            params: VariationalParameters::zeros(dim),
        })
    }

    /// Creates a family from explicit parameters.
    pub fn from_parameters(params: VariationalParameters) -> VIResult<Self> {
        let params = VariationalParameters::new(params.mu, params.log_sigma)?;
        Ok(Self { params })
    }

    pub fn dim(&self) -> usize {
        self.params.dim()
    }

    pub fn parameters(&self) -> &VariationalParameters {
        &self.params
    }

    /// Replaces the parameters. The new pair must have the same dimension and
    /// finite entries; on error the family is left unchanged.
    pub fn set_parameters(&mut self, params: VariationalParameters) -> VIResult<()> {
        if params.mu.len() != self.dim() {
            return Err(VIError::DimensionMismatch {
                expected: self.dim(),
                found: params.mu.len(),
            });
        }
        self.params = VariationalParameters::new(params.mu, params.log_sigma)?;
        Ok(())
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.params.mu
    }

    /// `sigma = exp(log_sigma)`, clamped below at [`MIN_SIGMA`].
    pub fn std(&self) -> Array1<f64> {
        self.clamped_log_sigma().mapv(f64::exp)
    }

    fn clamped_log_sigma(&self) -> Array1<f64> {
        let floor = MIN_SIGMA.ln();
        self.params.log_sigma.mapv(|s| s.max(floor))
    }

    /// Draws `n` i.i.d. reparameterized samples using `rng`.
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> VIResult<SampleBatch> {
        if n == 0 {
            return Err(VIError::invalid("number of samples must be positive"));
        }
        let eps = Array2::from_shape_fn((n, self.dim()), |_| {
            rng.sample::<f64, _>(StandardNormal)
        });
        let z = &eps * &self.std() + &self.params.mu;
        Ok(SampleBatch { z, eps })
    }

    /// `log q(z)` for a single point.
    pub fn log_prob(&self, z: ArrayView1<f64>) -> f64 {
        let log_sigma = self.clamped_log_sigma();
        let half_ln_2pi = 0.5 * (2.0 * PI).ln();
        z.iter()
            .zip(self.params.mu.iter())
            .zip(log_sigma.iter())
            .map(|((&x, &m), &ls)| {
                let u = (x - m) * (-ls).exp();
                -ls - half_ln_2pi - 0.5 * u * u
            })
            .sum()
    }

    /// `log q(z)` for every row of `zs` (shape `[N, D]`).
    pub fn log_prob_batch(&self, zs: ArrayView2<f64>) -> Array1<f64> {
        let log_sigma = self.clamped_log_sigma();
        let inv_sigma = log_sigma.mapv(|ls| (-ls).exp());
        let u = (&zs - &self.params.mu) * &inv_sigma;
        let norm = -log_sigma.sum() - 0.5 * self.dim() as f64 * (2.0 * PI).ln();
        u.mapv(|x| x * x).sum_axis(Axis(1)).mapv(|sq| norm - 0.5 * sq)
    }

    /// Closed-form entropy `sum(log_sigma) + D/2 * ln(2 * pi * e)`.
    pub fn entropy(&self) -> f64 {
        self.params.log_sigma.sum() + 0.5 * self.dim() as f64 * (2.0 * PI * E).ln()
    }

    /// `d log q(z) / d mu` at `z = mu + sigma * eps`, i.e. `eps / sigma`.
    pub fn score_mu(&self, eps: ArrayView2<f64>) -> Array2<f64> {
        let inv_sigma = self.clamped_log_sigma().mapv(|ls| (-ls).exp());
        &eps * &inv_sigma
    }

    /// `d log q(z) / d log_sigma` at `z = mu + sigma * eps`, i.e. `eps^2 - 1`.
    pub fn score_log_sigma(&self, eps: ArrayView2<f64>) -> Array2<f64> {
        eps.mapv(|e| e * e - 1.0)
    }
}
