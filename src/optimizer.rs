//! Gradient-ascent updates for the variational parameters.
//!
//! An [`Optimizer`] combines a step-size schedule ([`LearningRate`]), an
//! update rule ([`UpdateRule`]) and joint L2 gradient-norm clipping. The only
//! hidden state is the moment buffers used by `Momentum` and `Adam`.

use ndarray::Array1;

use crate::error::{VIError, VIResult};
use crate::estimator::GradientEstimate;
use crate::variational::VariationalParameters;

/// Step-size schedule indexed by the zero-based iteration `t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningRate {
    Constant(f64),
    /// `lr0 / (1 + decay * t)`.
    InverseDecay { lr0: f64, decay: f64 },
}

impl LearningRate {
    pub fn rate(&self, t: usize) -> f64 {
        match *self {
            LearningRate::Constant(lr) => lr,
            LearningRate::InverseDecay { lr0, decay } => lr0 / (1.0 + decay * t as f64),
        }
    }

    pub fn validate(&self) -> VIResult<()> {
        let (lr, decay) = match *self {
            LearningRate::Constant(lr) => (lr, 0.0),
            LearningRate::InverseDecay { lr0, decay } => (lr0, decay),
        };
        if !(lr.is_finite() && lr > 0.0) {
            return Err(VIError::invalid(format!(
                "learning rate must be positive and finite, got {lr}"
            )));
        }
        if !(decay.is_finite() && decay >= 0.0) {
            return Err(VIError::invalid(format!(
                "learning-rate decay must be non-negative and finite, got {decay}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateRule {
    /// Plain stochastic gradient ascent.
    Sgd,
    /// Heavy-ball momentum: `v = beta * v + g`, step along `v`.
    Momentum { beta: f64 },
    /// Adam with bias-corrected first and second moments.
    Adam {
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    },
}

impl UpdateRule {
    pub fn adam() -> Self {
        UpdateRule::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    pub fn validate(&self) -> VIResult<()> {
        let unit = |name: &str, x: f64| {
            if (0.0..1.0).contains(&x) {
                Ok(())
            } else {
                Err(VIError::invalid(format!("{name} must lie in [0, 1), got {x}")))
            }
        };
        match *self {
            UpdateRule::Sgd => Ok(()),
            UpdateRule::Momentum { beta } => unit("momentum beta", beta),
            UpdateRule::Adam {
                beta1,
                beta2,
                epsilon,
            } => {
                unit("adam beta1", beta1)?;
                unit("adam beta2", beta2)?;
                if epsilon.is_finite() && epsilon > 0.0 {
                    Ok(())
                } else {
                    Err(VIError::invalid(format!(
                        "adam epsilon must be positive, got {epsilon}"
                    )))
                }
            }
        }
    }
}

/// One moment buffer per parameter group.
#[derive(Debug, Clone, PartialEq)]
struct Moments {
    mu: Array1<f64>,
    log_sigma: Array1<f64>,
}

impl Moments {
    fn zeros(dim: usize) -> Self {
        Self {
            mu: Array1::zeros(dim),
            log_sigma: Array1::zeros(dim),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Optimizer {
    schedule: LearningRate,
    rule: UpdateRule,
    gradient_clip: f64,
    first: Option<Moments>,
    second: Option<Moments>,
}

impl Optimizer {
    /// Creates an SGD optimizer without clipping.
    pub fn new(schedule: LearningRate) -> Self {
        Self {
            schedule,
            rule: UpdateRule::Sgd,
            gradient_clip: f64::INFINITY,
            first: None,
            second: None,
        }
    }

    pub fn with_rule(mut self, rule: UpdateRule) -> Self {
        self.rule = rule;
        self.reset();
        self
    }

    /// Maximum joint L2 norm of the gradient. `f64::INFINITY` disables clipping.
    pub fn with_gradient_clip(mut self, gradient_clip: f64) -> Self {
        self.gradient_clip = gradient_clip;
        self
    }

    pub fn schedule(&self) -> LearningRate {
        self.schedule
    }

    pub fn rule(&self) -> UpdateRule {
        self.rule
    }

    /// Clears the moment buffers.
    pub fn reset(&mut self) {
        self.first = None;
        self.second = None;
    }

    /// Returns the parameters after one ascent step along `gradient` at
    /// iteration `t`. The input parameters are not modified.
    pub fn step(
        &mut self,
        params: &VariationalParameters,
        gradient: &GradientEstimate,
        t: usize,
    ) -> VIResult<VariationalParameters> {
        let dim = params.dim();
        for found in [gradient.mu.len(), gradient.log_sigma.len()] {
            if found != dim {
                return Err(VIError::DimensionMismatch {
                    expected: dim,
                    found,
                });
            }
        }

        if !gradient.is_finite() {
            return Err(VIError::invalid("gradient must be finite"));
        }

        let mut g = gradient.clone();
        let norm = g.norm();
        if norm > self.gradient_clip {
            g.scale(self.gradient_clip / norm);
        }

        let lr = self.schedule.rate(t);
        let (d_mu, d_log_sigma) = match self.rule {
            UpdateRule::Sgd => (g.mu, g.log_sigma),
            UpdateRule::Momentum { beta } => {
                let v = self.first.get_or_insert_with(|| Moments::zeros(dim));
                v.mu = &v.mu * beta + &g.mu;
                v.log_sigma = &v.log_sigma * beta + &g.log_sigma;
                (v.mu.clone(), v.log_sigma.clone())
            }
            UpdateRule::Adam {
                beta1,
                beta2,
                epsilon,
            } => {
                let m = self.first.get_or_insert_with(|| Moments::zeros(dim));
                m.mu = &m.mu * beta1 + &g.mu * (1.0 - beta1);
                m.log_sigma = &m.log_sigma * beta1 + &g.log_sigma * (1.0 - beta1);
                let m = m.clone();
                let v = self.second.get_or_insert_with(|| Moments::zeros(dim));
                v.mu = &v.mu * beta2 + &g.mu.mapv(|x| x * x) * (1.0 - beta2);
                v.log_sigma =
                    &v.log_sigma * beta2 + &g.log_sigma.mapv(|x| x * x) * (1.0 - beta2);

                let step = (t + 1) as i32;
                let c1 = 1.0 - beta1.powi(step);
                let c2 = 1.0 - beta2.powi(step);
                let adapt = |m: &Array1<f64>, v: &Array1<f64>| {
                    let mut out = m / c1;
                    out.zip_mut_with(v, |d, &s| *d /= (s / c2).sqrt() + epsilon);
                    out
                };
                (adapt(&m.mu, &v.mu), adapt(&m.log_sigma, &v.log_sigma))
            }
        };

        Ok(VariationalParameters {
            mu: &params.mu + &(d_mu * lr),
            log_sigma: &params.log_sigma + &(d_log_sigma * lr),
        })
    }
}
