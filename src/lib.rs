//! Mean-field Gaussian variational inference with stochastic gradients.
//!
//! A run fits `q(z) = prod_i N(z_i; mu_i, sigma_i)` to an unnormalized target
//! log-density by stochastic ascent on the ELBO `E_q[log p(z) - log q(z)]`.
//!
//! - [`distributions`]: the [`Target`](distributions::Target) trait and ready-made targets.
//! - [`variational`]: the mean-field Gaussian family.
//! - [`estimator`]: reparameterization and score-function gradient estimators.
//! - [`optimizer`]: step-size schedules, SGD/momentum/Adam updates, clipping.
//! - [`inference`]: the inference loop, its configuration and terminal states.
//! - [`autodiff`]: targets whose gradients come from `burn`.
//! - [`stats`]: convergence tracking and run diagnostics.
//! - [`io`]: trace export (feature `csv`).

pub mod autodiff;
pub mod distributions;
pub mod error;
pub mod estimator;
pub mod inference;
pub mod io;
pub mod optimizer;
pub mod stats;
pub mod variational;

pub use error::{VIError, VIResult};
