//! Gradients from `burn`'s autodiff backend.
//!
//! Implement [`TensorTarget`] for a log-density written with burn tensor
//! operations and wrap it in an [`AutodiffTarget`]. The wrapper implements
//! [`Target`], so the reparameterization estimator can use the gradients
//! burn computes instead of a hand-derived one.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::marker::PhantomData;

use crate::distributions::Target;

/// A batched log-density over `R^D` expressed with burn tensors.
pub trait TensorTarget<B: AutodiffBackend> {
    fn dim(&self) -> usize;

    /// Computes the unnormalized log-density for a batch of points.
    ///
    /// # Parameters
    ///
    /// * `positions`: A tensor of shape `[N, D]`.
    ///
    /// # Returns
    ///
    /// A 1D tensor of shape `[N]`.
    fn log_prob_batch(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1>;
}

/// Adapts a [`TensorTarget`] to the ndarray-based [`Target`] interface.
#[derive(Debug, Clone)]
pub struct AutodiffTarget<B, T> {
    pub inner: T,
    _marker: PhantomData<fn() -> B>,
}

impl<B, T> AutodiffTarget<B, T>
where
    B: AutodiffBackend,
    T: TensorTarget<B>,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    fn to_tensor(zs: ArrayView2<f64>) -> Tensor<B, 2> {
        let values: Vec<f64> = zs.iter().copied().collect();
        let td = TensorData::new(values, [zs.nrows(), zs.ncols()]);
        Tensor::<B, 2>::from_data(td, &B::Device::default())
    }
}

impl<B, T> Target for AutodiffTarget<B, T>
where
    B: AutodiffBackend,
    T: TensorTarget<B>,
{
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn unnorm_log_prob(&self, z: ArrayView1<f64>) -> f64 {
        self.unnorm_log_prob_batch(z.insert_axis(Axis(0)))[0]
    }

    fn unnorm_log_prob_batch(&self, zs: ArrayView2<f64>) -> Array1<f64> {
        let positions = Self::to_tensor(zs);
        let logp = self.inner.log_prob_batch(&positions);
        logp.into_data().iter::<f64>().collect()
    }

    fn is_differentiable(&self) -> bool {
        true
    }

    fn unnorm_log_prob_grad_batch(
        &self,
        zs: ArrayView2<f64>,
    ) -> Option<(Array1<f64>, Array2<f64>)> {
        let positions = Self::to_tensor(zs).require_grad();
        let logp = self.inner.log_prob_batch(&positions);
        // Rows are independent, so the gradient of the summed batch is the
        // per-row gradient.
        let grads = logp.backward();
        let grad = positions.grad(&grads)?;

        let values: Array1<f64> = logp.into_data().iter::<f64>().collect();
        let grad: Vec<f64> = grad.into_data().iter::<f64>().collect();
        let grad = Array2::from_shape_vec((zs.nrows(), zs.ncols()), grad).ok()?;
        Some((values, grad))
    }
}
