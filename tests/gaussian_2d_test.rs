//! Fits a mean-field Gaussian to the correlated 2D Gaussian
//! `N([1, 1], [[1, 0.1], [0.1, 1]])`.
//!
//! The mean-field optimum matches the target mean, and its standard deviations
//! are `1 / sqrt(P_ii)` where `P` is the target precision. They are slightly
//! below the marginal standard deviations of 1 because the factorized family
//! cannot represent the correlation.

use approx::assert_abs_diff_eq;
use mini_vi::distributions::Gaussian;
use mini_vi::estimator::EstimatorMode;
use mini_vi::inference::{MeanFieldVI, TerminalStatus, VIConfig};
use mini_vi::optimizer::UpdateRule;
use ndarray::{arr1, arr2, Array1};

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: u64 = 42;

    fn target() -> Gaussian {
        Gaussian::new(arr1(&[1.0, 1.0]), arr2(&[[1.0, 0.1], [0.1, 1.0]]))
            .expect("Expected a valid covariance")
    }

    /// `1 / sqrt(P_ii)`.
    fn mean_field_std() -> Array1<f64> {
        target().precision().diag().mapv(|p| 1.0 / p.sqrt())
    }

    #[test]
    fn test_reparam_converges_to_mean_field_optimum() {
        let mut vi = MeanFieldVI::new(target(), VIConfig::default().set_seed(SEED)).unwrap();
        let state = vi.fit();

        assert_eq!(state.status, TerminalStatus::MaxIterationsReached);
        assert_eq!(state.diagnostics.iterations, 10_000);
        assert_abs_diff_eq!(state.mean(), &arr1(&[1.0, 1.0]), epsilon = 0.1);
        assert_abs_diff_eq!(state.std(), arr1(&[1.0, 1.0]), epsilon = 0.2);
        assert_abs_diff_eq!(state.std(), mean_field_std(), epsilon = 0.1);

        // The ELBO is minus the KL divergence, about -0.005 here.
        let elbo = state.diagnostics.mean_recent_objective(1000).unwrap();
        assert!(elbo.abs() < 0.05, "ELBO {elbo} should be close to zero");
        assert_eq!(state.diagnostics.n_excluded, 0);
        assert_eq!(state.diagnostics.n_degenerate, 0);
    }

    #[test]
    fn test_score_function_converges() {
        let config = VIConfig::default()
            .set_seed(SEED)
            .set_estimator(EstimatorMode::ScoreFunction);
        let mut vi = MeanFieldVI::new(target(), config).unwrap();
        let state = vi.fit();

        assert_eq!(state.status, TerminalStatus::MaxIterationsReached);
        assert_abs_diff_eq!(state.mean(), &arr1(&[1.0, 1.0]), epsilon = 0.15);
        assert_abs_diff_eq!(state.std(), mean_field_std(), epsilon = 0.15);
    }

    #[test]
    fn test_adam_converges() {
        let config = VIConfig::default()
            .set_seed(SEED)
            .set_update_rule(UpdateRule::adam());
        let mut vi = MeanFieldVI::new(target(), config).unwrap();
        let state = vi.fit();

        assert!(state.status.is_success());
        assert_abs_diff_eq!(state.mean(), &arr1(&[1.0, 1.0]), epsilon = 0.15);
        assert_abs_diff_eq!(state.std(), mean_field_std(), epsilon = 0.15);
    }

    #[test]
    fn test_convergence_check_stops_early() {
        let config = VIConfig::default()
            .set_seed(SEED)
            .set_batch_size(32)
            .set_convergence(0.05, 200);
        let mut vi = MeanFieldVI::new(target(), config).unwrap();
        let state = vi.fit();

        assert_eq!(state.status, TerminalStatus::Converged);
        assert!(state.diagnostics.iterations >= 400);
        assert!(state.diagnostics.iterations < 10_000);
    }

    #[test]
    fn test_same_seed_gives_identical_trajectories() {
        let config = VIConfig::default().set_seed(7).set_n_iter(500);
        let a = MeanFieldVI::new(target(), config.clone()).unwrap().fit();
        let b = MeanFieldVI::new(target(), config.clone()).unwrap().fit();
        assert_eq!(a.parameters, b.parameters);
        assert_eq!(a.diagnostics.objective_trace, b.diagnostics.objective_trace);

        // Re-running the same instance starts over from the same state.
        let mut vi = MeanFieldVI::new(target(), config).unwrap();
        let first = vi.fit();
        let second = vi.fit();
        assert_eq!(first.parameters, second.parameters);
        assert_eq!(first.parameters, a.parameters);

        let other = MeanFieldVI::new(target(), VIConfig::default().set_seed(8).set_n_iter(500))
            .unwrap()
            .fit();
        assert_ne!(other.parameters, a.parameters);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let config = VIConfig::default().set_seed(3).set_n_iter(200).set_batch_size(64);
        let seq = MeanFieldVI::new(target(), config.clone()).unwrap().fit();
        let par = MeanFieldVI::new(target(), config.set_parallel(true))
            .unwrap()
            .fit();
        assert_abs_diff_eq!(seq.parameters.mu, par.parameters.mu, epsilon = 1e-8);
        assert_abs_diff_eq!(
            seq.parameters.log_sigma,
            par.parameters.log_sigma,
            epsilon = 1e-8
        );
    }
}
