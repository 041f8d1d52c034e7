//! Fits a mean-field Gaussian to a correlated 2D Gaussian posterior and prints
//! the fitted parameters.

use clap::{Parser, ValueEnum};
use log::info;
use mini_vi::distributions::Gaussian;
use mini_vi::estimator::EstimatorMode;
use mini_vi::inference::{MeanFieldVI, VIConfig};
use mini_vi::optimizer::UpdateRule;
use ndarray::{arr1, arr2};
use std::error::Error;
#[cfg(feature = "csv")]
use std::path::PathBuf;

#[derive(Clone, Debug, ValueEnum)]
enum Estimator {
    /// Pathwise gradients through the target's analytic gradient
    Reparam,
    /// Score-function gradients; the target is a black box
    Score,
}

#[derive(Clone, Debug, ValueEnum)]
enum Rule {
    Sgd,
    Momentum,
    Adam,
}

#[derive(Parser, Debug)]
#[command(name = "demo")]
#[command(about = "Mean-field VI on a 2D Gaussian with mean [1, 1] and correlation 0.1")]
struct Args {
    #[arg(long, default_value = "10000")]
    iters: usize,

    #[arg(long, default_value = "8")]
    batch_size: usize,

    #[arg(long, default_value = "0.05")]
    lr: f64,

    #[arg(long, default_value = "0.001")]
    lr_decay: f64,

    #[arg(long, default_value = "100.0")]
    gradient_clip: f64,

    #[arg(long, default_value = "0.0", help = "Convergence tolerance; 0 disables the check")]
    tol: f64,

    #[arg(long, default_value = "100")]
    window: usize,

    #[arg(short, long, default_value = "reparam")]
    estimator: Estimator,

    #[arg(short, long, default_value = "sgd")]
    rule: Rule,

    #[arg(long, default_value = "42")]
    seed: u64,

    #[arg(long, help = "Evaluate each batch on the rayon pool")]
    parallel: bool,

    #[arg(long, help = "Show a progress bar")]
    progress: bool,

    #[arg(long, default_value = "0", help = "Record parameters every N iterations")]
    trace_every: usize,

    #[cfg(feature = "csv")]
    #[arg(long, help = "Write the parameter trace to this CSV file")]
    trace_csv: Option<PathBuf>,

    #[cfg(feature = "csv")]
    #[arg(long, help = "Write the per-iteration ELBO estimates to this CSV file")]
    objective_csv: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    let target = Gaussian::new(arr1(&[1.0, 1.0]), arr2(&[[1.0, 0.1], [0.1, 1.0]]))?;
    let estimator = match args.estimator {
        Estimator::Reparam => EstimatorMode::Reparameterization,
        Estimator::Score => EstimatorMode::ScoreFunction,
    };
    let rule = match args.rule {
        Rule::Sgd => UpdateRule::Sgd,
        Rule::Momentum => UpdateRule::Momentum { beta: 0.9 },
        Rule::Adam => UpdateRule::adam(),
    };
    let config = VIConfig::default()
        .set_seed(args.seed)
        .set_n_iter(args.iters)
        .set_batch_size(args.batch_size)
        .set_learning_rate(args.lr, args.lr_decay)
        .set_gradient_clip(args.gradient_clip)
        .set_convergence(args.tol, args.window)
        .set_estimator(estimator)
        .set_update_rule(rule)
        .set_parallel(args.parallel)
        .set_trace_every(args.trace_every);
    info!("config: {config:?}");

    let mut vi = MeanFieldVI::new(target, config)?;
    let state = if args.progress {
        vi.run_progress(args.iters, args.batch_size, args.tol, args.window)
    } else {
        vi.fit()
    };

    println!("Status: {:?}", state.status);
    println!("Iterations: {}", state.diagnostics.iterations);
    println!("Mean: {:.4}", state.mean());
    println!("Std: {:.4}", state.std());
    if let Some(elbo) = state.diagnostics.mean_recent_objective(100) {
        println!("ELBO (last 100 iterations): {elbo:.4}");
    }
    if let Some(best) = state.diagnostics.best_objective() {
        println!("Best ELBO estimate: {best:.4}");
    }
    println!(
        "Excluded samples: {}, degenerate batches: {}",
        state.diagnostics.n_excluded, state.diagnostics.n_degenerate
    );

    #[cfg(feature = "csv")]
    if let Some(path) = &args.trace_csv {
        let filename = path.to_str().ok_or("trace path is not valid UTF-8")?;
        mini_vi::io::csv::save_trace_csv(&state.diagnostics.trace, filename)?;
        println!("Saved trace to {}", path.display());
    }
    #[cfg(feature = "csv")]
    if let Some(path) = &args.objective_csv {
        let filename = path.to_str().ok_or("objective path is not valid UTF-8")?;
        mini_vi::io::csv::save_objective_csv(&state.diagnostics.objective_trace, filename)?;
        println!("Saved ELBO estimates to {}", path.display());
    }

    if let mini_vi::inference::TerminalStatus::Failed(e) = state.status {
        return Err(e.into());
    }
    Ok(())
}
