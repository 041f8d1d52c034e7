/*!
# Saving Inference Traces to CSV

Writes the objective trace and the periodic parameter snapshots of a run to
CSV files. Enable via the `csv` feature.
*/

use std::error::Error;
use std::fs::File;

use csv::Writer;

use crate::stats::TraceRecord;

/**
Saves parameter snapshots as a CSV file.

The resulting CSV file will have:
- A header row containing `"iteration"`, `"objective"`, then one column per
  dimension for the means (`"mu_0"`, `"mu_1"`, ...) and for the log standard
  deviations (`"log_sigma_0"`, ...).
- One row per [`TraceRecord`].

An empty trace produces a file with the header `"iteration,objective"` only.

# Examples

```rust
use mini_vi::distributions::IsotropicGaussian;
use mini_vi::inference::{MeanFieldVI, VIConfig};
use mini_vi::io::csv::save_trace_csv;
use ndarray::arr1;

let target = IsotropicGaussian::new(arr1(&[0.0, 0.0]), 1.0)?;
let config = VIConfig::default().set_seed(1).set_n_iter(100).set_trace_every(10);
let state = MeanFieldVI::new(target, config)?.fit();
save_trace_csv(&state.diagnostics.trace, "/tmp/trace.csv")?;
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
pub fn save_trace_csv(trace: &[TraceRecord], filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    let n_dims = trace.first().map_or(0, |r| r.parameters.dim());

    let mut header: Vec<String> = vec!["iteration".to_string(), "objective".to_string()];
    header.extend((0..n_dims).map(|i| format!("mu_{}", i)));
    header.extend((0..n_dims).map(|i| format!("log_sigma_{}", i)));
    wtr.write_record(&header)?;

    for record in trace {
        if record.parameters.dim() != n_dims {
            return Err(format!(
                "trace record at iteration {} has {} dimensions, expected {}",
                record.iteration,
                record.parameters.dim(),
                n_dims
            )
            .into());
        }
        let mut row = vec![record.iteration.to_string(), record.objective.to_string()];
        row.extend(record.parameters.mu.iter().map(|v| v.to_string()));
        row.extend(record.parameters.log_sigma.iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}

/// Saves the per-iteration ELBO estimates with header `"iteration,objective"`.
/// Iterations are numbered from 1.
pub fn save_objective_csv(objective: &[f64], filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    wtr.write_record(["iteration", "objective"])?;
    for (i, value) in objective.iter().enumerate() {
        wtr.write_record(&[(i + 1).to_string(), value.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}
