//! Helium VMC with and without the electron-electron-nucleus Jastrow, on the batched executor.

use rust_dmc::io::Method;
use rust_dmc::sampling::ExecutorKind;
use rust_dmc::systems::ThreeBodyConfig;
use rust_dmc::{run_simulation, RunConfig, SystemConfig};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let three_body_options = [None, Some(ThreeBodyConfig { coefficient: -0.05, kappa: 1.0 })];
    for three_body in three_body_options {
        let config = RunConfig {
            method: Method::Vmc,
            system: SystemConfig::Helium {
                alpha: 1.6875,
                jastrow_b: 1.0,
                three_body: three_body.clone(),
            },
            tau: 0.05,
            blocks: 50,
            steps: 200,
            warmup_steps: 200,
            walkers: 128,
            executor: ExecutorKind::Batched,
            adapt_tau: true,
            ..Default::default()
        };
        let summary = run_simulation(&config)?;
        println!(
            "three-body {:<5}: E = {:.5} ± {:.5} Ha, variance {:.4}, acceptance {:.3}",
            three_body.is_some(),
            summary.energy.mean,
            summary.energy.error.unwrap_or(f64::NAN),
            summary.energy.variance,
            summary.acceptance
        );
    }
    Ok(())
}
