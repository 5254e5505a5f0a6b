use approx::assert_relative_eq;

use rust_dmc::io::Method;
use rust_dmc::sampling::{DriftPolicy, ExecutorKind, MoveMode};
use rust_dmc::{run_simulation, RunConfig, SystemConfig};

fn oscillator(alpha: f64) -> SystemConfig {
    SystemConfig::Harmonic { particles: 1, omega: 1.0, alpha, dims: 1 }
}

/// ψ(x) = exp(-x²/2), τ = 0.01, 1000 steps.
#[test]
fn exact_trial_function_scenario() {
    let config = RunConfig {
        method: Method::Dmc,
        system: oscillator(1.0),
        tau: 0.01,
        blocks: 10,
        steps: 100,
        warmup_steps: 0,
        walkers: 64,
        ..Default::default()
    };
    let summary = run_simulation(&config).unwrap();
    let stats = summary.energy;
    assert_eq!(stats.blocks, 10);
    let tolerance = stats.error.map_or(1e-8, |e| 3.0 * e + 1e-8);
    assert!((stats.mean - 0.5).abs() <= tolerance, "{} ± {:?}", stats.mean, stats.error);
    assert!(summary.acceptance > 0.9);
}

#[test]
fn vmc_energy_of_a_poor_gaussian() {
    // <E> = α/4 + 1/(4α) for ψ = exp(-αx²/2) in one dimension.
    let alpha = 0.6;
    let config = RunConfig {
        method: Method::Vmc,
        system: oscillator(alpha),
        tau: 0.2,
        blocks: 40,
        steps: 100,
        warmup_steps: 200,
        walkers: 100,
        move_mode: MoveMode::AllElectron,
        ..Default::default()
    };
    let summary = run_simulation(&config).unwrap();
    let exact = alpha / 4.0 + 1.0 / (4.0 * alpha);
    assert_relative_eq!(summary.energy.mean, exact, epsilon = 0.02);
    assert_eq!(summary.final_population, 100);
}

#[test]
fn dmc_projects_out_the_ground_state() {
    let config = RunConfig {
        method: Method::Dmc,
        system: oscillator(0.7),
        tau: 0.01,
        blocks: 20,
        steps: 100,
        warmup_steps: 300,
        walkers: 200,
        executor: ExecutorKind::Batched,
        threads: Some(2),
        drift: DriftPolicy::Umrigar { a: 1.0 },
        ..Default::default()
    };
    let summary = run_simulation(&config).unwrap();
    // Variational energy for α = 0.7 is 0.532.
    assert_relative_eq!(summary.energy.mean, 0.5, epsilon = 0.02);
    assert!(summary.final_population >= 100 && summary.final_population <= 400);
}

#[test]
fn fixed_population_dmc_over_ranks() {
    let config = RunConfig {
        method: Method::Dmc,
        system: oscillator(0.7),
        tau: 0.01,
        blocks: 5,
        steps: 50,
        warmup_steps: 50,
        walkers: 96,
        reconfiguration: true,
        ranks: 3,
        ..Default::default()
    };
    let summary = run_simulation(&config).unwrap();
    assert_eq!(summary.final_population, 96);
    assert!(summary.energy.mean > 0.4 && summary.energy.mean < 0.65);
}
