use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;

use rust_dmc::{load_config, run_simulation};

#[derive(Parser, Debug)]
#[command(version, about = "Variational and diffusion Monte Carlo", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    blocks: Option<usize>,
    #[arg(long)]
    steps: Option<usize>,
    #[arg(long)]
    threads: Option<usize>,
}

const HA_TO_EV: f64 = 27.21138602;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(blocks) = args.blocks {
        config.blocks = blocks;
    }
    if let Some(steps) = args.steps {
        config.steps = steps;
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }
    config.validate().context("validating command-line overrides")?;

    let summary = run_simulation(&config)
        .with_context(|| format!("running {}", args.config.display()))?;

    println!("{:?} results for {}", summary.method, summary.system);
    println!("----------------------------------------");
    println!("Blocks x steps:     {} x {}", summary.blocks, summary.steps);
    println!("Time step:          {}", summary.tau);
    println!("Final population:   {}", summary.final_population);
    println!("Acceptance:         {:.4}", summary.acceptance);
    match summary.energy.error {
        Some(error) => {
            println!("Energy:             {:.6} ± {:.6} Ha", summary.energy.mean, error);
            println!(
                "                    {:.4} ± {:.4} eV",
                HA_TO_EV * summary.energy.mean,
                HA_TO_EV * error
            );
        }
        None => {
            println!(
                "Energy:             {:.6} Ha (too few blocks for an error bar)",
                summary.energy.mean
            );
            println!("                    {:.4} eV", HA_TO_EV * summary.energy.mean);
        }
    }
    println!("Variance:           {:.6}", summary.energy.variance);
    println!("Autocorrelation:    {:.2} blocks", summary.energy.autocorrelation_time);
    if let Some(exact) = summary.exact_energy {
        println!("Exact energy:       {exact:.6} Ha");
    }
    Ok(())
}
