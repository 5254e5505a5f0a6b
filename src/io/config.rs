//! Run configuration, read from YAML.
//!
//! ```yaml
//! method: dmc
//! system:
//!   type: helium
//!   alpha: 1.6875
//!   jastrow_b: 1.0
//! tau: 0.01
//! blocks: 100
//! steps: 100
//! walkers: 512
//! reconfiguration: false
//! feedback:
//!   law: logarithmic
//!   gain: 1.0
//! drift:
//!   kind: umrigar
//!   a: 1.0
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{QmcError, Result};
use crate::sampling::{DriftPolicy, ExecutorKind, FeedbackLaw, MoveMode};
use crate::systems::SystemConfig;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Vmc,
    #[default]
    Dmc,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    /// Write every `period` blocks; 0 writes only at the end of the run.
    #[serde(default)]
    pub period: usize,
    /// Start from `path` if it exists.
    #[serde(default)]
    pub restart: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub method: Method,
    pub system: SystemConfig,
    pub tau: f64,
    pub blocks: usize,
    pub steps: usize,
    pub warmup_steps: usize,
    /// Leading blocks left out of the final statistics.
    pub discard_blocks: usize,
    /// Initial global population.
    pub walkers: usize,
    pub target_walkers: Option<usize>,
    pub min_walkers: Option<usize>,
    pub max_walkers: Option<usize>,
    pub branch_interval: usize,
    pub reconfiguration: bool,
    pub max_copies: usize,
    pub feedback: FeedbackLaw,
    pub drift: DriftPolicy,
    pub move_mode: MoveMode,
    pub max_age: usize,
    pub singular_floor: f64,
    /// Steps between full recomputes of every walker's caches; 0 disables them.
    pub recompute_period: usize,
    pub seed: u64,
    pub executor: ExecutorKind,
    pub threads: Option<usize>,
    /// In-process ranks sharing one population.
    pub ranks: usize,
    pub checkpoint: Option<CheckpointConfig>,
    pub adapt_tau: bool,
    pub target_acceptance: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            method: Method::Dmc,
            system: SystemConfig::default(),
            tau: 0.01,
            blocks: 20,
            steps: 50,
            warmup_steps: 100,
            discard_blocks: 0,
            walkers: 256,
            target_walkers: None,
            min_walkers: None,
            max_walkers: None,
            branch_interval: 1,
            reconfiguration: false,
            max_copies: 3,
            feedback: FeedbackLaw::default(),
            drift: DriftPolicy::default(),
            move_mode: MoveMode::ParticleByParticle,
            max_age: 1,
            singular_floor: 1e-12,
            recompute_period: 100,
            seed: 42,
            executor: ExecutorKind::Scalar,
            threads: None,
            ranks: 1,
            checkpoint: None,
            adapt_tau: false,
            target_acceptance: 0.5,
        }
    }
}

impl RunConfig {
    pub fn target(&self) -> usize {
        self.target_walkers.unwrap_or(self.walkers)
    }

    pub fn min_population(&self) -> usize {
        self.min_walkers.unwrap_or(self.target() / 2)
    }

    pub fn max_population(&self) -> usize {
        self.max_walkers.unwrap_or(self.target() * 2)
    }

    pub fn is_dmc(&self) -> bool {
        self.method == Method::Dmc
    }

    /// Reject settings no run could use, before any walker is created.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(QmcError::Config(msg));
        if !(self.tau > 0.0 && self.tau.is_finite()) {
            return fail(format!("tau must be positive, got {}", self.tau));
        }
        if self.walkers == 0 {
            return fail("walkers must be at least 1".into());
        }
        if self.ranks == 0 {
            return fail("ranks must be at least 1".into());
        }
        if self.walkers < self.ranks {
            return fail(format!(
                "{} walkers cannot be spread over {} ranks",
                self.walkers, self.ranks
            ));
        }
        if self.branch_interval == 0 {
            return fail("branch_interval must be at least 1".into());
        }
        if self.max_copies == 0 {
            return fail("max_copies must be at least 1".into());
        }
        let (lo, target, hi) = (self.min_population(), self.target(), self.max_population());
        if lo > hi {
            return fail(format!("min_walkers {lo} exceeds max_walkers {hi}"));
        }
        if target < lo || target > hi || target == 0 {
            return fail(format!("target population {target} outside [{lo}, {hi}]"));
        }
        if self.reconfiguration && target < self.ranks {
            return fail(format!(
                "reconfiguration target {target} smaller than {} ranks",
                self.ranks
            ));
        }
        if !(self.singular_floor >= 0.0) {
            return fail(format!(
                "singular_floor must be non-negative, got {}",
                self.singular_floor
            ));
        }
        if self.adapt_tau && !(self.target_acceptance > 0.0 && self.target_acceptance < 1.0) {
            return fail(format!(
                "target_acceptance must lie in (0, 1), got {}",
                self.target_acceptance
            ));
        }
        match self.drift {
            DriftPolicy::Umrigar { a } if !(a > 0.0) => {
                return fail(format!("umrigar drift needs a > 0, got {a}"))
            }
            DriftPolicy::Capped { max } if !(max > 0.0) => {
                return fail(format!("capped drift needs max > 0, got {max}"))
            }
            _ => {}
        }
        if let Some(ckpt) = &self.checkpoint {
            if ckpt.path.as_os_str().is_empty() {
                return fail("checkpoint path is empty".into());
            }
        }
        self.system.validate()
    }
}

/// Read and validate a YAML run configuration.
pub fn load_config(path: &Path) -> anyhow::Result<RunConfig> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening config {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let config: RunConfig = serde_yaml::from_reader(reader)
        .with_context(|| format!("parsing config {}", path.display()))?;
    config.validate().with_context(|| format!("validating config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_yaml() {
        let yaml = r#"
method: vmc
system:
  type: harmonic
  particles: 2
  omega: 1.0
  alpha: 0.9
  dims: 1
tau: 0.05
walkers: 16
drift:
  kind: capped
  max: 0.4
feedback:
  law: linear
  gain: 0.1
move_mode: all
executor: batched
checkpoint:
  path: run.ckpt
  period: 5
"#;
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.method, Method::Vmc);
        assert_eq!(config.drift, DriftPolicy::Capped { max: 0.4 });
        assert_eq!(config.feedback, FeedbackLaw::Linear { gain: 0.1 });
        assert_eq!(config.move_mode, MoveMode::AllElectron);
        assert_eq!(config.executor, ExecutorKind::Batched);
        assert_eq!(config.target(), 16);
        assert_eq!(config.blocks, RunConfig::default().blocks);
        assert!(!config.checkpoint.unwrap().restart);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut config = RunConfig {
            min_walkers: Some(300),
            max_walkers: Some(200),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(QmcError::Config(_))));
        config.min_walkers = None;
        config.max_walkers = None;
        config.target_walkers = Some(10_000);
        config.max_walkers = Some(600);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_tau() {
        let config = RunConfig { tau: 0.0, ..Default::default() };
        assert!(config.validate().is_err());
        let config = RunConfig { tau: f64::NAN, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_round_trips_through_yaml() {
        let config = RunConfig::default();
        let text = serde_yaml::to_string(&config).unwrap();
        let back: RunConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_load_config_reports_path() {
        let err = load_config(Path::new("/nonexistent/run.yml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/run.yml"));
    }
}
