//! Walker-population snapshots.
//!
//! Only the configuration of each walker is stored. Determinant inverses and Jastrow tables
//! are rebuilt from the positions on load, so a snapshot stays valid across changes to the
//! cache layout.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{QmcError, Result};
use crate::sampling::Walker;
use crate::systems::System;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WalkerSnapshot {
    pub positions: Vec<Vector3<f64>>,
    pub weight: f64,
    pub multiplicity: f64,
    pub age: usize,
}

impl WalkerSnapshot {
    pub fn capture(walker: &Walker) -> Self {
        Self {
            positions: walker.positions.clone(),
            weight: walker.weight,
            multiplicity: walker.multiplicity,
            age: walker.age,
        }
    }

    /// Walker at the stored configuration with caches rebuilt for `system` and a random stream
    /// seeded from `seed`.
    pub fn restore(&self, system: &System, seed: u64) -> Result<Walker> {
        let n = system.num_particles();
        if self.positions.len() != n {
            return Err(QmcError::Config(format!(
                "stored walker has {} particles but system {} has {n}",
                self.positions.len(),
                system.name
            )));
        }
        let mut walker = Walker::new(self.positions.clone(), &system.wavefunction, seed);
        walker.initialize(&system.wavefunction, system.hamiltonian.as_ref())?;
        walker.weight = self.weight;
        walker.multiplicity = self.multiplicity;
        walker.age = self.age;
        Ok(walker)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PopulationSnapshot {
    pub version: u32,
    pub step: usize,
    pub e_trial: f64,
    pub e_ref: f64,
    pub walkers: Vec<WalkerSnapshot>,
}

impl PopulationSnapshot {
    pub fn capture(step: usize, e_trial: f64, e_ref: f64, walkers: &[Walker]) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            step,
            e_trial,
            e_ref,
            walkers: walkers.iter().map(WalkerSnapshot::capture).collect(),
        }
    }

    /// Turn the stored configurations back into walkers with fresh caches.
    ///
    /// Each walker gets a new random stream drawn from `rng`.
    pub fn rebuild(&self, system: &System, rng: &mut StdRng) -> Result<Vec<Walker>> {
        self.walkers.iter().map(|stored| stored.restore(system, rng.gen())).collect()
    }
}

/// File used by `rank` out of `size`; a single rank writes to `path` itself.
pub fn rank_path(path: &Path, rank: usize, size: usize) -> PathBuf {
    if size == 1 {
        return path.to_path_buf();
    }
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{rank}"));
    PathBuf::from(name)
}

/// Write through a temporary file so a crash never leaves a truncated snapshot at `path`.
pub fn save_snapshot(path: &Path, snapshot: &PopulationSnapshot) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        bincode::serialize_into(&mut writer, snapshot)
            .map_err(|e| QmcError::Checkpoint(format!("encoding {}: {e}", path.display())))?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<PopulationSnapshot> {
    let reader = BufReader::new(File::open(path)?);
    let snapshot: PopulationSnapshot = bincode::deserialize_from(reader)
        .map_err(|e| QmcError::Checkpoint(format!("decoding {}: {e}", path.display())))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(QmcError::Checkpoint(format!(
            "{} has snapshot version {}, expected {SNAPSHOT_VERSION}",
            path.display(),
            snapshot.version
        )));
    }
    Ok(snapshot)
}
