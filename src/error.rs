//! Error types for the walker engine.
//!
//! Per-move numerical trouble (a near-singular determinant ratio, a diverging drift) is absorbed
//! by the accept/reject step and never shows up here. What does show up is anything that would
//! bias the long-run estimator if it were patched locally.

use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum QmcError {
    /// Malformed or inconsistent run configuration, detected before stepping.
    Config(String),
    /// No walker survived a branching pass.
    PopulationCollapse { step: usize },
    /// Ranks disagree on a quantity that must be globally consistent.
    Desync {
        what: &'static str,
        local: f64,
        global: f64,
    },
    /// Rank-1 update refused because |ratio| fell under the singular floor.
    SingularUpdate { ratio: f64 },
    /// A full recompute found a non-invertible matrix.
    Singular(String),
    /// Snapshot could not be encoded, decoded or matched to the system.
    Checkpoint(String),
    Io(std::io::Error),
}

impl fmt::Display for QmcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QmcError::Config(msg) => write!(f, "configuration error: {msg}"),
            QmcError::PopulationCollapse { step } => {
                write!(f, "walker population collapsed to zero at step {step}")
            }
            QmcError::Desync { what, local, global } => write!(
                f,
                "cross-rank desynchronization in {what}: \
                 local view {local}, global reduction {global}"
            ),
            QmcError::SingularUpdate { ratio } => {
                write!(f, "determinant ratio {ratio:e} is below the singular floor")
            }
            QmcError::Singular(msg) => write!(f, "singular matrix: {msg}"),
            QmcError::Checkpoint(msg) => write!(f, "checkpoint error: {msg}"),
            QmcError::Io(err) => write!(f, "i/o error: {err}"),
        }
    }
}

impl Error for QmcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            QmcError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for QmcError {
    fn from(err: std::io::Error) -> Self {
        QmcError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, QmcError>;
