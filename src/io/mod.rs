//! IO module - run configuration and walker checkpoints.

mod checkpoint;
mod config;

pub use checkpoint::{
    load_snapshot, rank_path, save_snapshot, PopulationSnapshot, WalkerSnapshot, SNAPSHOT_VERSION,
};
pub use config::{load_config, CheckpointConfig, Method, RunConfig};
