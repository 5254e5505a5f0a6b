//! Correlation module - Jastrow factors for electron-electron correlations.

mod jastrow;
mod three_body;

pub use jastrow::{JastrowState, PadeFunctor, TwoBodyJastrow};
pub use three_body::{ThreeBodyJastrow, ThreeBodyState};
