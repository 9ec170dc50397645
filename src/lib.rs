//! Weighted components of variation.
//!
//! Discovers low-rank structure in a weighted, partially observed features × samples
//! matrix while holding a fixed sample-level design constant. See [`components`] for
//! the fitting pipeline and [`view`] for the input contract.

pub mod components;
pub(crate) mod dense;
pub mod design;
pub mod error;
pub mod sparse;
mod utils;
pub mod view;

pub use components::interface::{recalibrate, EffectInputs, Residuals, WeightCalibration};
pub use components::rotation::RotationMethod;
pub use components::sequence::ComponentSequence;
pub use components::{
    Components, ComponentsBuilder, ComponentsConfig, ConvergenceStatus, Diagnostics,
    Factorization,
};
pub use design::DesignConstraint;
pub use error::ComponentError;
pub use sparse::SparseWeightedMatrix;
pub use view::{MatrixView, Observations, WeightedMatrix};
