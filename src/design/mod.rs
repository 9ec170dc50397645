use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView2};
use nshare::IntoNalgebra;

use crate::error::ComponentError;

/// Fixed sample-level covariates (m samples × k columns) held constant while
/// components are discovered. `k` may be zero.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignConstraint {
    matrix: Array2<f64>,
}

impl DesignConstraint {
    /// Checks that the matrix is finite and of full column rank.
    pub fn new(matrix: Array2<f64>) -> anyhow::Result<Self> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(ComponentError::DesignNotFinite.into());
        }
        let columns = matrix.ncols();
        if columns > 0 {
            let rank = numerical_rank(matrix.view());
            if rank < columns {
                return Err(ComponentError::DesignRankDeficient { rank, columns }.into());
            }
        }
        Ok(DesignConstraint { matrix })
    }

    /// No fixed covariates.
    pub fn empty(samples: usize) -> Self {
        DesignConstraint {
            matrix: Array2::zeros((samples, 0)),
        }
    }

    /// A single column of ones, so components describe variation about each row's mean.
    pub fn intercept(samples: usize) -> Self {
        DesignConstraint {
            matrix: Array2::ones((samples, 1)),
        }
    }

    pub fn samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn k(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    pub(crate) fn check_samples(&self, samples: usize) -> anyhow::Result<()> {
        if self.samples() != samples {
            return Err(ComponentError::DesignShape {
                design_rows: self.samples(),
                samples,
            }
            .into());
        }
        Ok(())
    }
}

fn numerical_rank(matrix: ArrayView2<f64>) -> usize {
    let (rows, cols) = matrix.dim();
    if rows < cols {
        // can never be full column rank
        return rows;
    }
    let m: DMatrix<f64> = matrix.into_nalgebra().clone_owned();
    let singular = m.singular_values();
    let max = singular.max();
    let eps = max * (rows.max(cols) as f64) * f64::EPSILON;
    singular.iter().filter(|&&s| s > eps).count()
}
