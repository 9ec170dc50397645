use anyhow::{anyhow, bail};
use nalgebra_sparse::CsrMatrix;

use crate::error::ComponentError;
use crate::view::MatrixView;

/// Weighted matrix backed by two CSR matrices.
///
/// An entry is observed when its stored weight is positive; entries without a stored
/// weight are missing. Values are read with sparse semantics, so an observed entry
/// with no stored value is an observed zero.
#[derive(Debug, Clone)]
pub struct SparseWeightedMatrix {
    values: CsrMatrix<f64>,
    weights: CsrMatrix<f64>,
    row_names: Option<Vec<String>>,
    col_names: Option<Vec<String>>,
}

impl SparseWeightedMatrix {
    pub fn new(values: CsrMatrix<f64>, weights: CsrMatrix<f64>) -> anyhow::Result<Self> {
        if values.nrows() != weights.nrows() || values.ncols() != weights.ncols() {
            bail!(
                "Shape of values ({}, {}) does not match shape of weights ({}, {})",
                values.nrows(),
                values.ncols(),
                weights.nrows(),
                weights.ncols()
            );
        }

        for (i, j, &w) in weights.triplet_iter() {
            if !w.is_finite() || w < 0.0 {
                return Err(ComponentError::InvalidWeight {
                    row: i,
                    col: j,
                    weight: w,
                }
                .into());
            }
            if w > 0.0 {
                let v = values
                    .get_entry(i, j)
                    .map(|e| e.into_value())
                    .unwrap_or(0.0);
                if !v.is_finite() {
                    return Err(ComponentError::MissingWithWeight {
                        row: i,
                        col: j,
                        weight: w,
                    }
                    .into());
                }
            }
        }

        Ok(SparseWeightedMatrix {
            values,
            weights,
            row_names: None,
            col_names: None,
        })
    }

    /// Unit weight for every stored finite value; everything else is missing.
    pub fn from_observed(values: CsrMatrix<f64>) -> anyhow::Result<Self> {
        let unit: Vec<f64> = values
            .values()
            .iter()
            .map(|v| if v.is_finite() { 1.0 } else { 0.0 })
            .collect();
        let weights = CsrMatrix::try_from_pattern_and_values(values.pattern().clone(), unit)
            .map_err(|e| anyhow!("Failed to build weight matrix: {}", e))?;
        Self::new(values, weights)
    }

    pub fn with_row_names(mut self, names: Vec<String>) -> anyhow::Result<Self> {
        if names.len() != self.values.nrows() {
            bail!(
                "Got {} row names for {} rows",
                names.len(),
                self.values.nrows()
            );
        }
        self.row_names = Some(names);
        Ok(self)
    }

    pub fn with_col_names(mut self, names: Vec<String>) -> anyhow::Result<Self> {
        if names.len() != self.values.ncols() {
            bail!(
                "Got {} column names for {} columns",
                names.len(),
                self.values.ncols()
            );
        }
        self.col_names = Some(names);
        Ok(self)
    }

    pub fn nnz_observed(&self) -> usize {
        self.weights.values().iter().filter(|&&w| w > 0.0).count()
    }
}

impl MatrixView for SparseWeightedMatrix {
    fn dims(&self) -> (usize, usize) {
        (self.values.nrows(), self.values.ncols())
    }

    fn get(&self, i: usize, j: usize) -> (Option<f64>, f64) {
        let w = self
            .weights
            .get_entry(i, j)
            .map(|e| e.into_value())
            .unwrap_or(0.0);
        if w > 0.0 {
            let v = self
                .values
                .get_entry(i, j)
                .map(|e| e.into_value())
                .unwrap_or(0.0);
            (Some(v), w)
        } else {
            (None, 0.0)
        }
    }

    fn row_metadata(&self) -> Option<&[String]> {
        self.row_names.as_deref()
    }

    fn col_metadata(&self) -> Option<&[String]> {
        self.col_names.as_deref()
    }
}
