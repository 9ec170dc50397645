//! # Weighted matrix views
//!
//! The component engine reads its input through [`MatrixView`], a small capability
//! trait over an n×m grid of (value, weight) pairs. Rows are features, columns are
//! samples. A weight of zero marks an entry as unobserved; its stored value is
//! ignored entirely.
//!
//! Two storage backends are provided: the dense [`WeightedMatrix`] and the CSR-backed
//! [`crate::sparse::SparseWeightedMatrix`].

use anyhow::bail;
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;

use crate::error::ComponentError;

pub trait MatrixView {
    /// Number of rows (features) and columns (samples).
    fn dims(&self) -> (usize, usize);

    /// Value and weight of entry `(i, j)`. A missing value is `None` and must carry
    /// weight zero.
    fn get(&self, i: usize, j: usize) -> (Option<f64>, f64);

    fn row_metadata(&self) -> Option<&[String]> {
        None
    }

    fn col_metadata(&self) -> Option<&[String]> {
        None
    }
}

/// Dense weighted matrix. Missing values are stored as `NaN` with weight zero.
#[derive(Debug, Clone)]
pub struct WeightedMatrix {
    values: Array2<f64>,
    weights: Array2<f64>,
    row_names: Option<Vec<String>>,
    col_names: Option<Vec<String>>,
}

impl WeightedMatrix {
    pub fn new(values: Array2<f64>, weights: Array2<f64>) -> anyhow::Result<Self> {
        if values.dim() != weights.dim() {
            bail!(
                "Shape of values {:?} does not match shape of weights {:?}",
                values.dim(),
                weights.dim()
            );
        }
        let matrix = WeightedMatrix {
            values,
            weights,
            row_names: None,
            col_names: None,
        };
        matrix.validate()?;
        Ok(matrix)
    }

    /// Unit weights for every finite value, zero weight for `NaN`/infinite ones.
    pub fn from_values(values: Array2<f64>) -> Self {
        let weights = values.mapv(|v| if v.is_finite() { 1.0 } else { 0.0 });
        WeightedMatrix {
            values,
            weights,
            row_names: None,
            col_names: None,
        }
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

    /// Same values and metadata with a replacement weight matrix, as produced by a
    /// calibration engine. The shape and the set of zero-weight entries must not change.
    pub fn with_weights(&self, weights: Array2<f64>) -> anyhow::Result<Self> {
        check_replacement_weights(&self.weights, &weights)?;
        let matrix = WeightedMatrix {
            values: self.values.clone(),
            weights,
            row_names: self.row_names.clone(),
            col_names: self.col_names.clone(),
        };
        matrix.validate()?;
        Ok(matrix)
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    fn validate(&self) -> anyhow::Result<()> {
        for ((i, j), &w) in self.weights.indexed_iter() {
            check_entry(i, j, Some(self.values[(i, j)]), w)?;
        }
        Ok(())
    }
}

impl MatrixView for WeightedMatrix {
    fn dims(&self) -> (usize, usize) {
        self.values.dim()
    }

    fn get(&self, i: usize, j: usize) -> (Option<f64>, f64) {
        let w = self.weights[(i, j)];
        let v = self.values[(i, j)];
        if v.is_nan() {
            (None, w)
        } else {
            (Some(v), w)
        }
    }

    fn row_metadata(&self) -> Option<&[String]> {
        self.row_names.as_deref()
    }

    fn col_metadata(&self) -> Option<&[String]> {
        self.col_names.as_deref()
    }
}

pub(crate) fn check_replacement_weights(
    current: &Array2<f64>,
    replacement: &Array2<f64>,
) -> anyhow::Result<()> {
    if current.dim() != replacement.dim() {
        return Err(ComponentError::CalibrationShape {
            got: replacement.dim(),
            expected: current.dim(),
        }
        .into());
    }
    for ((i, j), &w) in replacement.indexed_iter() {
        if (w > 0.0) != (current[(i, j)] > 0.0) {
            return Err(ComponentError::CalibrationPattern { row: i, col: j }.into());
        }
    }
    Ok(())
}

fn check_entry(i: usize, j: usize, value: Option<f64>, weight: f64) -> anyhow::Result<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(ComponentError::InvalidWeight {
            row: i,
            col: j,
            weight,
        }
        .into());
    }
    if weight > 0.0 && !value.is_some_and(f64::is_finite) {
        return Err(ComponentError::MissingWithWeight {
            row: i,
            col: j,
            weight,
        }
        .into());
    }
    Ok(())
}

/// Validated dense snapshot of a [`MatrixView`], the form the solver works on.
///
/// Every zero-weight entry holds the value `0.0`, whatever the view stored there.
#[derive(Debug, Clone)]
pub struct Observations {
    pub(crate) values: Array2<f64>,
    pub(crate) weights: Array2<f64>,
    pub(crate) row_names: Option<Vec<String>>,
    pub(crate) col_names: Option<Vec<String>>,
}

impl Observations {
    pub fn from_view<V: MatrixView + ?Sized>(view: &V) -> anyhow::Result<Self> {
        let (n, m) = view.dims();
        let mut values = Array2::zeros((n, m));
        let mut weights = Array2::zeros((n, m));

        for i in 0..n {
            for j in 0..m {
                let (value, weight) = view.get(i, j);
                check_entry(i, j, value, weight)?;
                if weight > 0.0 {
                    // check_entry guarantees a finite value here
                    values[(i, j)] = value.unwrap_or(0.0);
                    weights[(i, j)] = weight;
                }
            }
        }

        Ok(Observations {
            values,
            weights,
            row_names: view.row_metadata().map(<[String]>::to_vec),
            col_names: view.col_metadata().map(<[String]>::to_vec),
        })
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    /// Σ weight·value² over all observed entries.
    pub fn total_weighted_ss(&self) -> f64 {
        let per_row: Vec<f64> = self
            .values
            .axis_iter(Axis(0))
            .into_par_iter()
            .zip(self.weights.axis_iter(Axis(0)).into_par_iter())
            .map(|(y, w)| y.iter().zip(w.iter()).map(|(&y, &w)| w * y * y).sum::<f64>())
            .collect();
        // summed in row order so the result does not depend on the thread count
        per_row.iter().sum()
    }

    /// Mean weight of each sample across rows; the metric of the column inner product.
    pub fn column_weights(&self) -> Array1<f64> {
        if self.nrows() == 0 {
            return Array1::zeros(self.ncols());
        }
        self.weights
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.ncols()))
    }

    /// Number of positive weights in each row.
    pub fn observed_per_row(&self) -> Array1<usize> {
        self.weights
            .map_axis(Axis(1), |w| w.iter().filter(|&&w| w > 0.0).count())
    }
}
