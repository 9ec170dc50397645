//! Hand-off points to the engines that consume a fit: variance calibration, which turns
//! residuals into new weights, and effect ranking, which needs one loading column with
//! its per-row uncertainty.

use log::info;
use ndarray::{Array1, Array2};

use crate::error::ComponentError;
use crate::view::{MatrixView, Observations, WeightedMatrix};

use super::Components;

/// Residuals of a fit on the entries it was fitted to.
#[derive(Debug, Clone)]
pub struct Residuals {
    /// `value - fitted`, `NaN` wherever the weight is zero.
    pub residuals: Array2<f64>,
    pub weights: Array2<f64>,
}

/// An engine that derives replacement weights from residuals, typically by fitting a
/// mean-variance trend.
pub trait WeightCalibration {
    fn calibrate(&self, residuals: &Residuals) -> anyhow::Result<Array2<f64>>;
}

/// Per-row inputs of an effect ranking for one column of the row loadings.
#[derive(Debug, Clone)]
pub struct EffectInputs {
    pub effect: Array1<f64>,
    pub residual_variance: Array1<f64>,
    pub degrees_of_freedom: Array1<usize>,
    pub row_names: Option<Vec<String>>,
}

impl Components {
    pub fn residuals<V: MatrixView + ?Sized>(&self, view: &V) -> anyhow::Result<Residuals> {
        let obs = Observations::from_view(view)?;
        let expected = (
            self.factorization.row_loadings.nrows(),
            self.factorization.col_scores.nrows(),
        );
        if obs.values.dim() != expected {
            return Err(ComponentError::CalibrationShape {
                got: obs.values.dim(),
                expected,
            }
            .into());
        }

        let fitted = self.factorization.fitted();
        let residuals = Array2::from_shape_fn(expected, |(i, j)| {
            if obs.weights[(i, j)] > 0.0 {
                obs.values[(i, j)] - fitted[(i, j)]
            } else {
                f64::NAN
            }
        });
        Ok(Residuals {
            residuals,
            weights: obs.weights,
        })
    }

    /// Inputs for ranking rows by column `column` of the row loadings; design columns
    /// come first, followed by the discovered components.
    pub fn effect_inputs(&self, column: usize) -> anyhow::Result<EffectInputs> {
        let columns = self.factorization.row_loadings.ncols();
        if column >= columns {
            return Err(ComponentError::ColumnOutOfRange { column, columns }.into());
        }
        Ok(EffectInputs {
            effect: self.factorization.row_loadings.column(column).to_owned(),
            residual_variance: self.residual_variance.clone(),
            degrees_of_freedom: self.degrees_of_freedom.clone(),
            row_names: self.row_names.clone(),
        })
    }
}

/// Computes the residuals of `result` on `matrix`, asks `engine` for new weights, and
/// returns `matrix` with those weights once they pass validation.
pub fn recalibrate<E: WeightCalibration + ?Sized>(
    matrix: &WeightedMatrix,
    result: &Components,
    engine: &E,
) -> anyhow::Result<WeightedMatrix> {
    let residuals = result.residuals(matrix)?;
    let weights = engine.calibrate(&residuals)?;
    let recalibrated = matrix.with_weights(weights)?;
    info!("Replaced weights of a {:?} matrix", recalibrated.weights().dim());
    Ok(recalibrated)
}
