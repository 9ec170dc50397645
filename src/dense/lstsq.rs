use anyhow::anyhow;
use nalgebra::{DMatrix, DVector, SVD};
use ndarray::{Array1, ArrayView1};

/// Singular values of the normal matrix below this fraction of the largest one are
/// treated as zero.
const RELATIVE_RANK_TOLERANCE: f64 = 1e-12;

/// Outcome of one small weighted least-squares solve.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Solution {
    /// No observation carried positive weight.
    Undefined,
    /// Coefficients, with `determined == false` when fewer observations than
    /// parameters were available or the system was rank deficient. In that case the
    /// coefficients are the minimum-norm solution.
    Solved { coef: Array1<f64>, determined: bool },
}

/// Accumulates XᵀWX and XᵀWy one observation at a time.
#[derive(Debug, Clone)]
pub(crate) struct NormalEquations {
    gram: DMatrix<f64>,
    rhs: DVector<f64>,
    observed: usize,
}

impl NormalEquations {
    pub(crate) fn new(parameters: usize) -> Self {
        NormalEquations {
            gram: DMatrix::zeros(parameters, parameters),
            rhs: DVector::zeros(parameters),
            observed: 0,
        }
    }

    fn parameters(&self) -> usize {
        self.rhs.len()
    }

    /// Adds one observation `y` with predictors `x` and weight `w > 0`.
    pub(crate) fn add(&mut self, x: ArrayView1<f64>, y: f64, w: f64) {
        let q = self.parameters();
        for a in 0..q {
            let wxa = w * x[a];
            self.rhs[a] += wxa * y;
            for b in 0..=a {
                self.gram[(a, b)] += wxa * x[b];
            }
        }
        self.observed += 1;
    }

    pub(crate) fn solve(mut self) -> anyhow::Result<Solution> {
        if self.observed == 0 {
            return Ok(Solution::Undefined);
        }
        let q = self.parameters();
        if q == 0 {
            return Ok(Solution::Solved {
                coef: Array1::zeros(0),
                determined: true,
            });
        }

        for a in 0..q {
            for b in (a + 1)..q {
                self.gram[(a, b)] = self.gram[(b, a)];
            }
        }

        let svd = SVD::new(self.gram, true, true);
        let eps = svd.singular_values.max() * RELATIVE_RANK_TOLERANCE;
        let rank = svd.rank(eps);
        let coef = svd
            .solve(&self.rhs, eps)
            .map_err(|e| anyhow!("Least-squares solve failed: {}", e))?;

        Ok(Solution::Solved {
            coef: Array1::from_iter(coef.iter().copied()),
            determined: self.observed >= q && rank == q,
        })
    }
}
