use log::debug;
use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::dense::lstsq::{NormalEquations, Solution};
use crate::design::DesignConstraint;
use crate::error::ComponentError;
use crate::view::Observations;

use super::{ConvergenceStatus, Factorization};

/// An objective this small relative to the total weighted sum of squares is an exact fit.
const NEGLIGIBLE_OBJECTIVE: f64 = 1e-20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            max_iter: 100,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FitState {
    Determined,
    Underdetermined,
    Undefined,
}

/// Result of one alternating least-squares run, before rotation.
#[derive(Debug, Clone)]
pub struct SolverRun {
    pub factorization: Factorization,
    pub objective: f64,
    /// Weighted residual sum of squares per row, `NaN` for undefined rows.
    pub row_rss: Array1<f64>,
    pub status: ConvergenceStatus,
    pub iterations: usize,
    pub objective_trace: Vec<f64>,
    pub underdetermined_rows: Vec<usize>,
    pub underdetermined_cols: Vec<usize>,
    pub undefined_rows: Vec<usize>,
    pub undefined_cols: Vec<usize>,
}

/// Weighted alternating least squares for a fixed number of components.
#[derive(Clone, Copy)]
pub struct ComponentSolver<'a> {
    obs: &'a Observations,
    design: &'a DesignConstraint,
    options: SolverOptions,
}

impl<'a> ComponentSolver<'a> {
    pub fn new(
        obs: &'a Observations,
        design: &'a DesignConstraint,
        options: SolverOptions,
    ) -> anyhow::Result<Self> {
        design.check_samples(obs.ncols())?;
        Ok(ComponentSolver {
            obs,
            design,
            options,
        })
    }

    pub fn observations(&self) -> &'a Observations {
        self.obs
    }

    /// Weighted residual sum of squares left by the design alone.
    pub fn design_residual_ss(&self) -> anyhow::Result<f64> {
        let m = self.obs.ncols();
        Ok(self.solve(Array2::zeros((m, 0)).view())?.objective)
    }

    /// Runs the solver from `initial`, an m×p matrix of component scores.
    pub fn solve(&self, initial: ArrayView2<f64>) -> anyhow::Result<SolverRun> {
        let (n, m) = (self.obs.nrows(), self.obs.ncols());
        let k = self.design.k();
        let p = initial.ncols();
        if initial.nrows() != m {
            return Err(ComponentError::InitialScoresShape {
                got: initial.dim(),
                samples: m,
                rank: p,
            }
            .into());
        }

        let mut scores = concatenate(Axis(1), &[self.design.matrix().view(), initial.view()])?;
        let mut loadings = Array2::zeros((n, k + p));

        let mut row_states = self.row_step(&scores, &mut loadings)?;
        let mut col_states = self.structural_col_states(p);
        let mut row_rss = self.row_rss(&loadings, &scores);
        let mut objective = total(&row_rss);
        let mut trace = vec![objective];
        let floor = NEGLIGIBLE_OBJECTIVE * self.obs.total_weighted_ss();

        let mut status = ConvergenceStatus::Converged;
        let mut iterations = 0;

        if p > 0 && objective > floor {
            status = ConvergenceStatus::IterationLimit;
            let mut best = (loadings.clone(), scores.clone());

            for iter in 1..=self.options.max_iter {
                let new_col_states = self.col_step(&loadings, &mut scores)?;
                let new_row_states = self.row_step(&scores, &mut loadings)?;
                let new_rss = self.row_rss(&loadings, &scores);
                let new_objective = total(&new_rss);
                trace.push(new_objective);
                iterations = iter;

                let decrease = objective - new_objective;
                let relative = if objective > 0.0 {
                    decrease / objective
                } else {
                    0.0
                };
                debug!(
                    "Iteration {}: objective = {:.6e}, relative decrease = {:.3e}",
                    iter, new_objective, relative
                );

                if new_objective <= objective {
                    best = (loadings.clone(), scores.clone());
                    row_states = new_row_states;
                    col_states = new_col_states;
                    row_rss = new_rss;
                    objective = new_objective;
                }

                if relative < self.options.tolerance || new_objective <= floor {
                    status = ConvergenceStatus::Converged;
                    break;
                }
            }
            (loadings, scores) = best;
        }

        // Samples without observations have no component scores.
        for (j, state) in col_states.iter().enumerate() {
            if *state == FitState::Undefined {
                scores.slice_mut(s![j, k..]).fill(f64::NAN);
            }
        }

        Ok(SolverRun {
            factorization: Factorization {
                row_loadings: loadings,
                col_scores: scores,
                design_columns: k,
            },
            objective,
            row_rss,
            status,
            iterations,
            objective_trace: trace,
            underdetermined_rows: indices(&row_states, FitState::Underdetermined),
            underdetermined_cols: indices(&col_states, FitState::Underdetermined),
            undefined_rows: indices(&row_states, FitState::Undefined),
            undefined_cols: indices(&col_states, FitState::Undefined),
        })
    }

    /// Re-estimates every row of `loadings` against fixed `scores`.
    fn row_step(&self, scores: &Array2<f64>, loadings: &mut Array2<f64>) -> anyhow::Result<Vec<FitState>> {
        let q = scores.ncols();
        let values = &self.obs.values;
        let weights = &self.obs.weights;

        loadings
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(i, mut out)| -> anyhow::Result<FitState> {
                let mut eq = NormalEquations::new(q);
                for (j, &w) in weights.row(i).iter().enumerate() {
                    if w > 0.0 {
                        eq.add(scores.row(j), values[(i, j)], w);
                    }
                }
                Ok(store(eq.solve()?, &mut out))
            })
            .collect()
    }

    /// Re-estimates the component part of every row of `scores` against fixed
    /// `loadings`; the design part is left untouched.
    fn col_step(&self, loadings: &Array2<f64>, scores: &mut Array2<f64>) -> anyhow::Result<Vec<FitState>> {
        let k = self.design.k();
        let p = scores.ncols() - k;
        let values = &self.obs.values;
        let weights = &self.obs.weights;
        let design = self.design.matrix();

        scores
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(j, mut row)| -> anyhow::Result<FitState> {
                let mut eq = NormalEquations::new(p);
                let d = design.row(j);
                for (i, &w) in weights.column(j).iter().enumerate() {
                    if w > 0.0 {
                        let l = loadings.row(i);
                        let target = values[(i, j)] - l.slice(s![..k]).dot(&d);
                        eq.add(l.slice(s![k..]), target, w);
                    }
                }
                let mut out = row.slice_mut(s![k..]);
                Ok(store(eq.solve()?, &mut out))
            })
            .collect()
    }

    /// Weighted residual sum of squares of every row; `NaN` for rows without loadings.
    fn row_rss(&self, loadings: &Array2<f64>, scores: &Array2<f64>) -> Array1<f64> {
        let values = &self.obs.values;
        let weights = &self.obs.weights;
        let rss: Vec<f64> = (0..self.obs.nrows())
            .into_par_iter()
            .map(|i| {
                let l = loadings.row(i);
                if l.iter().any(|v| v.is_nan()) {
                    return f64::NAN;
                }
                weights
                    .row(i)
                    .iter()
                    .enumerate()
                    .filter(|(_, &w)| w > 0.0)
                    .map(|(j, &w)| {
                        let r = values[(i, j)] - l.dot(&scores.row(j));
                        w * r * r
                    })
                    .sum()
            })
            .collect();
        Array1::from(rss)
    }

    /// Column states implied by the weights alone, before any column step has run.
    fn structural_col_states(&self, p: usize) -> Vec<FitState> {
        if p == 0 {
            return Vec::new();
        }
        self.obs
            .weights
            .axis_iter(Axis(1))
            .map(|w| match w.iter().filter(|&&w| w > 0.0).count() {
                0 => FitState::Undefined,
                c if c < p => FitState::Underdetermined,
                _ => FitState::Determined,
            })
            .collect()
    }
}

fn store(solution: Solution, out: &mut ndarray::ArrayViewMut1<f64>) -> FitState {
    match solution {
        Solution::Undefined => {
            out.fill(f64::NAN);
            FitState::Undefined
        }
        Solution::Solved { coef, determined } => {
            out.assign(&coef);
            if determined {
                FitState::Determined
            } else {
                FitState::Underdetermined
            }
        }
    }
}

/// Sum of the defined entries, accumulated in index order.
fn total(rss: &Array1<f64>) -> f64 {
    rss.iter().filter(|v| !v.is_nan()).sum()
}

fn indices(states: &[FitState], wanted: FitState) -> Vec<usize> {
    states
        .iter()
        .enumerate()
        .filter(|(_, &s)| s == wanted)
        .map(|(i, _)| i)
        .collect()
}
