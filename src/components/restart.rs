use log::{debug, info};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{concatenate, Array2, Axis};
use nshare::IntoNalgebra;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::error::ComponentError;

use super::solver::{ComponentSolver, SolverRun};

/// Runs whose objectives differ by less than this fraction count as tied.
const TIE_TOLERANCE: f64 = 1e-12;

/// Starting point of the component scores.
#[derive(Debug, Clone, PartialEq)]
pub enum Initialization {
    /// Weighted SVD of the design residuals for a single restart, random otherwise.
    Canonical,
    /// Standard normal scores for every restart.
    Random,
    /// Leading score columns to keep (m × r, r ≤ p); the remaining columns are drawn
    /// at random for every restart.
    WarmStart(Array2<f64>),
}

/// The selected run and the final objective of every restart.
#[derive(Debug, Clone)]
pub struct RestartOutcome {
    pub best: SolverRun,
    pub selected: usize,
    pub objectives: Vec<f64>,
}

pub struct RestartScheduler<'a> {
    solver: ComponentSolver<'a>,
    rank: usize,
    restarts: usize,
    seed: u64,
}

impl<'a> RestartScheduler<'a> {
    pub fn new(
        solver: ComponentSolver<'a>,
        rank: usize,
        restarts: usize,
        seed: u64,
    ) -> anyhow::Result<Self> {
        if restarts == 0 {
            return Err(ComponentError::NoRestarts.into());
        }
        Ok(RestartScheduler {
            solver,
            rank,
            restarts,
            seed,
        })
    }

    pub fn run(&self, init: &Initialization) -> anyhow::Result<RestartOutcome> {
        let m = self.solver.observations().ncols();
        if let Initialization::WarmStart(warm) = init {
            if warm.nrows() != m || warm.ncols() > self.rank {
                return Err(ComponentError::InitialScoresShape {
                    got: warm.dim(),
                    samples: m,
                    rank: self.rank,
                }
                .into());
            }
        }

        // A rank-0 fit is closed form; further restarts would repeat it.
        let restarts = if self.rank == 0 { 1 } else { self.restarts };

        let runs = (0..restarts)
            .into_par_iter()
            .map(|r| -> anyhow::Result<SolverRun> {
                let initial = self.initial_scores(init, r)?;
                let run = self.solver.solve(initial.view())?;
                debug!(
                    "Restart {}: objective = {:.6e} after {} iterations",
                    r, run.objective, run.iterations
                );
                Ok(run)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let objectives: Vec<f64> = runs.iter().map(|run| run.objective).collect();
        let selected = select_best(&objectives);
        info!(
            "Selected restart {} of {} for rank {} (objective {:.6e})",
            selected,
            restarts,
            self.rank,
            objectives[selected]
        );

        let best = runs
            .into_iter()
            .nth(selected)
            .ok_or_else(|| anyhow::anyhow!("No restart produced a result"))?;

        Ok(RestartOutcome {
            best,
            selected,
            objectives,
        })
    }

    fn initial_scores(&self, init: &Initialization, restart: usize) -> anyhow::Result<Array2<f64>> {
        let m = self.solver.observations().ncols();
        match init {
            Initialization::Canonical if self.restarts == 1 => self.svd_scores(),
            Initialization::Canonical | Initialization::Random => {
                Ok(self.random_scores(restart, m, self.rank))
            }
            Initialization::WarmStart(warm) => {
                let extra = self.random_scores(restart, m, self.rank - warm.ncols());
                Ok(concatenate(Axis(1), &[warm.view(), extra.view()])?)
            }
        }
    }

    /// Standard normal draws from a stream that depends only on the seed, the rank
    /// and the restart index.
    fn random_scores(&self, restart: usize, rows: usize, cols: usize) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(((self.rank as u64) << 32) | restart as u64);
        Array2::from_shape_fn((rows, cols), |_| rng.sample(StandardNormal))
    }

    /// Top right singular vectors of the weighted residuals of the design-only fit.
    fn svd_scores(&self) -> anyhow::Result<Array2<f64>> {
        let obs = self.solver.observations();
        let m = obs.ncols();
        if self.rank == 0 {
            return Ok(Array2::zeros((m, 0)));
        }

        let baseline = self.solver.solve(Array2::zeros((m, 0)).view())?;
        let fitted = baseline.factorization.fitted();
        let mut residual = Array2::zeros(obs.values.dim());
        for ((i, j), &w) in obs.weights.indexed_iter() {
            if w > 0.0 {
                residual[(i, j)] = w.sqrt() * (obs.values[(i, j)] - fitted[(i, j)]);
            }
        }

        let gram = residual.t().dot(&residual);
        let gram: DMatrix<f64> = gram.view().into_nalgebra().clone_owned();
        let eigen = SymmetricEigen::new(gram);

        let mut order: Vec<usize> = (0..m).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .partial_cmp(&eigen.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(Array2::from_shape_fn((m, self.rank), |(j, c)| {
            eigen.eigenvectors[(j, order[c])]
        }))
    }
}

/// Index of the lowest objective; near-ties go to the earliest restart.
fn select_best(objectives: &[f64]) -> usize {
    let mut best = 0;
    for (r, &obj) in objectives.iter().enumerate().skip(1) {
        let current = objectives[best];
        if obj < current - TIE_TOLERANCE * current.abs() {
            best = r;
        }
    }
    best
}
