//! # Components of variation
//!
//! Weighted low-rank factorization of a [`MatrixView`] alongside a fixed
//! [`DesignConstraint`]. The fitted value of entry `(i, j)` is
//! `row_loadings[i, :] · col_scores[j, :]`, where the first `k` columns of the column
//! scores are the design and the remaining `p` are discovered components.
//!
//! The pipeline is: [`restart::RestartScheduler`] runs [`solver::ComponentSolver`]
//! from one or more initializations, the best run is passed through
//! [`rotation::rotate`], and the result is assembled into [`Components`].
//! [`sequence::SequenceBuilder`] repeats this for ranks `0..=p` with warm starts.
//!
//! ```no_run
//! use single_components::components::ComponentsBuilder;
//! use single_components::{DesignConstraint, WeightedMatrix};
//! # fn main() -> anyhow::Result<()> {
//! # let values = ndarray::Array2::<f64>::zeros((10, 4));
//! let matrix = WeightedMatrix::from_values(values);
//! let design = DesignConstraint::intercept(4);
//! let config = ComponentsBuilder::new().rank(2).restarts(3).seed(1).build();
//! let comp = config.fit(&matrix, &design)?;
//! println!("R² = {}", comp.r_squared());
//! # Ok(())
//! # }
//! ```

use log::{info, warn};
use ndarray::{s, Array1, Array2, ArrayView2};

use crate::design::DesignConstraint;
use crate::error::ComponentError;
use crate::utils;
use crate::view::{MatrixView, Observations};

pub mod interface;
pub mod restart;
pub mod rotation;
pub mod sequence;
pub mod solver;

use restart::{Initialization, RestartScheduler};
use rotation::RotationMethod;
use sequence::{ComponentSequence, SequenceBuilder};
use solver::{ComponentSolver, SolverOptions, SolverRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Relative decrease of the objective fell below the tolerance.
    Converged,
    /// Stopped at the iteration cap while the objective was still decreasing.
    IterationLimit,
}

/// Options of a component fit.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentsConfig {
    /// Number of discovered components `p`.
    pub rank: usize,
    /// Number of solver runs; with one restart the initialization is the top-`p`
    /// weighted SVD of the design residuals, otherwise every restart is random.
    pub restarts: usize,
    pub max_iter: usize,
    /// Relative objective decrease below which a run counts as converged.
    pub tolerance: f64,
    pub seed: u64,
    /// Worker threads; `None` uses the global rayon pool.
    pub threads: Option<usize>,
    pub rotation: RotationMethod,
}

impl Default for ComponentsConfig {
    fn default() -> Self {
        ComponentsConfig {
            rank: 1,
            restarts: 1,
            max_iter: 100,
            tolerance: 1e-6,
            seed: 42,
            threads: None,
            rotation: RotationMethod::default(),
        }
    }
}

pub struct ComponentsBuilder {
    config: ComponentsConfig,
}

impl Default for ComponentsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentsBuilder {
    pub fn new() -> Self {
        ComponentsBuilder {
            config: ComponentsConfig::default(),
        }
    }

    pub fn rank(mut self, rank: usize) -> Self {
        self.config.rank = rank;
        self
    }

    pub fn restarts(mut self, restarts: usize) -> Self {
        self.config.restarts = restarts;
        self
    }

    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.config.max_iter = max_iter;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.config.tolerance = tolerance;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = Some(threads);
        self
    }

    pub fn rotation(mut self, rotation: RotationMethod) -> Self {
        self.config.rotation = rotation;
        self
    }

    pub fn build(self) -> ComponentsConfig {
        self.config
    }
}

impl ComponentsConfig {
    pub(crate) fn solver_options(&self) -> SolverOptions {
        SolverOptions {
            max_iter: self.max_iter,
            tolerance: self.tolerance,
        }
    }

    /// Fits `self.rank` components.
    pub fn fit<V: MatrixView + ?Sized>(
        &self,
        view: &V,
        design: &DesignConstraint,
    ) -> anyhow::Result<Components> {
        let obs = Observations::from_view(view)?;
        design.check_samples(obs.ncols())?;
        utils::install(self.threads, || {
            fit_observations(&obs, design, self, self.rank, &Initialization::Canonical)
        })?
    }

    /// Fits every rank from 0 to `self.rank`, each warm-started from the previous one.
    pub fn fit_sequence<V: MatrixView + ?Sized>(
        &self,
        view: &V,
        design: &DesignConstraint,
    ) -> anyhow::Result<ComponentSequence> {
        let obs = Observations::from_view(view)?;
        design.check_samples(obs.ncols())?;
        utils::install(self.threads, || {
            SequenceBuilder::new(self).build(&obs, design, self.rank)
        })?
    }
}

/// Checks that `rank` components plus the design fit within the data dimensions.
pub(crate) fn check_rank(obs: &Observations, design: &DesignConstraint, rank: usize) -> anyhow::Result<()> {
    let max = obs.nrows().min(obs.ncols());
    if rank > 0 && design.k() + rank > max {
        return Err(ComponentError::RankInfeasible {
            rank,
            design: design.k(),
            max: max.saturating_sub(design.k()),
        }
        .into());
    }
    Ok(())
}

pub(crate) fn fit_observations(
    obs: &Observations,
    design: &DesignConstraint,
    config: &ComponentsConfig,
    rank: usize,
    init: &Initialization,
) -> anyhow::Result<Components> {
    check_rank(obs, design, rank)?;
    let solver = ComponentSolver::new(obs, design, config.solver_options())?;
    let scheduler = RestartScheduler::new(solver, rank, config.restarts, config.seed)?;
    let outcome = scheduler.run(init)?;
    let residual_ss = if rank > 0 {
        solver.design_residual_ss()?
    } else {
        0.0
    };
    let rotated = rotation::rotate(
        obs,
        design,
        &outcome.best.factorization,
        config.rotation,
        residual_ss,
    )?;

    let mut diagnostics = Diagnostics::from_run(&outcome.best);
    diagnostics.restart_objectives = outcome.objectives;
    diagnostics.selected_restart = outcome.selected;

    if diagnostics.status == ConvergenceStatus::IterationLimit {
        warn!(
            "Rank {} fit stopped at the iteration cap ({} iterations)",
            rank, diagnostics.iterations
        );
    }
    if !diagnostics.underdetermined_rows.is_empty() || !diagnostics.underdetermined_cols.is_empty() {
        warn!(
            "{} rows and {} columns were under-determined",
            diagnostics.underdetermined_rows.len(),
            diagnostics.underdetermined_cols.len()
        );
    }

    Ok(Components::assemble(
        obs,
        rotated.factorization,
        rotated.component_ss,
        &outcome.best,
        diagnostics,
    ))
}

/// Row loadings and column scores. Undefined entries are `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct Factorization {
    pub(crate) row_loadings: Array2<f64>,
    pub(crate) col_scores: Array2<f64>,
    pub(crate) design_columns: usize,
}

impl Factorization {
    pub fn row_loadings(&self) -> &Array2<f64> {
        &self.row_loadings
    }

    pub fn col_scores(&self) -> &Array2<f64> {
        &self.col_scores
    }

    /// Number of design columns `k`.
    pub fn k(&self) -> usize {
        self.design_columns
    }

    /// Number of discovered components `p`.
    pub fn p(&self) -> usize {
        self.col_scores.ncols() - self.design_columns
    }

    pub fn component_loadings(&self) -> ArrayView2<'_, f64> {
        self.row_loadings.slice(s![.., self.design_columns..])
    }

    pub fn component_scores(&self) -> ArrayView2<'_, f64> {
        self.col_scores.slice(s![.., self.design_columns..])
    }

    pub fn design_loadings(&self) -> ArrayView2<'_, f64> {
        self.row_loadings.slice(s![.., ..self.design_columns])
    }

    /// n×m matrix of fitted values.
    pub fn fitted(&self) -> Array2<f64> {
        self.row_loadings.dot(&self.col_scores.t())
    }
}

/// Recoverable conditions met during a fit.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub status: ConvergenceStatus,
    pub iterations: usize,
    /// Objective after the initial row step and after every iteration.
    pub objective_trace: Vec<f64>,
    /// Rows fitted with a minimum-norm solution.
    pub underdetermined_rows: Vec<usize>,
    pub underdetermined_cols: Vec<usize>,
    /// Rows with no positive weight; their loadings are `NaN`.
    pub undefined_rows: Vec<usize>,
    /// Samples with no positive weight; their component scores are `NaN`.
    pub undefined_cols: Vec<usize>,
    pub restart_objectives: Vec<f64>,
    pub selected_restart: usize,
}

impl Diagnostics {
    fn from_run(run: &SolverRun) -> Self {
        Diagnostics {
            status: run.status,
            iterations: run.iterations,
            objective_trace: run.objective_trace.clone(),
            underdetermined_rows: run.underdetermined_rows.clone(),
            underdetermined_cols: run.underdetermined_cols.clone(),
            undefined_rows: run.undefined_rows.clone(),
            undefined_cols: run.undefined_cols.clone(),
            restart_objectives: vec![run.objective],
            selected_restart: 0,
        }
    }
}

/// A fitted, rotated set of components together with the per-row quantities needed
/// by downstream calibration and ranking.
#[derive(Debug, Clone)]
pub struct Components {
    factorization: Factorization,
    objective: f64,
    total_weighted_ss: f64,
    component_ss: Array1<f64>,
    residual_variance: Array1<f64>,
    degrees_of_freedom: Array1<usize>,
    row_names: Option<Vec<String>>,
    col_names: Option<Vec<String>>,
    diagnostics: Diagnostics,
}

impl Components {
    fn assemble(
        obs: &Observations,
        factorization: Factorization,
        component_ss: Array1<f64>,
        run: &SolverRun,
        diagnostics: Diagnostics,
    ) -> Self {
        let parameters = factorization.k() + factorization.p();
        let degrees_of_freedom = obs
            .observed_per_row()
            .mapv(|observed| observed.saturating_sub(parameters));
        let residual_variance = Array1::from_shape_fn(obs.nrows(), |i| {
            let df = degrees_of_freedom[i];
            if df == 0 || run.row_rss[i].is_nan() {
                f64::NAN
            } else {
                run.row_rss[i] / df as f64
            }
        });

        info!(
            "Fitted {} components with {} design columns, objective {:.6e}",
            factorization.p(),
            factorization.k(),
            run.objective
        );

        Components {
            factorization,
            objective: run.objective,
            total_weighted_ss: obs.total_weighted_ss(),
            component_ss,
            residual_variance,
            degrees_of_freedom,
            row_names: obs.row_names.clone(),
            col_names: obs.col_names.clone(),
            diagnostics,
        }
    }

    pub fn factorization(&self) -> &Factorization {
        &self.factorization
    }

    pub fn rank(&self) -> usize {
        self.factorization.p()
    }

    /// Weighted residual sum of squares of the fit.
    pub fn objective(&self) -> f64 {
        self.objective
    }

    pub fn total_weighted_ss(&self) -> f64 {
        self.total_weighted_ss
    }

    /// Share of the total weighted sum of squares (about zero) explained by design and
    /// components together.
    pub fn r_squared(&self) -> f64 {
        if self.total_weighted_ss > 0.0 {
            1.0 - self.objective / self.total_weighted_ss
        } else {
            0.0
        }
    }

    /// Weighted sum of squares carried by each discovered component, in the column
    /// metric; non-increasing.
    pub fn component_ss(&self) -> &Array1<f64> {
        &self.component_ss
    }

    pub fn residual_variance(&self) -> &Array1<f64> {
        &self.residual_variance
    }

    pub fn degrees_of_freedom(&self) -> &Array1<usize> {
        &self.degrees_of_freedom
    }

    pub fn row_names(&self) -> Option<&[String]> {
        self.row_names.as_deref()
    }

    pub fn col_names(&self) -> Option<&[String]> {
        self.col_names.as_deref()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn status(&self) -> ConvergenceStatus {
        self.diagnostics.status
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use ndarray::Array2;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rand_distr::StandardNormal;

    pub(crate) fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    pub(crate) fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.sample(StandardNormal))
    }

    /// `loadings · scoresᵀ` with Gaussian factors, plus Gaussian noise of scale `noise`.
    pub(crate) fn low_rank(
        rows: usize,
        cols: usize,
        rank: usize,
        noise: f64,
        seed: u64,
    ) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let loadings = random_matrix(rows, rank, seed);
        let scores = random_matrix(cols, rank, seed.wrapping_add(1));
        let eps = random_matrix(rows, cols, seed.wrapping_add(2));
        let values = loadings.dot(&scores.t()) + eps * noise;
        (values, loadings, scores)
    }
}
