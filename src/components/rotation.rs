use anyhow::anyhow;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2};

use crate::design::DesignConstraint;
use crate::error::ComponentError;
use crate::view::Observations;

use super::Factorization;

/// A component carrying less than this fraction of the weighted sum of squares left by
/// the design is taken to be beyond the rank of the data.
const DEGENERATE_COMPONENT: f64 = 1e-10;
const RANK_TOLERANCE: f64 = 1e-12;
const VARIMAX_MAX_ITER: usize = 1000;
const VARIMAX_TOLERANCE: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationMethod {
    /// Components ordered by explained weighted sum of squares, like principal axes.
    #[default]
    Principal,
    /// Principal axes followed by a varimax rotation of the component loadings.
    Varimax,
}

#[derive(Debug, Clone)]
pub struct Rotated {
    pub factorization: Factorization,
    /// Weighted sum of squares carried by each component, non-increasing.
    pub component_ss: Array1<f64>,
}

/// Re-expresses a factorization in a canonical basis with identical fitted values.
///
/// Component scores are made orthonormal, and orthogonal to the design, under the
/// column inner product `⟨a, b⟩ = Σ_j c_j a_j b_j` where `c_j` is the mean weight of
/// sample `j`. Components are sorted by explained sum of squares and signed so that
/// the largest loading of each is positive.
///
/// `residual_ss` is the weighted residual sum of squares of the design-only fit; a
/// component explaining a negligible share of it makes the rank infeasible.
pub fn rotate(
    obs: &Observations,
    design: &DesignConstraint,
    factorization: &Factorization,
    method: RotationMethod,
    residual_ss: f64,
) -> anyhow::Result<Rotated> {
    let k = factorization.k();
    let p = factorization.p();
    if p == 0 {
        return Ok(Rotated {
            factorization: factorization.clone(),
            component_ss: Array1::zeros(0),
        });
    }

    let (n, m) = (obs.nrows(), obs.ncols());
    let metric = obs.column_weights();
    let loadings = factorization.row_loadings();
    let scores = factorization.col_scores();
    let design = design.matrix();

    let cols: Vec<usize> = (0..m)
        .filter(|&j| metric[j] > 0.0 && scores.row(j).iter().all(|v| v.is_finite()))
        .collect();
    let rows: Vec<usize> = (0..n)
        .filter(|&i| loadings.row(i).iter().all(|v| v.is_finite()))
        .collect();
    if cols.len() < k + p {
        return Err(ComponentError::RankInfeasible {
            rank: p,
            design: k,
            max: cols.len().saturating_sub(k),
        }
        .into());
    }

    let sqrt_metric: Vec<f64> = cols.iter().map(|&j| metric[j].sqrt()).collect();
    let dw = DMatrix::from_fn(cols.len(), k, |a, c| sqrt_metric[a] * design[(cols[a], c)]);
    let cw = DMatrix::from_fn(cols.len(), p, |a, c| {
        sqrt_metric[a] * scores[(cols[a], k + c)]
    });

    // Remove the design part of the component scores; the design loadings absorb it.
    let projection = if k > 0 {
        let svd = dw.clone().svd(true, true);
        let eps = svd.singular_values.max() * RANK_TOLERANCE;
        svd.solve(&cw, eps)
            .map_err(|e| anyhow!("Projection on the design failed: {}", e))?
    } else {
        DMatrix::zeros(0, p)
    };
    let residual_scores = &cw - &dw * &projection;

    let qr = residual_scores.qr();
    let q = qr.q();
    let r = qr.r();

    let lc = DMatrix::from_fn(rows.len(), p, |a, c| loadings[(rows[a], k + c)]);
    let ld = DMatrix::from_fn(rows.len(), k, |a, c| loadings[(rows[a], c)]);
    let coupled = &lc * r.transpose();

    let eigen = SymmetricEigen::new(coupled.transpose() * &coupled);
    let order = descending(eigen.eigenvalues.as_slice());
    let smallest = eigen.eigenvalues[order[p - 1]];
    if smallest <= DEGENERATE_COMPONENT * residual_ss {
        return Err(ComponentError::RankInfeasible {
            rank: p,
            design: k,
            max: p - 1,
        }
        .into());
    }
    let basis = DMatrix::from_fn(p, p, |i, c| eigen.eigenvectors[(i, order[c])]);

    let mut new_lc = &coupled * &basis;
    let mut new_cw = &q * &basis;

    if method == RotationMethod::Varimax && p > 1 {
        let t = varimax(&new_lc)?;
        new_lc = &new_lc * &t;
        new_cw = &new_cw * &t;
    }

    let ss: Vec<f64> = (0..p).map(|c| new_lc.column(c).norm_squared()).collect();
    let order = descending(&ss);

    let new_ld = ld + &lc * projection.transpose();

    let mut row_loadings = Array2::from_elem((n, k + p), f64::NAN);
    for (a, &i) in rows.iter().enumerate() {
        for c in 0..k {
            row_loadings[(i, c)] = new_ld[(a, c)];
        }
        for (c, &src) in order.iter().enumerate() {
            row_loadings[(i, k + c)] = new_lc[(a, src)];
        }
    }

    let mut col_scores = Array2::from_elem((m, k + p), f64::NAN);
    for j in 0..m {
        for c in 0..k {
            col_scores[(j, c)] = design[(j, c)];
        }
    }
    for (a, &j) in cols.iter().enumerate() {
        for (c, &src) in order.iter().enumerate() {
            col_scores[(j, k + c)] = new_cw[(a, src)] / sqrt_metric[a];
        }
    }

    for c in k..(k + p) {
        if leading_sign(&row_loadings, c) < 0.0 {
            row_loadings.column_mut(c).mapv_inplace(|v| -v);
            col_scores.column_mut(c).mapv_inplace(|v| -v);
        }
    }

    Ok(Rotated {
        factorization: Factorization {
            row_loadings,
            col_scores,
            design_columns: k,
        },
        component_ss: order.iter().map(|&c| ss[c]).collect(),
    })
}

/// Indices that sort `values` in descending order; stable for equal values.
fn descending(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

/// Sign of the entry of largest magnitude in column `c`, ignoring undefined rows.
fn leading_sign(loadings: &Array2<f64>, c: usize) -> f64 {
    let mut best = 0.0f64;
    for &v in loadings.column(c).iter() {
        if v.is_finite() && v.abs() > best.abs() {
            best = v;
        }
    }
    if best < 0.0 {
        -1.0
    } else {
        1.0
    }
}

/// Orthogonal rotation maximizing the varimax criterion of `x` (rows × components).
fn varimax(x: &DMatrix<f64>) -> anyhow::Result<DMatrix<f64>> {
    let (n, p) = x.shape();
    let mut t = DMatrix::identity(p, p);
    if n == 0 {
        return Ok(t);
    }

    let mut criterion = 0.0;
    for _ in 0..VARIMAX_MAX_ITER {
        let z = x * &t;
        let col_ss: Vec<f64> = (0..p).map(|c| z.column(c).norm_squared()).collect();
        let target = DMatrix::from_fn(n, p, |i, c| {
            z[(i, c)].powi(3) - z[(i, c)] * col_ss[c] / n as f64
        });
        let svd = (x.transpose() * target).svd(true, true);
        let u = svd.u.ok_or_else(|| anyhow!("Varimax SVD did not produce U"))?;
        let v_t = svd.v_t.ok_or_else(|| anyhow!("Varimax SVD did not produce V^T"))?;
        t = u * v_t;

        let previous = criterion;
        criterion = svd.singular_values.sum();
        if criterion < previous * (1.0 + VARIMAX_TOLERANCE) {
            break;
        }
    }
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::solver::{ComponentSolver, SolverOptions};
    use crate::components::test_support::*;
    use crate::view::WeightedMatrix;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, s};

    fn objective(obs: &Observations, f: &Factorization) -> f64 {
        let fitted = f.fitted();
        let mut total = 0.0;
        for ((i, j), &w) in obs.weights().indexed_iter() {
            if w > 0.0 {
                total += w * (obs.values()[(i, j)] - fitted[(i, j)]).powi(2);
            }
        }
        total
    }

    fn design_residual_ss(obs: &Observations, design: &DesignConstraint) -> f64 {
        let solver = ComponentSolver::new(obs, design, SolverOptions::default()).unwrap();
        solver.design_residual_ss().unwrap()
    }

    fn fitted_run(seed: u64) -> (Observations, DesignConstraint, Factorization) {
        let (values, _, _) = low_rank(14, 9, 3, 0.4, seed);
        let mut weights = random_matrix(14, 9, seed + 10).mapv(|v| 0.5 + v.abs());
        weights[(3, 4)] = 0.0;
        weights[(8, 1)] = 0.0;
        let obs = Observations::from_view(&WeightedMatrix::new(values, weights).unwrap()).unwrap();
        let design = DesignConstraint::new(Array2::from_shape_fn((9, 2), |(j, c)| {
            if c == 0 {
                1.0
            } else {
                j as f64
            }
        }))
        .unwrap();
        let solver = ComponentSolver::new(&obs, &design, SolverOptions::default()).unwrap();
        let run = solver.solve(random_matrix(9, 2, seed + 20).view()).unwrap();
        (obs, design, run.factorization)
    }

    fn check_canonical(obs: &Observations, design: &DesignConstraint, rotated: &Rotated) {
        let f = &rotated.factorization;
        let metric = obs.column_weights();
        let c = f.component_scores();
        let d = design.matrix();

        // orthonormal components, orthogonal to the design
        for a in 0..f.p() {
            for b in 0..f.p() {
                let inner: f64 = (0..obs.ncols()).map(|j| metric[j] * c[(j, a)] * c[(j, b)]).sum();
                let expected = if a == b { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(inner, expected, epsilon = 1e-8);
            }
            for e in 0..design.k() {
                let inner: f64 = (0..obs.ncols()).map(|j| metric[j] * c[(j, a)] * d[(j, e)]).sum();
                assert_abs_diff_eq!(inner, 0.0, epsilon = 1e-8);
            }
        }

        for pair in rotated.component_ss.to_vec().windows(2) {
            assert!(pair[0] >= pair[1]);
        }

        for col in f.component_loadings().columns() {
            let largest = col.iter().cloned().fold(0.0f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
            assert!(largest > 0.0);
        }

        assert_eq!(f.col_scores().slice(s![.., ..design.k()]), design.matrix());
    }

    #[test]
    fn test_rotation_preserves_fit() -> anyhow::Result<()> {
        let (obs, design, f) = fitted_run(1);
        let before = objective(&obs, &f);

        let rss = design_residual_ss(&obs, &design);
        let rotated = rotate(&obs, &design, &f, RotationMethod::Principal, rss)?;
        let after = objective(&obs, &rotated.factorization);
        assert_abs_diff_eq!(before, after, epsilon = 1e-8 * before.max(1.0));

        let (a, b) = (f.fitted(), rotated.factorization.fitted());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-8);
        }
        check_canonical(&obs, &design, &rotated);
        Ok(())
    }

    #[test]
    fn test_varimax_preserves_fit() -> anyhow::Result<()> {
        let (obs, design, f) = fitted_run(2);
        let before = objective(&obs, &f);

        let rss = design_residual_ss(&obs, &design);
        let rotated = rotate(&obs, &design, &f, RotationMethod::Varimax, rss)?;
        let after = objective(&obs, &rotated.factorization);
        assert_abs_diff_eq!(before, after, epsilon = 1e-8 * before.max(1.0));
        check_canonical(&obs, &design, &rotated);
        Ok(())
    }

    #[test]
    fn test_equivalent_bases_give_same_rotation() -> anyhow::Result<()> {
        let (obs, design, f) = fitted_run(3);

        // scores C·M with loadings L·M⁻ᵀ describe the same fit
        let mix = array![[2.0, 1.0], [0.5, 1.0]];
        let mix_inv_t = array![[1.0, -0.5], [-1.0, 2.0]] / 1.5;
        let mut other = f.clone();
        let mixed_scores = f.component_scores().dot(&mix);
        let mixed_loadings = f.component_loadings().dot(&mix_inv_t);
        other.col_scores.slice_mut(s![.., 2..]).assign(&mixed_scores);
        other.row_loadings.slice_mut(s![.., 2..]).assign(&mixed_loadings);

        let rss = design_residual_ss(&obs, &design);
        let a = rotate(&obs, &design, &f, RotationMethod::Principal, rss)?;
        let b = rotate(&obs, &design, &other, RotationMethod::Principal, rss)?;
        for (x, y) in a
            .factorization
            .row_loadings()
            .iter()
            .zip(b.factorization.row_loadings().iter())
        {
            assert_abs_diff_eq!(x, y, epsilon = 1e-7);
        }
        for (x, y) in a
            .factorization
            .col_scores()
            .iter()
            .zip(b.factorization.col_scores().iter())
        {
            assert_abs_diff_eq!(x, y, epsilon = 1e-7);
        }
        Ok(())
    }

    #[test]
    fn test_rank_beyond_data_is_infeasible() -> anyhow::Result<()> {
        // two components whose loadings are parallel only span one dimension
        let a = random_matrix(10, 1, 4);
        let f = Factorization {
            row_loadings: ndarray::concatenate![ndarray::Axis(1), a, a.mapv(|v| 2.0 * v)],
            col_scores: random_matrix(6, 2, 5),
            design_columns: 0,
        };
        let obs = Observations::from_view(&WeightedMatrix::from_values(f.fitted()))?;
        let design = DesignConstraint::empty(6);

        let rss = design_residual_ss(&obs, &design);
        let err = rotate(&obs, &design, &f, RotationMethod::Principal, rss).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ComponentError>(),
            Some(ComponentError::RankInfeasible { rank: 2, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_offset_absorbed_by_design() -> anyhow::Result<()> {
        // a large common level must not hide structure about the row means
        let (signal, _, _) = low_rank(20, 8, 1, 0.05, 8);
        let values = signal.mapv(|v| 1e5 + 0.5 * v);
        let obs = Observations::from_view(&WeightedMatrix::from_values(values))?;
        let design = DesignConstraint::intercept(8);
        let solver = ComponentSolver::new(&obs, &design, SolverOptions::default())?;
        let run = solver.solve(random_matrix(8, 1, 9).view())?;

        let rss = solver.design_residual_ss()?;
        assert!(rss < 1e-6 * obs.total_weighted_ss());
        let rotated = rotate(&obs, &design, &run.factorization, RotationMethod::Principal, rss)?;
        assert!(rotated.component_ss[0] > 0.5 * rss);
        check_canonical(&obs, &design, &rotated);
        Ok(())
    }

    #[test]
    fn test_unobserved_sample_left_undefined() -> anyhow::Result<()> {
        let (values, _, _) = low_rank(8, 6, 1, 0.2, 6);
        let mut weights = Array2::ones((8, 6));
        weights.column_mut(5).fill(0.0);
        let obs = Observations::from_view(&WeightedMatrix::new(values, weights)?)?;
        let design = DesignConstraint::intercept(6);
        let solver = ComponentSolver::new(&obs, &design, SolverOptions::default())?;
        let run = solver.solve(random_matrix(6, 1, 7).view())?;

        let rss = solver.design_residual_ss()?;
        let rotated = rotate(&obs, &design, &run.factorization, RotationMethod::Principal, rss)?;
        let scores = rotated.factorization.col_scores();
        assert!(scores[(5, 1)].is_nan());
        assert_eq!(scores[(5, 0)], 1.0);
        assert!(scores.slice(s![..5, ..]).iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_descending_is_stable() {
        assert_eq!(descending(&[1.0, 3.0, 2.0]), vec![1, 2, 0]);
        assert_eq!(descending(&[1.0, 1.0]), vec![0, 1]);
    }
}
