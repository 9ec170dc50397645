use log::{info, warn};

use crate::design::DesignConstraint;
use crate::error::ComponentError;
use crate::view::Observations;

use super::restart::Initialization;
use super::{fit_observations, Components, ComponentsConfig};

/// Fits of rank 0, 1, …, up to the requested rank or the first infeasible one.
#[derive(Debug, Clone)]
pub struct ComponentSequence {
    ranks: Vec<Components>,
    truncated_at: Option<usize>,
}

impl ComponentSequence {
    /// The fit with `rank` components, if that rank was reached.
    pub fn components(&self, rank: usize) -> Option<&Components> {
        self.ranks.get(rank)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Components> {
        self.ranks.iter()
    }

    /// Highest rank fitted.
    pub fn max_rank(&self) -> usize {
        self.ranks.len().saturating_sub(1)
    }

    /// Rank that exceeded the structure of the data, when the sequence stopped early.
    pub fn truncated_at(&self) -> Option<usize> {
        self.truncated_at
    }

    pub fn objectives(&self) -> Vec<f64> {
        self.ranks.iter().map(Components::objective).collect()
    }

    /// `1 - objective(r) / objective(0)`: the share of the design residual explained by
    /// the first `r` components.
    pub fn r_squared(&self) -> Vec<f64> {
        let baseline = self.ranks.first().map_or(0.0, Components::objective);
        self.ranks
            .iter()
            .map(|c| {
                if baseline > 0.0 {
                    1.0 - c.objective() / baseline
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Gain in explained share from each added component; entry `r - 1` is the gain of
    /// rank `r` over rank `r - 1`.
    pub fn r_squared_increments(&self) -> Vec<f64> {
        self.r_squared().windows(2).map(|w| w[1] - w[0]).collect()
    }
}

pub struct SequenceBuilder<'a> {
    config: &'a ComponentsConfig,
}

impl<'a> SequenceBuilder<'a> {
    pub fn new(config: &'a ComponentsConfig) -> Self {
        SequenceBuilder { config }
    }

    pub fn build(
        &self,
        obs: &Observations,
        design: &DesignConstraint,
        max_rank: usize,
    ) -> anyhow::Result<ComponentSequence> {
        let baseline = fit_observations(obs, design, self.config, 0, &Initialization::Canonical)?;
        let mut ranks = vec![baseline];
        let mut truncated_at = None;

        for rank in 1..=max_rank {
            let init = match ranks.last() {
                Some(previous) if previous.rank() > 0 => Initialization::WarmStart(
                    previous.factorization().component_scores().to_owned(),
                ),
                _ => Initialization::Canonical,
            };

            match fit_observations(obs, design, self.config, rank, &init) {
                Ok(components) => ranks.push(components),
                Err(e) => match e.downcast_ref::<ComponentError>() {
                    Some(ComponentError::RankInfeasible { .. }) => {
                        warn!("Stopping the sequence at rank {}: {}", rank, e);
                        truncated_at = Some(rank);
                        break;
                    }
                    _ => return Err(e),
                },
            }
        }

        info!(
            "Fitted component sequence up to rank {}",
            ranks.len().saturating_sub(1)
        );
        Ok(ComponentSequence {
            ranks,
            truncated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::test_support::*;
    use crate::components::ComponentsBuilder;
    use crate::view::WeightedMatrix;
    use approx::assert_abs_diff_eq;
    use nalgebra::DMatrix;
    use ndarray::{array, Array2, ArrayView2};

    #[test]
    fn test_sequence_r_squared_is_monotone() -> anyhow::Result<()> {
        init_logging();
        let (values, _, _) = low_rank(16, 10, 3, 0.3, 60);
        let mut weights = random_matrix(16, 10, 61).mapv(|v| 0.5 + v.abs());
        weights[(2, 3)] = 0.0;
        let matrix = WeightedMatrix::new(values, weights)?;
        let design = DesignConstraint::intercept(10);

        let sequence = ComponentsBuilder::new()
            .rank(3)
            .tolerance(1e-10)
            .build()
            .fit_sequence(&matrix, &design)?;

        assert_eq!(sequence.max_rank(), 3);
        assert_eq!(sequence.truncated_at(), None);
        for (r, comp) in sequence.iter().enumerate() {
            assert_eq!(comp.rank(), r);
        }

        let r2 = sequence.r_squared();
        assert_eq!(r2[0], 0.0);
        for pair in r2.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-9, "{} < {}", pair[1], pair[0]);
        }
        assert!(r2[3] > 0.5);

        let increments = sequence.r_squared_increments();
        assert_eq!(increments.len(), 3);
        assert_abs_diff_eq!(increments.iter().sum::<f64>(), r2[3], epsilon = 1e-12);
        Ok(())
    }

    /// Relative size of the part of `scores` outside the column span of `basis`.
    fn outside_span(scores: ArrayView2<f64>, basis: ArrayView2<f64>) -> f64 {
        let b = DMatrix::from_fn(basis.nrows(), basis.ncols(), |i, j| basis[(i, j)]);
        let y = DMatrix::from_fn(scores.nrows(), scores.ncols(), |i, j| scores[(i, j)]);
        let coef = b.clone().svd(true, true).solve(&y, 1e-12).unwrap();
        (&y - &b * coef).norm() / y.norm()
    }

    #[test]
    fn test_lower_rank_components_are_contained() -> anyhow::Result<()> {
        let loadings = random_matrix(16, 3, 65) * array![4.0, 2.0, 1.0];
        let scores = random_matrix(10, 3, 66);
        let values = loadings.dot(&scores.t()) + random_matrix(16, 10, 67) * 0.05;
        let matrix = WeightedMatrix::from_values(values);
        let design = DesignConstraint::intercept(10);

        let sequence = ComponentsBuilder::new()
            .rank(3)
            .max_iter(1000)
            .tolerance(1e-12)
            .build()
            .fit_sequence(&matrix, &design)?;
        assert_eq!(sequence.max_rank(), 3);

        for r in 1..3 {
            let lower = sequence.components(r).unwrap().factorization().component_scores();
            let upper = sequence.components(r + 1).unwrap().factorization().component_scores();
            let outside = outside_span(lower, upper);
            assert!(outside < 1e-3, "rank {} leaves {} outside rank {}", r, outside, r + 1);
        }
        Ok(())
    }

    #[test]
    fn test_sequence_truncates_beyond_structure() -> anyhow::Result<()> {
        init_logging();
        let (values, _, _) = low_rank(12, 7, 1, 0.0, 70);
        let matrix = WeightedMatrix::from_values(values);
        let design = DesignConstraint::empty(7);

        let sequence = ComponentsBuilder::new()
            .rank(3)
            .build()
            .fit_sequence(&matrix, &design)?;

        assert_eq!(sequence.truncated_at(), Some(2));
        assert_eq!(sequence.max_rank(), 1);
        assert!(sequence.components(2).is_none());
        assert_abs_diff_eq!(sequence.r_squared()[1], 1.0, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn test_dimension_limit_truncates() -> anyhow::Result<()> {
        let matrix = WeightedMatrix::from_values(random_matrix(3, 8, 80));
        let design = DesignConstraint::intercept(8);

        let sequence = ComponentsBuilder::new()
            .rank(4)
            .build()
            .fit_sequence(&matrix, &design)?;
        assert_eq!(sequence.max_rank(), 2);
        assert_eq!(sequence.truncated_at(), Some(3));
        Ok(())
    }

    #[test]
    fn test_sequence_is_deterministic() -> anyhow::Result<()> {
        let (values, _, _) = low_rank(10, 6, 2, 0.4, 90);
        let matrix = WeightedMatrix::new(values, Array2::from_elem((10, 6), 1.5))?;
        let design = DesignConstraint::intercept(6);
        let config = ComponentsBuilder::new().rank(2).restarts(2).seed(3).build();

        let a = config.fit_sequence(&matrix, &design)?;
        let b = config.fit_sequence(&matrix, &design)?;
        assert_eq!(a.objectives(), b.objectives());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.factorization(), y.factorization());
        }
        Ok(())
    }
}
