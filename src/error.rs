use thiserror::Error;

/// Fatal conditions detected by the component engine.
///
/// Functions in this crate return `anyhow::Result`; the underlying cause can be
/// recovered with `err.downcast_ref::<ComponentError>()`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComponentError {
    #[error("weight at ({row}, {col}) is {weight}; weights must be finite and non-negative")]
    InvalidWeight { row: usize, col: usize, weight: f64 },

    #[error("value at ({row}, {col}) is missing or non-finite but carries weight {weight}")]
    MissingWithWeight { row: usize, col: usize, weight: f64 },

    #[error("design has {design_rows} rows but the data has {samples} samples")]
    DesignShape { design_rows: usize, samples: usize },

    #[error("design is not of full column rank (rank {rank} of {columns} columns)")]
    DesignRankDeficient { rank: usize, columns: usize },

    #[error("design contains non-finite entries")]
    DesignNotFinite,

    #[error(
        "requested {rank} components on top of {design} design columns, but the data supports at most {max}"
    )]
    RankInfeasible {
        rank: usize,
        design: usize,
        max: usize,
    },

    #[error("initial column scores have shape {got:?}, expected ({samples}, {rank}) or fewer columns")]
    InitialScoresShape {
        got: (usize, usize),
        samples: usize,
        rank: usize,
    },

    #[error("restart count must be at least 1")]
    NoRestarts,

    #[error("component {column} is out of range for a factorization with {columns} columns")]
    ColumnOutOfRange { column: usize, columns: usize },

    #[error("replacement weights have shape {got:?}, expected {expected:?}")]
    CalibrationShape {
        got: (usize, usize),
        expected: (usize, usize),
    },

    #[error("replacement weights change the missingness pattern at ({row}, {col})")]
    CalibrationPattern { row: usize, col: usize },
}
