mod weighted;

pub use weighted::SparseWeightedMatrix;
