pub mod cross_entropy;
pub mod marginal_entropy;

pub use cross_entropy::CrossEntropyLoss;
pub use marginal_entropy::MarginalEntropyLoss;
