//! Binding compiled segments to global indices and batching their evaluation.

mod details;
mod stamper;

pub use details::{BoundInput, IndexMap, SKIP, StampInstance, VarIndex, accumulate_residuals, bind};
pub use stamper::{InputBuilder, MatrixStamper};
