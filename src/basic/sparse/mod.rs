mod builder;

pub use builder::{MatrixBuilder, assert_valid};
