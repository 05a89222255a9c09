//! Symbolic device equations and their compiled derivatives.

mod expr;
mod kernel;
mod parser;
mod segment;

pub use expr::{Expr, Symbol};
pub use kernel::Kernel;
pub use parser::parse_expression;
pub use segment::{DerivativeEntry, ExprKey, LagrangeSegment, Part, StampExpression, TX_FACTOR};
