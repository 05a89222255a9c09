use std::{collections::HashMap, fmt, sync::Arc};

use super::expr::{Expr, Symbol};
use crate::basic::error::{PowerFlowError, Result};

type BatchFn = dyn Fn(&[Vec<f64>], usize) -> Vec<f64> + Send + Sync;

/// Compiled, vectorized form of an [`Expr`].
///
/// A kernel reads stacked input columns (one column per symbol slot, one
/// row per instance) and produces one value per row.
#[derive(Clone)]
pub struct Kernel {
    f: Arc<BatchFn>,
    constant: Option<f64>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("constant", &self.constant)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Compiles `expr` against a symbol → column slot table.
    pub fn compile(expr: &Expr, slots: &HashMap<Symbol, usize>) -> Result<Self> {
        let constant = match expr {
            Expr::Const(c) => Some(*c),
            _ => None,
        };
        Ok(Self {
            f: build(expr, slots, &expr.to_string())?,
            constant,
        })
    }

    /// Evaluates all `rows` instances at once.
    #[inline]
    pub fn eval(&self, columns: &[Vec<f64>], rows: usize) -> Vec<f64> {
        (self.f)(columns, rows)
    }

    /// Evaluates a single instance given one value per slot.
    pub fn eval_single(&self, values: &[f64]) -> f64 {
        if let Some(c) = self.constant {
            return c;
        }
        let columns: Vec<Vec<f64>> = values.iter().map(|v| vec![*v]).collect();
        (self.f)(&columns, 1)[0]
    }
}

fn build(expr: &Expr, slots: &HashMap<Symbol, usize>, equation: &str) -> Result<Arc<BatchFn>> {
    let f: Arc<BatchFn> = match expr {
        Expr::Const(c) => {
            let c = *c;
            Arc::new(move |_: &[Vec<f64>], n: usize| vec![c; n])
        }
        Expr::Sym(s) => {
            let slot = *slots
                .get(s)
                .ok_or_else(|| PowerFlowError::UndeclaredSymbol {
                    symbol: s.to_string(),
                    equation: equation.to_string(),
                })?;
            Arc::new(move |cols: &[Vec<f64>], n: usize| cols[slot][..n].to_vec())
        }
        Expr::Sum(terms) => {
            let parts = terms
                .iter()
                .map(|t| build(t, slots, equation))
                .collect::<Result<Vec<_>>>()?;
            Arc::new(move |cols: &[Vec<f64>], n: usize| {
                let mut acc = vec![0.0; n];
                for part in &parts {
                    for (a, b) in acc.iter_mut().zip(part(cols, n)) {
                        *a += b;
                    }
                }
                acc
            })
        }
        Expr::Product(factors) => {
            let parts = factors
                .iter()
                .map(|t| build(t, slots, equation))
                .collect::<Result<Vec<_>>>()?;
            Arc::new(move |cols: &[Vec<f64>], n: usize| {
                let mut acc = vec![1.0; n];
                for part in &parts {
                    for (a, b) in acc.iter_mut().zip(part(cols, n)) {
                        *a *= b;
                    }
                }
                acc
            })
        }
        Expr::Pow(base, k) => {
            let inner = build(base, slots, equation)?;
            let k = *k;
            Arc::new(move |cols: &[Vec<f64>], n: usize| {
                let mut v = inner(cols, n);
                v.iter_mut().for_each(|x| *x = x.powi(k));
                v
            })
        }
        Expr::Sqrt(base) => {
            let inner = build(base, slots, equation)?;
            Arc::new(move |cols: &[Vec<f64>], n: usize| {
                let mut v = inner(cols, n);
                v.iter_mut().for_each(|x| *x = x.sqrt());
                v
            })
        }
    };
    Ok(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::symbolic::parse_expression;

    fn slots(names: &[&str]) -> HashMap<Symbol, usize> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (Symbol::from(*n), i))
            .collect()
    }

    #[test]
    fn test_vectorized_eval() {
        let e = parse_expression("P*Vr/(Vr^2 + Vi^2)").unwrap();
        let k = Kernel::compile(&e, &slots(&["P", "Vr", "Vi"])).unwrap();
        let cols = vec![vec![1.0, 2.0], vec![1.0, 0.0], vec![0.0, 2.0]];
        let out = k.eval(&cols, 2);
        assert_eq!(out, vec![1.0, 0.0]);
        assert_eq!(k.eval_single(&[2.0, 2.0, 0.0]), 1.0);
    }

    #[test]
    fn test_unknown_symbol() {
        let e = parse_expression("a + b").unwrap();
        let err = Kernel::compile(&e, &slots(&["a"])).unwrap_err();
        assert!(matches!(err, PowerFlowError::UndeclaredSymbol { ref symbol, .. } if symbol == "b"));
    }
}
