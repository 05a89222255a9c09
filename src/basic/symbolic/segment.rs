use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, LazyLock, Mutex},
};

use tracing::trace;

use super::{
    expr::{Expr, Symbol},
    kernel::Kernel,
};
use crate::basic::error::{PowerFlowError, Result};

/// Reserved constant symbol carrying the homotopy factor.
pub const TX_FACTOR: &str = "tx_factor";

/// Bumped whenever derivation or compilation changes so cached segments are not reused.
const SEGMENT_VERSION: &str = "seg-v1";

static SEGMENT_CACHE: LazyLock<Mutex<HashMap<String, Arc<LagrangeSegment>>>> =
    LazyLock::new(Default::default);

/// A compiled sub-expression of a derivative.
#[derive(Debug, Clone)]
pub struct StampExpression {
    pub expr: Expr,
    pub kernel: Kernel,
    /// `true` when no primal or dual symbol appears in `expr`.
    pub is_linear: bool,
}

/// Which part of a [`DerivativeEntry`] a stamp refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Part {
    Constant,
    Coefficient(usize),
}

/// Identifies one stampable expression inside a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprKey {
    pub entry: usize,
    pub part: Part,
}

/// `dL/dx` split into its constant part and its linear coefficients.
#[derive(Debug)]
pub struct DerivativeEntry {
    pub variable: Symbol,
    pub full: StampExpression,
    pub constant: StampExpression,
    /// `(variable position, d²L/dx dy)`, zero coefficients omitted.
    pub coefficients: Vec<(usize, StampExpression)>,
    pub is_linear: bool,
}

/// Derivatives of one device Lagrangian, shared by every instance with the same shape.
///
/// Slot layout of the evaluation columns: constants first, then primals,
/// then duals. Variable position `p` lives in slot `constants.len() + p`.
#[derive(Debug)]
pub struct LagrangeSegment {
    lagrangian: Expr,
    constants: Vec<Symbol>,
    variables: Vec<Symbol>,
    num_primals: usize,
    slots: HashMap<Symbol, usize>,
    entries: Vec<DerivativeEntry>,
}

impl LagrangeSegment {
    /// Differentiates `lagrangian` and compiles every part. Bypasses the cache.
    pub fn build(
        lagrangian: Expr,
        constants: &[&str],
        primals: &[&str],
        duals: &[&str],
    ) -> Result<Self> {
        let constants: Vec<Symbol> = constants.iter().map(|s| Symbol::from(*s)).collect();
        let variables: Vec<Symbol> = primals
            .iter()
            .chain(duals.iter())
            .map(|s| Symbol::from(*s))
            .collect();

        let slots: HashMap<Symbol, usize> = constants
            .iter()
            .chain(variables.iter())
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();

        for symbol in lagrangian.free_symbols() {
            if !slots.contains_key(&symbol) {
                return Err(PowerFlowError::UndeclaredSymbol {
                    symbol: symbol.to_string(),
                    equation: lagrangian.to_string(),
                });
            }
        }

        let var_set: HashSet<Symbol> = variables.iter().cloned().collect();
        let compile = |expr: Expr| -> Result<StampExpression> {
            let kernel = Kernel::compile(&expr, &slots)?;
            let is_linear = !expr.depends_on_any(&var_set);
            Ok(StampExpression {
                expr,
                kernel,
                is_linear,
            })
        };

        let mut entries = Vec::with_capacity(variables.len());
        for x in &variables {
            let f = lagrangian.diff(x);
            let mut coefficients = Vec::new();
            for (q, y) in variables.iter().enumerate() {
                let c = f.diff(y);
                if !c.is_zero() {
                    coefficients.push((q, c));
                }
            }
            let is_linear = coefficients.iter().all(|(_, c)| !c.depends_on_any(&var_set));
            let constant = if is_linear {
                f.substitute(&|s| var_set.contains(s).then(Expr::zero))
            } else {
                Expr::sum(std::iter::once(f.clone()).chain(
                    coefficients
                        .iter()
                        .map(|(q, c)| -(c.clone() * Expr::Sym(variables[*q].clone()))),
                ))
            };
            entries.push(DerivativeEntry {
                variable: x.clone(),
                full: compile(f)?,
                constant: compile(constant)?,
                coefficients: coefficients
                    .into_iter()
                    .map(|(q, c)| Ok((q, compile(c)?)))
                    .collect::<Result<Vec<_>>>()?,
                is_linear,
            });
        }

        Ok(Self {
            lagrangian,
            constants,
            variables,
            num_primals: primals.len(),
            slots,
            entries,
        })
    }

    /// Returns the shared segment for this shape, building it on first use.
    pub fn cached(
        lagrangian: Expr,
        constants: &[&str],
        primals: &[&str],
        duals: &[&str],
    ) -> Result<Arc<Self>> {
        let key = format!(
            "{SEGMENT_VERSION}|{}|{}|{}|{}",
            constants.join(","),
            primals.join(","),
            duals.join(","),
            lagrangian
        );
        let mut cache = SEGMENT_CACHE.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(segment) = cache.get(&key) {
            return Ok(segment.clone());
        }
        trace!(key = %key, "compiling segment");
        let segment = Arc::new(Self::build(lagrangian, constants, primals, duals)?);
        cache.insert(key, segment.clone());
        Ok(segment)
    }

    pub fn lagrangian(&self) -> &Expr {
        &self.lagrangian
    }

    pub fn constants(&self) -> &[Symbol] {
        &self.constants
    }

    /// Primals followed by duals.
    pub fn variables(&self) -> &[Symbol] {
        &self.variables
    }

    pub fn primals(&self) -> &[Symbol] {
        &self.variables[..self.num_primals]
    }

    pub fn duals(&self) -> &[Symbol] {
        &self.variables[self.num_primals..]
    }

    pub fn entries(&self) -> &[DerivativeEntry] {
        &self.entries
    }

    pub fn slot_count(&self) -> usize {
        self.constants.len() + self.variables.len()
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.slots.get(name).copied()
    }

    pub fn tx_slot(&self) -> Option<usize> {
        self.slot(TX_FACTOR)
    }

    /// Position of a primal or dual in [`variables`](Self::variables).
    pub fn variable_position(&self, name: &str) -> Option<usize> {
        self.slot(name)
            .and_then(|s| s.checked_sub(self.constants.len()))
    }

    pub fn expression(&self, key: ExprKey) -> &StampExpression {
        let entry = &self.entries[key.entry];
        match key.part {
            Part::Constant => &entry.constant,
            Part::Coefficient(k) => &entry.coefficients[k].1,
        }
    }

    /// Symbol tuple identifying the column layout of this segment.
    pub fn shape_key(&self) -> String {
        let names: Vec<&str> = self
            .constants
            .iter()
            .chain(self.variables.iter())
            .map(|s| &**s)
            .collect();
        names.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::symbolic::parse_expression;

    fn conductance() -> LagrangeSegment {
        let l = parse_expression("G*(Lr_f - Lr_t)*(Vr_f - Vr_t)").unwrap();
        LagrangeSegment::build(l, &["G"], &["Vr_f", "Vr_t"], &["Lr_f", "Lr_t"]).unwrap()
    }

    #[test]
    fn test_linear_split() {
        let seg = conductance();
        // dL/dLr_f = G*(Vr_f - Vr_t): linear, zero constant
        let pos = seg.variable_position("Lr_f").unwrap();
        let entry = &seg.entries()[pos];
        assert!(entry.is_linear);
        assert!(entry.constant.expr.is_zero());
        let coeffs: Vec<_> = entry
            .coefficients
            .iter()
            .map(|(q, c)| (seg.variables()[*q].to_string(), c.kernel.eval_single(&[2.0, 0.0, 0.0, 0.0, 0.0])))
            .collect();
        assert_eq!(coeffs, vec![("Vr_f".to_string(), 2.0), ("Vr_t".to_string(), -2.0)]);
    }

    #[test]
    fn test_nonlinear_constant_is_linearization() {
        // constant-power current P/Vr, dual paired
        let l = parse_expression("Lr*P/Vr").unwrap();
        let seg = LagrangeSegment::build(l, &["P"], &["Vr"], &["Lr"]).unwrap();
        let entry = &seg.entries()[seg.variable_position("Lr").unwrap()];
        assert!(!entry.is_linear);
        // f(v) = P/v, coefficient = -P/v^2, constant = f - c*v = 2P/v
        let values = [3.0, 2.0, 0.0];
        assert!((entry.full.kernel.eval_single(&values) - 1.5).abs() < 1e-12);
        assert!((entry.constant.kernel.eval_single(&values) - 3.0).abs() < 1e-12);
        assert!((entry.coefficients[0].1.kernel.eval_single(&values) + 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_variable_layout() {
        let seg = conductance();
        let names = |syms: &[Symbol]| syms.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(names(seg.primals()), vec!["Vr_f", "Vr_t"]);
        assert_eq!(names(seg.duals()), vec!["Lr_f", "Lr_t"]);
        assert_eq!(seg.variables().len(), seg.primals().len() + seg.duals().len());
        assert_eq!(seg.variable_position("Lr_f"), Some(2));
    }

    #[test]
    fn test_undeclared_symbol() {
        let l = parse_expression("G*Lr*(Vr - Vq)").unwrap();
        let err = LagrangeSegment::build(l, &["G"], &["Vr"], &["Lr"]).unwrap_err();
        assert!(matches!(err, PowerFlowError::UndeclaredSymbol { ref symbol, .. } if symbol == "Vq"));
    }

    #[test]
    fn test_cache_shares_segment() {
        let make = || {
            LagrangeSegment::cached(
                parse_expression("B*(1 - tx_factor)*Li*Vr").unwrap(),
                &["B", TX_FACTOR],
                &["Vr"],
                &["Li"],
            )
            .unwrap()
        };
        let a = make();
        let b = make();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.tx_slot(), Some(1));
    }
}
