use std::sync::Arc;

use nalgebra::DVector;

use crate::basic::{
    error::{PowerFlowError, Result},
    symbolic::{ExprKey, LagrangeSegment, Part, TX_FACTOR},
};

/// Sentinel for an absent index: ground, or a dual outside optimization mode.
pub const SKIP: usize = usize::MAX;

/// Global placement of one segment variable.
///
/// `col` is the variable's own position in `v`; `row` is where the
/// derivative with respect to it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarIndex {
    pub col: usize,
    pub row: usize,
}

impl VarIndex {
    pub const SKIPPED: VarIndex = VarIndex { col: SKIP, row: SKIP };
}

/// Per-instance symbol → value / index assignment for a segment.
#[derive(Debug, Clone)]
pub struct IndexMap {
    segment: Arc<LagrangeSegment>,
    constants: Vec<Option<f64>>,
    variables: Vec<VarIndex>,
    unknown: Vec<String>,
}

impl IndexMap {
    pub fn new(segment: &Arc<LagrangeSegment>) -> Self {
        let constants = segment
            .constants()
            .iter()
            .map(|c| (&**c == TX_FACTOR).then_some(0.0))
            .collect();
        Self {
            segment: segment.clone(),
            constants,
            variables: vec![VarIndex::SKIPPED; segment.variables().len()],
            unknown: Vec::new(),
        }
    }

    pub fn set_constant(&mut self, name: &str, value: f64) -> &mut Self {
        match self.segment.slot(name) {
            Some(slot) if slot < self.constants.len() => self.constants[slot] = Some(value),
            _ => self.unknown.push(name.to_string()),
        }
        self
    }

    pub fn set_variable(&mut self, name: &str, col: usize, row: usize) -> &mut Self {
        match self.segment.variable_position(name) {
            Some(p) => self.variables[p] = VarIndex { col, row },
            None => self.unknown.push(name.to_string()),
        }
        self
    }

    /// Binds a primal and its dual: the dual's equation lands on the
    /// primal's row and vice versa.
    pub fn pair(&mut self, primal: &str, dual: &str, primal_idx: usize, dual_idx: usize) -> &mut Self {
        self.set_variable(primal, primal_idx, dual_idx);
        self.set_variable(dual, dual_idx, primal_idx)
    }

    /// Validates the map; every constant must have a value.
    pub fn finish(self) -> Result<BoundInput> {
        if let Some(name) = self.unknown.first() {
            return Err(PowerFlowError::UndeclaredSymbol {
                symbol: name.clone(),
                equation: self.segment.lagrangian().to_string(),
            });
        }
        let constants = self
            .constants
            .iter()
            .zip(self.segment.constants())
            .map(|(v, name)| v.ok_or_else(|| PowerFlowError::MissingConstant(name.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(BoundInput {
            segment: self.segment,
            constants,
            variables: self.variables,
        })
    }
}

/// A segment bound to concrete parameter values and global indices.
#[derive(Debug)]
pub struct BoundInput {
    pub segment: Arc<LagrangeSegment>,
    pub constants: Vec<f64>,
    pub variables: Vec<VarIndex>,
}

impl BoundInput {
    /// Slot values at `v`, `tx_factor` forced to zero.
    pub fn values_at(&self, v: &DVector<f64>) -> Vec<f64> {
        let mut values: Vec<f64> = self.constants.clone();
        if let Some(slot) = self.segment.tx_slot() {
            values[slot] = 0.0;
        }
        values.extend(
            self.variables
                .iter()
                .map(|vi| if vi.col == SKIP { 0.0 } else { v[vi.col] }),
        );
        values
    }
}

/// One scheduled contribution: `col = None` goes to `J[row]`, otherwise `Y[row, col]`.
#[derive(Debug, Clone)]
pub struct StampInstance {
    pub input: Arc<BoundInput>,
    pub expr: ExprKey,
    pub row: usize,
    pub col: Option<usize>,
}

/// Expands a bound input into its stamp instances.
pub fn bind(input: &Arc<BoundInput>) -> Vec<StampInstance> {
    let segment = &input.segment;
    let mut out = Vec::new();
    for (entry_idx, entry) in segment.entries().iter().enumerate() {
        let row = input.variables[entry_idx].row;
        if row == SKIP {
            continue;
        }
        if !entry.constant.expr.is_zero() {
            out.push(StampInstance {
                input: input.clone(),
                expr: ExprKey {
                    entry: entry_idx,
                    part: Part::Constant,
                },
                row,
                col: None,
            });
        }
        for (k, (q, coeff)) in entry.coefficients.iter().enumerate() {
            let col = input.variables[*q].col;
            if col == SKIP || coeff.expr.is_zero() {
                continue;
            }
            out.push(StampInstance {
                input: input.clone(),
                expr: ExprKey {
                    entry: entry_idx,
                    part: Part::Coefficient(k),
                },
                row,
                col: Some(col),
            });
        }
    }
    out
}

/// Adds every bound row's full derivative, evaluated at `v`, into `res`.
pub fn accumulate_residuals(input: &BoundInput, v: &DVector<f64>, res: &mut DVector<f64>) {
    let values = input.values_at(v);
    for (entry_idx, entry) in input.segment.entries().iter().enumerate() {
        let row = input.variables[entry_idx].row;
        if row == SKIP {
            continue;
        }
        res[row] += entry.full.kernel.eval_single(&values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::symbolic::parse_expression;

    fn segment() -> Arc<LagrangeSegment> {
        Arc::new(
            LagrangeSegment::build(
                parse_expression("G*(Lr_f - Lr_t)*(Vr_f - Vr_t)").unwrap(),
                &["G"],
                &["Vr_f", "Vr_t"],
                &["Lr_f", "Lr_t"],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_bind_skips_ground_and_duals() {
        let seg = segment();
        let mut map = IndexMap::new(&seg);
        map.set_constant("G", 2.0)
            .pair("Vr_f", "Lr_f", 0, SKIP)
            .pair("Vr_t", "Lr_t", SKIP, SKIP);
        let input = Arc::new(map.finish().unwrap());
        let stamps = bind(&input);
        // only the KCL row of the `from` terminal, one coefficient column
        assert_eq!(stamps.len(), 1);
        assert_eq!(stamps[0].row, 0);
        assert_eq!(stamps[0].col, Some(0));
    }

    #[test]
    fn test_bind_optimization_doubles() {
        let seg = segment();
        let mut map = IndexMap::new(&seg);
        map.set_constant("G", 2.0)
            .pair("Vr_f", "Lr_f", 0, 2)
            .pair("Vr_t", "Lr_t", 1, 3);
        let input = Arc::new(map.finish().unwrap());
        let stamps = bind(&input);
        // 2 KCL rows x 2 voltage columns + 2 adjoint rows x 2 dual columns
        assert_eq!(stamps.len(), 8);
        assert!(stamps.iter().all(|s| s.col.is_some()));
    }

    #[test]
    fn test_missing_constant() {
        let seg = segment();
        let mut map = IndexMap::new(&seg);
        map.pair("Vr_f", "Lr_f", 0, SKIP);
        assert!(matches!(map.finish(), Err(PowerFlowError::MissingConstant(name)) if name == "G"));
    }

    #[test]
    fn test_unknown_symbol_in_map() {
        let seg = segment();
        let mut map = IndexMap::new(&seg);
        map.set_constant("G", 1.0).set_constant("H", 1.0);
        assert!(matches!(map.finish(), Err(PowerFlowError::UndeclaredSymbol { .. })));
    }

    #[test]
    fn test_residual() {
        let seg = segment();
        let mut map = IndexMap::new(&seg);
        map.set_constant("G", 2.0)
            .pair("Vr_f", "Lr_f", 0, SKIP)
            .pair("Vr_t", "Lr_t", 1, SKIP);
        let input = map.finish().unwrap();
        let v = DVector::from_vec(vec![1.0, 0.25]);
        let mut res = DVector::zeros(2);
        accumulate_residuals(&input, &v, &mut res);
        assert_eq!(res[0], 1.5);
        assert_eq!(res[1], -1.5);
    }
}
