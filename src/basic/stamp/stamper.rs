use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use nalgebra::DVector;

use super::details::{BoundInput, SKIP, StampInstance};
use crate::basic::{
    error::Result,
    sparse::MatrixBuilder,
    symbolic::{ExprKey, Kernel, LagrangeSegment},
};

/// Stacked evaluation columns for every input sharing one symbol layout.
#[derive(Debug)]
pub struct InputBuilder {
    num_constants: usize,
    tx_slot: Option<usize>,
    columns: Vec<Vec<f64>>,
    /// Global column of each variable, per row.
    var_cols: Vec<Vec<usize>>,
    rows: usize,
    has_nonlinear: bool,
}

impl InputBuilder {
    fn new(segment: &LagrangeSegment) -> Self {
        Self {
            num_constants: segment.constants().len(),
            tx_slot: segment.tx_slot(),
            columns: vec![Vec::new(); segment.slot_count()],
            var_cols: vec![Vec::new(); segment.variables().len()],
            rows: 0,
            has_nonlinear: false,
        }
    }

    fn push(&mut self, input: &BoundInput) -> usize {
        for (k, c) in input.constants.iter().enumerate() {
            self.columns[k].push(*c);
        }
        for (p, vi) in input.variables.iter().enumerate() {
            self.columns[self.num_constants + p].push(0.0);
            self.var_cols[p].push(vi.col);
        }
        self.rows += 1;
        self.rows - 1
    }

    fn set_tx_factor(&mut self, tx: f64) {
        if let Some(slot) = self.tx_slot {
            self.columns[slot].fill(tx);
        }
    }

    fn update_variables(&mut self, v: &DVector<f64>) {
        for (p, cols) in self.var_cols.iter().enumerate() {
            let column = &mut self.columns[self.num_constants + p];
            for (dst, &idx) in column.iter_mut().zip(cols) {
                *dst = if idx == SKIP { 0.0 } else { v[idx] };
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StampTarget {
    slot: usize,
    row: usize,
    col: Option<usize>,
}

/// All destinations of one expression of one segment.
#[derive(Debug)]
struct StampSet {
    builder: usize,
    kernel: Kernel,
    is_linear: bool,
    targets: Vec<StampTarget>,
}

impl StampSet {
    fn write(&self, builder: &InputBuilder, y: &mut MatrixBuilder, j: &mut DVector<f64>) -> Result<()> {
        let values = self.kernel.eval(&builder.columns, builder.rows);
        for t in &self.targets {
            let value = values[t.slot];
            match t.col {
                None => j[t.row] -= value,
                Some(col) => y.stamp(t.row, col, value)?,
            }
        }
        Ok(())
    }
}

/// Batches stamp instances so each expression is evaluated once for all of its instances.
#[derive(Debug, Default)]
pub struct MatrixStamper {
    builders: Vec<InputBuilder>,
    builder_lookup: HashMap<String, usize>,
    input_lookup: HashMap<usize, (usize, usize)>,
    inputs: Vec<Arc<BoundInput>>,
    sets: Vec<StampSet>,
    set_lookup: HashMap<(usize, ExprKey), usize>,
    /// `(set, slot, row, col)` already routed.
    seen_targets: HashSet<(usize, usize, usize, Option<usize>)>,
}

impl MatrixStamper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds instances, grouping them by symbol layout and expression in first-seen order.
    ///
    /// An instance already registered with the same input, expression and
    /// destination is ignored, so repeated registration stamps it once.
    pub fn register(&mut self, instances: impl IntoIterator<Item = StampInstance>) {
        for inst in instances {
            let (builder, slot) = self.input_slot(&inst.input);
            let segment = &inst.input.segment;
            let key = (Arc::as_ptr(segment) as usize, inst.expr);
            let set_idx = match self.set_lookup.get(&key) {
                Some(&idx) => idx,
                None => {
                    let expr = segment.expression(inst.expr);
                    if !expr.is_linear {
                        self.builders[builder].has_nonlinear = true;
                    }
                    self.sets.push(StampSet {
                        builder,
                        kernel: expr.kernel.clone(),
                        is_linear: expr.is_linear,
                        targets: Vec::new(),
                    });
                    self.set_lookup.insert(key, self.sets.len() - 1);
                    self.sets.len() - 1
                }
            };
            if !self.seen_targets.insert((set_idx, slot, inst.row, inst.col)) {
                continue;
            }
            self.sets[set_idx].targets.push(StampTarget {
                slot,
                row: inst.row,
                col: inst.col,
            });
        }
    }

    fn input_slot(&mut self, input: &Arc<BoundInput>) -> (usize, usize) {
        let ptr = Arc::as_ptr(input) as usize;
        if let Some(&found) = self.input_lookup.get(&ptr) {
            return found;
        }
        let shape = input.segment.shape_key();
        let builder = match self.builder_lookup.get(&shape) {
            Some(&b) => b,
            None => {
                self.builders.push(InputBuilder::new(&input.segment));
                self.builder_lookup.insert(shape, self.builders.len() - 1);
                self.builders.len() - 1
            }
        };
        let slot = self.builders[builder].push(input);
        self.input_lookup.insert(ptr, (builder, slot));
        // keeps the pointer key unique for the stamper's lifetime
        self.inputs.push(input.clone());
        (builder, slot)
    }

    /// Writes every variable-free expression with the given homotopy factor.
    pub fn stamp_linear(&mut self, y: &mut MatrixBuilder, j: &mut DVector<f64>, tx_factor: f64) -> Result<()> {
        for b in &mut self.builders {
            b.set_tx_factor(tx_factor);
        }
        for set in self.sets.iter().filter(|s| s.is_linear) {
            set.write(&self.builders[set.builder], y, j)?;
        }
        Ok(())
    }

    /// Writes every variable-dependent expression linearized at `v_prev`.
    pub fn stamp_nonlinear(&mut self, y: &mut MatrixBuilder, j: &mut DVector<f64>, v_prev: &DVector<f64>) -> Result<()> {
        for b in self.builders.iter_mut().filter(|b| b.has_nonlinear) {
            b.update_variables(v_prev);
        }
        for set in self.sets.iter().filter(|s| !s.is_linear) {
            set.write(&self.builders[set.builder], y, j)?;
        }
        Ok(())
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_builders(&self) -> usize {
        self.builders.len()
    }

    /// `(linear, nonlinear)` stamp set counts.
    pub fn num_sets(&self) -> (usize, usize) {
        let linear = self.sets.iter().filter(|s| s.is_linear).count();
        (linear, self.sets.len() - linear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::{
        stamp::{IndexMap, bind},
        symbolic::{LagrangeSegment, TX_FACTOR, parse_expression},
    };

    fn conductance(g: f64, f: usize, t: usize) -> Arc<BoundInput> {
        let seg = LagrangeSegment::cached(
            parse_expression("G*(1 + tx_factor)*(Lr_f - Lr_t)*(Vr_f - Vr_t)").unwrap(),
            &["G", TX_FACTOR],
            &["Vr_f", "Vr_t"],
            &["Lr_f", "Lr_t"],
        )
        .unwrap();
        let mut map = IndexMap::new(&seg);
        map.set_constant("G", g)
            .pair("Vr_f", "Lr_f", f, SKIP)
            .pair("Vr_t", "Lr_t", t, SKIP);
        Arc::new(map.finish().unwrap())
    }

    fn inverse_source(p: f64, node: usize) -> Arc<BoundInput> {
        let seg = LagrangeSegment::cached(
            parse_expression("Lr*P/Vr").unwrap(),
            &["P"],
            &["Vr"],
            &["Lr"],
        )
        .unwrap();
        let mut map = IndexMap::new(&seg);
        map.set_constant("P", p).pair("Vr", "Lr", node, SKIP);
        Arc::new(map.finish().unwrap())
    }

    fn dense(y: &MatrixBuilder) -> nalgebra::DMatrix<f64> {
        let m = y.to_matrix().unwrap();
        let mut d = nalgebra::DMatrix::zeros(y.size(), y.size());
        for (r, c, v) in m.triplet_iter() {
            d[(r, c)] += *v;
        }
        d
    }

    #[test]
    fn test_batches_share_sets() {
        let mut stamper = MatrixStamper::new();
        for input in [conductance(1.0, 0, 1), conductance(2.0, 1, 2)] {
            stamper.register(bind(&input));
        }
        assert_eq!(stamper.num_builders(), 1);
        assert_eq!(stamper.num_inputs(), 2);
        // 2 rows x 2 columns, all linear
        assert_eq!(stamper.num_sets(), (4, 0));

        let mut y = MatrixBuilder::new(3, true);
        let mut j = DVector::zeros(3);
        stamper.stamp_linear(&mut y, &mut j, 0.5).unwrap();
        let d = dense(&y);
        assert_eq!(d[(0, 0)], 1.5);
        assert_eq!(d[(1, 1)], 1.5 + 3.0);
        assert_eq!(d[(1, 2)], -3.0);
        assert_eq!(d[(2, 1)], -3.0);
        assert_eq!(j, DVector::zeros(3));
    }

    #[test]
    fn test_nonlinear_linearization() {
        let mut stamper = MatrixStamper::new();
        stamper.register(bind(&inverse_source(4.0, 0)));
        assert_eq!(stamper.num_sets(), (0, 2));

        let mut y = MatrixBuilder::new(1, true);
        let mut j = DVector::zeros(1);
        stamper.stamp_linear(&mut y, &mut j, 0.0).unwrap();
        assert_eq!(y.get_usage(), 0);

        let v = DVector::from_vec(vec![2.0]);
        stamper.stamp_nonlinear(&mut y, &mut j, &v).unwrap();
        // coefficient -P/v^2 = -1, constant 2P/v = 4 moved to the right-hand side
        assert_eq!(dense(&y)[(0, 0)], -1.0);
        assert_eq!(j[0], -4.0);
    }

    #[test]
    fn test_repeated_registration_stamps_once() {
        let input = conductance(1.0, 0, 1);
        let mut once = MatrixStamper::new();
        once.register(bind(&input));
        let mut twice = MatrixStamper::new();
        twice.register(bind(&input));
        twice.register(bind(&input));
        assert_eq!(twice.num_inputs(), 1);

        let stamp = |stamper: &mut MatrixStamper| {
            let mut y = MatrixBuilder::new(2, true);
            let mut j = DVector::zeros(2);
            stamper.stamp_linear(&mut y, &mut j, 0.0).unwrap();
            (dense(&y), y.get_usage())
        };
        let (d_once, used_once) = stamp(&mut once);
        let (d_twice, used_twice) = stamp(&mut twice);
        assert_eq!(d_twice, d_once);
        assert_eq!(d_twice[(0, 0)], 1.0);
        assert_eq!(used_twice, used_once);
    }

    #[test]
    fn test_iterations_do_not_accumulate() {
        let mut stamper = MatrixStamper::new();
        stamper.register(bind(&conductance(1.0, 0, 1)));
        stamper.register(bind(&inverse_source(4.0, 1)));

        let mut y = MatrixBuilder::new(2, true);
        let mut j_linear = DVector::zeros(2);
        stamper.stamp_linear(&mut y, &mut j_linear, 0.0).unwrap();
        let linear_index = y.get_usage();

        let mut v = DVector::from_vec(vec![1.0, 1.0]);
        for k in 0..4 {
            v[1] = 1.0 + 0.25 * k as f64;
            let mut j = j_linear.clone();
            stamper.stamp_nonlinear(&mut y, &mut j, &v).unwrap();
            let reused = dense(&y);

            let mut fresh_y = MatrixBuilder::new(2, true);
            let mut fresh_j = DVector::zeros(2);
            stamper.stamp_linear(&mut fresh_y, &mut fresh_j, 0.0).unwrap();
            stamper.stamp_nonlinear(&mut fresh_y, &mut fresh_j, &v).unwrap();
            assert_eq!(reused, dense(&fresh_y));
            assert_eq!(j, fresh_j);

            y.clear(linear_index);
        }
    }
}
