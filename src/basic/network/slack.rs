use std::sync::{Arc, LazyLock};

use nalgebra::DVector;
use num_complex::Complex64;

use super::{ComplexUnknown, Device, IndexSequence, StampContext, Terminal};
use crate::basic::{
    error::Result,
    stamp::{BoundInput, IndexMap},
    symbolic::{LagrangeSegment, parse_expression},
};

/// KCL on the bus plus `V - V_set = 0`, both per phase.
const SLACK_EQUATION: &str = "Lr_b*Ir + Li_b*Ii + Lr_s*(Vr_b - Vset_r) + Li_s*(Vi_b - Vset_i)";

static TERMINAL: LazyLock<Terminal> = LazyLock::new(|| Terminal::new("b"));

/// Ideal voltage source, one set point per phase.
#[derive(Debug, Clone)]
pub struct SlackSource {
    pub name: String,
    pub buses: Vec<i64>,
    /// Per-unit set points.
    pub set_points: Vec<Complex64>,
    currents: Vec<ComplexUnknown>,
}

impl SlackSource {
    pub fn new(name: &str, buses: Vec<i64>, set_points: Vec<Complex64>) -> Self {
        let currents = vec![ComplexUnknown::UNASSIGNED; buses.len()];
        Self {
            name: name.to_string(),
            buses,
            set_points,
            currents,
        }
    }

    fn segment() -> Result<Arc<LagrangeSegment>> {
        LagrangeSegment::cached(
            parse_expression(SLACK_EQUATION)?,
            &["Vset_r", "Vset_i"],
            &["Vr_b", "Vi_b", "Ir", "Ii"],
            &["Lr_b", "Li_b", "Lr_s", "Li_s"],
        )
    }

    /// Current injected into each bus, per unit.
    pub fn injections(&self, v: &DVector<f64>) -> Vec<Complex64> {
        self.currents.iter().map(|c| -c.value(v)).collect()
    }
}

impl Device for SlackSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign_nodes(&mut self, seq: &mut IndexSequence) {
        for current in &mut self.currents {
            *current = ComplexUnknown::assign(seq);
        }
    }

    fn bindings(&self, ctx: &StampContext) -> Result<Vec<BoundInput>> {
        let segment = Self::segment()?;
        self.buses
            .iter()
            .zip(&self.set_points)
            .zip(&self.currents)
            .map(|((&bus, set), current)| {
                let mut map = IndexMap::new(&segment);
                map.set_constant("Vset_r", set.re).set_constant("Vset_i", set.im);
                TERMINAL.bind(&mut map, ctx.bus(bus));
                current.bind(&mut map, "Ir", "Ii", "Lr_s", "Li_s");
                map.finish()
            })
            .collect()
    }

    fn init_v(&self, ctx: &StampContext, v: &mut DVector<f64>) {
        for (&bus, set) in self.buses.iter().zip(&self.set_points) {
            let ix = ctx.bus(bus).indices;
            v[ix.node_vr] = set.re;
            v[ix.node_vi] = set.im;
        }
    }
}
