use std::{
    str::FromStr,
    sync::{Arc, LazyLock},
};

use num_complex::Complex64;

use super::{ComplexUnknown, Device, GND, IndexSequence, StampContext, Terminal, terminal_symbols};
use crate::basic::{
    error::{PowerFlowError, Result},
    stamp::{BoundInput, IndexMap},
    symbolic::{Expr, LagrangeSegment, TX_FACTOR},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformerConnection {
    GwyeGwye,
    DeltaGwye,
}

impl FromStr for TransformerConnection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GWYE_GWYE" | "WYE_WYE" => Ok(Self::GwyeGwye),
            "DELTA_GWYE" => Ok(Self::DeltaGwye),
            other => Err(other.to_string()),
        }
    }
}

struct WindingSymbols {
    a: Terminal,
    b: Terminal,
    s: Terminal,
}

static WINDING: LazyLock<WindingSymbols> = LazyLock::new(|| WindingSymbols {
    a: Terminal::new("a"),
    b: Terminal::new("b"),
    s: Terminal::new("s"),
});

/// One single-phase winding: ideal ratio `n` between the primary pair
/// `(a, b)` and the secondary `s`, with series impedance `R + jX` on the
/// secondary. The secondary current `I` is an unknown; `(Va - Vb)/n - Vs
/// - Z·I = 0` is its constraint.
pub(crate) fn winding_segment() -> Result<Arc<LagrangeSegment>> {
    let w = &*WINDING;
    let (ir, ii) = (Expr::sym("Ir"), Expr::sym("Ii"));
    let (r, x) = (Expr::sym("R"), Expr::sym("X"));
    let inv_n = Expr::sym("n").recip();
    let soften = (Expr::one() + Expr::Const(20.0) * Expr::sym(TX_FACTOR)).recip();

    let kcl = inv_n.clone()
        * (w.a.injection(ir.clone(), ii.clone()) - w.b.injection(ir.clone(), ii.clone()))
        - w.s.injection(ir.clone(), ii.clone());
    let drop_r = soften.clone() * (r.clone() * ir.clone() - x.clone() * ii.clone());
    let drop_i = soften * (r * ii + x * ir);
    let constraint_r = inv_n.clone() * (w.a.vr() - w.b.vr()) - w.s.vr() - drop_r;
    let constraint_i = inv_n * (w.a.vi() - w.b.vi()) - w.s.vi() - drop_i;
    let lagrangian = kcl + Expr::sym("Lr_w") * constraint_r + Expr::sym("Li_w") * constraint_i;

    let (mut primals, mut duals) = terminal_symbols(&[&w.a, &w.b, &w.s]);
    primals.extend(["Ir".to_string(), "Ii".to_string()]);
    duals.extend(["Lr_w".to_string(), "Li_w".to_string()]);
    let primals: Vec<&str> = primals.iter().map(String::as_str).collect();
    let duals: Vec<&str> = duals.iter().map(String::as_str).collect();
    LagrangeSegment::cached(lagrangian, &["n", "R", "X", TX_FACTOR], &primals, &duals)
}

/// Binds one winding; `b` is [`GND`] for a grounded-wye primary.
#[allow(clippy::too_many_arguments)]
pub(crate) fn bind_winding(
    segment: &Arc<LagrangeSegment>,
    ctx: &StampContext,
    a: i64,
    b: i64,
    s: i64,
    n: f64,
    z: Complex64,
    current: &ComplexUnknown,
) -> Result<BoundInput> {
    let w = &*WINDING;
    let mut map = IndexMap::new(segment);
    map.set_constant("n", n)
        .set_constant("R", z.re)
        .set_constant("X", z.im);
    w.a.bind(&mut map, ctx.bus(a));
    w.b.bind(&mut map, ctx.bus(b));
    w.s.bind(&mut map, ctx.bus(s));
    current.bind(&mut map, "Ir", "Ii", "Lr_w", "Li_w");
    map.finish()
}

/// Three-phase transformer built from three single-phase windings.
#[derive(Debug, Clone)]
pub struct Transformer {
    pub name: String,
    pub connection: TransformerConnection,
    pub primary: Vec<i64>,
    pub secondary: Vec<i64>,
    /// Per-unit winding ratio, tap included.
    pub ratio: f64,
    /// Series impedance on the secondary, per unit of the system base.
    pub z: Complex64,
    currents: Vec<ComplexUnknown>,
}

impl Transformer {
    pub fn new(
        name: &str,
        connection: &str,
        primary: Vec<i64>,
        secondary: Vec<i64>,
        ratio: f64,
        z: Complex64,
    ) -> Result<Self> {
        let connection = connection
            .parse::<TransformerConnection>()
            .map_err(|connection| PowerFlowError::UnsupportedConnection {
                element: name.to_string(),
                connection,
            })?;
        if primary.len() != 3 || secondary.len() != 3 {
            return Err(PowerFlowError::InvalidPhases {
                element: name.to_string(),
                reason: "transformers need three phases on both sides".to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            connection,
            primary,
            secondary,
            ratio,
            z,
            currents: vec![ComplexUnknown::UNASSIGNED; 3],
        })
    }

    /// Primary terminal pair of winding `k`.
    fn primary_pair(&self, k: usize) -> (i64, i64) {
        match self.connection {
            TransformerConnection::GwyeGwye => (self.primary[k], GND),
            TransformerConnection::DeltaGwye => (self.primary[k], self.primary[(k + 1) % 3]),
        }
    }
}

impl Device for Transformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign_nodes(&mut self, seq: &mut IndexSequence) {
        for current in &mut self.currents {
            *current = ComplexUnknown::assign(seq);
        }
    }

    fn bindings(&self, ctx: &StampContext) -> Result<Vec<BoundInput>> {
        let segment = winding_segment()?;
        (0..3)
            .map(|k| {
                let (a, b) = self.primary_pair(k);
                bind_winding(
                    &segment,
                    ctx,
                    a,
                    b,
                    self.secondary[k],
                    self.ratio,
                    self.z,
                    &self.currents[k],
                )
            })
            .collect()
    }
}
