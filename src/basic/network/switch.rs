use std::sync::Arc;

use nalgebra::DVector;
use tracing::info;

use super::{Device, DiscreteControl, StampContext, Terminal};
use crate::basic::{
    error::Result,
    stamp::{BoundInput, IndexMap},
    symbolic::{LagrangeSegment, parse_expression},
};

/// Per-unit conductance of a closed switch or intact fuse.
pub const CLOSED_CONDUCTANCE: f64 = 1e4;

const CONDUCTANCE_EQUATION: &str = "G*((Lr_f - Lr_t)*(Vr_f - Vr_t) + (Li_f - Li_t)*(Vi_f - Vi_t))";

fn conductance_segment() -> Result<Arc<LagrangeSegment>> {
    LagrangeSegment::cached(
        parse_expression(CONDUCTANCE_EQUATION)?,
        &["G"],
        &["Vr_f", "Vi_f", "Vr_t", "Vi_t"],
        &["Lr_f", "Li_f", "Lr_t", "Li_t"],
    )
}

/// Binds a per-phase conductance between `from[k]` and `to[k]` for every conducting phase.
fn conductance_bindings(
    ctx: &StampContext,
    from: &[i64],
    to: &[i64],
    conducting: impl Iterator<Item = bool>,
) -> Result<Vec<BoundInput>> {
    let segment = conductance_segment()?;
    let (f, t) = (Terminal::new("f"), Terminal::new("t"));
    let mut out = Vec::new();
    for ((&a, &b), on) in from.iter().zip(to).zip(conducting) {
        if !on {
            continue;
        }
        let mut map = IndexMap::new(&segment);
        map.set_constant("G", CLOSED_CONDUCTANCE);
        f.bind(&mut map, ctx.bus(a));
        t.bind(&mut map, ctx.bus(b));
        out.push(map.finish()?);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct Switch {
    pub name: String,
    pub from: Vec<i64>,
    pub to: Vec<i64>,
    pub closed: Vec<bool>,
}

impl Switch {
    pub fn new(name: &str, from: Vec<i64>, to: Vec<i64>, closed: Vec<bool>) -> Self {
        Self {
            name: name.to_string(),
            from,
            to,
            closed,
        }
    }
}

impl Device for Switch {
    fn name(&self) -> &str {
        &self.name
    }

    fn bindings(&self, ctx: &StampContext) -> Result<Vec<BoundInput>> {
        conductance_bindings(ctx, &self.from, &self.to, self.closed.iter().copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseStatus {
    Good,
    Blown,
}

#[derive(Debug, Clone)]
pub struct Fuse {
    pub name: String,
    pub from: Vec<i64>,
    pub to: Vec<i64>,
    pub status: Vec<FuseStatus>,
    /// Blowing current in amps.
    pub current_limit: f64,
}

impl Fuse {
    pub fn new(name: &str, from: Vec<i64>, to: Vec<i64>, current_limit: f64) -> Self {
        let status = vec![FuseStatus::Good; from.len()];
        Self {
            name: name.to_string(),
            from,
            to,
            status,
            current_limit,
        }
    }

    /// Current magnitude through each intact phase in amps; blown phases read zero.
    pub fn currents_amps(&self, ctx: &StampContext, v: &DVector<f64>) -> Vec<f64> {
        self.from
            .iter()
            .zip(&self.to)
            .zip(&self.status)
            .map(|((&a, &b), status)| match status {
                FuseStatus::Blown => 0.0,
                FuseStatus::Good => {
                    let i_pu = (ctx.voltage(a, v) - ctx.voltage(b, v)) * CLOSED_CONDUCTANCE;
                    i_pu.norm() * ctx.i_base(a)
                }
            })
            .collect()
    }
}

impl Device for Fuse {
    fn name(&self) -> &str {
        &self.name
    }

    fn bindings(&self, ctx: &StampContext) -> Result<Vec<BoundInput>> {
        conductance_bindings(
            ctx,
            &self.from,
            &self.to,
            self.status.iter().map(|s| *s == FuseStatus::Good),
        )
    }
}

impl DiscreteControl for Fuse {
    /// Blows every intact phase above the limit. A blown phase stays blown.
    fn operate(&mut self, ctx: &StampContext, v: &DVector<f64>) -> Result<bool> {
        let currents = self.currents_amps(ctx, v);
        let mut changed = false;
        for (k, amps) in currents.into_iter().enumerate() {
            if self.status[k] == FuseStatus::Good && amps > self.current_limit {
                info!(fuse = %self.name, phase = k, amps, limit = self.current_limit, "fuse blown");
                self.status[k] = FuseStatus::Blown;
                changed = true;
            }
        }
        Ok(changed)
    }
}
