use std::sync::Arc;

use nalgebra::DVector;
use tracing::debug;

use super::{Connection, Device, DiscreteControl, GND, StampContext, Terminal};
use crate::basic::{
    error::{PowerFlowError, Result},
    stamp::{BoundInput, IndexMap},
    symbolic::{LagrangeSegment, TX_FACTOR, parse_expression},
};

const SHUNT_EQUATION: &str =
    "B*(1 - tx_factor)*((Li_p - Li_q)*(Vr_p - Vr_q) - (Lr_p - Lr_q)*(Vi_p - Vi_q))";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CapacitorControl {
    Manual,
    /// Close below `voltage_low`, open above `voltage_high` (volts).
    Volt { voltage_low: f64, voltage_high: f64 },
}

/// Switched shunt capacitor bank.
#[derive(Debug, Clone)]
pub struct Capacitor {
    pub name: String,
    pub connection: Connection,
    /// `(p, q)` terminal pair per phase; `q` is ground for wye.
    pub terminals: Vec<(i64, i64)>,
    /// Per-unit susceptance per phase.
    pub susceptance: Vec<f64>,
    pub closed: Vec<bool>,
    pub control: CapacitorControl,
}

impl Capacitor {
    /// `buses` are the capacitor's phase buses in phase order; for delta each
    /// phase connects to the next one. `q_rated` is VAr per phase at the
    /// rated voltage `v_rated` (volts across the element).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        connection: Connection,
        buses: &[i64],
        q_rated: &[f64],
        v_rated: f64,
        closed: Vec<bool>,
        control: CapacitorControl,
        ctx: &StampContext,
    ) -> Result<Self> {
        if buses.is_empty() || q_rated.len() != buses.len() || closed.len() != buses.len() {
            return Err(PowerFlowError::InvalidPhases {
                element: name.to_string(),
                reason: "one rating and switch state per phase expected".to_string(),
            });
        }
        if connection == Connection::Delta && buses.len() != 3 {
            return Err(PowerFlowError::InvalidPhases {
                element: name.to_string(),
                reason: "delta capacitors need three phases".to_string(),
            });
        }
        let terminals: Vec<(i64, i64)> = match connection {
            Connection::Wye => buses.iter().map(|&b| (b, GND)).collect(),
            Connection::Delta => (0..3).map(|k| (buses[k], buses[(k + 1) % 3])).collect(),
        };
        let susceptance = terminals
            .iter()
            .zip(q_rated)
            .map(|(&(p, _), q)| {
                let v_base = ctx.bus(p).v_nominal;
                q / ctx.s_base_phase * (v_base / v_rated).powi(2)
            })
            .collect();
        Ok(Self {
            name: name.to_string(),
            connection,
            terminals,
            susceptance,
            closed,
            control,
        })
    }

    fn segment() -> Result<Arc<LagrangeSegment>> {
        LagrangeSegment::cached(
            parse_expression(SHUNT_EQUATION)?,
            &["B", TX_FACTOR],
            &["Vr_p", "Vi_p", "Vr_q", "Vi_q"],
            &["Lr_p", "Li_p", "Lr_q", "Li_q"],
        )
    }

    /// Voltage across each phase element in volts.
    pub fn voltages(&self, ctx: &StampContext, v: &DVector<f64>) -> Vec<f64> {
        self.terminals
            .iter()
            .map(|&(p, q)| (ctx.voltage(p, v) - ctx.voltage(q, v)).norm() * ctx.bus(p).v_nominal)
            .collect()
    }
}

impl Device for Capacitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn bindings(&self, ctx: &StampContext) -> Result<Vec<BoundInput>> {
        let segment = Self::segment()?;
        let (p, q) = (Terminal::new("p"), Terminal::new("q"));
        let mut out = Vec::new();
        for ((&(a, b), &susceptance), &closed) in
            self.terminals.iter().zip(&self.susceptance).zip(&self.closed)
        {
            if !closed {
                continue;
            }
            let mut map = IndexMap::new(&segment);
            map.set_constant("B", susceptance);
            p.bind(&mut map, ctx.bus(a));
            q.bind(&mut map, ctx.bus(b));
            out.push(map.finish()?);
        }
        Ok(out)
    }
}

impl DiscreteControl for Capacitor {
    fn operate(&mut self, ctx: &StampContext, v: &DVector<f64>) -> Result<bool> {
        let CapacitorControl::Volt {
            voltage_low,
            voltage_high,
        } = self.control
        else {
            return Ok(false);
        };
        let mut changed = false;
        for (k, volts) in self.voltages(ctx, v).into_iter().enumerate() {
            let next = if !self.closed[k] && volts < voltage_low {
                true
            } else if self.closed[k] && volts > voltage_high {
                false
            } else {
                continue;
            };
            debug!(capacitor = %self.name, phase = k, volts, closed = next, "capacitor switched");
            self.closed[k] = next;
            changed = true;
        }
        Ok(changed)
    }
}
