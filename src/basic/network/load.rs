use std::sync::Arc;

use num_complex::Complex64;

use super::{Connection, Device, GND, StampContext, Terminal, terminal_symbols};
use crate::basic::{
    error::{PowerFlowError, Result},
    stamp::{BoundInput, IndexMap},
    symbolic::{Expr, LagrangeSegment, TX_FACTOR},
};

/// ZIP components of one phase, complex power in VA at nominal voltage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ZipComponents {
    pub constant_power: Complex64,
    pub constant_current: Complex64,
    pub constant_impedance: Complex64,
}

impl ZipComponents {
    pub fn power(s: Complex64) -> Self {
        Self {
            constant_power: s,
            ..Default::default()
        }
    }

    fn shape(&self) -> [bool; 3] {
        let nz = |c: Complex64| c.re != 0.0 || c.im != 0.0;
        [
            nz(self.constant_power),
            nz(self.constant_current),
            nz(self.constant_impedance),
        ]
    }
}

/// Current drawn by the ZIP components present in `shape`.
///
/// With `vr, vi` the voltage across the element, `m² = vr² + vi²` and the
/// nominal magnitude `vnom`:
///
/// * constant power: `I = conj(S) · V / m²`
/// * constant current: `I = conj(S) · V / (m · vnom)`
/// * constant impedance: `I = conj(S) · V / vnom²`
fn zip_segment(shape: [bool; 3]) -> Result<Arc<LagrangeSegment>> {
    let (p, q) = (Terminal::new("p"), Terminal::new("q"));
    let vr = p.vr() - q.vr();
    let vi = p.vi() - q.vi();
    let m2 = vr.clone() * vr.clone() + vi.clone() * vi.clone();
    let vnom = Expr::sym("vnom");

    let mut constants: Vec<&str> = Vec::new();
    let mut ir = Vec::new();
    let mut ii = Vec::new();
    let components = [("Pp", "Qp"), ("Pi", "Qi"), ("Pz", "Qz")];
    for (k, (pn, qn)) in components.into_iter().enumerate() {
        if !shape[k] {
            continue;
        }
        constants.extend([pn, qn]);
        let (pe, qe) = (Expr::sym(pn), Expr::sym(qn));
        let scale = match k {
            0 => m2.clone().recip(),
            1 => (Expr::sqrt(m2.clone()) * vnom.clone()).recip(),
            _ => Expr::pow(vnom.clone(), -2),
        };
        ir.push((pe.clone() * vr.clone() + qe.clone() * vi.clone()) * scale.clone());
        ii.push((pe * vi.clone() - qe * vr.clone()) * scale);
    }
    if shape[1] || shape[2] {
        constants.push("vnom");
    }
    constants.push(TX_FACTOR);

    let (ir, ii) = (Expr::sum(ir), Expr::sum(ii));
    let lagrangian = (Expr::one() - Expr::sym(TX_FACTOR))
        * (p.injection(ir.clone(), ii.clone()) - q.injection(ir, ii));
    let (primals, duals) = terminal_symbols(&[&p, &q]);
    let primals: Vec<&str> = primals.iter().map(String::as_str).collect();
    let duals: Vec<&str> = duals.iter().map(String::as_str).collect();
    LagrangeSegment::cached(lagrangian, &constants, &primals, &duals)
}

fn zip_bindings(
    ctx: &StampContext,
    terminals: &[(i64, i64)],
    components: &[ZipComponents],
    vnom: f64,
    scale: f64,
) -> Result<Vec<BoundInput>> {
    let (p, q) = (Terminal::new("p"), Terminal::new("q"));
    let mut out = Vec::new();
    for (&(a, b), zip) in terminals.iter().zip(components) {
        let shape = zip.shape();
        if !shape.iter().any(|s| *s) {
            continue;
        }
        let segment = zip_segment(shape)?;
        let mut map = IndexMap::new(&segment);
        let to_pu = scale / ctx.s_base_phase;
        for (present, (pn, qn), s) in [
            (shape[0], ("Pp", "Qp"), zip.constant_power),
            (shape[1], ("Pi", "Qi"), zip.constant_current),
            (shape[2], ("Pz", "Qz"), zip.constant_impedance),
        ] {
            if present {
                map.set_constant(pn, s.re * to_pu).set_constant(qn, s.im * to_pu);
            }
        }
        if shape[1] || shape[2] {
            map.set_constant("vnom", vnom);
        }
        p.bind(&mut map, ctx.bus(a));
        q.bind(&mut map, ctx.bus(b));
        out.push(map.finish()?);
    }
    Ok(out)
}

fn terminal_pairs(name: &str, connection: Connection, buses: &[i64]) -> Result<Vec<(i64, i64)>> {
    match connection {
        Connection::Wye => Ok(buses.iter().map(|&b| (b, GND)).collect()),
        Connection::Delta if buses.len() == 3 => {
            Ok((0..3).map(|k| (buses[k], buses[(k + 1) % 3])).collect())
        }
        Connection::Delta => Err(PowerFlowError::InvalidPhases {
            element: name.to_string(),
            reason: "delta loads need three phases".to_string(),
        }),
    }
}

/// ZIP load. Delta phases are AB, BC, CA.
#[derive(Debug, Clone)]
pub struct Load {
    pub name: String,
    pub connection: Connection,
    pub terminals: Vec<(i64, i64)>,
    pub components: Vec<ZipComponents>,
    /// Per-load multiplier, e.g. from a load shape.
    pub scaling: f64,
}

impl Load {
    pub fn new(name: &str, connection: Connection, buses: &[i64], components: Vec<ZipComponents>) -> Result<Self> {
        if components.len() != buses.len() {
            return Err(PowerFlowError::InvalidPhases {
                element: name.to_string(),
                reason: format!("{} buses but {} component sets", buses.len(), components.len()),
            });
        }
        Ok(Self {
            name: name.to_string(),
            connection,
            terminals: terminal_pairs(name, connection, buses)?,
            components,
            scaling: 1.0,
        })
    }

    /// Nominal per-unit magnitude across one element.
    fn vnom(&self) -> f64 {
        match self.connection {
            Connection::Wye => 1.0,
            Connection::Delta => 3f64.sqrt(),
        }
    }
}

impl Device for Load {
    fn name(&self) -> &str {
        &self.name
    }

    fn bindings(&self, ctx: &StampContext) -> Result<Vec<BoundInput>> {
        zip_bindings(
            ctx,
            &self.terminals,
            &self.components,
            self.vnom(),
            self.scaling * ctx.load_factor,
        )
    }
}

/// Wye constant-power generator.
#[derive(Debug, Clone)]
pub struct Generator {
    pub name: String,
    pub buses: Vec<i64>,
    /// Generated complex power per phase in VA.
    pub power: Vec<Complex64>,
}

impl Generator {
    pub fn new(name: &str, buses: Vec<i64>, power: Vec<Complex64>) -> Self {
        Self {
            name: name.to_string(),
            buses,
            power,
        }
    }
}

impl Device for Generator {
    fn name(&self) -> &str {
        &self.name
    }

    fn bindings(&self, ctx: &StampContext) -> Result<Vec<BoundInput>> {
        let terminals: Vec<(i64, i64)> = self.buses.iter().map(|&b| (b, GND)).collect();
        let components: Vec<ZipComponents> =
            self.power.iter().map(|s| ZipComponents::power(-s)).collect();
        zip_bindings(ctx, &terminals, &components, 1.0, 1.0)
    }
}
