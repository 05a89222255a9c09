use std::{fmt, str::FromStr};

use derive_more::Display;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::IndexSequence;
use crate::basic::{
    error::PowerFlowError,
    stamp::{IndexMap, SKIP},
    symbolic::Expr,
};

/// Id of the ground bus.
pub const GND: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn nominal_angle_deg(self) -> f64 {
        match self {
            Phase::A => 0.0,
            Phase::B => -120.0,
            Phase::C => 120.0,
        }
    }

    /// Phase following this one in a delta (A→B→C→A).
    pub fn next(self) -> Phase {
        match self {
            Phase::A => Phase::B,
            Phase::B => Phase::C,
            Phase::C => Phase::A,
        }
    }

    /// Parses a phase string like `"ABC"` or `"AC"`; `N` (neutral) is ignored.
    pub fn parse_set(s: &str) -> Result<Vec<Phase>, PowerFlowError> {
        let mut out = Vec::new();
        for c in s.chars() {
            let p = match c.to_ascii_uppercase() {
                'A' => Phase::A,
                'B' => Phase::B,
                'C' => Phase::C,
                'N' | 'S' => continue,
                other => {
                    return Err(PowerFlowError::Parse(format!(
                        "unknown phase `{other}` in `{s}`"
                    )));
                }
            };
            if !out.contains(&p) {
                out.push(p);
            }
        }
        out.sort();
        Ok(out)
    }
}

impl FromStr for Phase {
    type Err = PowerFlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Phase::parse_set(s)?.as_slice() {
            [p] => Ok(*p),
            _ => Err(PowerFlowError::Parse(format!("expected one phase, got `{s}`"))),
        }
    }
}

/// Global indices of a bus in the solution vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIndices {
    pub node_vr: usize,
    pub node_vi: usize,
    pub node_lambda_vr: usize,
    pub node_lambda_vi: usize,
}

impl NodeIndices {
    pub const UNASSIGNED: NodeIndices = NodeIndices {
        node_vr: SKIP,
        node_vi: SKIP,
        node_lambda_vr: SKIP,
        node_lambda_vi: SKIP,
    };
}

/// One phase at one node.
#[derive(Debug, Clone)]
pub struct Bus {
    pub id: i64,
    pub node: String,
    pub phase: Phase,
    /// Nominal line-to-neutral voltage in volts, also the per-unit base.
    pub v_nominal: f64,
    /// Flat-start angle in degrees.
    pub angle_deg: f64,
    /// Initial voltage override, per unit.
    pub v_init: Option<Complex64>,
    pub indices: NodeIndices,
}

pub(crate) static GROUND: Bus = Bus {
    id: GND,
    node: String::new(),
    phase: Phase::A,
    v_nominal: 1.0,
    angle_deg: 0.0,
    v_init: None,
    indices: NodeIndices::UNASSIGNED,
};

impl Bus {
    pub fn new(id: i64, node: &str, phase: Phase, v_nominal: f64) -> Self {
        Self {
            id,
            node: node.to_string(),
            phase,
            v_nominal,
            angle_deg: phase.nominal_angle_deg(),
            v_init: None,
            indices: NodeIndices::UNASSIGNED,
        }
    }

    pub(crate) fn assign_nodes(&mut self, seq: &mut IndexSequence) {
        self.indices = NodeIndices {
            node_vr: seq.next(),
            node_vi: seq.next(),
            node_lambda_vr: seq.next_dual(),
            node_lambda_vi: seq.next_dual(),
        };
    }

    /// Flat-start phasor in per unit.
    pub fn initial_voltage(&self) -> Complex64 {
        self.v_init
            .unwrap_or_else(|| Complex64::from_polar(1.0, self.angle_deg.to_radians()))
    }
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.phase)
    }
}

/// Symbol names of a device terminal: voltages `Vr_t`, `Vi_t` and KCL duals `Lr_t`, `Li_t`.
#[derive(Debug, Clone)]
pub(crate) struct Terminal {
    pub vr: String,
    pub vi: String,
    pub lr: String,
    pub li: String,
}

impl Terminal {
    pub fn new(tag: &str) -> Self {
        Self {
            vr: format!("Vr_{tag}"),
            vi: format!("Vi_{tag}"),
            lr: format!("Lr_{tag}"),
            li: format!("Li_{tag}"),
        }
    }

    pub fn vr(&self) -> Expr {
        Expr::sym(&self.vr)
    }

    pub fn vi(&self) -> Expr {
        Expr::sym(&self.vi)
    }

    /// KCL term for a current `(ir, ii)` leaving the bus into the device.
    pub fn injection(&self, ir: Expr, ii: Expr) -> Expr {
        Expr::sym(&self.lr) * ir + Expr::sym(&self.li) * ii
    }

    pub fn bind(&self, map: &mut IndexMap, bus: &Bus) {
        let ix = &bus.indices;
        map.pair(&self.vr, &self.lr, ix.node_vr, ix.node_lambda_vr)
            .pair(&self.vi, &self.li, ix.node_vi, ix.node_lambda_vi);
    }
}

/// Symbol lists for a set of terminals, primals and duals separately.
pub(crate) fn terminal_symbols(terminals: &[&Terminal]) -> (Vec<String>, Vec<String>) {
    let mut primals = Vec::new();
    let mut duals = Vec::new();
    for t in terminals {
        primals.push(t.vr.clone());
        primals.push(t.vi.clone());
        duals.push(t.lr.clone());
        duals.push(t.li.clone());
    }
    (primals, duals)
}

/// A device-internal complex unknown (e.g. a source or winding current) and the
/// dual of the constraint that determines it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComplexUnknown {
    pub re: usize,
    pub im: usize,
    pub lambda_re: usize,
    pub lambda_im: usize,
}

impl ComplexUnknown {
    pub const UNASSIGNED: ComplexUnknown = ComplexUnknown {
        re: SKIP,
        im: SKIP,
        lambda_re: SKIP,
        lambda_im: SKIP,
    };

    pub(crate) fn assign(seq: &mut IndexSequence) -> Self {
        Self {
            re: seq.next(),
            im: seq.next(),
            lambda_re: seq.next_dual(),
            lambda_im: seq.next_dual(),
        }
    }

    /// Binds `(re, im)` primals with the constraint duals `(dual_re, dual_im)`.
    pub(crate) fn bind(&self, map: &mut IndexMap, re: &str, im: &str, dual_re: &str, dual_im: &str) {
        map.pair(re, dual_re, self.re, self.lambda_re)
            .pair(im, dual_im, self.im, self.lambda_im);
    }

    pub fn value(&self, v: &nalgebra::DVector<f64>) -> Complex64 {
        Complex64::new(v[self.re], v[self.im])
    }
}
