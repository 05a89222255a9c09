use std::str::FromStr;

use nalgebra::DVector;
use num_complex::Complex64;

use super::{
    ComplexUnknown, Device, DiscreteControl, GND, IndexSequence, StampContext,
    transformer::{bind_winding, winding_segment},
};
use crate::basic::{
    error::{PowerFlowError, Result},
    stamp::BoundInput,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegulatorControl {
    Manual,
    OutputVoltage,
    LineDropComp,
}

impl FromStr for RegulatorControl {
    type Err = PowerFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(Self::Manual),
            "OUTPUT_VOLTAGE" => Ok(Self::OutputVoltage),
            "LINE_DROP_COMP" => Ok(Self::LineDropComp),
            other => Err(PowerFlowError::Parse(format!("unknown regulator control `{other}`"))),
        }
    }
}

/// Wye-wye step voltage regulator, one ideal ratio per phase.
#[derive(Debug, Clone)]
pub struct Regulator {
    pub name: String,
    pub from: Vec<i64>,
    pub to: Vec<i64>,
    pub taps: Vec<i32>,
    /// Total regulation range, e.g. `0.1` for ±10 %.
    pub regulation: f64,
    pub raise_taps: u32,
    pub control: RegulatorControl,
    currents: Vec<ComplexUnknown>,
}

impl Regulator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        connection: &str,
        from: Vec<i64>,
        to: Vec<i64>,
        taps: Vec<i32>,
        regulation: f64,
        raise_taps: u32,
        control: RegulatorControl,
    ) -> Result<Self> {
        let upper = connection.to_ascii_uppercase();
        if upper != "WYE_WYE" && upper != "GWYE_GWYE" {
            return Err(PowerFlowError::UnsupportedConnection {
                element: name.to_string(),
                connection: connection.to_string(),
            });
        }
        if from.is_empty() || from.len() != to.len() || taps.len() != from.len() {
            return Err(PowerFlowError::InvalidPhases {
                element: name.to_string(),
                reason: "from, to and taps must have one entry per phase".to_string(),
            });
        }
        if raise_taps == 0 {
            return Err(PowerFlowError::InvalidPhases {
                element: name.to_string(),
                reason: "raise_taps must be positive".to_string(),
            });
        }
        let currents = vec![ComplexUnknown::UNASSIGNED; from.len()];
        Ok(Self {
            name: name.to_string(),
            from,
            to,
            taps,
            regulation,
            raise_taps,
            control,
            currents,
        })
    }

    /// Output over input voltage ratio of phase `k`.
    pub fn ratio(&self, k: usize) -> f64 {
        1.0 + self.regulation * self.taps[k] as f64 / self.raise_taps as f64
    }
}

impl Device for Regulator {
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
        (0..self.from.len())
            .map(|k| {
                bind_winding(
                    &segment,
                    ctx,
                    self.from[k],
                    GND,
                    self.to[k],
                    1.0 / self.ratio(k),
                    Complex64::new(0.0, 0.0),
                    &self.currents[k],
                )
            })
            .collect()
    }
}

impl DiscreteControl for Regulator {
    fn operate(&mut self, _ctx: &StampContext, _v: &DVector<f64>) -> Result<bool> {
        match self.control {
            RegulatorControl::Manual => Ok(false),
            RegulatorControl::OutputVoltage => Err(PowerFlowError::UnimplementedControl {
                element: self.name.clone(),
                mode: "OUTPUT_VOLTAGE".to_string(),
            }),
            RegulatorControl::LineDropComp => Err(PowerFlowError::UnimplementedControl {
                element: self.name.clone(),
                mode: "LINE_DROP_COMP".to_string(),
            }),
        }
    }
}
