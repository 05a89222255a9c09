use std::{fmt, io::Write};

use csv::WriterBuilder;
use nalgebra::DVector;
use serde::Serialize;
use tabled::{Table, Tabled, settings::Style};

use crate::basic::{error::Result, network::Network};

/// Limits the decimal places of a float when printed.
#[derive(Clone, Copy, PartialEq, PartialOrd)]
pub struct FloatWrapper {
    pub value: f64,
    pub precision: usize,
}

impl FloatWrapper {
    pub fn new(value: f64, precision: usize) -> Self {
        FloatWrapper { value, precision }
    }
}

impl fmt::Display for FloatWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1$}", self.value, self.precision)
    }
}

impl fmt::Debug for FloatWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1$}", self.value, self.precision)
    }
}

/// Solved phasor of one bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusVoltage {
    pub node: String,
    pub phase: String,
    pub v_mag: f64,
    pub v_ang_deg: f64,
    pub v_pu: f64,
}

/// Row of the printed bus report.
#[derive(Debug, Tabled)]
#[allow(non_snake_case)]
pub struct BusResTable {
    pub Node: String,
    pub Phase: String,
    pub V: FloatWrapper,
    pub Angle: FloatWrapper,
    pub Vpu: FloatWrapper,
}

impl From<&BusVoltage> for BusResTable {
    fn from(b: &BusVoltage) -> Self {
        BusResTable {
            Node: b.node.clone(),
            Phase: b.phase.clone(),
            V: FloatWrapper::new(b.v_mag, 2),
            Angle: FloatWrapper::new(b.v_ang_deg, 3),
            Vpu: FloatWrapper::new(b.v_pu, 5),
        }
    }
}

/// Bus phasors in network order.
pub fn bus_voltages(net: &Network, v: &DVector<f64>) -> Vec<BusVoltage> {
    net.buses
        .iter()
        .map(|bus| {
            let pu = net.bus_voltage(bus.id, v);
            let volts = pu * bus.v_nominal;
            BusVoltage {
                node: bus.node.clone(),
                phase: bus.phase.to_string(),
                v_mag: volts.norm(),
                v_ang_deg: volts.arg().to_degrees(),
                v_pu: pu.norm(),
            }
        })
        .collect()
}

/// Markdown table of the bus voltages.
pub fn format_bus_table(voltages: &[BusVoltage]) -> String {
    Table::new(voltages.iter().map(BusResTable::from))
        .with(Style::markdown())
        .to_string()
}

/// Writes one CSV row per bus.
pub fn write_voltages_csv<W: Write>(writer: W, voltages: &[BusVoltage]) -> Result<()> {
    let mut wtr = WriterBuilder::new().has_headers(true).from_writer(writer);
    for row in voltages {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}
