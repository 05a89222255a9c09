use std::{fs, path::Path};

use nalgebra::DMatrix;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::basic::{
    error::{PowerFlowError, Result},
    homotopy::PowerFlowConfig,
    network::{
        CapacitorControl, Connection, Network, Phase, RegulatorControl, TransformerRating, ZipComponents,
    },
};

/// Complex value written as `[re, im]`.
pub type ComplexPair = [f64; 2];

fn cplx(p: &ComplexPair) -> Complex64 {
    Complex64::new(p[0], p[1])
}

fn default_s_base() -> f64 {
    1.0
}

fn default_tap() -> f64 {
    1.0
}

fn default_regulator_connection() -> String {
    "WYE_WYE".to_string()
}

fn default_manual() -> String {
    "MANUAL".to_string()
}

fn default_true() -> bool {
    true
}

/// A node with one bus per phase.
#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct NodeRecord {
    pub name: String,
    pub phases: String,
    /// Line-to-neutral volts.
    pub nominal_voltage: f64,
    /// Shift of the flat-start angle, degrees.
    #[serde(default)]
    pub angle_offset_deg: f64,
}

#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct SourceRecord {
    pub name: String,
    pub node: String,
    pub phases: String,
    /// Line-to-neutral volts.
    pub voltage: f64,
    #[serde(default)]
    pub angle_deg: f64,
}

#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct LineRecord {
    pub name: String,
    pub from: String,
    pub to: String,
    pub phases: String,
    pub length: f64,
    /// Series impedance per unit length, ohms, already reduced to the phases.
    pub z: Vec<Vec<ComplexPair>>,
    /// Shunt admittance per unit length, siemens.
    pub y_shunt: Option<Vec<Vec<ComplexPair>>>,
}

#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct TransformerRecord {
    pub name: String,
    pub from: String,
    pub to: String,
    pub connection: String,
    pub s_rated_kva: f64,
    /// Line-to-line kV.
    pub v_primary_kv: f64,
    pub v_secondary_kv: f64,
    pub r_pct: f64,
    pub x_pct: f64,
    #[serde(default = "default_tap")]
    pub tap: f64,
}

#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct RegulatorRecord {
    pub name: String,
    pub from: String,
    pub to: String,
    pub phases: String,
    #[serde(default = "default_regulator_connection")]
    pub connection: String,
    pub taps: Vec<i32>,
    pub regulation: f64,
    pub raise_taps: u32,
    #[serde(default = "default_manual")]
    pub control: String,
}

#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct SwitchRecord {
    pub name: String,
    pub from: String,
    pub to: String,
    pub phases: String,
    #[serde(default = "default_true")]
    pub closed: bool,
}

#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct FuseRecord {
    pub name: String,
    pub from: String,
    pub to: String,
    pub phases: String,
    /// Amps.
    pub current_limit: f64,
}

#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct CapacitorRecord {
    pub name: String,
    pub node: String,
    pub phases: String,
    #[serde(default)]
    pub connection: Connection,
    /// Rated kvar per phase element.
    pub q_kvar: Vec<f64>,
    /// Rated volts across each element.
    pub v_rated: f64,
    #[serde(default = "default_manual")]
    pub control: String,
    pub voltage_low: Option<f64>,
    pub voltage_high: Option<f64>,
    pub closed: Option<Vec<bool>>,
}

/// ZIP load, complex power per phase in kVA at nominal voltage.
#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct LoadRecord {
    pub name: String,
    pub node: String,
    pub phases: String,
    #[serde(default)]
    pub connection: Connection,
    pub constant_power_kva: Option<Vec<ComplexPair>>,
    pub constant_current_kva: Option<Vec<ComplexPair>>,
    pub constant_impedance_kva: Option<Vec<ComplexPair>>,
}

#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct GeneratorRecord {
    pub name: String,
    pub node: String,
    pub phases: String,
    pub power_kva: Vec<ComplexPair>,
}

/// JSON network description.
#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct CaseFile {
    pub name: Option<String>,
    #[serde(default = "default_s_base")]
    pub s_base_mva: f64,
    pub config: Option<PowerFlowConfig>,
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub sources: Vec<SourceRecord>,
    #[serde(default)]
    pub lines: Vec<LineRecord>,
    #[serde(default)]
    pub transformers: Vec<TransformerRecord>,
    #[serde(default)]
    pub regulators: Vec<RegulatorRecord>,
    #[serde(default)]
    pub switches: Vec<SwitchRecord>,
    #[serde(default)]
    pub fuses: Vec<FuseRecord>,
    #[serde(default)]
    pub capacitors: Vec<CapacitorRecord>,
    #[serde(default)]
    pub loads: Vec<LoadRecord>,
    #[serde(default)]
    pub generators: Vec<GeneratorRecord>,
}

impl CaseFile {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Builds an unassigned network.
    pub fn to_network(&self) -> Result<Network> {
        Network::try_from(self)
    }
}

fn complex_matrix(element: &str, rows: &[Vec<ComplexPair>], n: usize) -> Result<DMatrix<Complex64>> {
    if rows.len() != n || rows.iter().any(|r| r.len() != n) {
        return Err(PowerFlowError::InvalidPhases {
            element: element.to_string(),
            reason: format!("expected a {n}x{n} matrix"),
        });
    }
    Ok(DMatrix::from_fn(n, n, |i, j| cplx(&rows[i][j])))
}

fn zip_components(record: &LoadRecord, n: usize) -> Result<Vec<ZipComponents>> {
    let pick = |values: &Option<Vec<ComplexPair>>| -> Result<Vec<Complex64>> {
        match values {
            None => Ok(vec![Complex64::new(0.0, 0.0); n]),
            Some(v) if v.len() == n => Ok(v.iter().map(|p| cplx(p) * 1e3).collect()),
            Some(v) => Err(PowerFlowError::InvalidPhases {
                element: record.name.clone(),
                reason: format!("{} values for {n} load elements", v.len()),
            }),
        }
    };
    let power = pick(&record.constant_power_kva)?;
    let current = pick(&record.constant_current_kva)?;
    let impedance = pick(&record.constant_impedance_kva)?;
    Ok((0..n)
        .map(|k| ZipComponents {
            constant_power: power[k],
            constant_current: current[k],
            constant_impedance: impedance[k],
        })
        .collect())
}

impl TryFrom<&CaseFile> for Network {
    type Error = PowerFlowError;

    fn try_from(case: &CaseFile) -> Result<Self> {
        let mut net = Network::new(case.s_base_mva * 1e6);

        for node in &case.nodes {
            let phases = Phase::parse_set(&node.phases)?;
            let ids = net.add_node(&node.name, &phases, node.nominal_voltage)?;
            if node.angle_offset_deg != 0.0 {
                for id in ids {
                    net.buses[id as usize].angle_deg += node.angle_offset_deg;
                }
            }
        }
        for s in &case.sources {
            let phases = Phase::parse_set(&s.phases)?;
            net.add_slack(&s.name, &s.node, &phases, s.voltage, s.angle_deg)?;
        }
        for l in &case.lines {
            let phases = Phase::parse_set(&l.phases)?;
            let z = complex_matrix(&l.name, &l.z, phases.len())?;
            let y = l
                .y_shunt
                .as_ref()
                .map(|y| complex_matrix(&l.name, y, phases.len()))
                .transpose()?;
            net.add_line(&l.name, &l.from, &l.to, &phases, &z, y.as_ref(), l.length)?;
        }
        for t in &case.transformers {
            let rating = TransformerRating {
                s_rated: t.s_rated_kva * 1e3,
                v_primary: t.v_primary_kv * 1e3,
                v_secondary: t.v_secondary_kv * 1e3,
                impedance: Complex64::new(t.r_pct, t.x_pct) / 100.0,
                tap: t.tap,
            };
            net.add_transformer(&t.name, &t.from, &t.to, &t.connection, &rating)?;
        }
        for r in &case.regulators {
            let phases = Phase::parse_set(&r.phases)?;
            let control: RegulatorControl = r.control.parse()?;
            net.add_regulator(
                &r.name,
                &r.from,
                &r.to,
                &phases,
                &r.connection,
                r.taps.clone(),
                r.regulation,
                r.raise_taps,
                control,
            )?;
        }
        for s in &case.switches {
            let phases = Phase::parse_set(&s.phases)?;
            net.add_switch(&s.name, &s.from, &s.to, &phases, s.closed)?;
        }
        for f in &case.fuses {
            let phases = Phase::parse_set(&f.phases)?;
            net.add_fuse(&f.name, &f.from, &f.to, &phases, f.current_limit)?;
        }
        for c in &case.capacitors {
            let phases = Phase::parse_set(&c.phases)?;
            let control = match c.control.to_ascii_uppercase().as_str() {
                "MANUAL" => CapacitorControl::Manual,
                "VOLT" => match (c.voltage_low, c.voltage_high) {
                    (Some(voltage_low), Some(voltage_high)) => CapacitorControl::Volt {
                        voltage_low,
                        voltage_high,
                    },
                    _ => {
                        return Err(PowerFlowError::Parse(format!(
                            "capacitor `{}`: VOLT control needs voltage_low and voltage_high",
                            c.name
                        )));
                    }
                },
                other => {
                    return Err(PowerFlowError::UnimplementedControl {
                        element: c.name.clone(),
                        mode: other.to_string(),
                    });
                }
            };
            let q: Vec<f64> = c.q_kvar.iter().map(|q| q * 1e3).collect();
            net.add_capacitor(&c.name, &c.node, &phases, c.connection, &q, c.v_rated, control)?;
            if let (Some(closed), Some(cap)) = (&c.closed, net.capacitors.last_mut()) {
                if closed.len() != cap.closed.len() {
                    return Err(PowerFlowError::InvalidPhases {
                        element: c.name.clone(),
                        reason: "one switch state per phase expected".to_string(),
                    });
                }
                cap.closed.clone_from(closed);
            }
        }
        for l in &case.loads {
            let phases = Phase::parse_set(&l.phases)?;
            let components = zip_components(l, phases.len())?;
            net.add_load(&l.name, &l.node, &phases, l.connection, components)?;
        }
        for g in &case.generators {
            let phases = Phase::parse_set(&g.phases)?;
            let power = g.power_kva.iter().map(|p| cplx(p) * 1e3).collect();
            net.add_generator(&g.name, &g.node, &phases, power)?;
        }
        Ok(net)
    }
}
