use nalgebra::DMatrix;
use num_complex::Complex64;

use super::{
    Capacitor, CapacitorControl, Connection, Fuse, Generator, Line, Load, Network, Phase, Regulator,
    RegulatorControl, SlackSource, Switch, Transformer, ZipComponents,
};
use crate::basic::error::{PowerFlowError, Result};

/// Nameplate data of a three-phase transformer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformerRating {
    /// Three-phase rating in VA.
    pub s_rated: f64,
    /// Line-to-line rated voltages in volts.
    pub v_primary: f64,
    pub v_secondary: f64,
    /// Series impedance in per unit of the transformer's own rating.
    pub impedance: Complex64,
    /// Off-nominal primary tap, 1.0 at nominal.
    pub tap: f64,
}

/// Element builders taking physical units. Per-unit conversion happens here,
/// against the base of the buses each element connects to.
impl Network {
    /// Ideal source at `node`; `v_ln` in volts, `angle_deg` added to each phase's nominal angle.
    pub fn add_slack(&mut self, name: &str, node: &str, phases: &[Phase], v_ln: f64, angle_deg: f64) -> Result<()> {
        let buses = self.resolve(name, node, phases)?;
        let set_points = buses
            .iter()
            .map(|&b| {
                let bus = self.bus(b);
                Complex64::from_polar(
                    v_ln / bus.v_nominal,
                    (bus.phase.nominal_angle_deg() + angle_deg).to_radians(),
                )
            })
            .collect();
        self.slack_sources.push(SlackSource::new(name, buses, set_points));
        Ok(())
    }

    /// Line from per-length data (ohms, siemens) and a length in the same unit.
    #[allow(clippy::too_many_arguments)]
    pub fn add_line(
        &mut self,
        name: &str,
        from: &str,
        to: &str,
        phases: &[Phase],
        z_per_length: &DMatrix<Complex64>,
        y_shunt_per_length: Option<&DMatrix<Complex64>>,
        length: f64,
    ) -> Result<()> {
        let from_buses = self.resolve(name, from, phases)?;
        let to_buses = self.resolve(name, to, phases)?;
        let v_base = self.bus(from_buses[0]).v_nominal;
        let z_base = v_base * v_base / self.s_base_phase();
        let z = z_per_length * Complex64::new(length / z_base, 0.0);
        let y_shunt = y_shunt_per_length.map(|y| y * Complex64::new(length * z_base, 0.0));
        self.lines.push(Line::new(name, from_buses, to_buses, &z, y_shunt)?);
        Ok(())
    }

    pub fn add_transformer(
        &mut self,
        name: &str,
        from: &str,
        to: &str,
        connection: &str,
        rating: &TransformerRating,
    ) -> Result<()> {
        let primary = self.resolve(name, from, &Phase::ALL)?;
        let secondary = self.resolve(name, to, &Phase::ALL)?;
        let delta = connection.to_ascii_uppercase().starts_with("DELTA");
        let winding_primary = if delta {
            rating.v_primary
        } else {
            rating.v_primary / 3f64.sqrt()
        };
        let winding_secondary = rating.v_secondary / 3f64.sqrt();
        let v_base_p = self.bus(primary[0]).v_nominal;
        let v_base_s = self.bus(secondary[0]).v_nominal;
        let ratio = rating.tap * (winding_primary / winding_secondary) * (v_base_s / v_base_p);

        // own-rating per unit -> ohms on the secondary -> system per unit
        let s_rated_phase = rating.s_rated / 3.0;
        let z_ohm = rating.impedance * (winding_secondary * winding_secondary / s_rated_phase);
        let z = z_ohm * (self.s_base_phase() / (v_base_s * v_base_s));

        self.transformers
            .push(Transformer::new(name, connection, primary, secondary, ratio, z)?);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_regulator(
        &mut self,
        name: &str,
        from: &str,
        to: &str,
        phases: &[Phase],
        connection: &str,
        taps: Vec<i32>,
        regulation: f64,
        raise_taps: u32,
        control: RegulatorControl,
    ) -> Result<()> {
        let from_buses = self.resolve(name, from, phases)?;
        let to_buses = self.resolve(name, to, phases)?;
        self.regulators.push(Regulator::new(
            name, connection, from_buses, to_buses, taps, regulation, raise_taps, control,
        )?);
        Ok(())
    }

    pub fn add_switch(&mut self, name: &str, from: &str, to: &str, phases: &[Phase], closed: bool) -> Result<()> {
        let from_buses = self.resolve(name, from, phases)?;
        let to_buses = self.resolve(name, to, phases)?;
        self.switches
            .push(Switch::new(name, from_buses, to_buses, vec![closed; phases.len()]));
        Ok(())
    }

    pub fn add_fuse(&mut self, name: &str, from: &str, to: &str, phases: &[Phase], current_limit: f64) -> Result<()> {
        let from_buses = self.resolve(name, from, phases)?;
        let to_buses = self.resolve(name, to, phases)?;
        self.fuses
            .push(Fuse::new(name, from_buses, to_buses, current_limit));
        Ok(())
    }

    /// `q_rated` is VAr per phase element at `v_rated`, the volts across it.
    #[allow(clippy::too_many_arguments)]
    pub fn add_capacitor(
        &mut self,
        name: &str,
        node: &str,
        phases: &[Phase],
        connection: Connection,
        q_rated: &[f64],
        v_rated: f64,
        control: CapacitorControl,
    ) -> Result<()> {
        let buses = self.resolve(name, node, phases)?;
        let closed = vec![true; buses.len()];
        let capacitor = Capacitor::new(
            name,
            connection,
            &buses,
            q_rated,
            v_rated,
            closed,
            control,
            &self.context(),
        )?;
        self.capacitors.push(capacitor);
        Ok(())
    }

    pub fn add_load(
        &mut self,
        name: &str,
        node: &str,
        phases: &[Phase],
        connection: Connection,
        components: Vec<ZipComponents>,
    ) -> Result<()> {
        let buses = self.resolve(name, node, phases)?;
        self.loads.push(Load::new(name, connection, &buses, components)?);
        Ok(())
    }

    pub fn add_generator(&mut self, name: &str, node: &str, phases: &[Phase], power: Vec<Complex64>) -> Result<()> {
        let buses = self.resolve(name, node, phases)?;
        if power.len() != buses.len() {
            return Err(PowerFlowError::InvalidPhases {
                element: name.to_string(),
                reason: "one power value per phase expected".to_string(),
            });
        }
        self.generators.push(Generator::new(name, buses, power));
        Ok(())
    }

    pub fn load_mut(&mut self, name: &str) -> Option<&mut Load> {
        self.loads.iter_mut().find(|l| l.name == name)
    }
}
