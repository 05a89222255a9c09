//! Network model: buses, devices and their equations.
//!
//! Devices are described per unit on each bus's nominal line-to-neutral
//! voltage and a per-phase power base of `S_base / 3`.

mod build;
mod bus;
mod capacitor;
mod line;
mod load;
mod regulator;
mod slack;
mod switch;
mod transformer;

use std::{collections::HashMap, sync::Arc};

use nalgebra::DVector;
use num_complex::Complex64;
use tracing::{debug, trace};

pub use build::TransformerRating;
pub use bus::{Bus, ComplexUnknown, GND, NodeIndices, Phase};
pub(crate) use bus::{GROUND, Terminal, terminal_symbols};
pub use capacitor::{Capacitor, CapacitorControl};
pub use line::Line;
pub use load::{Generator, Load, ZipComponents};
pub use regulator::{Regulator, RegulatorControl};
pub use slack::SlackSource;
pub use switch::{Fuse, FuseStatus, Switch, CLOSED_CONDUCTANCE};
pub use transformer::{Transformer, TransformerConnection};

use crate::basic::{
    error::{PowerFlowError, Result},
    stamp::{BoundInput, SKIP, StampInstance, accumulate_residuals, bind},
};

/// Wye (to ground) or delta (phase to phase) connection of a shunt device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Connection {
    #[default]
    Wye,
    Delta,
}

/// Hands out dense, monotonically increasing indices.
#[derive(Debug, Default)]
pub struct IndexSequence {
    next: usize,
    optimization: bool,
}

impl IndexSequence {
    pub fn new(optimization: bool) -> Self {
        Self {
            next: 0,
            optimization,
        }
    }

    pub fn next(&mut self) -> usize {
        self.next += 1;
        self.next - 1
    }

    /// Index for a dual variable, [`SKIP`] outside optimization mode.
    pub fn next_dual(&mut self) -> usize {
        if self.optimization { self.next() } else { SKIP }
    }

    pub fn len(&self) -> usize {
        self.next
    }

    pub fn is_empty(&self) -> bool {
        self.next == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Unassigned,
    Assigned,
    Stamped,
    Solved,
}

/// Read-only view handed to devices while they build their equations.
#[derive(Debug, Clone, Copy)]
pub struct StampContext<'a> {
    pub buses: &'a [Bus],
    /// Per-phase power base in VA.
    pub s_base_phase: f64,
    pub load_factor: f64,
}

impl<'a> StampContext<'a> {
    pub fn bus(&self, id: i64) -> &'a Bus {
        if id == GND {
            &GROUND
        } else {
            &self.buses[id as usize]
        }
    }

    /// Per-unit phasor of a bus at `v`; ground reads zero.
    pub fn voltage(&self, id: i64, v: &DVector<f64>) -> Complex64 {
        let ix = self.bus(id).indices;
        if ix.node_vr == SKIP {
            return Complex64::new(0.0, 0.0);
        }
        Complex64::new(v[ix.node_vr], v[ix.node_vi])
    }

    /// Current base in amps at a bus.
    pub fn i_base(&self, id: i64) -> f64 {
        self.s_base_phase / self.bus(id).v_nominal
    }
}

/// Equations a device contributes to the system.
pub trait Device {
    fn name(&self) -> &str;

    /// Claims indices for device-internal unknowns.
    fn assign_nodes(&mut self, _seq: &mut IndexSequence) {}

    /// Segments bound to this device's parameters and indices.
    fn bindings(&self, ctx: &StampContext) -> Result<Vec<BoundInput>>;

    fn get_stamps(&self, ctx: &StampContext) -> Result<Vec<StampInstance>> {
        let mut out = Vec::new();
        for input in self.bindings(ctx)? {
            out.extend(bind(&Arc::new(input)));
        }
        Ok(out)
    }

    /// Adds this device's equation residuals at `v` (homotopy factor zero).
    fn calculate_residuals(&self, ctx: &StampContext, v: &DVector<f64>, res: &mut DVector<f64>) -> Result<()> {
        for input in self.bindings(ctx)? {
            accumulate_residuals(&input, v, res);
        }
        Ok(())
    }

    /// Device-specific initial values.
    fn init_v(&self, _ctx: &StampContext, _v: &mut DVector<f64>) {}
}

/// Devices with a discrete operating rule evaluated between solves.
pub trait DiscreteControl {
    /// Updates discrete state from a converged solution; returns `true` if anything changed.
    fn operate(&mut self, ctx: &StampContext, v: &DVector<f64>) -> Result<bool>;
}

/// Borrowed view of any network element.
#[derive(Debug, Clone, Copy)]
pub enum Element<'a> {
    Slack(&'a SlackSource),
    Line(&'a Line),
    Transformer(&'a Transformer),
    Regulator(&'a Regulator),
    Switch(&'a Switch),
    Fuse(&'a Fuse),
    Capacitor(&'a Capacitor),
    Load(&'a Load),
    Generator(&'a Generator),
}

impl<'a> Element<'a> {
    pub fn device(&self) -> &'a dyn Device {
        match *self {
            Element::Slack(d) => d,
            Element::Line(d) => d,
            Element::Transformer(d) => d,
            Element::Regulator(d) => d,
            Element::Switch(d) => d,
            Element::Fuse(d) => d,
            Element::Capacitor(d) => d,
            Element::Load(d) => d,
            Element::Generator(d) => d,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Element::Slack(_) => "slack",
            Element::Line(_) => "line",
            Element::Transformer(_) => "transformer",
            Element::Regulator(_) => "regulator",
            Element::Switch(_) => "switch",
            Element::Fuse(_) => "fuse",
            Element::Capacitor(_) => "capacitor",
            Element::Load(_) => "load",
            Element::Generator(_) => "generator",
        }
    }
}

/// A multi-phase distribution network.
#[derive(Debug)]
pub struct Network {
    /// Three-phase power base in VA.
    pub s_base: f64,
    /// Global multiplier on every load.
    pub load_factor: f64,
    pub buses: Vec<Bus>,
    node_lookup: HashMap<String, [Option<i64>; 3]>,
    pub slack_sources: Vec<SlackSource>,
    pub lines: Vec<Line>,
    pub transformers: Vec<Transformer>,
    pub regulators: Vec<Regulator>,
    pub switches: Vec<Switch>,
    pub fuses: Vec<Fuse>,
    pub capacitors: Vec<Capacitor>,
    pub loads: Vec<Load>,
    pub generators: Vec<Generator>,
    state: AssemblyState,
    size_y: usize,
    optimization: bool,
}

impl Network {
    pub fn new(s_base: f64) -> Self {
        Self {
            s_base,
            load_factor: 1.0,
            buses: Vec::new(),
            node_lookup: HashMap::new(),
            slack_sources: Vec::new(),
            lines: Vec::new(),
            transformers: Vec::new(),
            regulators: Vec::new(),
            switches: Vec::new(),
            fuses: Vec::new(),
            capacitors: Vec::new(),
            loads: Vec::new(),
            generators: Vec::new(),
            state: AssemblyState::Unassigned,
            size_y: 0,
            optimization: false,
        }
    }

    pub fn s_base_phase(&self) -> f64 {
        self.s_base / 3.0
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    pub fn size_y(&self) -> usize {
        self.size_y
    }

    pub fn optimization(&self) -> bool {
        self.optimization
    }

    pub(crate) fn set_state(&mut self, state: AssemblyState) {
        self.state = state;
    }

    /// Adds one bus per phase of a node. `v_nominal` is line-to-neutral volts.
    pub fn add_node(&mut self, node: &str, phases: &[Phase], v_nominal: f64) -> Result<Vec<i64>> {
        if self.node_lookup.contains_key(node) {
            return Err(PowerFlowError::InvalidPhases {
                element: node.to_string(),
                reason: "node defined twice".to_string(),
            });
        }
        if phases.is_empty() || !(v_nominal > 0.0) {
            return Err(PowerFlowError::InvalidPhases {
                element: node.to_string(),
                reason: "a node needs at least one phase and a positive nominal voltage".to_string(),
            });
        }
        let mut slots = [None; 3];
        let mut ids = Vec::with_capacity(phases.len());
        for &phase in phases {
            let id = self.buses.len() as i64;
            self.buses.push(Bus::new(id, node, phase, v_nominal));
            slots[phase.index()] = Some(id);
            ids.push(id);
        }
        self.node_lookup.insert(node.to_string(), slots);
        Ok(ids)
    }

    pub fn bus_id(&self, node: &str, phase: Phase) -> Option<i64> {
        self.node_lookup.get(node).and_then(|s| s[phase.index()])
    }

    pub fn bus(&self, id: i64) -> &Bus {
        if id == GND {
            &GROUND
        } else {
            &self.buses[id as usize]
        }
    }

    /// Resolves `node` to one bus per phase, in the order given. An empty phase list is rejected.
    pub fn resolve(&self, element: &str, node: &str, phases: &[Phase]) -> Result<Vec<i64>> {
        if phases.is_empty() {
            return Err(PowerFlowError::InvalidPhases {
                element: element.to_string(),
                reason: format!("no phases given at node `{node}`"),
            });
        }
        let slots = self
            .node_lookup
            .get(node)
            .ok_or_else(|| PowerFlowError::UnknownNode {
                element: element.to_string(),
                node: node.to_string(),
            })?;
        phases
            .iter()
            .map(|p| {
                slots[p.index()].ok_or_else(|| PowerFlowError::InvalidPhases {
                    element: element.to_string(),
                    reason: format!("node `{node}` has no phase {p}"),
                })
            })
            .collect()
    }

    /// Overrides the flat-start voltage of one bus (per unit).
    pub fn set_initial_voltage(&mut self, id: i64, v: Complex64) {
        if let Some(bus) = self.buses.get_mut(id as usize) {
            bus.v_init = Some(v);
        }
    }

    pub(crate) fn context(&self) -> StampContext<'_> {
        StampContext {
            buses: &self.buses,
            s_base_phase: self.s_base_phase(),
            load_factor: self.load_factor,
        }
    }

    /// Elements whose equations do not change across Newton iterations of a run.
    pub fn nr_invariant_elements(&self) -> impl Iterator<Item = Element<'_>> {
        let slack = self.slack_sources.iter().map(Element::Slack);
        let lines = self.lines.iter().map(Element::Line);
        let transformers = self.transformers.iter().map(Element::Transformer);
        let regulators = self.regulators.iter().map(Element::Regulator);
        let switches = self.switches.iter().map(Element::Switch);
        let fuses = self.fuses.iter().map(Element::Fuse);
        let capacitors = self.capacitors.iter().map(Element::Capacitor);
        slack
            .chain(lines)
            .chain(transformers)
            .chain(regulators)
            .chain(switches)
            .chain(fuses)
            .chain(capacitors)
    }

    pub fn nr_variable_elements(&self) -> impl Iterator<Item = Element<'_>> {
        let loads = self.loads.iter().map(Element::Load);
        let generators = self.generators.iter().map(Element::Generator);
        loads.chain(generators)
    }

    pub fn elements(&self) -> impl Iterator<Item = Element<'_>> {
        self.nr_invariant_elements().chain(self.nr_variable_elements())
    }

    /// Assigns every index exactly once: buses, then invariant, then variable elements.
    pub fn assign_nodes(&mut self, optimization: bool) -> Result<usize> {
        if self.state != AssemblyState::Unassigned {
            return Err(PowerFlowError::NodesAlreadyAssigned);
        }
        let mut seq = IndexSequence::new(optimization);
        for bus in &mut self.buses {
            bus.assign_nodes(&mut seq);
        }
        let invariant = self
            .slack_sources
            .iter_mut()
            .map(|d| d as &mut dyn Device)
            .chain(self.lines.iter_mut().map(|d| d as &mut dyn Device))
            .chain(self.transformers.iter_mut().map(|d| d as &mut dyn Device))
            .chain(self.regulators.iter_mut().map(|d| d as &mut dyn Device))
            .chain(self.switches.iter_mut().map(|d| d as &mut dyn Device))
            .chain(self.fuses.iter_mut().map(|d| d as &mut dyn Device))
            .chain(self.capacitors.iter_mut().map(|d| d as &mut dyn Device));
        for device in invariant {
            device.assign_nodes(&mut seq);
        }
        let variable = self
            .loads
            .iter_mut()
            .map(|d| d as &mut dyn Device)
            .chain(self.generators.iter_mut().map(|d| d as &mut dyn Device));
        for device in variable {
            device.assign_nodes(&mut seq);
        }
        self.size_y = seq.len();
        self.optimization = optimization;
        self.state = AssemblyState::Assigned;
        debug!(size_y = self.size_y, optimization, "assigned network indices");
        Ok(self.size_y)
    }

    fn ensure_assigned(&self) -> Result<()> {
        if self.state == AssemblyState::Unassigned {
            return Err(PowerFlowError::NodesNotAssigned);
        }
        Ok(())
    }

    /// Stamp instances of every element, invariant elements first.
    pub fn collect_stamps(&self) -> Result<Vec<StampInstance>> {
        self.ensure_assigned()?;
        let ctx = self.context();
        let mut out = Vec::new();
        for element in self.elements() {
            let stamps = element.device().get_stamps(&ctx)?;
            trace!(kind = element.kind(), name = element.device().name(), stamps = stamps.len(), "collected stamps");
            out.extend(stamps);
        }
        Ok(out)
    }

    /// Flat start with device overrides.
    pub fn generate_v_init(&self) -> Result<DVector<f64>> {
        self.ensure_assigned()?;
        let mut v = DVector::zeros(self.size_y);
        for bus in &self.buses {
            let v0 = bus.initial_voltage();
            v[bus.indices.node_vr] = v0.re;
            v[bus.indices.node_vi] = v0.im;
        }
        let ctx = self.context();
        for element in self.elements() {
            element.device().init_v(&ctx, &mut v);
        }
        Ok(v)
    }

    /// Real and imaginary voltage indices of every bus.
    pub fn bus_voltage_indices(&self) -> Vec<usize> {
        self.buses
            .iter()
            .flat_map(|b| [b.indices.node_vr, b.indices.node_vi])
            .filter(|&i| i != SKIP)
            .collect()
    }

    /// Sum of every element's residuals at `v`.
    pub fn kcl_mismatch(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        self.ensure_assigned()?;
        let ctx = self.context();
        let mut res = DVector::zeros(self.size_y);
        for element in self.elements() {
            element.device().calculate_residuals(&ctx, v, &mut res)?;
        }
        Ok(res)
    }

    /// Runs every discrete control once; `true` if any state changed.
    pub fn operate_devices(&mut self, v: &DVector<f64>) -> Result<bool> {
        let ctx = StampContext {
            buses: &self.buses,
            s_base_phase: self.s_base / 3.0,
            load_factor: self.load_factor,
        };
        let mut changed = false;
        for capacitor in &mut self.capacitors {
            changed |= capacitor.operate(&ctx, v)?;
        }
        for fuse in &mut self.fuses {
            changed |= fuse.operate(&ctx, v)?;
        }
        for regulator in &mut self.regulators {
            changed |= regulator.operate(&ctx, v)?;
        }
        Ok(changed)
    }

    /// Per-unit phasor of a bus.
    pub fn bus_voltage(&self, id: i64, v: &DVector<f64>) -> Complex64 {
        self.context().voltage(id, v)
    }

    /// Phasor of a bus in volts.
    pub fn bus_voltage_volts(&self, id: i64, v: &DVector<f64>) -> Complex64 {
        self.bus_voltage(id, v) * self.bus(id).v_nominal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_bus() -> Network {
        let mut net = Network::new(1e6);
        net.add_node("src", &[Phase::A], 1000.0).unwrap();
        net.add_node("n1", &[Phase::A], 1000.0).unwrap();
        net.slack_sources.push(SlackSource::new("source", vec![0], vec![Complex64::new(1.0, 0.0)]));
        net.switches.push(Switch::new("sw", vec![0], vec![1], vec![true]));
        net
    }

    #[test]
    fn test_assign_once() {
        let mut net = two_bus();
        // 2 buses x 2 coordinates + slack current
        assert_eq!(net.assign_nodes(false).unwrap(), 6);
        assert!(matches!(net.assign_nodes(false), Err(PowerFlowError::NodesAlreadyAssigned)));
    }

    #[test]
    fn test_optimization_doubles_size() {
        let mut net = two_bus();
        assert_eq!(net.assign_nodes(true).unwrap(), 12);
    }

    #[test]
    fn test_unassigned_network_rejected() {
        let net = two_bus();
        assert!(matches!(net.collect_stamps(), Err(PowerFlowError::NodesNotAssigned)));
    }

    #[test]
    fn test_resolve() {
        let net = two_bus();
        assert_eq!(net.resolve("x", "n1", &[Phase::A]).unwrap(), vec![1]);
        assert!(matches!(
            net.resolve("x", "nowhere", &[Phase::A]),
            Err(PowerFlowError::UnknownNode { .. })
        ));
        assert!(matches!(
            net.resolve("x", "n1", &[Phase::B]),
            Err(PowerFlowError::InvalidPhases { .. })
        ));
        assert!(matches!(
            net.resolve("x", "n1", &[]),
            Err(PowerFlowError::InvalidPhases { .. })
        ));
    }

    #[test]
    fn test_line_without_phases_is_rejected() {
        let mut net = two_bus();
        let z = nalgebra::DMatrix::<Complex64>::zeros(0, 0);
        assert!(matches!(
            net.add_line("l0", "src", "n1", &[], &z, None, 1.0),
            Err(PowerFlowError::InvalidPhases { .. })
        ));
        assert!(net.lines.is_empty());
    }

    #[test]
    fn test_v_init_uses_set_point() {
        let mut net = Network::new(1e6);
        net.add_node("src", &[Phase::A], 1000.0).unwrap();
        net.slack_sources.push(SlackSource::new("source", vec![0], vec![Complex64::new(1.05, 0.1)]));
        net.assign_nodes(false).unwrap();
        let v = net.generate_v_init().unwrap();
        assert_eq!(v[0], 1.05);
        assert_eq!(v[1], 0.1);
    }
}
