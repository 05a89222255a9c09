use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    error::{PowerFlowError, Result},
    network::{AssemblyState, Network},
    newton::{NrStatus, newton_solve},
    solver::{DefaultSolver, Solve},
    stamp::MatrixStamper,
};

/// Solver settings. Every field has a default, so a partial JSON object is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerFlowConfig {
    pub max_iters: usize,
    pub tolerance: f64,
    pub voltage_limiting: bool,
    pub diverge_check: bool,
    pub tx_stepping: bool,
    pub tx_steps: usize,
    pub max_device_iters: usize,
    /// Solve with dual variables (infeasibility analysis layout).
    pub optimization: bool,
    /// Validate every stamp and the builder cursor.
    pub debug: bool,
    pub load_factor: f64,
}

impl Default for PowerFlowConfig {
    fn default() -> Self {
        Self {
            max_iters: 100,
            tolerance: 1e-6,
            voltage_limiting: true,
            diverge_check: true,
            tx_stepping: false,
            tx_steps: 1000,
            max_device_iters: 10,
            optimization: false,
            debug: false,
            load_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerFlowResult {
    pub v: DVector<f64>,
    /// Newton iterations summed over every homotopy step and device round.
    pub iterations: usize,
    pub converged: bool,
    pub status: NrStatus,
    /// Homotopy factor of the last attempted step; `0.0` once the sweep completes.
    pub tx_factor: f64,
    pub device_rounds: usize,
}

#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub status: NrStatus,
    pub v: DVector<f64>,
    pub iterations: usize,
    pub tx_factor: f64,
}

/// Tx-stepping: solves at factors `1, 1 - 1/steps, ..., 0`, seeding each step
/// with the previous solution. The first failing step ends the sweep.
pub fn homotopy_sweep<S: Solve>(
    stamper: &mut MatrixStamper,
    v_init: &DVector<f64>,
    bus_idx: &[usize],
    cfg: &PowerFlowConfig,
    solver: &mut S,
) -> Result<SweepOutcome> {
    if !cfg.tx_stepping {
        let out = newton_solve(stamper, v_init, 0.0, bus_idx, cfg, solver)?;
        return Ok(SweepOutcome {
            status: out.status,
            v: out.v,
            iterations: out.iterations,
            tx_factor: 0.0,
        });
    }
    let steps = cfg.tx_steps.max(1);
    let mut v = v_init.clone();
    let mut iterations = 0;
    for k in 0..=steps {
        let tx_factor = 1.0 - k as f64 / steps as f64;
        let out = newton_solve(stamper, &v, tx_factor, bus_idx, cfg, solver)?;
        iterations += out.iterations;
        if out.status != NrStatus::Converged {
            warn!(tx_factor, step = k, status = ?out.status, "homotopy step failed");
            return Ok(SweepOutcome {
                status: out.status,
                v: out.v,
                iterations,
                tx_factor,
            });
        }
        debug!(tx_factor, iterations = out.iterations, "homotopy step converged");
        v = out.v;
    }
    Ok(SweepOutcome {
        status: NrStatus::Converged,
        v,
        iterations,
        tx_factor: 0.0,
    })
}

/// Solves the network, re-solving from a flat start while discrete controls change state.
pub fn run_pf<S: Solve>(net: &mut Network, cfg: &PowerFlowConfig, solver: &mut S) -> Result<PowerFlowResult> {
    net.load_factor = cfg.load_factor;
    if net.state() == AssemblyState::Unassigned {
        net.assign_nodes(cfg.optimization)?;
    } else if net.optimization() != cfg.optimization {
        warn!(
            assigned = net.optimization(),
            requested = cfg.optimization,
            "network indices already assigned, keeping the assigned layout"
        );
    }
    let bus_idx = net.bus_voltage_indices();
    let mut iterations = 0;

    for round in 1..=cfg.max_device_iters {
        let mut stamper = MatrixStamper::new();
        stamper.register(net.collect_stamps()?);
        net.set_state(AssemblyState::Stamped);
        let (linear, nonlinear) = stamper.num_sets();
        debug!(round, inputs = stamper.num_inputs(), linear, nonlinear, "stamps registered");

        solver.reset();
        let v_init = net.generate_v_init()?;
        let sweep = homotopy_sweep(&mut stamper, &v_init, &bus_idx, cfg, solver)?;
        iterations += sweep.iterations;

        if sweep.status != NrStatus::Converged {
            warn!(status = ?sweep.status, tx_factor = sweep.tx_factor, iterations, "power flow did not converge");
            return Ok(PowerFlowResult {
                v: sweep.v,
                iterations,
                converged: false,
                status: sweep.status,
                tx_factor: sweep.tx_factor,
                device_rounds: round,
            });
        }
        net.set_state(AssemblyState::Solved);

        if !net.operate_devices(&sweep.v)? {
            info!(iterations, device_rounds = round, size = net.size_y(), "power flow converged");
            return Ok(PowerFlowResult {
                v: sweep.v,
                iterations,
                converged: true,
                status: NrStatus::Converged,
                tx_factor: 0.0,
                device_rounds: round,
            });
        }
        debug!(round, "discrete controls changed state, solving again");
    }
    Err(PowerFlowError::DeviceOperationDidNotSettle(cfg.max_device_iters))
}

/// [`run_pf`] with the feature-selected [`DefaultSolver`].
pub fn run_pf_default(net: &mut Network, cfg: &PowerFlowConfig) -> Result<PowerFlowResult> {
    let mut solver = DefaultSolver::default();
    run_pf(net, cfg, &mut solver)
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;

    use nalgebra::DMatrix;
    use num_complex::Complex64;

    use super::*;
    use crate::basic::network::{
        CapacitorControl, Connection, FuseStatus, Phase, RegulatorControl, ZipComponents,
    };

    const VLN: f64 = 7200.0;

    fn z_matrix(n: usize, r: f64, x: f64) -> DMatrix<Complex64> {
        DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                Complex64::new(r, x)
            } else {
                Complex64::new(r / 3.0, x / 3.0)
            }
        })
    }

    fn assert_kcl(net: &Network, v: &DVector<f64>) {
        let res = net.kcl_mismatch(v).unwrap();
        let worst = res.iter().fold(0.0f64, |m, r| m.max(r.abs()));
        assert!(worst < 1e-6, "largest residual {worst}");
    }

    /// slack -> three-phase line -> wye constant-power load
    fn feeder(load_kw: f64) -> Network {
        let abc = Phase::ALL;
        let mut net = Network::new(1e6);
        net.add_node("src", &abc, VLN).unwrap();
        net.add_node("n1", &abc, VLN).unwrap();
        net.add_slack("source", "src", &abc, VLN, 0.0).unwrap();
        net.add_line("l1", "src", "n1", &abc, &z_matrix(3, 0.3, 0.6), None, 1.0)
            .unwrap();
        let s = Complex64::new(load_kw * 1e3, load_kw * 0.5e3);
        net.add_load("ld", "n1", &abc, Connection::Wye, vec![ZipComponents::power(s); 3])
            .unwrap();
        net
    }

    fn unloaded(v_set: f64, angle_deg: f64) -> Network {
        let mut net = Network::new(1e6);
        net.add_node("src", &[Phase::A], VLN).unwrap();
        net.add_node("n1", &[Phase::A], VLN).unwrap();
        net.add_slack("source", "src", &[Phase::A], v_set, angle_deg).unwrap();
        net.add_line("l1", "src", "n1", &[Phase::A], &z_matrix(1, 0.2, 0.4), None, 1.0)
            .unwrap();
        net
    }

    #[test]
    fn test_unloaded_bus_takes_set_point_in_one_iteration() {
        let mut net = unloaded(VLN, 0.0);
        let result = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap();
        assert!(result.converged);
        assert_eq!(result.iterations, 1);
        let v1 = net.bus_voltage(1, &result.v);
        assert!((v1 - Complex64::new(1.0, 0.0)).norm() < 1e-9);
        assert_eq!(net.state(), AssemblyState::Solved);
        assert_kcl(&net, &result.v);
    }

    #[test]
    fn test_linear_network_needs_one_confirming_iteration() {
        let mut net = unloaded(VLN * 1.02, 10.0);
        let result = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap();
        assert!(result.converged);
        assert_eq!(result.iterations, 2);
        let v1 = net.bus_voltage(1, &result.v);
        assert!((v1 - Complex64::from_polar(1.02, 10f64.to_radians())).norm() < 1e-9);
    }

    #[test]
    fn test_loaded_feeder_satisfies_kcl() {
        let mut net = feeder(500.0);
        let result = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap();
        assert!(result.converged);
        assert_kcl(&net, &result.v);
        let v = net.bus_voltage(net.bus_id("n1", Phase::A).unwrap(), &result.v);
        assert!(v.norm() < 1.0 && v.norm() > 0.9, "{v}");

        // the source covers the load (1.5 pu per phase) plus line losses
        let source = &net.slack_sources[0];
        let supplied: Complex64 = source
            .buses
            .iter()
            .zip(source.injections(&result.v))
            .map(|(&b, i)| net.bus_voltage(b, &result.v) * i.conj())
            .sum();
        let p = supplied.re.abs();
        assert!(p > 4.5 && p < 4.6, "supplied {supplied}");
    }

    #[test]
    fn test_homotopy_reaches_direct_solution() {
        let mut direct = feeder(800.0);
        let a = run_pf_default(&mut direct, &PowerFlowConfig::default()).unwrap();

        let mut stepped = feeder(800.0);
        let cfg = PowerFlowConfig {
            tx_stepping: true,
            tx_steps: 20,
            ..Default::default()
        };
        let b = run_pf_default(&mut stepped, &cfg).unwrap();
        assert!(a.converged && b.converged);
        assert_eq!(b.tx_factor, 0.0);
        assert!((&a.v - &b.v).amax() < 1e-5);
        assert_kcl(&stepped, &b.v);
    }

    #[test]
    fn test_optimization_mode_duals_vanish() {
        let mut plain = feeder(300.0);
        let a = run_pf_default(&mut plain, &PowerFlowConfig::default()).unwrap();

        let mut dual = feeder(300.0);
        let cfg = PowerFlowConfig {
            optimization: true,
            ..Default::default()
        };
        let b = run_pf_default(&mut dual, &cfg).unwrap();
        assert!(b.converged);
        assert_eq!(dual.size_y(), 2 * plain.size_y());
        for bus in &dual.buses {
            let ix = bus.indices;
            assert!(b.v[ix.node_lambda_vr].abs() < 1e-6);
            assert!(b.v[ix.node_lambda_vi].abs() < 1e-6);
            let p = plain.bus_voltage(bus.id, &a.v);
            assert!((dual.bus_voltage(bus.id, &b.v) - p).norm() < 1e-6);
        }
    }

    #[test]
    fn test_impedance_load_is_exact_in_one_pass() {
        let abc = Phase::ALL;
        let mut net = Network::new(1e6);
        net.add_node("src", &abc, VLN).unwrap();
        net.add_node("n1", &abc, VLN).unwrap();
        net.add_slack("source", "src", &abc, VLN, 0.0).unwrap();
        net.add_line("l1", "src", "n1", &abc, &z_matrix(3, 0.3, 0.6), None, 1.0)
            .unwrap();
        let z = ZipComponents {
            constant_impedance: Complex64::new(4e5, 1e5),
            ..Default::default()
        };
        net.add_load("ld", "n1", &abc, Connection::Wye, vec![z; 3]).unwrap();
        let result = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap();
        assert!(result.converged);
        // linear system: the second iteration only confirms the first
        assert!(result.iterations <= 2);
        assert_kcl(&net, &result.v);
    }

    #[test]
    fn test_delta_load_and_generator() {
        let mut net = feeder(200.0);
        let abc = Phase::ALL;
        let d = ZipComponents {
            constant_power: Complex64::new(1e5, 2e4),
            constant_current: Complex64::new(5e4, 0.0),
            constant_impedance: Complex64::new(2e4, 0.0),
        };
        net.add_load("dl", "n1", &abc, Connection::Delta, vec![d; 3]).unwrap();
        net.add_generator("pv", "n1", &abc, vec![Complex64::new(5e4, 0.0); 3])
            .unwrap();
        let result = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap();
        assert!(result.converged);
        assert_kcl(&net, &result.v);
    }

    #[test]
    fn test_delta_wye_transformer_converges() {
        let abc = Phase::ALL;
        let mut net = Network::new(1e6);
        let v_lv = 4160.0 / 3f64.sqrt();
        net.add_node("src", &abc, 12470.0 / 3f64.sqrt()).unwrap();
        net.add_node("lv", &abc, v_lv).unwrap();
        net.add_node("load", &abc, v_lv).unwrap();
        net.add_slack("source", "src", &abc, 12470.0 / 3f64.sqrt(), 0.0).unwrap();
        let rating = crate::basic::network::TransformerRating {
            s_rated: 6e6,
            v_primary: 12470.0,
            v_secondary: 4160.0,
            impedance: Complex64::new(0.01, 0.06),
            tap: 1.0,
        };
        net.add_transformer("t1", "src", "lv", "DELTA_GWYE", &rating).unwrap();
        net.add_line("l1", "lv", "load", &abc, &z_matrix(3, 0.2, 0.5), None, 1.0)
            .unwrap();
        net.add_load(
            "ld",
            "load",
            &abc,
            Connection::Wye,
            vec![ZipComponents::power(Complex64::new(1e6, 4e5)); 3],
        )
        .unwrap();
        // the delta primary advances the secondary by 30 degrees
        for p in abc {
            for node in ["lv", "load"] {
                let id = net.bus_id(node, p).unwrap();
                let angle = (p.nominal_angle_deg() + 30.0) * PI / 180.0;
                net.set_initial_voltage(id, Complex64::from_polar(1.0, angle));
            }
        }
        let result = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap();
        assert!(result.converged);
        assert_kcl(&net, &result.v);
        let va = net.bus_voltage(net.bus_id("lv", Phase::A).unwrap(), &result.v);
        assert!((va.arg().to_degrees() - 30.0).abs() < 5.0, "angle {}", va.arg().to_degrees());
        assert!(va.norm() > 0.9 && va.norm() < 1.01);
    }

    /// slack -> line -> n1 -> fuse -> n2 (plus a weak parallel line) -> load
    fn fused(limit: f64) -> Network {
        let a = [Phase::A];
        let mut net = Network::new(1e6);
        for node in ["src", "n1", "n2"] {
            net.add_node(node, &a, VLN).unwrap();
        }
        net.add_slack("source", "src", &a, VLN, 0.0).unwrap();
        net.add_line("l1", "src", "n1", &a, &z_matrix(1, 0.1, 0.2), None, 1.0)
            .unwrap();
        net.add_fuse("f1", "n1", "n2", &a, limit).unwrap();
        net.add_line("bypass", "n1", "n2", &a, &z_matrix(1, 5.0, 10.0), None, 1.0)
            .unwrap();
        net.add_load(
            "ld",
            "n2",
            &a,
            Connection::Wye,
            vec![ZipComponents::power(Complex64::new(2e5, 5e4))],
        )
        .unwrap();
        net
    }

    #[test]
    fn test_fuse_stays_good_below_limit() {
        // about 29 A flows
        let mut net = fused(100.0);
        let result = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap();
        assert!(result.converged);
        assert_eq!(net.fuses[0].status, vec![FuseStatus::Good]);
        assert_eq!(result.device_rounds, 1);
    }

    #[test]
    fn test_fuse_blows_and_stays_blown() {
        let mut net = fused(10.0);
        let result = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap();
        assert!(result.converged);
        assert_eq!(net.fuses[0].status, vec![FuseStatus::Blown]);
        assert_eq!(result.device_rounds, 2);
        assert_kcl(&net, &result.v);

        // a blown fuse carries no current and does not recover
        let ctx = net.context();
        assert_eq!(net.fuses[0].currents_amps(&ctx, &result.v), vec![0.0]);
        assert!(!net.operate_devices(&result.v).unwrap());
        assert_eq!(net.fuses[0].status, vec![FuseStatus::Blown]);
    }

    #[test]
    fn test_manual_regulator_boosts_voltage() {
        let abc = Phase::ALL;
        let mut net = Network::new(1e6);
        for node in ["src", "reg", "n1"] {
            net.add_node(node, &abc, VLN).unwrap();
        }
        net.add_slack("source", "src", &abc, VLN, 0.0).unwrap();
        net.add_regulator(
            "r1",
            "src",
            "reg",
            &abc,
            "WYE_WYE",
            vec![8, 8, 8],
            0.1,
            16,
            RegulatorControl::Manual,
        )
        .unwrap();
        net.add_line("l1", "reg", "n1", &abc, &z_matrix(3, 0.3, 0.6), None, 1.0)
            .unwrap();
        let result = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap();
        assert!(result.converged);
        let v = net.bus_voltage(net.bus_id("n1", Phase::B).unwrap(), &result.v);
        assert!((v.norm() - 1.05).abs() < 1e-9);
        assert_kcl(&net, &result.v);
    }

    #[test]
    fn test_automatic_regulator_is_rejected() {
        let a = [Phase::A];
        let mut net = Network::new(1e6);
        net.add_node("src", &a, VLN).unwrap();
        net.add_node("reg", &a, VLN).unwrap();
        net.add_slack("source", "src", &a, VLN, 0.0).unwrap();
        net.add_regulator(
            "r1",
            "src",
            "reg",
            &a,
            "WYE_WYE",
            vec![0],
            0.1,
            16,
            RegulatorControl::OutputVoltage,
        )
        .unwrap();
        let err = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap_err();
        assert!(matches!(err, PowerFlowError::UnimplementedControl { ref mode, .. } if mode == "OUTPUT_VOLTAGE"));
    }

    #[test]
    fn test_volt_capacitor_switches_in() {
        let abc = Phase::ALL;
        let mut net = feeder(2500.0);
        net.add_capacitor(
            "c1",
            "n1",
            &abc,
            Connection::Wye,
            &[3e5; 3],
            VLN,
            CapacitorControl::Volt {
                voltage_low: 0.99 * VLN,
                voltage_high: 1.2 * VLN,
            },
        )
        .unwrap();
        net.capacitors[0].closed = vec![false; 3];

        let mut reference = feeder(2500.0);
        let base = run_pf_default(&mut reference, &PowerFlowConfig::default()).unwrap();

        let result = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap();
        assert!(result.converged);
        assert_eq!(net.capacitors[0].closed, vec![true; 3]);
        assert_eq!(result.device_rounds, 2);
        assert_kcl(&net, &result.v);
        let id = net.bus_id("n1", Phase::A).unwrap();
        assert!(net.bus_voltage(id, &result.v).norm() > reference.bus_voltage(id, &base.v).norm());
    }

    #[test]
    fn test_open_switch_isolating_a_bus_is_structural_error() {
        let a = [Phase::A];
        let mut net = Network::new(1e6);
        net.add_node("src", &a, VLN).unwrap();
        net.add_node("n1", &a, VLN).unwrap();
        net.add_slack("source", "src", &a, VLN, 0.0).unwrap();
        net.add_switch("s1", "src", "n1", &a, false).unwrap();
        let err = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap_err();
        assert!(matches!(err, PowerFlowError::ZeroColumn(_) | PowerFlowError::ZeroRow(_)));
    }

    #[test]
    fn test_overloaded_feeder_reports_divergence() {
        let mut net = Network::new(1e6);
        net.add_node("src", &[Phase::A], 2400.0).unwrap();
        net.add_node("n1", &[Phase::A], 2400.0).unwrap();
        net.add_slack("source", "src", &[Phase::A], 2400.0, 0.0).unwrap();
        net.add_line("l1", "src", "n1", &[Phase::A], &z_matrix(1, 0.3, 0.6), None, 1.0)
            .unwrap();
        net.add_load(
            "ld",
            "n1",
            &[Phase::A],
            Connection::Wye,
            vec![ZipComponents::power(Complex64::new(5e6, 1e6))],
        )
        .unwrap();
        let result = run_pf_default(&mut net, &PowerFlowConfig::default()).unwrap();
        assert!(!result.converged);
        assert_eq!(result.status, NrStatus::Diverged);
        assert_eq!(result.device_rounds, 1);
    }

    #[test]
    fn test_debug_mode_matches_release() {
        let mut a = feeder(400.0);
        let mut b = feeder(400.0);
        let ra = run_pf_default(&mut a, &PowerFlowConfig::default()).unwrap();
        let cfg = PowerFlowConfig {
            debug: true,
            ..Default::default()
        };
        let rb = run_pf_default(&mut b, &cfg).unwrap();
        assert_eq!(ra.v, rb.v);
    }

    #[test]
    fn test_config_partial_json() {
        let cfg: PowerFlowConfig = serde_json::from_str(r#"{"tx_stepping": true, "max_iters": 30}"#).unwrap();
        assert!(cfg.tx_stepping);
        assert_eq!(cfg.max_iters, 30);
        assert_eq!(cfg.tolerance, 1e-6);
        assert_eq!(cfg.tx_steps, 1000);
    }
}
