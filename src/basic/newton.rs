use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    error::{PowerFlowError, Result},
    homotopy::PowerFlowConfig,
    solver::Solve,
    sparse::{MatrixBuilder, assert_valid},
    stamp::MatrixStamper,
};

/// Iterations between non-progress checks, and the window they fit.
const DIVERGE_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NrStatus {
    Converged,
    Diverged,
    MaxIterExceeded,
}

#[derive(Debug, Clone)]
pub struct NrOutcome {
    pub status: NrStatus,
    pub v: DVector<f64>,
    pub iterations: usize,
    pub err_max: f64,
}

/// Newton-Raphson at a fixed homotopy factor.
///
/// The linear stamps are written once; each iteration rewinds the matrix
/// builder to the end of that prefix, restamps the nonlinear part at the
/// previous iterate and solves `Y v = J`.
pub fn newton_solve<S: Solve>(
    stamper: &mut MatrixStamper,
    v_init: &DVector<f64>,
    tx_factor: f64,
    bus_idx: &[usize],
    cfg: &PowerFlowConfig,
    solver: &mut S,
) -> Result<NrOutcome> {
    let n = v_init.len();
    let mut y = MatrixBuilder::new(n, cfg.debug);
    let mut j_linear = DVector::zeros(n);
    stamper.stamp_linear(&mut y, &mut j_linear, tx_factor)?;
    let linear_index = y.get_usage();

    let mut v_prev = v_init.clone();
    let mut history = Vec::with_capacity(cfg.max_iters);
    let mut err_max = f64::INFINITY;

    for iteration in 0..cfg.max_iters {
        let mut j = j_linear.clone();
        stamper.stamp_nonlinear(&mut y, &mut j, &v_prev)?;
        let mat = y.to_matrix()?;
        assert_valid(&mat, true)?;

        let (ap, ai, ax) = mat.disassemble();
        solver
            .solve(&ap, &ai, &ax, j.as_mut_slice(), n)
            .map_err(PowerFlowError::LinearSolve)?;
        let v_next = j;
        if let Some(index) = v_next.iter().position(|x| x.is_nan()) {
            return Err(PowerFlowError::NanInSolution { index });
        }

        err_max = bus_idx
            .iter()
            .map(|&i| (v_next[i] - v_prev[i]).abs())
            .fold(0.0, f64::max);
        history.push(err_max);

        if err_max < cfg.tolerance {
            debug!(tx_factor, iterations = iteration + 1, err_max, "newton converged");
            return Ok(NrOutcome {
                status: NrStatus::Converged,
                v: v_next,
                iterations: iteration + 1,
                err_max,
            });
        }

        if cfg.diverge_check
            && (iteration + 1) % DIVERGE_WINDOW == 0
            && trailing_slope(&history[history.len() - DIVERGE_WINDOW..]) >= 0.0
        {
            warn!(tx_factor, iterations = iteration + 1, err_max, "newton is not making progress");
            return Ok(NrOutcome {
                status: NrStatus::Diverged,
                v: v_next,
                iterations: iteration + 1,
                err_max,
            });
        }

        v_prev = if cfg.voltage_limiting {
            limit_voltage_step(&v_prev, &v_next, bus_idx)
        } else {
            v_next
        };
        y.clear(linear_index);
    }

    warn!(tx_factor, max_iters = cfg.max_iters, err_max, "newton hit the iteration limit");
    Ok(NrOutcome {
        status: NrStatus::MaxIterExceeded,
        v: v_prev,
        iterations: cfg.max_iters,
        err_max,
    })
}

/// Clips the step on bus voltage coordinates to `[-1, 1]` and the result to
/// `[-2, 2]`; every other entry takes `v_next` unchanged.
pub fn limit_voltage_step(v_prev: &DVector<f64>, v_next: &DVector<f64>, bus_idx: &[usize]) -> DVector<f64> {
    let mut out = v_next.clone();
    for &i in bus_idx {
        let step = (v_next[i] - v_prev[i]).clamp(-1.0, 1.0);
        out[i] = (v_prev[i] + step).clamp(-2.0, 2.0);
    }
    out
}

/// Least-squares slope of `errors` against their index.
fn trailing_slope(errors: &[f64]) -> f64 {
    let n = errors.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = errors.iter().sum::<f64>() / n;
    let (num, den) = errors
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - x_mean;
            (num + dx * (y - y_mean), den + dx * dx)
        });
    if den == 0.0 { 0.0 } else { num / den }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_voltage_step() {
        let prev = DVector::from_vec(vec![1.0, 1.5, 0.0, 0.0]);
        let next = DVector::from_vec(vec![3.5, 2.0, -5.0, 7.0]);
        let out = limit_voltage_step(&prev, &next, &[0, 1, 2]);
        // step clipped to +1
        assert_eq!(out[0], 2.0);
        // step fits but result clipped to 2
        assert_eq!(out[1], 2.0);
        // step clipped to -1
        assert_eq!(out[2], -1.0);
        // not a bus voltage coordinate
        assert_eq!(out[3], 7.0);
    }

    #[test]
    fn test_limit_keeps_small_steps() {
        let prev = DVector::from_vec(vec![1.0, -0.5]);
        let next = DVector::from_vec(vec![1.2, -0.9]);
        assert_eq!(limit_voltage_step(&prev, &next, &[0, 1]), next);
    }

    #[test]
    fn test_trailing_slope() {
        let falling: Vec<f64> = (0..50).map(|i| 1.0 / (i as f64 + 1.0)).collect();
        assert!(trailing_slope(&falling) < 0.0);
        let rising: Vec<f64> = (0..50).map(|i| i as f64 * 0.1).collect();
        assert!((trailing_slope(&rising) - 0.1).abs() < 1e-12);
        assert_eq!(trailing_slope(&[2.0; 50]), 0.0);
    }
}
