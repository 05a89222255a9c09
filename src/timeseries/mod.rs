//! Load-shape driven sequence of power flows.

use std::ops::Range;

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    basic::{
        error::Result,
        homotopy::{PowerFlowConfig, PowerFlowResult, run_pf},
        network::Network,
        newton::NrStatus,
        solver::Solve,
    },
    io::loadshape::LoadShape,
};

/// Outcome of one load-shape row.
#[derive(Debug, Clone, Serialize)]
pub struct TimeStep {
    pub row: usize,
    pub label: String,
    pub converged: bool,
    pub status: NrStatus,
    pub iterations: usize,
    #[serde(skip)]
    pub result: PowerFlowResult,
}

/// Solves rows `rows` of `shape` in order.
///
/// A row that fails to converge is recorded and the next row is attempted.
/// Rows past the end of the shape are ignored; structural errors abort.
pub fn run_timeseries<S: Solve>(
    net: &mut Network,
    shape: &LoadShape,
    rows: Range<usize>,
    cfg: &PowerFlowConfig,
    solver: &mut S,
) -> Result<Vec<TimeStep>> {
    shape.validate(net)?;
    let rows = rows.start.min(shape.len())..rows.end.min(shape.len());
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        shape.apply(row, net)?;
        let result = run_pf(net, cfg, solver)?;
        let label = shape.labels[row].clone();
        if result.converged {
            info!(row, label = %label, iterations = result.iterations, "time step solved");
        } else {
            warn!(row, label = %label, status = ?result.status, "time step did not converge, continuing");
        }
        out.push(TimeStep {
            row,
            label,
            converged: result.converged,
            status: result.status,
            iterations: result.iterations,
            result,
        });
    }
    Ok(out)
}
