use std::{fs::File, io, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result, bail};
use clap::Parser;
use ecpf::prelude::{solver::DefaultSolver, *};
use tracing::{error, info, warn};

/// Multi-phase power flow on an equivalent-circuit formulation.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON case file.
    case: PathBuf,

    /// CSV of per-load multipliers, one row per time step.
    #[arg(long)]
    load_shape: Option<PathBuf>,

    /// First load-shape row to solve.
    #[arg(long, default_value_t = 0, requires = "load_shape")]
    start: usize,

    /// One past the last load-shape row to solve.
    #[arg(long, requires = "load_shape")]
    end: Option<usize>,

    /// Check stamps and matrix bookkeeping on every iteration.
    #[arg(long)]
    debug: bool,

    /// Debug-level logging.
    #[arg(short, long)]
    verbose: bool,

    /// Solve the infeasibility formulation with dual variables.
    #[arg(long)]
    infeasibility: bool,

    /// Global multiplier applied to every load.
    #[arg(long)]
    load_factor: Option<f64>,

    /// Ramp series elements and shunts in with Tx-stepping.
    #[arg(long)]
    tx_stepping: bool,

    #[arg(long)]
    no_voltage_limiting: bool,

    /// Write bus voltages of the last solve to this CSV.
    #[arg(long)]
    dump_voltages: Option<PathBuf>,
}

impl Cli {
    fn config(&self, base: Option<PowerFlowConfig>) -> PowerFlowConfig {
        let mut cfg = base.unwrap_or_default();
        cfg.debug |= self.debug;
        cfg.optimization |= self.infeasibility;
        cfg.tx_stepping |= self.tx_stepping;
        if self.no_voltage_limiting {
            cfg.voltage_limiting = false;
        }
        if let Some(lf) = self.load_factor {
            cfg.load_factor = lf;
        }
        cfg
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(io::stderr)
        .init();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

/// `Ok(false)` when some solve did not converge.
fn run(cli: &Cli) -> Result<bool> {
    let case = CaseFile::from_path(&cli.case).with_context(|| format!("reading {}", cli.case.display()))?;
    let cfg = cli.config(case.config.clone());
    let mut net = case.to_network().context("building the network")?;
    info!(
        case = case.name.as_deref().unwrap_or("unnamed"),
        buses = net.buses.len(),
        "case loaded"
    );
    let mut solver = DefaultSolver::default();

    let (v, converged) = match &cli.load_shape {
        Some(path) => {
            let shape = LoadShape::from_path(path).with_context(|| format!("reading {}", path.display()))?;
            let end = cli.end.unwrap_or(shape.len());
            if cli.start >= end {
                bail!("empty row range {}..{end}", cli.start);
            }
            let steps = run_timeseries(&mut net, &shape, cli.start..end, &cfg, &mut solver)?;
            let failed = steps.iter().filter(|s| !s.converged).count();
            if failed > 0 {
                warn!(failed, rows = steps.len(), "some time steps did not converge");
            }
            match steps.into_iter().last() {
                Some(last) => (last.result.v, failed == 0),
                None => bail!("row range {}..{end} is past the end of the load shape", cli.start),
            }
        }
        None => {
            let res = run_pf(&mut net, &cfg, &mut solver)?;
            if !res.converged {
                warn!(status = ?res.status, iterations = res.iterations, "power flow did not converge");
            }
            (res.v, res.converged)
        }
    };

    let voltages = bus_voltages(&net, &v);
    println!("{}", format_bus_table(&voltages));
    if let Some(path) = &cli.dump_voltages {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        write_voltages_csv(file, &voltages)?;
    }
    Ok(converged)
}
