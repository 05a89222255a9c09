use std::sync::Arc;

use nalgebra::DMatrix;
use num_complex::Complex64;

use super::{Device, StampContext, Terminal, terminal_symbols};
use crate::basic::{
    error::{PowerFlowError, Result},
    stamp::{BoundInput, IndexMap},
    symbolic::{Expr, LagrangeSegment, TX_FACTOR},
};

/// Multi-phase pi-model line.
#[derive(Debug, Clone)]
pub struct Line {
    pub name: String,
    pub from: Vec<i64>,
    pub to: Vec<i64>,
    /// Series admittance, per unit.
    pub y_series: DMatrix<Complex64>,
    /// Total shunt admittance, per unit, split half per end.
    pub y_shunt: Option<DMatrix<Complex64>>,
}

impl Line {
    /// `z` is the total series impedance in per unit, `y_shunt` the total
    /// shunt admittance in per unit.
    pub fn new(
        name: &str,
        from: Vec<i64>,
        to: Vec<i64>,
        z: &DMatrix<Complex64>,
        y_shunt: Option<DMatrix<Complex64>>,
    ) -> Result<Self> {
        let n = from.len();
        if n == 0 || n > 3 || to.len() != n || z.nrows() != n || z.ncols() != n {
            return Err(PowerFlowError::InvalidPhases {
                element: name.to_string(),
                reason: format!(
                    "{} from / {} to buses with a {}x{} impedance",
                    n,
                    to.len(),
                    z.nrows(),
                    z.ncols()
                ),
            });
        }
        if let Some(ys) = &y_shunt {
            if ys.nrows() != n || ys.ncols() != n {
                return Err(PowerFlowError::InvalidPhases {
                    element: name.to_string(),
                    reason: "shunt admittance does not match the phase count".to_string(),
                });
            }
        }
        let y_series = z
            .clone()
            .try_inverse()
            .filter(|y| y.iter().all(|c| c.re.is_finite() && c.im.is_finite()))
            .ok_or_else(|| PowerFlowError::SingularLineImpedance(name.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            from,
            to,
            y_series,
            y_shunt,
        })
    }

    pub fn num_phases(&self) -> usize {
        self.from.len()
    }

    fn segment(n: usize, shunt: bool) -> Result<Arc<LagrangeSegment>> {
        let from: Vec<Terminal> = (0..n).map(|i| Terminal::new(&format!("f{i}"))).collect();
        let to: Vec<Terminal> = (0..n).map(|i| Terminal::new(&format!("t{i}"))).collect();
        let tx = Expr::sym(TX_FACTOR);
        let stiffen = Expr::one() + Expr::Const(20.0) * tx.clone();
        let half_shunt = Expr::Const(0.5) * (Expr::one() - tx);

        let mut constants = Vec::new();
        let mut terms = Vec::new();
        for i in 0..n {
            let mut ir = Vec::new();
            let mut ii = Vec::new();
            let mut sr = [Vec::new(), Vec::new()];
            let mut si = [Vec::new(), Vec::new()];
            for j in 0..n {
                let g = Expr::sym(&format!("G_{i}_{j}"));
                let b = Expr::sym(&format!("B_{i}_{j}"));
                constants.push(format!("G_{i}_{j}"));
                constants.push(format!("B_{i}_{j}"));
                let dvr = from[j].vr() - to[j].vr();
                let dvi = from[j].vi() - to[j].vi();
                ir.push(g.clone() * dvr.clone() - b.clone() * dvi.clone());
                ii.push(g * dvi + b * dvr);
                if shunt {
                    let gs = Expr::sym(&format!("Gs_{i}_{j}"));
                    let bs = Expr::sym(&format!("Bs_{i}_{j}"));
                    constants.push(format!("Gs_{i}_{j}"));
                    constants.push(format!("Bs_{i}_{j}"));
                    for (end, t) in [&from[j], &to[j]].into_iter().enumerate() {
                        sr[end].push(gs.clone() * t.vr() - bs.clone() * t.vi());
                        si[end].push(gs.clone() * t.vi() + bs.clone() * t.vr());
                    }
                }
            }
            let (ir, ii) = (Expr::sum(ir), Expr::sum(ii));
            terms.push(
                stiffen.clone()
                    * (from[i].injection(ir.clone(), ii.clone()) - to[i].injection(ir, ii)),
            );
            if shunt {
                let [sr_f, sr_t] = sr;
                let [si_f, si_t] = si;
                terms.push(
                    half_shunt.clone()
                        * (from[i].injection(Expr::sum(sr_f), Expr::sum(si_f))
                            + to[i].injection(Expr::sum(sr_t), Expr::sum(si_t))),
                );
            }
        }
        constants.push(TX_FACTOR.to_string());

        let terminals: Vec<&Terminal> = from.iter().chain(to.iter()).collect();
        let (primals, duals) = terminal_symbols(&terminals);
        fn as_str(v: &[String]) -> Vec<&str> {
            v.iter().map(String::as_str).collect()
        }
        LagrangeSegment::cached(
            Expr::sum(terms),
            &as_str(&constants),
            &as_str(&primals),
            &as_str(&duals),
        )
    }
}

impl Device for Line {
    fn name(&self) -> &str {
        &self.name
    }

    fn bindings(&self, ctx: &StampContext) -> Result<Vec<BoundInput>> {
        let n = self.num_phases();
        let segment = Self::segment(n, self.y_shunt.is_some())?;
        let mut map = IndexMap::new(&segment);
        for i in 0..n {
            for j in 0..n {
                let y = self.y_series[(i, j)];
                map.set_constant(&format!("G_{i}_{j}"), y.re)
                    .set_constant(&format!("B_{i}_{j}"), y.im);
                if let Some(ys) = &self.y_shunt {
                    let y = ys[(i, j)];
                    map.set_constant(&format!("Gs_{i}_{j}"), y.re)
                        .set_constant(&format!("Bs_{i}_{j}"), y.im);
                }
            }
            Terminal::new(&format!("f{i}")).bind(&mut map, ctx.bus(self.from[i]));
            Terminal::new(&format!("t{i}")).bind(&mut map, ctx.bus(self.to[i]));
        }
        Ok(vec![map.finish()?])
    }
}
