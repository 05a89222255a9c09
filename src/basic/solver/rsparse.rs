use rsparse::{
    data::{self, Numeric, Symb},
    lsolve, lu, sqr, usolve,
};

use super::{Pattern, Solve};

/// Sparse LU from `rsparse`, reusing the symbolic analysis while the pattern is unchanged.
#[derive(Default)]
pub struct RSparseSolver {
    x: Vec<f64>,
    symbolic: Option<Symb>,
    pattern: Pattern,
}

impl Solve for RSparseSolver {
    fn solve(
        &mut self,
        ap: &[usize],
        ai: &[usize],
        ax: &[f64],
        b: &mut [f64],
        n: usize,
    ) -> Result<(), &'static str> {
        if ap.len() != n + 1 || b.len() != n {
            return Err("dimension mismatch");
        }
        let a = data::Sprs {
            m: n,
            n,
            i: ai.to_vec(),
            p: ap.iter().map(|&v| v as isize).collect(),
            x: ax.to_vec(),
            nzmax: ax.len(),
        };
        if self.pattern.update(ap, ai) || self.symbolic.is_none() {
            self.symbolic = Some(sqr(&a, 1, false));
            self.x = vec![0.0; n];
        }
        let Some(s) = self.symbolic.as_mut() else {
            return Err("missing symbolic factorization");
        };
        let num = lu(&a, s, 1e-6).map_err(|_| "LU factorization failed")?;
        ipvec(&num.pinv, b, &mut self.x); // x = P*b
        lsolve(&num.l, &mut self.x); // x = L\x
        usolve(&num.u, &mut self.x); // x = U\x
        ipvec(&s.q, &self.x, b); // b = Q*x
        Ok(())
    }

    fn reset(&mut self) {
        self.symbolic = None;
        self.pattern.clear();
    }
}

fn ipvec<T: Numeric<T>>(p: &Option<Vec<isize>>, b: &[T], x: &mut [T]) {
    match p {
        Some(perm) => {
            for k in 0..b.len() {
                x[perm[k] as usize] = b[k];
            }
        }
        None => x.copy_from_slice(b),
    }
}
