use faer::{
    MatMut,
    linalg::solvers::Solve as _,
    sparse::{
        SparseColMatRef, SymbolicSparseColMatRef,
        linalg::solvers::{Lu, SymbolicLu},
    },
};

use super::{Pattern, Solve};

/// Sparse LU from `faer`, reusing the symbolic analysis while the pattern is unchanged.
#[derive(Default)]
pub struct FaerSolver {
    symbolic: Option<SymbolicLu<usize>>,
    pattern: Pattern,
}

impl Solve for FaerSolver {
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
        let s = SymbolicSparseColMatRef::new_checked(n, n, ap, None, ai);
        let mat = SparseColMatRef::new(s, ax);
        if self.pattern.update(ap, ai) || self.symbolic.is_none() {
            self.symbolic = Some(SymbolicLu::try_new(s).map_err(|_| "Faer symbolic error")?);
        }
        let Some(symbolic) = self.symbolic.as_ref() else {
            return Err("missing symbolic factorization");
        };
        let lu = Lu::try_new_with_symbolic(symbolic.clone(), mat)
            .map_err(|_| "Faer numerical error")?;
        let rhs = MatMut::from_column_major_slice_mut(b, n, 1);
        lu.solve_in_place(rhs);
        Ok(())
    }

    fn reset(&mut self) {
        self.symbolic = None;
        self.pattern.clear();
    }
}
