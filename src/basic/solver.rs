#[cfg(feature = "faer")]
mod faer;
#[cfg(feature = "faer")]
pub use faer::*;

#[cfg(feature = "rsparse")]
mod rsparse;
#[cfg(feature = "rsparse")]
pub use rsparse::*;

#[cfg(feature = "faer")]
pub type DefaultSolver = FaerSolver;

#[cfg(all(not(feature = "faer"), feature = "rsparse"))]
pub type DefaultSolver = RSparseSolver;

/// A trait for solving sparse linear systems `A x = b` given in CSC form.
pub trait Solve {
    /// Solves in place: on success `b` holds `x`.
    ///
    /// # Parameters
    ///
    /// * `ap` - Column pointers of the matrix.
    /// * `ai` - Row indices of the matrix.
    /// * `ax` - Non-zero values of the matrix.
    /// * `b` - Right-hand side vector, overwritten by the solution.
    /// * `n` - Dimension of the system.
    fn solve(
        &mut self,
        ap: &[usize],
        ai: &[usize],
        ax: &[f64],
        b: &mut [f64],
        n: usize,
    ) -> Result<(), &'static str>;

    /// Drops any cached symbolic factorization.
    fn reset(&mut self);
}

/// Last sparsity pattern seen by a solver, used to decide when the
/// symbolic factorization must be recomputed.
#[derive(Debug, Default, Clone)]
pub(crate) struct Pattern {
    ap: Vec<usize>,
    ai: Vec<usize>,
}

impl Pattern {
    /// Records the pattern and returns `true` if it differs from the previous one.
    pub(crate) fn update(&mut self, ap: &[usize], ai: &[usize]) -> bool {
        if self.ap == ap && self.ai == ai {
            return false;
        }
        self.ap.clear();
        self.ap.extend_from_slice(ap);
        self.ai.clear();
        self.ai.extend_from_slice(ai);
        true
    }

    pub(crate) fn clear(&mut self) {
        self.ap.clear();
        self.ai.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // [[4, 1], [2, 3]] in CSC
    fn system() -> (Vec<usize>, Vec<usize>, Vec<f64>) {
        (vec![0, 2, 4], vec![0, 1, 0, 1], vec![4.0, 2.0, 1.0, 3.0])
    }

    #[test]
    fn test_default_solver() {
        let (ap, ai, ax) = system();
        let mut b = vec![1.0, 2.0];
        let mut solver = DefaultSolver::default();
        solver.solve(&ap, &ai, &ax, &mut b, 2).unwrap();
        // x = [0.1, 0.6]
        assert!((b[0] - 0.1).abs() < 1e-12);
        assert!((b[1] - 0.6).abs() < 1e-12);

        // same pattern, new values
        let ax2 = vec![2.0, 0.0, 0.0, 2.0];
        let mut b = vec![2.0, 4.0];
        solver.solve(&ap, &ai, &ax2, &mut b, 2).unwrap();
        assert!((b[0] - 1.0).abs() < 1e-12);
        assert!((b[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_pattern_change_detection() {
        let mut p = Pattern::default();
        assert!(p.update(&[0, 1, 2], &[0, 1]));
        assert!(!p.update(&[0, 1, 2], &[0, 1]));
        assert!(p.update(&[0, 2, 3], &[0, 1, 1]));
    }
}
