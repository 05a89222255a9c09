use nalgebra_sparse::{CooMatrix, CscMatrix};

use crate::basic::error::{PowerFlowError, Result};

/// Triplet accumulator for the system matrix.
///
/// The cursor walks over reusable `(row, col, val)` slots. Linear stamps are
/// written once per homotopy step; [`clear`](Self::clear) then rewinds to the
/// end of that prefix so each Newton iteration overwrites only the nonlinear
/// tail. Entries past the cursor are stale and never reach the matrix; in
/// debug mode [`to_matrix`](Self::to_matrix) refuses to build while the
/// cursor sits below the high-water mark.
#[derive(Debug, Clone)]
pub struct MatrixBuilder {
    size: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f64>,
    index: usize,
    max_index: usize,
    debug: bool,
}

impl MatrixBuilder {
    pub fn new(size: usize, debug: bool) -> Self {
        Self::with_capacity(size, 0, debug)
    }

    pub fn with_capacity(size: usize, capacity: usize, debug: bool) -> Self {
        Self {
            size,
            rows: Vec::with_capacity(capacity),
            cols: Vec::with_capacity(capacity),
            vals: Vec::with_capacity(capacity),
            index: 0,
            max_index: 0,
            debug,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Writes one triplet at the cursor. Exact zeros are dropped.
    pub fn stamp(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        if value == 0.0 {
            return Ok(());
        }
        if self.debug && (row >= self.size || col >= self.size || !value.is_finite()) {
            return Err(PowerFlowError::InvalidStamp {
                row,
                col,
                value,
                size: self.size,
            });
        }
        if self.index < self.vals.len() {
            self.rows[self.index] = row;
            self.cols[self.index] = col;
            self.vals[self.index] = value;
        } else {
            self.rows.push(row);
            self.cols.push(col);
            self.vals.push(value);
        }
        self.index += 1;
        self.max_index = self.max_index.max(self.index);
        Ok(())
    }

    /// Number of live triplets.
    pub fn get_usage(&self) -> usize {
        self.index
    }

    /// Rewinds the cursor to `retain_idx`, keeping the storage and the high-water mark.
    pub fn clear(&mut self, retain_idx: usize) {
        debug_assert!(retain_idx <= self.vals.len());
        self.index = retain_idx;
    }

    /// Builds the CSC matrix from the live triplets, summing duplicates.
    pub fn to_matrix(&self) -> Result<CscMatrix<f64>> {
        if self.debug && self.index != self.max_index {
            return Err(PowerFlowError::StaleEntries {
                cursor: self.index,
                high_water: self.max_index,
            });
        }
        let n = self.index;
        let coo = CooMatrix::try_from_triplets(
            self.size,
            self.size,
            self.rows[..n].to_vec(),
            self.cols[..n].to_vec(),
            self.vals[..n].to_vec(),
        )
        .map_err(|_| self.first_invalid())?;
        Ok(CscMatrix::from(&coo))
    }

    fn first_invalid(&self) -> PowerFlowError {
        let k = (0..self.index)
            .find(|&k| self.rows[k] >= self.size || self.cols[k] >= self.size)
            .unwrap_or(0);
        PowerFlowError::InvalidStamp {
            row: self.rows.get(k).copied().unwrap_or(0),
            col: self.cols.get(k).copied().unwrap_or(0),
            value: self.vals.get(k).copied().unwrap_or(f64::NAN),
            size: self.size,
        }
    }
}

/// Checks the matrix is square and, with `check_zeros`, that no row or
/// column is structurally empty.
pub fn assert_valid(matrix: &CscMatrix<f64>, check_zeros: bool) -> Result<()> {
    let (rows, cols) = (matrix.nrows(), matrix.ncols());
    if rows != cols {
        return Err(PowerFlowError::NotSquare { rows, cols });
    }
    if !check_zeros {
        return Ok(());
    }
    let offsets = matrix.col_offsets();
    let row_indices = matrix.row_indices();
    let values = matrix.values();
    let mut row_seen = vec![false; rows];
    for c in 0..cols {
        let mut any = false;
        for k in offsets[c]..offsets[c + 1] {
            if values[k] != 0.0 {
                row_seen[row_indices[k]] = true;
                any = true;
            }
        }
        if !any {
            return Err(PowerFlowError::ZeroColumn(c));
        }
    }
    match row_seen.iter().position(|seen| !seen) {
        Some(r) => Err(PowerFlowError::ZeroRow(r)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(m: &CscMatrix<f64>, r: usize, c: usize) -> f64 {
        m.get_entry(r, c).map(|e| e.into_value()).unwrap_or(0.0)
    }

    #[test]
    fn test_cursor_keeps_linear_prefix() {
        let mut y = MatrixBuilder::new(2, true);
        y.stamp(0, 0, 2.0).unwrap();
        let linear = y.get_usage();

        for value in [3.0, 5.0] {
            y.stamp(1, 1, value).unwrap();
            y.stamp(0, 1, value).unwrap();
            let m = y.to_matrix().unwrap();
            assert_eq!(entry(&m, 0, 0), 2.0);
            assert_eq!(entry(&m, 1, 1), value);
            assert_eq!(entry(&m, 0, 1), value);
            assert_eq!(m.nnz(), 3);
            y.clear(linear);
        }
    }

    #[test]
    fn test_shrinking_tail() {
        for debug in [true, false] {
            let mut y = MatrixBuilder::new(2, debug);
            y.stamp(0, 0, 2.0).unwrap();
            let linear = y.get_usage();
            y.stamp(1, 1, 3.0).unwrap();
            y.stamp(0, 1, 1.0).unwrap();
            y.to_matrix().unwrap();
            y.clear(linear);

            y.stamp(1, 1, 5.0).unwrap();
            let built = y.to_matrix();
            if debug {
                assert!(matches!(
                    built,
                    Err(PowerFlowError::StaleEntries { cursor: 2, high_water: 3 })
                ));
            } else {
                // the old tail past the cursor never reaches the matrix
                let m = built.unwrap();
                assert_eq!(entry(&m, 1, 1), 5.0);
                assert_eq!(entry(&m, 0, 1), 0.0);
                assert_eq!(m.nnz(), 2);
            }
        }
    }

    #[test]
    fn test_duplicates_sum() {
        let mut y = MatrixBuilder::new(1, false);
        y.stamp(0, 0, 1.5).unwrap();
        y.stamp(0, 0, 1.5).unwrap();
        let m = y.to_matrix().unwrap();
        assert_eq!(entry(&m, 0, 0), 3.0);
    }

    #[test]
    fn test_zero_is_skipped() {
        let mut y = MatrixBuilder::new(1, true);
        y.stamp(0, 0, 0.0).unwrap();
        assert_eq!(y.get_usage(), 0);
    }

    #[test]
    fn test_debug_rejects_bad_stamps() {
        let mut y = MatrixBuilder::new(2, true);
        assert!(matches!(
            y.stamp(usize::MAX, 0, 1.0),
            Err(PowerFlowError::InvalidStamp { .. })
        ));
        assert!(y.stamp(0, 0, f64::NAN).is_err());
        assert!(y.stamp(0, 0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_release_reports_out_of_range_on_build() {
        let mut y = MatrixBuilder::new(2, false);
        y.stamp(0, 5, 1.0).unwrap();
        assert!(matches!(
            y.to_matrix(),
            Err(PowerFlowError::InvalidStamp { col: 5, .. })
        ));
    }

    #[test]
    fn test_stale_entries_detected() {
        let mut y = MatrixBuilder::new(2, true);
        y.stamp(0, 0, 1.0).unwrap();
        y.stamp(1, 1, 1.0).unwrap();
        y.clear(0);
        y.stamp(0, 0, 1.0).unwrap();
        assert!(matches!(
            y.to_matrix(),
            Err(PowerFlowError::StaleEntries { cursor: 1, high_water: 2 })
        ));
        // writing the slot again clears the condition
        y.stamp(1, 1, 1.0).unwrap();
        assert!(y.to_matrix().is_ok());
    }

    #[test]
    fn test_assert_valid() {
        let mut y = MatrixBuilder::new(2, false);
        y.stamp(0, 0, 1.0).unwrap();
        y.stamp(1, 0, 1.0).unwrap();
        let m = y.to_matrix().unwrap();
        assert!(matches!(assert_valid(&m, true), Err(PowerFlowError::ZeroColumn(1))));
        assert!(assert_valid(&m, false).is_ok());

        let mut y = MatrixBuilder::new(2, false);
        y.stamp(0, 0, 1.0).unwrap();
        y.stamp(0, 1, 1.0).unwrap();
        let m = y.to_matrix().unwrap();
        assert!(matches!(assert_valid(&m, true), Err(PowerFlowError::ZeroRow(1))));
    }
}
