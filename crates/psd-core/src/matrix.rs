//! Write-only matrix sinks for Jacobian assembly.
//!
//! Components append `(row, col, value)` triplets through the [`MatrixData`]
//! trait; the driver decides what backs the sink (triplet accumulation for
//! the solver, a filtering or callback sink for diagnostics).

use sprs::TriMat;

/// Destination for Jacobian entries. Repeated assignments to the same
/// coordinate accumulate.
pub trait MatrixData {
    fn assign(&mut self, row: usize, col: usize, value: f64);

    /// Number of entries appended so far.
    fn count(&self) -> usize;
}

/// Triplet accumulator convertible to a compressed sparse matrix.
#[derive(Debug, Clone, Default)]
pub struct TripletMatrix {
    entries: Vec<(usize, usize, f64)>,
    rows: usize,
    cols: usize,
}

impl TripletMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        TripletMatrix {
            entries: Vec::new(),
            rows,
            cols,
        }
    }

    pub fn with_capacity(rows: usize, cols: usize, cap: usize) -> Self {
        TripletMatrix {
            entries: Vec::with_capacity(cap),
            rows,
            cols,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn entries(&self) -> &[(usize, usize, f64)] {
        &self.entries
    }

    /// Sum duplicate coordinates into single entries.
    pub fn compact(&mut self) {
        self.entries.sort_by_key(|&(r, c, _)| (r, c));
        let mut out: Vec<(usize, usize, f64)> = Vec::with_capacity(self.entries.len());
        for &(r, c, v) in &self.entries {
            match out.last_mut() {
                Some(last) if last.0 == r && last.1 == c => last.2 += v,
                _ => out.push((r, c, v)),
            }
        }
        self.entries = out;
    }

    /// Dense row-major copy, accumulating duplicates.
    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let mut dense = vec![vec![0.0; self.cols]; self.rows];
        for &(r, c, v) in &self.entries {
            dense[r][c] += v;
        }
        dense
    }

    /// Convert to CSR through a sprs triplet matrix.
    pub fn to_csr(&self) -> sprs::CsMat<f64> {
        let mut tri = TriMat::new((self.rows, self.cols));
        for &(r, c, v) in &self.entries {
            tri.add_triplet(r, c, v);
        }
        tri.to_csr()
    }
}

impl MatrixData for TripletMatrix {
    fn assign(&mut self, row: usize, col: usize, value: f64) {
        debug_assert!(row < self.rows && col < self.cols);
        if value != 0.0 {
            self.entries.push((row, col, value));
        }
    }

    fn count(&self) -> usize {
        self.entries.len()
    }
}

/// Sink forwarding every assignment to a custom write function; used by the
/// diagnostics layer to observe entries without storing them.
pub struct FnSink<F: FnMut(usize, usize, f64)> {
    write: F,
    count: usize,
}

impl<F: FnMut(usize, usize, f64)> FnSink<F> {
    pub fn new(write: F) -> Self {
        FnSink { write, count: 0 }
    }
}

impl<F: FnMut(usize, usize, f64)> MatrixData for FnSink<F> {
    fn assign(&mut self, row: usize, col: usize, value: f64) {
        (self.write)(row, col, value);
        self.count += 1;
    }

    fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulation_and_compact() {
        let mut m = TripletMatrix::new(3, 3);
        m.assign(0, 0, 1.0);
        m.assign(0, 0, 2.0);
        m.assign(2, 1, -1.0);
        assert_eq!(m.count(), 3);
        m.compact();
        assert_eq!(m.count(), 2);
        let dense = m.to_dense();
        assert!((dense[0][0] - 3.0).abs() < 1e-15);
        assert!((dense[2][1] + 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_zero_entries_skipped() {
        let mut m = TripletMatrix::new(2, 2);
        m.assign(0, 1, 0.0);
        assert_eq!(m.count(), 0);
    }

    #[test]
    fn test_csr_conversion() {
        let mut m = TripletMatrix::new(2, 2);
        m.assign(0, 0, 4.0);
        m.assign(1, 1, 5.0);
        let csr = m.to_csr();
        assert_eq!(csr.nnz(), 2);
    }

    #[test]
    fn test_fn_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = FnSink::new(|r, c, v| seen.push((r, c, v)));
            sink.assign(1, 2, 3.0);
            assert_eq!(sink.count(), 1);
        }
        assert_eq!(seen, vec![(1, 2, 3.0)]);
    }
}
