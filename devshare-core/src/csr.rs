use crate::error::{CoreError, Result};

/// Borrowed view of one process's row block of a row-distributed CSR matrix.
///
/// Row offsets are local (start at 0, length `n_local_rows + 1`); column
/// indices are global. The caller keeps ownership of the arrays.
#[derive(Debug, Clone, Copy)]
pub struct CsrView<'a> {
    n_global_rows: usize,
    row_offsets: &'a [usize],
    col_indices: &'a [usize],
    values: &'a [f64],
}

impl<'a> CsrView<'a> {
    /// Validates and wraps the caller's CSR arrays.
    pub fn new(
        n_global_rows: usize,
        row_offsets: &'a [usize],
        col_indices: &'a [usize],
        values: &'a [f64],
    ) -> Result<Self> {
        let Some((&first, _)) = row_offsets.split_first() else {
            return Err(CoreError::InvalidDimensions(
                "row_offsets must hold at least one entry".to_string(),
            ));
        };
        if first != 0 {
            return Err(CoreError::InvalidDimensions(format!(
                "row_offsets must start at 0, found {}",
                first
            )));
        }
        if row_offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(CoreError::InvalidDimensions(
                "row_offsets must be non-decreasing".to_string(),
            ));
        }
        if values.len() != col_indices.len() {
            return Err(CoreError::InvalidDimensions(format!(
                "values ({}) and col_indices ({}) must have the same length",
                values.len(),
                col_indices.len()
            )));
        }
        let n_local_rows = row_offsets.len() - 1;
        if row_offsets[n_local_rows] != values.len() {
            return Err(CoreError::InvalidDimensions(format!(
                "Last row offset ({}) must equal the number of non-zero values ({})",
                row_offsets[n_local_rows],
                values.len()
            )));
        }
        if n_local_rows > n_global_rows {
            return Err(CoreError::InvalidDimensions(format!(
                "Local rows ({}) exceed global rows ({})",
                n_local_rows, n_global_rows
            )));
        }
        if let Some(&col) = col_indices.iter().find(|&&c| c >= n_global_rows) {
            return Err(CoreError::InvalidDimensions(format!(
                "Column index {} out of bounds for {} global columns",
                col, n_global_rows
            )));
        }
        Ok(Self {
            n_global_rows,
            row_offsets,
            col_indices,
            values,
        })
    }

    pub fn n_local_rows(&self) -> usize {
        self.row_offsets.len() - 1
    }

    pub fn n_global_rows(&self) -> usize {
        self.n_global_rows
    }

    pub fn n_local_nz(&self) -> usize {
        self.values.len()
    }

    pub fn row_offsets(&self) -> &'a [usize] {
        self.row_offsets
    }

    pub fn col_indices(&self) -> &'a [usize] {
        self.col_indices
    }

    pub fn values(&self) -> &'a [f64] {
        self.values
    }
}

/// A row-distributed sparse matrix owned by some external container.
/// Only the per-process CSR block is ever read.
pub trait DistributedMatrix {
    fn n_global_rows(&self) -> usize;

    fn row_offsets(&self) -> &[usize];

    fn col_indices(&self) -> &[usize];

    fn values(&self) -> &[f64];

    fn n_local_rows(&self) -> usize {
        self.row_offsets().len().saturating_sub(1)
    }

    fn n_local_nz(&self) -> usize {
        self.values().len()
    }

    fn csr_view(&self) -> Result<CsrView<'_>> {
        CsrView::new(
            self.n_global_rows(),
            self.row_offsets(),
            self.col_indices(),
            self.values(),
        )
    }
}

/// One `(row, col, value)` entry; `row` is a global row index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triplet {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

impl Triplet {
    pub fn new(row: usize, col: usize, value: f64) -> Self {
        Self { row, col, value }
    }
}

/// An owned row block `[first_row, first_row + n_local_rows)` of a square,
/// row-distributed matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrPartition {
    first_row: usize,
    n_global_rows: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
}

impl CsrPartition {
    /// Builds the block from triplets carrying global row indices. Entries
    /// are sorted by (row, col); duplicates are kept in input order.
    pub fn from_triplets(
        first_row: usize,
        n_local_rows: usize,
        n_global_rows: usize,
        mut triplets: Vec<Triplet>,
    ) -> Result<Self> {
        if first_row + n_local_rows > n_global_rows {
            return Err(CoreError::InvalidDimensions(format!(
                "Row block [{}, {}) exceeds {} global rows",
                first_row,
                first_row + n_local_rows,
                n_global_rows
            )));
        }
        triplets.sort_by_key(|t| (t.row, t.col));

        // Count non-zeros per row
        let mut row_offsets = vec![0usize; n_local_rows + 1];
        for t in &triplets {
            if t.row < first_row || t.row >= first_row + n_local_rows {
                return Err(CoreError::InvalidDimensions(format!(
                    "Row index {} is outside the local block [{}, {})",
                    t.row,
                    first_row,
                    first_row + n_local_rows
                )));
            }
            if t.col >= n_global_rows {
                return Err(CoreError::InvalidDimensions(format!(
                    "Column index {} out of bounds",
                    t.col
                )));
            }
            row_offsets[t.row - first_row + 1] += 1;
        }
        // Convert counts to cumulative row offsets
        for i in 1..=n_local_rows {
            row_offsets[i] += row_offsets[i - 1];
        }

        // Already sorted, so entries land in row order.
        let col_indices = triplets.iter().map(|t| t.col).collect();
        let values = triplets.iter().map(|t| t.value).collect();

        Ok(Self {
            first_row,
            n_global_rows,
            row_offsets,
            col_indices,
            values,
        })
    }

    /// Takes ownership of already assembled CSR arrays for rows starting at
    /// `first_row`.
    pub fn from_parts(
        first_row: usize,
        n_global_rows: usize,
        row_offsets: Vec<usize>,
        col_indices: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self> {
        let n_local_rows = CsrView::new(n_global_rows, &row_offsets, &col_indices, &values)?
            .n_local_rows();
        if first_row + n_local_rows > n_global_rows {
            return Err(CoreError::InvalidDimensions(format!(
                "Row block [{}, {}) exceeds {} global rows",
                first_row,
                first_row + n_local_rows,
                n_global_rows
            )));
        }
        Ok(Self {
            first_row,
            n_global_rows,
            row_offsets,
            col_indices,
            values,
        })
    }

    pub fn first_row(&self) -> usize {
        self.first_row
    }

    /// Mutable non-zero values; the sparsity structure stays fixed.
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }
}

impl DistributedMatrix for CsrPartition {
    fn n_global_rows(&self) -> usize {
        self.n_global_rows
    }

    fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    fn values(&self) -> &[f64] {
        &self.values
    }
}
