use crate::{KernelElem, KernelError, Result};
use std::ops::Range;

/// Borrowed compressed-row matrix block.
///
/// `row_ptr` has `rows + 1` entries, `col` and `val` are parallel and every
/// column index is below `cols`. These are checked once in [`CsrView::new`] so
/// row products can index without bounds surprises.
#[derive(Debug, Clone, Copy)]
pub struct CsrView<'a, T> {
    row_ptr: &'a [usize],
    col: &'a [usize],
    val: &'a [T],
    cols: usize,
}

impl<'a, T: KernelElem> CsrView<'a, T> {
    pub fn new(row_ptr: &'a [usize], col: &'a [usize], val: &'a [T], cols: usize) -> Result<Self> {
        let Some(&last) = row_ptr.last() else {
            return Err(KernelError::ShapeMismatch {
                expected: vec![1],
                got: vec![0],
            });
        };
        if col.len() != val.len() || last != col.len() {
            return Err(KernelError::ShapeMismatch {
                expected: vec![last, last],
                got: vec![col.len(), val.len()],
            });
        }
        if row_ptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(KernelError::MalformedProgram(
                "row pointers must be non-decreasing".into(),
            ));
        }
        if let Some(&bad) = col.iter().find(|&&c| c >= cols) {
            return Err(KernelError::ColumnOutOfRange { col: bad, cols });
        }
        Ok(Self {
            row_ptr,
            col,
            val,
            cols,
        })
    }

    pub fn rows(&self) -> usize {
        self.row_ptr.len() - 1
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.col.len()
    }

    /// Dot product of row `row` with `x`.
    #[inline]
    pub fn row_dot(&self, row: usize, x: &[T]) -> T {
        let (start, end) = (self.row_ptr[row], self.row_ptr[row + 1]);
        self.col[start..end]
            .iter()
            .zip(&self.val[start..end])
            .fold(T::zero(), |acc, (&c, &v)| acc + v * x[c])
    }
}

/// Rows `rows` of one shard's sparse product: `local * x + remote * imports`.
///
/// Argument shapes are checked by the caller.
pub(crate) fn spmv_rows<T: KernelElem>(
    local: &CsrView<'_, T>,
    x: &[T],
    remote: &CsrView<'_, T>,
    imports: &[T],
    rows: Range<usize>,
) -> Vec<T> {
    rows.map(|row| local.row_dot(row, x) + remote.row_dot(row, imports))
        .collect()
}
