//! Offset-addressed matrix views.
//!
//! Kernels never receive a whole arena region as "the" matrix. They receive a
//! backing slice plus an element offset and row-major dimensions, so the same
//! region can hold many tensors side by side.

use crate::error::{KernelError, KernelResult};

fn check_bounds(
    operation: &'static str,
    available: usize,
    offset: usize,
    rows: usize,
    cols: usize,
) -> KernelResult<()> {
    let len = rows
        .checked_mul(cols)
        .ok_or_else(|| KernelError::out_of_bounds(operation, offset, usize::MAX, available))?;
    match offset.checked_add(len) {
        Some(end) if end <= available => Ok(()),
        _ => Err(KernelError::out_of_bounds(operation, offset, len, available)),
    }
}

/// Read-only row-major `rows x cols` matrix inside a larger buffer
#[derive(Debug, Clone, Copy)]
pub struct MatRef<'a, T> {
    data: &'a [T],
    offset: usize,
    rows: usize,
    cols: usize,
}

impl<'a, T: Copy> MatRef<'a, T> {
    /// View `rows * cols` elements of `data` starting at `offset`
    pub fn new(data: &'a [T], offset: usize, rows: usize, cols: usize) -> KernelResult<Self> {
        check_bounds("MatRef::new", data.len(), offset, rows, cols)?;
        Ok(Self {
            data,
            offset,
            rows,
            cols,
        })
    }

    /// View a slice that holds exactly one matrix
    pub fn from_slice(data: &'a [T], rows: usize, cols: usize) -> KernelResult<Self> {
        Self::new(data, 0, rows, cols)
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `[rows, cols]`
    pub fn dims(&self) -> Vec<usize> {
        vec![self.rows, self.cols]
    }

    /// Element count
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether the view has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `(row, col)`
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[self.offset + row * self.cols + col]
    }

    /// Row `row` as a contiguous slice
    #[inline]
    pub fn row(&self, row: usize) -> &'a [T] {
        let start = self.offset + row * self.cols;
        &self.data[start..start + self.cols]
    }

    /// All elements in row-major order
    pub fn as_slice(&self) -> &'a [T] {
        &self.data[self.offset..self.offset + self.len()]
    }
}

/// Mutable row-major `rows x cols` matrix inside a larger buffer
#[derive(Debug)]
pub struct MatMut<'a, T> {
    data: &'a mut [T],
    offset: usize,
    rows: usize,
    cols: usize,
}

impl<'a, T: Copy> MatMut<'a, T> {
    /// View `rows * cols` elements of `data` starting at `offset`
    pub fn new(data: &'a mut [T], offset: usize, rows: usize, cols: usize) -> KernelResult<Self> {
        check_bounds("MatMut::new", data.len(), offset, rows, cols)?;
        Ok(Self {
            data,
            offset,
            rows,
            cols,
        })
    }

    /// View a slice that holds exactly one matrix
    pub fn from_slice(data: &'a mut [T], rows: usize, cols: usize) -> KernelResult<Self> {
        Self::new(data, 0, rows, cols)
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `[rows, cols]`
    pub fn dims(&self) -> Vec<usize> {
        vec![self.rows, self.cols]
    }

    /// Element count
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether the view has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `(row, col)`
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[self.offset + row * self.cols + col]
    }

    /// Overwrite the element at `(row, col)`
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        self.data[self.offset + row * self.cols + col] = value;
    }

    /// Row `row` as a contiguous mutable slice
    #[inline]
    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        let start = self.offset + row * self.cols;
        &mut self.data[start..start + self.cols]
    }

    /// All elements in row-major order
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let len = self.len();
        &mut self.data[self.offset..self.offset + len]
    }

    /// Set every element to `value`
    pub fn fill(&mut self, value: T) {
        self.as_mut_slice().fill(value);
    }

    /// Read-only view of the same elements
    pub fn view(&self) -> MatRef<'_, T> {
        MatRef {
            data: &*self.data,
            offset: self.offset,
            rows: self.rows,
            cols: self.cols,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_view_indexing() {
        let data: Vec<f32> = (0..10).map(|v| v as f32).collect();
        let m = MatRef::new(&data, 4, 2, 3).unwrap();

        assert_eq!(m.get(0, 0), 4.0);
        assert_eq!(m.get(1, 2), 9.0);
        assert_eq!(m.row(1), &[7.0, 8.0, 9.0]);
        assert_eq!(m.as_slice().len(), 6);
    }

    #[test]
    fn test_view_must_fit_backing_buffer() {
        let data = [0.0f32; 8];
        let err = MatRef::new(&data, 4, 2, 3).unwrap_err();
        assert!(matches!(
            err,
            KernelError::OutOfBounds {
                offset: 4,
                len: 6,
                available: 8,
                ..
            }
        ));
    }

    #[test]
    fn test_mut_view_writes_inside_window() {
        let mut data = [0.0f64; 8];
        {
            let mut m = MatMut::new(&mut data, 2, 2, 2).unwrap();
            m.fill(1.0);
            m.set(1, 1, 5.0);
            assert_eq!(m.view().get(1, 1), 5.0);
        }
        assert_eq!(data, [0.0, 0.0, 1.0, 1.0, 1.0, 5.0, 0.0, 0.0]);
    }
}
