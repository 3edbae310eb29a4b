//! Two-dimensional raster scan over a packed byte matrix.
//!
//! The sliding-window pass reads a rectangular window out of a row-major
//! byte matrix stored four bytes per word. For a window of `rows x cols`
//! elements at `(row_offset, col_offset)` inside a matrix with `pitch`
//! elements per row:
//!
//! ```text
//! byte  = (row_offset + window_row) * pitch + col_offset + window_col
//! word  = base + byte / WORD_BYTES
//! lane  = byte % WORD_BYTES
//! ```
//!
//! The scan walks `window_col` fastest, then `window_row`, and produces
//! exactly `rows * cols` reads.

use crate::device::arch;

/// Shape and placement of a window inside a packed matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowShape {
    /// Window height.
    pub rows: usize,
    /// Window width.
    pub cols: usize,
    /// Elements per matrix row.
    pub pitch: usize,
    /// First matrix row covered by the window.
    pub row_offset: usize,
    /// First matrix column covered by the window.
    pub col_offset: usize,
}

impl WindowShape {
    /// A window covering a whole `size x size` matrix.
    pub fn full(size: usize) -> Self {
        Self {
            rows: size,
            cols: size,
            pitch: size,
            row_offset: 0,
            col_offset: 0,
        }
    }

    /// A `rows x cols` window at an offset inside a matrix of `pitch` columns.
    pub fn sub(rows: usize, cols: usize, pitch: usize, row_offset: usize, col_offset: usize) -> Self {
        Self { rows, cols, pitch, row_offset, col_offset }
    }

    /// Number of reads the window needs.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Matrix byte index of a window position.
    #[inline]
    pub fn byte_index(&self, window_row: usize, window_col: usize) -> usize {
        (self.row_offset + window_row) * self.pitch + self.col_offset + window_col
    }
}

/// One read produced by the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRead {
    /// Word address to read.
    pub address: u32,
    /// Byte lane holding the element.
    pub lane: usize,
    /// Window row of the element.
    pub row: usize,
    /// Window column of the element.
    pub col: usize,
}

/// Raster-scan counters.
#[derive(Debug, Clone)]
pub struct RasterScan {
    base: u32,
    shape: WindowShape,
    window_row: usize,
    window_col: usize,
    generated: usize,
    finished: bool,
}

impl RasterScan {
    pub fn new(base: u32, shape: WindowShape) -> Self {
        Self {
            base,
            shape,
            window_row: 0,
            window_col: 0,
            generated: 0,
            finished: shape.is_empty(),
        }
    }

    #[inline]
    pub fn shape(&self) -> &WindowShape {
        &self.shape
    }

    /// Current `(window_row, window_col)`.
    #[inline]
    pub fn position(&self) -> (usize, usize) {
        (self.window_row, self.window_col)
    }

    /// Read at the current position.
    pub fn current(&self) -> WindowRead {
        let byte = self.shape.byte_index(self.window_row, self.window_col);
        WindowRead {
            address: self.base + (byte / arch::WORD_BYTES) as u32,
            lane: byte % arch::WORD_BYTES,
            row: self.window_row,
            col: self.window_col,
        }
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[inline]
    pub fn generated(&self) -> usize {
        self.generated
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.shape.len().saturating_sub(self.generated)
    }

    /// Produce the read at the current position and advance.
    pub fn next(&mut self) -> Option<WindowRead> {
        if self.finished {
            return None;
        }

        let read = self.current();
        self.generated += 1;

        self.window_col += 1;
        if self.window_col == self.shape.cols {
            self.window_col = 0;
            self.window_row += 1;
        }
        if self.generated >= self.shape.len() {
            self.finished = true;
        }

        Some(read)
    }

    /// Restart the scan.
    pub fn reset(&mut self) {
        self.window_row = 0;
        self.window_col = 0;
        self.generated = 0;
        self.finished = self.shape.is_empty();
    }

    /// Iterate over the remaining reads without disturbing this scan.
    pub fn iter(&self) -> RasterIter {
        RasterIter { scan: self.clone() }
    }
}

/// Iterator over the reads of a [`RasterScan`].
pub struct RasterIter {
    scan: RasterScan,
}

impl Iterator for RasterIter {
    type Item = WindowRead;

    fn next(&mut self) -> Option<Self::Item> {
        self.scan.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.scan.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RasterIter {}
