//! Run configuration and the tiling geometry derived from it.
//!
//! A [`RunConfig`] is latched on a host `start` pulse and stays immutable
//! until the run completes. Everything else the control layer needs is
//! recomputed from it by [`TileGeometry::new`].
//!
//! ```text
//!   input (N x N)              output (N-K+1)^2, tiled A x A
//!   +-----------------+        +-----+-----+--+
//!   | tile 0 input    |        |  0  |  1  |2 |
//!   | (A+K-1)^2 with  |  --->  +-----+-----+--+
//!   |  halo overlap   |        |  3  |  4  |5 |
//!   +-----------------+        +-----+-----+--+
//! ```

use crate::device::arch;
use crate::error::ConfigurationError;

/// Host-supplied configuration of one convolution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    /// Input edge N.
    pub n: usize,
    /// Kernel edge K.
    pub k: usize,
    /// Physical array edge.
    pub array_size: usize,
}

impl RunConfig {
    /// Create a configuration for the default array size.
    pub fn new(n: usize, k: usize) -> Self {
        Self {
            n,
            k,
            array_size: arch::DEFAULT_ARRAY_SIZE,
        }
    }

    /// Same run on a different array edge.
    pub fn with_array_size(mut self, array_size: usize) -> Self {
        self.array_size = array_size;
        self
    }

    /// Check the configuration against the supported ranges.
    ///
    /// Called at latch time; a failure leaves the accelerator idle.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_array_size(self.array_size)?;

        if !(arch::MIN_KERNEL_DIM..=arch::MAX_KERNEL_DIM).contains(&self.k) {
            return Err(ConfigurationError::KernelDimOutOfRange {
                k: self.k,
                min: arch::MIN_KERNEL_DIM,
                max: arch::MAX_KERNEL_DIM,
            });
        }
        if !(arch::MIN_INPUT_DIM..=arch::MAX_INPUT_DIM).contains(&self.n) {
            return Err(ConfigurationError::InputDimOutOfRange {
                n: self.n,
                min: arch::MIN_INPUT_DIM,
                max: arch::MAX_INPUT_DIM,
            });
        }
        if self.n < self.k {
            return Err(ConfigurationError::KernelLargerThanInput { n: self.n, k: self.k });
        }
        if self.k > arch::MAX_KERNEL_TILES_PER_DIM * self.array_size {
            return Err(ConfigurationError::KernelTooLargeForArray {
                k: self.k,
                array_size: self.array_size,
                max_tiles: arch::MAX_KERNEL_TILES_PER_DIM,
            });
        }
        ConfigurationError::check_headroom(self.k)
    }
}

/// Check an array edge read from configuration.
pub fn validate_array_size(size: usize) -> Result<(), ConfigurationError> {
    if size == 0 || size > arch::MAX_ARRAY_SIZE {
        return Err(ConfigurationError::ArraySizeOutOfRange {
            size,
            max: arch::MAX_ARRAY_SIZE,
        });
    }
    Ok(())
}

/// Sizes derived from a [`RunConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub config: RunConfig,
    /// `N - K + 1`
    pub output_dim: usize,
    /// `arraySize + K - 1`
    pub input_tile_size: usize,
    /// `K^2`
    pub total_weight_elems: usize,
    /// `inputTileSize^2`
    pub total_input_elems: usize,
    /// `ceil(K / arraySize)^2`
    pub num_kernel_tiles: usize,
    /// Output tiles along one edge: `ceil(outputDim / arraySize)`.
    pub output_tiles_per_dim: usize,
}

impl TileGeometry {
    /// Derive the geometry of a (validated) configuration.
    pub fn new(config: RunConfig) -> Self {
        let a = config.array_size;
        let output_dim = config.n + 1 - config.k;
        let input_tile_size = a + config.k - 1;
        let kernel_tiles_per_dim = config.k.div_ceil(a);

        Self {
            config,
            output_dim,
            input_tile_size,
            total_weight_elems: config.k * config.k,
            total_input_elems: input_tile_size * input_tile_size,
            num_kernel_tiles: kernel_tiles_per_dim * kernel_tiles_per_dim,
            output_tiles_per_dim: output_dim.div_ceil(a),
        }
    }

    #[inline]
    pub fn array_size(&self) -> usize {
        self.config.array_size
    }

    #[inline]
    pub fn kernel_tiles_per_dim(&self) -> usize {
        self.config.k.div_ceil(self.config.array_size)
    }

    /// Total output tiles in the run.
    #[inline]
    pub fn num_output_tiles(&self) -> usize {
        self.output_tiles_per_dim * self.output_tiles_per_dim
    }

    /// Total outputs in the run: `outputDim^2`.
    #[inline]
    pub fn total_outputs(&self) -> usize {
        self.output_dim * self.output_dim
    }

    /// Output tile by row-major index.
    pub fn output_tile(&self, index: usize) -> OutputTile {
        let a = self.array_size();
        let tile_row = index / self.output_tiles_per_dim;
        let tile_col = index % self.output_tiles_per_dim;
        let row0 = tile_row * a;
        let col0 = tile_col * a;

        OutputTile {
            index,
            row0,
            col0,
            rows: a.min(self.output_dim - row0),
            cols: a.min(self.output_dim - col0),
        }
    }

    /// Kernel tile by row-major index.
    pub fn kernel_tile(&self, index: usize) -> KernelTile {
        let a = self.array_size();
        let per_dim = self.kernel_tiles_per_dim();
        let tile_row = index / per_dim;
        let tile_col = index % per_dim;
        let row0 = tile_row * a;
        let col0 = tile_col * a;

        KernelTile {
            index,
            row0,
            col0,
            rows: a.min(self.config.k - row0),
            cols: a.min(self.config.k - col0),
            is_last: index + 1 == self.num_kernel_tiles,
        }
    }

    /// Iterate over every kernel tile.
    pub fn kernel_tiles(&self) -> impl Iterator<Item = KernelTile> + '_ {
        (0..self.num_kernel_tiles).map(move |i| self.kernel_tile(i))
    }

    /// Iterate over every output tile.
    pub fn output_tiles(&self) -> impl Iterator<Item = OutputTile> + '_ {
        (0..self.num_output_tiles()).map(move |i| self.output_tile(i))
    }

    /// Memory words needed to hold the packed kernel.
    #[inline]
    pub fn weight_words(&self) -> u32 {
        self.total_weight_elems.div_ceil(arch::WORD_BYTES) as u32
    }

    /// Memory words needed to hold one packed input tile.
    #[inline]
    pub fn input_words(&self) -> u32 {
        self.total_input_elems.div_ceil(arch::WORD_BYTES) as u32
    }
}

/// One output tile: a block of at most `A x A` outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputTile {
    pub index: usize,
    /// First output row covered.
    pub row0: usize,
    /// First output column covered.
    pub col0: usize,
    pub rows: usize,
    pub cols: usize,
}

impl OutputTile {
    /// Number of outputs in this tile.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One kernel tile: the sub-block of the kernel resident in the array at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelTile {
    pub index: usize,
    /// First kernel row covered.
    pub row0: usize,
    /// First kernel column covered.
    pub col0: usize,
    pub rows: usize,
    pub cols: usize,
    pub is_last: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_n16_k3() {
        let geo = TileGeometry::new(RunConfig::new(16, 3));
        assert_eq!(geo.output_dim, 14);
        assert_eq!(geo.input_tile_size, 10);
        assert_eq!(geo.total_weight_elems, 9);
        assert_eq!(geo.total_input_elems, 100);
        assert_eq!(geo.num_kernel_tiles, 1);
        assert_eq!(geo.num_output_tiles(), 4);
        assert_eq!(geo.total_outputs(), 196);
        assert_eq!(geo.weight_words(), 3);
        assert_eq!(geo.input_words(), 25);
    }

    #[test]
    fn test_output_tiles_cover_output_once() {
        let geo = TileGeometry::new(RunConfig::new(16, 3));
        let sizes: Vec<usize> = geo.output_tiles().map(|t| t.len()).collect();
        assert_eq!(sizes, vec![64, 48, 48, 36]);
        assert_eq!(sizes.iter().sum::<usize>(), geo.total_outputs());

        let last = geo.output_tile(3);
        assert_eq!((last.row0, last.col0, last.rows, last.cols), (8, 8, 6, 6));
    }

    #[test]
    fn test_kernel_tiling() {
        let geo = TileGeometry::new(RunConfig::new(20, 11));
        assert_eq!(geo.num_kernel_tiles, 4);

        let tiles: Vec<KernelTile> = geo.kernel_tiles().collect();
        assert_eq!((tiles[0].rows, tiles[0].cols), (8, 8));
        assert_eq!((tiles[1].row0, tiles[1].col0, tiles[1].rows, tiles[1].cols), (0, 8, 8, 3));
        assert_eq!((tiles[3].row0, tiles[3].col0, tiles[3].rows, tiles[3].cols), (8, 8, 3, 3));
        assert!(tiles[3].is_last);
        assert!(!tiles[2].is_last);
    }

    #[test]
    fn test_validate_ranges() {
        assert!(RunConfig::new(16, 3).validate().is_ok());
        assert!(RunConfig::new(64, 16).validate().is_ok());
        assert!(matches!(
            RunConfig::new(16, 1).validate(),
            Err(ConfigurationError::KernelDimOutOfRange { k: 1, .. })
        ));
        assert!(matches!(
            RunConfig::new(16, 17).validate(),
            Err(ConfigurationError::KernelDimOutOfRange { .. })
        ));
        assert!(matches!(
            RunConfig::new(15, 3).validate(),
            Err(ConfigurationError::InputDimOutOfRange { n: 15, .. })
        ));
        assert!(matches!(
            RunConfig::new(65, 3).validate(),
            Err(ConfigurationError::InputDimOutOfRange { .. })
        ));
    }

    #[test]
    fn test_validate_kernel_vs_array() {
        // K=9 needs three tiles per edge on a 4x4 array
        assert!(matches!(
            RunConfig::new(16, 9).with_array_size(4).validate(),
            Err(ConfigurationError::KernelTooLargeForArray { k: 9, array_size: 4, .. })
        ));
        assert!(RunConfig::new(16, 8).with_array_size(4).validate().is_ok());
        assert!(matches!(
            RunConfig::new(16, 3).with_array_size(0).validate(),
            Err(ConfigurationError::ArraySizeOutOfRange { .. })
        ));
    }
}
