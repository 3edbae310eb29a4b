//! Golden model: direct 2D valid convolution.
//!
//! Computes the same cross-correlation the accelerator does (no kernel
//! flip), one output at a time with plain loops. End-to-end runs are
//! compared against this.

/// `out[y][x] = sum_{i,j} kernel[i][j] * image[y+i][x+j]` for an `n x n`
/// image and `k x k` kernel, both row-major. Returns `(n-k+1)^2` outputs.
pub fn conv2d(image: &[u8], n: usize, kernel: &[u8], k: usize) -> Vec<u32> {
    assert_eq!(image.len(), n * n, "image must be {n}x{n}");
    assert_eq!(kernel.len(), k * k, "kernel must be {k}x{k}");
    assert!(k <= n);

    let out_dim = n - k + 1;
    let mut out = Vec::with_capacity(out_dim * out_dim);
    for y in 0..out_dim {
        for x in 0..out_dim {
            let mut acc = 0u32;
            for i in 0..k {
                for j in 0..k {
                    acc += kernel[i * k + j] as u32 * image[(y + i) * n + x + j] as u32;
                }
            }
            out.push(acc);
        }
    }
    out
}
