//! Tensor Operations
//!
//! A minimal dense tensor for the transformer. Data lives in a flat
//! row-major `Vec<f32>` with shape and stride metadata.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[rows, n_embd]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! Most layers work on 2D activations `[rows, features]` where `rows` is
//! `sequences * n_ctx`. Attention reshapes into 4D `[batch, n_head, seq, head_dim]`
//! and uses the batched matmul.
//!
//! ## Example
//!
//! ```rust
//! use baike_gpt::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```
//!
//! ## Performance
//!
//! Matmul, softmax and element-wise operations run on Rayon. Large 2D
//! products use a cache-blocked kernel parallelized over row blocks.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

/// A multi-dimensional array for neural network computations
///
/// # Memory Layout
///
/// For shape `[2, 3]`, data is stored as
/// `[r0c0, r0c1, r0c2, r1c0, r1c1, r1c2]` and strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with a constant
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Sample every element from `Normal(0, std)`
    ///
    /// Draws sequentially from `rng` so a seeded generator always yields the
    /// same parameters.
    pub fn random_normal<R: Rng + ?Sized>(shape: Vec<usize>, std: f32, rng: &mut R) -> Self {
        let size: usize = shape.iter().product();
        let normal = match Normal::new(0.0f32, std) {
            Ok(dist) => dist,
            // A non-finite std can only come from a programming error upstream
            Err(_) => return Self::zeros(shape),
        };
        let data = (0..size).map(|_| normal.sample(rng)).collect();
        Self::new(data, shape)
    }

    /// Compute strides from shape (row-major layout)
    ///
    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the last dimension
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Number of rows when viewed as `[len / last_dim, last_dim]`
    pub fn rows(&self) -> usize {
        let cols = self.last_dim();
        if cols == 0 {
            0
        } else {
            self.data.len() / cols
        }
    }

    /// Borrow row `i` of the 2D view
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.last_dim();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// SIMD-friendly inner loop: `result[j] += a_val * b[j]`
    #[inline(always)]
    fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication
    ///
    /// Supports:
    /// - 2D × 2D: `[m, k] @ [k, n] -> [m, n]`
    /// - 4D × 4D: `[b, h, m, k] @ [b, h, k, n] -> [b, h, m, n]`, one
    ///   independent product per (batch, head) pair
    ///
    /// # Panics
    ///
    /// Panics if dimensions are incompatible or unsupported
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        if self.shape.len() == 2 && other.shape.len() == 2 {
            assert_eq!(
                self.shape[1], other.shape[0],
                "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
                self.shape[0], self.shape[1], other.shape[0], other.shape[1]
            );

            let m = self.shape[0];
            let n = other.shape[1];
            let k = self.shape[1];

            // Parallel overhead only pays off past ~1K multiply-adds
            if m * n * k >= 1_000 {
                return self.matmul_parallel_blocked(other, m, n, k);
            }

            let mut result = vec![0.0; m * n];
            for i in 0..m {
                for l in 0..k {
                    let a_val = self.data[i * k + l];
                    Self::matmul_inner_simd(
                        a_val,
                        &other.data[l * n..(l + 1) * n],
                        &mut result[i * n..(i + 1) * n],
                    );
                }
            }

            return Tensor::new(result, vec![m, n]);
        }

        if self.shape.len() == 4 && other.shape.len() == 4 {
            let batch = self.shape[0];
            let n_heads = self.shape[1];
            let seq1 = self.shape[2];
            let inner_dim = self.shape[3];
            let seq2 = other.shape[3];

            assert_eq!(
                (other.shape[0], other.shape[1], other.shape[2]),
                (batch, n_heads, inner_dim),
                "Batched matmul shapes incompatible: {:?} @ {:?}",
                self.shape,
                other.shape
            );

            let mut result = vec![0.0; batch * n_heads * seq1 * seq2];

            result
                .par_chunks_mut(seq1 * seq2)
                .enumerate()
                .for_each(|(bh, chunk)| {
                    let a = &self.data[bh * seq1 * inner_dim..(bh + 1) * seq1 * inner_dim];
                    let b = &other.data[bh * inner_dim * seq2..(bh + 1) * inner_dim * seq2];
                    for i in 0..seq1 {
                        for l in 0..inner_dim {
                            Self::matmul_inner_simd(
                                a[i * inner_dim + l],
                                &b[l * seq2..(l + 1) * seq2],
                                &mut chunk[i * seq2..(i + 1) * seq2],
                            );
                        }
                    }
                });

            return Tensor::new(result, vec![batch, n_heads, seq1, seq2]);
        }

        panic!(
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape, other.shape
        );
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Processes 8×8 blocks so the working set stays in L1, distributing row
    /// blocks across Rayon workers.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::matmul_inner_simd(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Softmax over the last axis
    ///
    /// Uses the numerically stable form:
    ///
    /// ```text
    /// softmax(x)[i] = exp(x[i] - max(x)) / sum(exp(x[j] - max(x)))
    /// ```
    ///
    /// Every row (all leading dimensions flattened) is normalized
    /// independently and in parallel.
    pub fn softmax_last(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = self.data.clone();

        result.par_chunks_mut(cols).for_each(|row| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for val in row.iter_mut() {
                *val = (*val - max).exp();
                sum += *val;
            }
            for val in row.iter_mut() {
                *val /= sum;
            }
        });

        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition with broadcasting support
    ///
    /// 1. **Exact match**: Same shape
    /// 2. **Broadcast last dim**: `[*, n] + [n]` (bias addition)
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let last_dim = self.last_dim();
        if self.shape.len() > other.shape.len() && other.data.len() == last_dim {
            let mut result = self.data.clone();
            result.par_chunks_mut(last_dim).for_each(|row| {
                for (r, &b) in row.iter_mut().zip(&other.data) {
                    *r += b;
                }
            });
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// In-place element-wise accumulation (shapes must match in length)
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(
            self.data.len(),
            other.data.len(),
            "Cannot accumulate {:?} into {:?}",
            other.shape,
            self.shape
        );
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, &b)| *a += b);
    }

    /// Multiply all elements by scalar in place
    pub fn scale(&mut self, scalar: f32) {
        self.data.par_iter_mut().for_each(|x| *x *= scalar);
    }

    /// Sum of squared elements
    pub fn sum_sq(&self) -> f32 {
        self.data.par_iter().map(|&x| x * x).sum()
    }

    /// Column sums of the 2D view: `[rows, n] -> [n]`
    ///
    /// This is the bias gradient of an affine layer.
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.last_dim();
        let mut sums = vec![0.0; cols];
        for row in self.data.chunks(cols) {
            for (s, &v) in sums.iter_mut().zip(row) {
                *s += v;
            }
        }
        Tensor::new(sums, vec![cols])
    }

    /// Reshape tensor to new shape
    ///
    /// Total number of elements must remain the same.
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} into {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Transpose two dimensions (negative indices count from the end)
    ///
    /// ```rust
    /// # use baike_gpt::Tensor;
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
    /// let tt = t.transpose(0, 1);
    /// assert_eq!(tt.shape, vec![3, 2]);
    /// assert_eq!(tt.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    /// ```
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Tensor {
        let ndim = self.shape.len() as isize;
        let d1 = if dim1 < 0 { ndim + dim1 } else { dim1 } as usize;
        let d2 = if dim2 < 0 { ndim + dim2 } else { dim2 } as usize;

        let mut new_shape = self.shape.clone();
        new_shape.swap(d1, d2);

        if self.shape.len() == 2 {
            let rows = self.shape[0];
            let cols = self.shape[1];
            let mut result = vec![0.0; rows * cols];
            for i in 0..rows {
                for j in 0..cols {
                    result[j * rows + i] = self.data[i * cols + j];
                }
            }
            return Tensor::new(result, new_shape);
        }

        // Walk the output in order, mapping each coordinate back through the
        // swapped source strides.
        let new_strides = Self::compute_strides(&new_shape);
        let mut source_strides = self.strides.clone();
        source_strides.swap(d1, d2);

        let result: Vec<f32> = (0..self.data.len())
            .into_par_iter()
            .map(|i| {
                let mut remaining = i;
                let mut src = 0;
                for (stride, src_stride) in new_strides.iter().zip(&source_strides) {
                    let coord = remaining / stride;
                    remaining %= stride;
                    src += coord * src_stride;
                }
                self.data[src]
            })
            .collect();

        Tensor::new(result, new_shape)
    }

    /// Gather rows of a 2D tensor: `out[i] = self[indices[i]]`
    pub fn gather_rows(&self, indices: &[usize]) -> Tensor {
        let cols = self.last_dim();
        let mut data = Vec::with_capacity(indices.len() * cols);
        for &idx in indices {
            data.extend_from_slice(self.row(idx));
        }
        Tensor::new(data, vec![indices.len(), cols])
    }

    /// Scatter-add rows into a zero tensor of `n_rows`: `out[indices[i]] += self[i]`
    ///
    /// Transpose of [`gather_rows`](Self::gather_rows).
    pub fn scatter_add_rows(&self, indices: &[usize], n_rows: usize) -> Tensor {
        let mut out = Tensor::zeros(vec![n_rows, self.last_dim()]);
        out.index_add_rows(indices, self);
        out
    }

    /// Accumulate rows of `src` into this tensor: `self[indices[i]] += src[i]`
    pub fn index_add_rows(&mut self, indices: &[usize], src: &Tensor) {
        let cols = self.last_dim();
        assert_eq!(cols, src.last_dim(), "Row widths differ in index_add_rows");
        for (i, &idx) in indices.iter().enumerate() {
            let dst = &mut self.data[idx * cols..(idx + 1) * cols];
            for (d, &s) in dst.iter_mut().zip(src.row(i)) {
                *d += s;
            }
        }
    }

    /// Concatenate tensors along dimension 0
    pub fn concat_rows(parts: &[Tensor]) -> Tensor {
        let Some(first) = parts.first() else {
            return Tensor::zeros(vec![0]);
        };
        let mut shape = first.shape.clone();
        shape[0] = parts.iter().map(|p| p.shape[0]).sum();
        let mut data = Vec::with_capacity(parts.iter().map(|p| p.data.len()).sum());
        for part in parts {
            assert_eq!(
                part.shape[1..],
                first.shape[1..],
                "Cannot concatenate tensors with different trailing shapes"
            );
            data.extend_from_slice(&part.data);
        }
        Tensor::new(data, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_matmul_small_and_blocked_agree() {
        let a = Tensor::new((0..12 * 10).map(|i| (i % 7) as f32 * 0.1).collect(), vec![12, 10]);
        let b = Tensor::new((0..10 * 9).map(|i| (i % 5) as f32 * 0.2).collect(), vec![10, 9]);
        let blocked = a.matmul(&b);

        let mut naive = vec![0.0; 12 * 9];
        for i in 0..12 {
            for j in 0..9 {
                for l in 0..10 {
                    naive[i * 9 + j] += a.data[i * 10 + l] * b.data[l * 9 + j];
                }
            }
        }
        for (x, y) in blocked.data.iter().zip(&naive) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_batched_matmul_matches_per_head() {
        let a = Tensor::new((0..2 * 2 * 3 * 4).map(|i| i as f32 * 0.01).collect(), vec![2, 2, 3, 4]);
        let b = Tensor::new((0..2 * 2 * 4 * 5).map(|i| i as f32 * 0.02).collect(), vec![2, 2, 4, 5]);
        let c = a.matmul(&b);
        assert_eq!(c.shape, vec![2, 2, 3, 5]);

        // Head (1, 0) computed as an ordinary 2D product
        let bh = 2;
        let a2 = Tensor::new(a.data[bh * 12..(bh + 1) * 12].to_vec(), vec![3, 4]);
        let b2 = Tensor::new(b.data[bh * 20..(bh + 1) * 20].to_vec(), vec![4, 5]);
        let c2 = a2.matmul(&b2);
        assert_eq!(&c.data[bh * 15..(bh + 1) * 15], &c2.data[..]);
    }

    #[test]
    fn test_transpose_4d_last_two() {
        let t = Tensor::new((0..24).map(|i| i as f32).collect(), vec![1, 2, 3, 4]);
        let tt = t.transpose(-2, -1);
        assert_eq!(tt.shape, vec![1, 2, 4, 3]);
        // Element [0, 1, 2, 3] moves to [0, 1, 3, 2]
        assert_eq!(tt.data[12 + 3 * 3 + 2], t.data[12 + 2 * 4 + 3]);
        assert_eq!(tt.transpose(-2, -1), t);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, -1e9, 0.0, 5.0], vec![2, 3]);
        let s = t.softmax_last();
        for row in s.data.chunks(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
        assert_eq!(s.data[3], 0.0);
    }

    #[test]
    fn test_gather_scatter_are_adjoint() {
        let table = Tensor::new((0..12).map(|i| i as f32).collect(), vec![4, 3]);
        let picked = table.gather_rows(&[2, 0, 2]);
        assert_eq!(picked.row(0), &[6.0, 7.0, 8.0]);

        let back = picked.scatter_add_rows(&[2, 0, 2], 4);
        assert_eq!(back.row(2), &[12.0, 14.0, 16.0]);
        assert_eq!(back.row(1), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_random_normal_is_seeded() {
        let mut r1 = StdRng::seed_from_u64(7);
        let mut r2 = StdRng::seed_from_u64(7);
        let a = Tensor::random_normal(vec![4, 4], 0.02, &mut r1);
        let b = Tensor::random_normal(vec![4, 4], 0.02, &mut r2);
        assert_eq!(a, b);
        assert!(a.data.iter().all(|v| v.abs() < 0.2));
    }

    #[test]
    fn test_sum_rows_and_concat() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        assert_eq!(t.sum_rows().data, vec![4.0, 6.0]);
        let c = Tensor::concat_rows(&[t.clone(), t]);
        assert_eq!(c.shape, vec![4, 2]);
    }
}
