//! Minimal tensor utilities for the controller and the task loss.
//!
//! All operations are free functions on flat f32 slices with explicit dimensions.
//! Row-major layout throughout.

// ── Free-function math ops on flat slices ────────────────────────────

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Matrix multiply with accumulation: C[M,N] += A[M,K] @ B[K,N].
pub fn matmul_acc_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] += sum;
        }
    }
}

/// Transpose A[M,K] → out[K,M].
pub fn transpose_f32(a: &[f32], out: &mut [f32], m: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(out.len(), k * m);

    for i in 0..m {
        for j in 0..k {
            out[j * m + i] = a[i * k + j];
        }
    }
}

/// Add a bias row to every row: out[r, c] += bias[c].
pub fn add_bias_f32(out: &mut [f32], bias: &[f32], rows: usize, cols: usize) {
    debug_assert_eq!(out.len(), rows * cols);
    debug_assert_eq!(bias.len(), cols);
    for r in 0..rows {
        for c in 0..cols {
            out[r * cols + c] += bias[c];
        }
    }
}

/// Column sums accumulated into `out`: out[c] += sum_r a[r, c]. Bias gradients.
pub fn sum_rows_acc_f32(a: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(a.len(), rows * cols);
    debug_assert_eq!(out.len(), cols);
    for r in 0..rows {
        for c in 0..cols {
            out[c] += a[r * cols + c];
        }
    }
}

/// Row-wise softmax: each row of length `cols` in `scores` gets softmaxed into `out`.
/// `rows` * `cols` elements.
pub fn softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];

        // Numerically stable: subtract max
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..cols {
            let e = (row[c] - max_val).exp();
            out[base + c] = e;
            sum_exp += e;
        }
        if sum_exp > 0.0 {
            for c in 0..cols {
                out[base + c] /= sum_exp;
            }
        }
    }
}

/// Index of the largest entry. First index wins ties.
pub fn argmax_f32(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &x) in row.iter().enumerate() {
        if x > row[best] {
            best = i;
        }
    }
    best
}

/// Masked cross-entropy over one time step of a batch.
///
/// `logits`: [batch, classes], `targets`: [batch], `scored`: [batch].
/// Returns (mean loss over scored rows, correct argmax count, scored count).
/// With no scored rows the loss is 0.
pub fn masked_cross_entropy(
    logits: &[f32],
    targets: &[usize],
    scored: &[bool],
    classes: usize,
) -> (f32, usize, usize) {
    let batch = targets.len();
    debug_assert_eq!(logits.len(), batch * classes);
    debug_assert_eq!(scored.len(), batch);

    let mut total_loss = 0.0f32;
    let mut correct = 0usize;
    let mut total = 0usize;

    for b in 0..batch {
        if !scored[b] {
            continue;
        }
        let row = &logits[b * classes..(b + 1) * classes];
        let target = targets[b];
        debug_assert!(target < classes);

        // log-softmax: log(exp(x_t) / sum(exp(x)))
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let sum_exp: f32 = row.iter().map(|&x| (x - max_val).exp()).sum();
        total_loss -= (row[target] - max_val) - sum_exp.ln();

        if argmax_f32(row) == target {
            correct += 1;
        }
        total += 1;
    }

    if total > 0 {
        (total_loss / total as f32, correct, total)
    } else {
        (0.0, 0, 0)
    }
}

/// Gradient of `masked_cross_entropy`'s loss w.r.t. logits, accumulated into `d_logits`.
///
/// d_loss/d_logits = (softmax(logits) - one_hot(target)) / scored_count, zero on
/// unscored rows.
pub fn masked_cross_entropy_backward(
    logits: &[f32],
    targets: &[usize],
    scored: &[bool],
    classes: usize,
    d_logits: &mut [f32],
) {
    let batch = targets.len();
    debug_assert_eq!(d_logits.len(), batch * classes);

    let count = scored.iter().filter(|&&s| s).count();
    if count == 0 {
        return;
    }
    let scale = 1.0 / count as f32;

    let mut probs = vec![0.0f32; classes];
    for b in 0..batch {
        if !scored[b] {
            continue;
        }
        let base = b * classes;
        softmax_f32(&logits[base..base + classes], &mut probs, 1, classes);
        for c in 0..classes {
            let one_hot = if c == targets[b] { 1.0 } else { 0.0 };
            d_logits[base + c] += (probs[c] - one_hot) * scale;
        }
    }
}

/// Sigmoid: 1 / (1 + exp(-x)). Clamped to avoid overflow.
#[inline]
pub fn sigmoid_f32(x: f32) -> f32 {
    if x >= 15.0 { return 1.0; }
    if x <= -15.0 { return 0.0; }
    1.0 / (1.0 + (-x).exp())
}

/// L2 norm of a vector: sqrt(sum(a[i]^2)).
pub fn vec_norm_f32(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Simple xorshift64 PRNG for deterministic weight init. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Uniform in [0, 1).
    pub fn unit(&mut self) -> f32 {
        ((self.next_u64() >> 40) as f32) / ((1u64 << 24) as f32)
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}
