//! Differentiable stack (Grefenstette et al. 2015, "Learning to Transduce
//! with Unbounded Memory").
//!
//! Forward (per step t, per batch element):
//!   V_t = v_t                                   (always appended)
//!   w   = u_t
//!   for i = t-1 .. 0:   s_i ← relu(s_i - w),  w ← relu(w - s_i_old)
//!   s_t = d_t
//!   R^m = Σ_i min(s_i, relu(m - Σ_{j>i} s_j)) · V_i      m = 1..k
//!   read level 0 = R^1,  level m = R^{m+1} - R^m
//!
//! Backward: reverse step loop. The gradient w.r.t. the strength vector is
//! carried from step t+1 into step t through the pop recurrence; the
//! gradient w.r.t. every pushed vector accumulates over all later reads.
//!
//! The log is an arena sized for `max_steps`. Besides V it keeps the
//! strength vector after every step and the pop mass that reached every
//! slot, which is everything the backward pass needs.

use std::fmt;

use crate::error::{check_len, Error, Result};

#[inline]
fn relu(x: f32) -> f32 {
    if x > 0.0 { x } else { 0.0 }
}

/// Soft push/pop stack over a batch of independent sequences.
#[derive(Clone, Debug)]
pub struct NeuralStack {
    batch_size: usize,
    embedding_size: usize,
    num_reads: usize,
    max_steps: usize,
    len: usize,
    /// Pushed vectors: [max_steps, batch, embedding]
    values: Vec<f32>,
    /// Strengths after each step: [max_steps (step), max_steps (slot), batch]
    strengths: Vec<f32>,
    /// Pop mass reaching each slot during each step: same layout as `strengths`.
    pops: Vec<f32>,
}

/// Gradients for one step of the stack's history.
#[derive(Clone, Debug)]
pub struct StackStepGrads {
    /// d_loss/d_v: [batch, embedding]
    pub d_v: Vec<f32>,
    /// d_loss/d_u: [batch]
    pub d_u: Vec<f32>,
    /// d_loss/d_d: [batch]
    pub d_d: Vec<f32>,
}

/// Gradients for the full history, step-major.
#[derive(Clone, Debug)]
pub struct StackGrads {
    /// [steps, batch, embedding]
    pub d_v: Vec<f32>,
    /// [steps, batch]
    pub d_u: Vec<f32>,
    /// [steps, batch]
    pub d_d: Vec<f32>,
}

impl NeuralStack {
    /// Create an empty stack. `num_reads` is the number of read levels (k ≥ 1).
    pub fn new(batch_size: usize, embedding_size: usize, num_reads: usize, max_steps: usize) -> Result<Self> {
        if batch_size == 0 || embedding_size == 0 {
            return Err(Error::config(format!(
                "stack needs batch_size > 0 and embedding_size > 0 (got {batch_size}, {embedding_size})"
            )));
        }
        if num_reads == 0 {
            return Err(Error::config("stack needs at least one read level"));
        }
        if max_steps == 0 {
            return Err(Error::config("stack arena needs max_steps > 0"));
        }
        Ok(NeuralStack {
            batch_size,
            embedding_size,
            num_reads,
            max_steps,
            len: 0,
            values: vec![0.0; max_steps * batch_size * embedding_size],
            strengths: vec![0.0; max_steps * max_steps * batch_size],
            pops: vec![0.0; max_steps * max_steps * batch_size],
        })
    }

    /// Empty the log for a new batch. The arena is reused when the
    /// dimensions are unchanged.
    pub fn reset(&mut self, batch_size: usize, embedding_size: usize) -> Result<()> {
        if batch_size == 0 || embedding_size == 0 {
            return Err(Error::config(format!(
                "stack needs batch_size > 0 and embedding_size > 0 (got {batch_size}, {embedding_size})"
            )));
        }
        if batch_size != self.batch_size || embedding_size != self.embedding_size {
            let t = self.max_steps;
            self.values = vec![0.0; t * batch_size * embedding_size];
            self.strengths = vec![0.0; t * t * batch_size];
            self.pops = vec![0.0; t * t * batch_size];
            self.batch_size = batch_size;
            self.embedding_size = embedding_size;
        }
        self.len = 0;
        Ok(())
    }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    pub fn batch_size(&self) -> usize { self.batch_size }
    pub fn embedding_size(&self) -> usize { self.embedding_size }
    pub fn num_reads(&self) -> usize { self.num_reads }
    pub fn max_steps(&self) -> usize { self.max_steps }

    /// Width of one batch element's read output: num_reads * embedding_size.
    pub fn read_width(&self) -> usize {
        self.num_reads * self.embedding_size
    }

    #[inline]
    fn s_idx(&self, step: usize, slot: usize, b: usize) -> usize {
        (step * self.max_steps + slot) * self.batch_size + b
    }

    #[inline]
    fn v_idx(&self, slot: usize, b: usize) -> usize {
        (slot * self.batch_size + b) * self.embedding_size
    }

    /// Current strength of `slot` for batch element `b`.
    /// `None` when the slot or batch element does not exist.
    pub fn strength(&self, slot: usize, b: usize) -> Option<f32> {
        if slot >= self.len || b >= self.batch_size {
            return None;
        }
        Some(self.strengths[self.s_idx(self.len - 1, slot, b)])
    }

    /// All current strengths for batch element `b`, bottom of the stack first.
    pub fn strengths(&self, b: usize) -> Option<Vec<f32>> {
        if b >= self.batch_size {
            return None;
        }
        Some((0..self.len).map(|i| self.strengths[self.s_idx(self.len - 1, i, b)]).collect())
    }

    /// Pushed vector at `slot` for batch element `b`.
    pub fn value(&self, slot: usize, b: usize) -> Option<&[f32]> {
        if slot >= self.len || b >= self.batch_size {
            return None;
        }
        let base = self.v_idx(slot, b);
        Some(&self.values[base..base + self.embedding_size])
    }

    /// Push `v` with strength `d` after popping with strength `u`, then read.
    ///
    /// `v`: [batch, embedding], `u`: [batch], `d`: [batch].
    /// Returns the read: [batch, num_reads, embedding].
    pub fn push_pop_read(&mut self, v: &[f32], u: &[f32], d: &[f32]) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; self.batch_size * self.read_width()];
        self.push_pop_read_into(v, u, d, &mut out)?;
        Ok(out)
    }

    /// `push_pop_read` writing into a caller-owned buffer.
    pub fn push_pop_read_into(&mut self, v: &[f32], u: &[f32], d: &[f32], out: &mut [f32]) -> Result<()> {
        let bs = self.batch_size;
        let e = self.embedding_size;
        check_len("push vector", bs * e, v.len())?;
        check_len("pop strengths", bs, u.len())?;
        check_len("push strengths", bs, d.len())?;
        check_len("read output", bs * self.read_width(), out.len())?;
        if self.len == self.max_steps {
            return Err(Error::CapacityExceeded { max_steps: self.max_steps });
        }

        let t = self.len;
        let base = self.v_idx(t, 0);
        self.values[base..base + bs * e].copy_from_slice(v);

        for b in 0..bs {
            let mut w = u[b];
            for i in (0..t).rev() {
                let old = self.strengths[self.s_idx(t - 1, i, b)];
                let pi = self.s_idx(t, i, b);
                self.pops[pi] = w;
                self.strengths[pi] = relu(old - w);
                w = relu(w - old);
            }
            let top = self.s_idx(t, t, b);
            self.strengths[top] = d[b];
        }
        self.len += 1;

        self.fill_read(out);
        Ok(())
    }

    /// Read the current stack contents without modifying it.
    /// An empty stack reads as zeros.
    pub fn read(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.batch_size * self.read_width()];
        self.fill_read(&mut out);
        out
    }

    /// `read` into a caller-owned buffer of `batch * read_width` floats.
    pub fn read_into(&self, out: &mut [f32]) -> Result<()> {
        check_len("read output", self.batch_size * self.read_width(), out.len())?;
        self.fill_read(out);
        Ok(())
    }

    /// `out` must hold exactly `batch * read_width` floats.
    fn fill_read(&self, out: &mut [f32]) {
        out.iter_mut().for_each(|x| *x = 0.0);
        if self.len == 0 {
            return;
        }

        let e = self.embedding_size;
        let k = self.num_reads;
        let t = self.len - 1;
        for b in 0..self.batch_size {
            let row = &mut out[b * k * e..(b + 1) * k * e];
            for m in 0..k {
                let threshold = (m + 1) as f32;
                let mut used = 0.0f32;
                for i in (0..self.len).rev() {
                    let s = self.strengths[self.s_idx(t, i, b)];
                    let coeff = s.min(relu(threshold - used));
                    if coeff != 0.0 {
                        let vb = self.v_idx(i, b);
                        for j in 0..e {
                            row[m * e + j] += coeff * self.values[vb + j];
                        }
                    }
                    used += s;
                }
            }
            // Cumulative reads → per-level reads, deepest level first.
            for m in (1..k).rev() {
                for j in 0..e {
                    row[m * e + j] -= row[(m - 1) * e + j];
                }
            }
        }
    }

    /// Per-level read coefficients for batch element `b`: [num_reads, len].
    ///
    /// Level m's read equals Σ_i weights[m][i] · V_i.
    pub fn read_weights(&self, b: usize) -> Option<Vec<Vec<f32>>> {
        if b >= self.batch_size {
            return None;
        }
        let k = self.num_reads;
        let mut cumulative = vec![vec![0.0f32; self.len]; k];
        if self.len == 0 {
            return Some(cumulative);
        }
        let t = self.len - 1;
        for (m, level) in cumulative.iter_mut().enumerate() {
            let threshold = (m + 1) as f32;
            let mut used = 0.0f32;
            for i in (0..self.len).rev() {
                let s = self.strengths[self.s_idx(t, i, b)];
                level[i] = s.min(relu(threshold - used));
                used += s;
            }
        }
        for m in (1..k).rev() {
            for i in 0..self.len {
                cumulative[m][i] -= cumulative[m - 1][i];
            }
        }
        Some(cumulative)
    }

    /// Reverse-mode gradients for the whole history.
    ///
    /// `d_reads`: [len, batch, num_reads * embedding], the loss gradient w.r.t.
    /// every read this stack has returned.
    pub fn backward(&self, d_reads: &[f32]) -> Result<StackGrads> {
        let step_width = self.batch_size * self.read_width();
        check_len("read gradients", self.len * step_width, d_reads.len())?;

        let n = self.len;
        let bs = self.batch_size;
        let e = self.embedding_size;
        let mut grads = StackGrads {
            d_v: vec![0.0; n * bs * e],
            d_u: vec![0.0; n * bs],
            d_d: vec![0.0; n * bs],
        };
        let mut walker = StackBackward::new(self);
        for t in (0..n).rev() {
            let step = walker.step(&d_reads[t * step_width..(t + 1) * step_width])?;
            grads.d_v[t * bs * e..(t + 1) * bs * e].copy_from_slice(&step.d_v);
            grads.d_u[t * bs..(t + 1) * bs].copy_from_slice(&step.d_u);
            grads.d_d[t * bs..(t + 1) * bs].copy_from_slice(&step.d_d);
        }
        Ok(grads)
    }

    /// Human-readable dump: one row per slot (vector entries | strength),
    /// one block per batch element.
    pub fn log(&self) -> String {
        if self.len == 0 {
            return "[Empty stack]".to_string();
        }
        let mut lines = Vec::new();
        for b in 0..self.batch_size {
            if b > 0 {
                lines.push("----------------------------".to_string());
            }
            for i in 0..self.len {
                let base = self.v_idx(i, b);
                let entries: Vec<String> =
                    self.values[base..base + self.embedding_size].iter().map(|x| format!("{x:.2}")).collect();
                let strength = self.strengths[self.s_idx(self.len - 1, i, b)];
                lines.push(format!("{}\t|\t{strength:.2}", entries.join("\t")));
            }
        }
        lines.join("\n")
    }
}

impl fmt::Display for NeuralStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.log())
    }
}

/// Step-at-a-time reverse pass over a stack's history.
///
/// Steps are consumed newest first, so the caller can interleave them with
/// its own reverse pass: the read gradient for step t is only known once the
/// controller step t+1 has been differentiated.
pub struct StackBackward<'a> {
    stack: &'a NeuralStack,
    /// Number of steps not yet processed.
    remaining: usize,
    /// Accumulated d_loss/d_V: [len, batch, embedding]
    d_values: Vec<f32>,
    /// d_loss/d_s for the strengths of the step being processed: [max_steps, batch]
    d_strengths: Vec<f32>,
}

impl<'a> StackBackward<'a> {
    pub fn new(stack: &'a NeuralStack) -> Self {
        StackBackward {
            stack,
            remaining: stack.len,
            d_values: vec![0.0; stack.len * stack.batch_size * stack.embedding_size],
            d_strengths: vec![0.0; stack.max_steps * stack.batch_size],
        }
    }

    /// Steps still to be differentiated.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Differentiate the newest unprocessed step given d_loss/d_read for it
    /// ([batch, num_reads * embedding]).
    pub fn step(&mut self, d_read: &[f32]) -> Result<StackStepGrads> {
        let st = self.stack;
        let bs = st.batch_size;
        let e = st.embedding_size;
        let k = st.num_reads;
        check_len("read gradient", bs * k * e, d_read.len())?;
        if self.remaining == 0 {
            return Err(Error::config("stack backward stepped past the first push"));
        }
        let t = self.remaining - 1;
        let n = t + 1;

        let mut d_u = vec![0.0f32; bs];
        let mut d_d = vec![0.0f32; bs];
        let mut d_cum = vec![0.0f32; k * e];
        let mut d_used = vec![0.0f32; n];
        let mut d_s = vec![0.0f32; n];

        for b in 0..bs {
            // level_m = R^{m+1} - R^m  ⇒  dR^m = g_m - g_{m+1}
            let g = &d_read[b * k * e..(b + 1) * k * e];
            for m in 0..k {
                for j in 0..e {
                    let next = if m + 1 < k { g[(m + 1) * e + j] } else { 0.0 };
                    d_cum[m * e + j] = g[m * e + j] - next;
                }
            }

            for i in 0..n {
                d_s[i] = self.d_strengths[i * bs + b];
                d_used[i] = 0.0;
            }

            // Read backward.
            let mut used = 0.0f32;
            for i in (0..n).rev() {
                let s = st.strengths[st.s_idx(t, i, b)];
                let vb = st.v_idx(i, b);
                let dvb = (i * bs + b) * e;
                for m in 0..k {
                    let pre = (m + 1) as f32 - used;
                    let headroom = relu(pre);
                    let coeff = s.min(headroom);
                    let mut d_coeff = 0.0f32;
                    for j in 0..e {
                        let dr = d_cum[m * e + j];
                        self.d_values[dvb + j] += coeff * dr;
                        d_coeff += dr * st.values[vb + j];
                    }
                    if s <= headroom {
                        d_s[i] += d_coeff;
                    } else if pre > 0.0 {
                        d_used[i] -= d_coeff;
                    }
                }
                used += s;
            }
            // used_i = Σ_{j>i} s_j
            let mut acc = 0.0f32;
            for j in 0..n {
                d_s[j] += acc;
                acc += d_used[j];
            }

            // The new top's strength is the push signal.
            d_d[b] = d_s[t];

            // Pop recurrence backward, oldest slot first (reverse of the forward walk).
            let mut d_w_below = 0.0f32;
            for i in 0..t {
                let old = st.strengths[st.s_idx(t - 1, i, b)];
                let w = st.pops[st.s_idx(t, i, b)];
                let mut d_w = 0.0f32;
                let mut d_old = 0.0f32;
                if old - w > 0.0 {
                    d_old += d_s[i];
                    d_w -= d_s[i];
                }
                if w - old > 0.0 {
                    d_w += d_w_below;
                    d_old -= d_w_below;
                }
                self.d_strengths[i * bs + b] = d_old;
                d_w_below = d_w;
            }
            d_u[b] = d_w_below;
            self.d_strengths[t * bs + b] = 0.0;
        }

        self.remaining = t;
        let base = t * bs * e;
        Ok(StackStepGrads {
            d_v: self.d_values[base..base + bs * e].to_vec(),
            d_u,
            d_d,
        })
    }
}
