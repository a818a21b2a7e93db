use super::{StateRecurrenceKernel, Wkv7Inputs};
use crate::ops;
use crate::Result;
use candle::{CpuStorage, DType, Layout, Shape, Tensor};
use rayon::prelude::*;

/// Whole-sequence recurrence evaluated in f32 by a single custom op, heads run in parallel.
///
/// The decay enters in log-log form, `w = -softplus(-x) - 1/2`, and is applied as
/// `exp(-exp(w))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FusedCpuKernel;

impl StateRecurrenceKernel for FusedCpuKernel {
    fn name(&self) -> &'static str {
        "fused-cpu"
    }

    fn forward(
        &self,
        inputs: &Wkv7Inputs<'_>,
        state: &Tensor,
        num_heads: usize,
        head_size: usize,
    ) -> Result<(Tensor, Tensor)> {
        let seq_len = inputs.validate(state, num_heads, head_size)?;
        let dtype = inputs.receptance.dtype();
        let to_f32 = |xs: &Tensor| xs.to_dtype(DType::F32);
        let packed = Tensor::stack(
            &[
                to_f32(inputs.receptance)?,
                ops::log_decay(inputs.decay_preact)?,
                to_f32(inputs.key)?,
                to_f32(inputs.value)?,
                to_f32(inputs.removal)?,
                to_f32(inputs.replacement)?,
            ],
            0,
        )?
        .contiguous()?;
        let op = Wkv7Op {
            num_heads,
            head_size,
        };
        let ys = packed.apply_op2_no_bwd(&state.contiguous()?, &op)?;
        let c = num_heads * head_size;
        let out = ys
            .narrow(0, 0, seq_len * c)?
            .reshape((seq_len, c))?
            .to_dtype(dtype)?;
        let state = ys
            .narrow(0, seq_len * c, num_heads * head_size * head_size)?
            .reshape((num_heads, head_size, head_size))?;
        Ok((out, state))
    }
}

/// Takes the packed `(6, T, C)` inputs `[r, w, k, v, a, b]` and the `(H, N, N)` state, and
/// returns the readout followed by the final state as a flat f32 vector.
struct Wkv7Op {
    num_heads: usize,
    head_size: usize,
}

impl candle::CustomOp2 for Wkv7Op {
    fn name(&self) -> &'static str {
        "wkv7"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> candle::Result<(CpuStorage, Shape)> {
        use candle::backend::BackendStorage;

        let (xs, state) = match (s1, s2) {
            (CpuStorage::F32(xs), CpuStorage::F32(state)) => (xs, state),
            _ => candle::bail!("wkv7 expects f32 inputs, got {:?} {:?}", s1.dtype(), s2.dtype()),
        };
        let xs = match l1.contiguous_offsets() {
            None => candle::bail!("input has to be contiguous"),
            Some((o1, o2)) => &xs[o1..o2],
        };
        let state = match l2.contiguous_offsets() {
            None => candle::bail!("state has to be contiguous"),
            Some((o1, o2)) => &state[o1..o2],
        };
        let (h, n) = (self.num_heads, self.head_size);
        let (six, t, c) = l1.shape().dims3()?;
        if six != 6 || c != h * n || state.len() != h * n * n {
            candle::bail!("wkv7 unexpected shapes {:?} {:?}", l1.shape(), l2.shape())
        }

        let per_head: Vec<(Vec<f32>, Vec<f32>)> = (0..h)
            .into_par_iter()
            .map(|head| {
                let mut s = state[head * n * n..(head + 1) * n * n].to_vec();
                let mut ys = vec![0f32; t * n];
                let mut decay = vec![0f32; n];
                for step in 0..t {
                    let at = |which: usize| {
                        let start = which * t * c + step * c + head * n;
                        &xs[start..start + n]
                    };
                    let (r, w, k, v, a, b) = (at(0), at(1), at(2), at(3), at(4), at(5));
                    for (d, &w) in decay.iter_mut().zip(w) {
                        *d = ops::decay_from_log(w)
                    }
                    for (i, y) in ys[step * n..(step + 1) * n].iter_mut().enumerate() {
                        let row = &mut s[i * n..(i + 1) * n];
                        let sa: f32 = row.iter().zip(a).map(|(s, a)| s * a).sum();
                        let mut acc = 0f32;
                        for j in 0..n {
                            let sj = row[j] * decay[j] + sa * b[j] + v[i] * k[j];
                            row[j] = sj;
                            acc += sj * r[j];
                        }
                        *y = acc
                    }
                }
                (ys, s)
            })
            .collect();

        let mut dst = vec![0f32; t * c + h * n * n];
        let (out, new_state) = dst.split_at_mut(t * c);
        for (head, (ys, s)) in per_head.iter().enumerate() {
            for step in 0..t {
                let start = step * c + head * n;
                out[start..start + n].copy_from_slice(&ys[step * n..(step + 1) * n]);
            }
            new_state[head * n * n..(head + 1) * n * n].copy_from_slice(s);
        }
        let len = dst.len();
        Ok((CpuStorage::F32(dst), Shape::from(len)))
    }
}
