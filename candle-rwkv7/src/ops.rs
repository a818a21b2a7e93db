//! Tensor ops shared by the time-mix and channel-mix operators.
//!
//! The normalizations run in f32 internally and cast back to the input dtype.
use candle::{DType, Result, Tensor, D};

/// `exp(-1/2)`, the largest per-step log-decay magnitude.
pub const DECAY_SCALE: f64 = 0.606_530_659_712_633_4;

pub const LAYER_NORM_EPS: f64 = 1e-5;
pub const GROUP_NORM_EPS: f64 = 64e-5;
const L2_NORM_EPS: f64 = 1e-12;

fn with_f32<F: FnOnce(&Tensor) -> Result<Tensor>>(xs: &Tensor, f: F) -> Result<Tensor> {
    let dtype = xs.dtype();
    if dtype == DType::F32 {
        f(xs)
    } else {
        f(&xs.to_dtype(DType::F32)?)?.to_dtype(dtype)
    }
}

fn normalize_last_dim(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let mean = xs.mean_keepdim(D::Minus1)?;
    let centered = xs.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    centered.broadcast_div(&(var + eps)?.sqrt()?)
}

/// Layer normalization over the last dimension.
pub fn layer_norm(xs: &Tensor, weight: &Tensor, bias: &Tensor, eps: f64) -> Result<Tensor> {
    let xs = with_f32(xs, |xs| normalize_last_dim(xs, eps))?;
    xs.broadcast_mul(weight)?.broadcast_add(bias)
}

/// Group normalization over the last dimension, `num_groups` contiguous groups with an affine
/// transform spanning the whole dimension.
pub fn group_norm(
    xs: &Tensor,
    num_groups: usize,
    weight: &Tensor,
    bias: &Tensor,
    eps: f64,
) -> Result<Tensor> {
    let grouped = split_last_dim(xs, num_groups)?;
    let xs = with_f32(&grouped, |xs| normalize_last_dim(xs, eps))?.reshape(xs.shape())?;
    xs.broadcast_mul(weight)?.broadcast_add(bias)
}

/// L2 normalization within each of the `num_groups` slices of the last dimension, dividing by
/// `max(norm, 1e-12)`.
pub fn l2_normalize(xs: &Tensor, num_groups: usize) -> Result<Tensor> {
    let grouped = split_last_dim(xs, num_groups)?;
    let norm = grouped
        .to_dtype(DType::F32)?
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sqrt()?
        .maximum(L2_NORM_EPS)?
        .to_dtype(xs.dtype())?;
    grouped.broadcast_div(&norm)?.reshape(xs.shape())
}

/// Sums each of the `num_groups` slices of the last dimension, keeping the group dimension.
/// `(.., G * N)` gives `(.., G, 1)`.
pub fn group_sum(xs: &Tensor, num_groups: usize) -> Result<Tensor> {
    split_last_dim(xs, num_groups)?.sum_keepdim(D::Minus1)
}

/// Reshapes `(.., C)` into `(.., G, C / G)`.
pub fn split_last_dim(xs: &Tensor, num_groups: usize) -> Result<Tensor> {
    let mut dims = xs.dims().to_vec();
    let last = match dims.pop() {
        Some(last) => last,
        None => candle::bail!("cannot split the last dim of a scalar"),
    };
    if num_groups == 0 || last % num_groups != 0 {
        candle::bail!("{last} channels cannot be split in {num_groups} groups")
    }
    dims.push(num_groups);
    dims.push(last / num_groups);
    xs.reshape(dims)
}

/// Previous-timestep activations for a `(T, C)` sequence: row 0 is `x_prev`, row `t` is
/// `xs[t - 1]`.
pub fn shifted(xs: &Tensor, x_prev: &Tensor) -> Result<Tensor> {
    let (seq_len, _) = xs.dims2()?;
    let x_prev = x_prev.unsqueeze(0)?;
    if seq_len == 1 {
        Ok(x_prev)
    } else {
        Tensor::cat(&[&x_prev, &xs.narrow(0, 0, seq_len - 1)?], 0)
    }
}

/// Token-shift delta `x_prev - x`, for a single `(C,)` step or a `(T, C)` sequence.
pub fn token_shift(xs: &Tensor, x_prev: &Tensor) -> Result<Tensor> {
    match xs.rank() {
        1 => x_prev - xs,
        2 => shifted(xs, x_prev)? - xs,
        rank => candle::bail!("token shift expects a rank 1 or 2 input, got {rank}"),
    }
}

/// `x + delta * mix`.
pub fn lerp(xs: &Tensor, delta: &Tensor, mix: &Tensor) -> Result<Tensor> {
    xs + delta.broadcast_mul(mix)?
}

/// Numerically stable `ln(1 + exp(x))`.
pub fn softplus(xs: &Tensor) -> Result<Tensor> {
    let tail = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;
    xs.relu()? + tail
}

/// Per-step decay in `(0, 1]`: `exp(-exp(-1/2) * sigmoid(x))`, computed in f32.
pub fn decay(preact: &Tensor) -> Result<Tensor> {
    let preact = preact.to_dtype(DType::F32)?;
    (candle_nn::ops::sigmoid(&preact)? * -DECAY_SCALE)?.exp()
}

/// Log-log form of [`decay`]: `-softplus(-x) - 1/2`, so that `decay = exp(-exp(w))`.
pub fn log_decay(preact: &Tensor) -> Result<Tensor> {
    let preact = preact.to_dtype(DType::F32)?;
    softplus(&preact.neg()?)?.affine(-1.0, -0.5)
}

/// Scalar version of the `exp(-exp(w))` step used by the fused kernels.
#[inline]
pub(crate) fn decay_from_log(w: f32) -> f32 {
    (-w.exp()).exp()
}
