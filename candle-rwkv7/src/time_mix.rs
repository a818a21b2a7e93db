//! Time-mix sublayer, the attention replacement of RWKV-7.
//!
//! Each head of size `N` carries an `N x N` memory updated once per token:
//!
//! ```text
//! state <- state * diag(w) + state @ ((-kk) ⊗ (kk * a)) + v ⊗ k
//! out    = state @ r
//! ```
//!
//! The single token path applies this directly while the sequence path hands the whole
//! sequence to the configured [`StateRecurrenceKernel`](crate::kernels::StateRecurrenceKernel).
use crate::config::RuntimeConfig;
use crate::kernels::{self, KernelSet, Wkv7Inputs};
use crate::matmul::Weight;
use crate::ops;
use crate::weights::WeightMap;
use crate::{Error, Result};
use candle::{Tensor, D};
use candle_nn::ops::sigmoid;

/// Cross-layer value blending, absent on layer 0 which produces `v_first` instead.
#[derive(Debug, Clone)]
struct ValueResidual {
    v0: Tensor,
    v1: Tensor,
    v2: Tensor,
}

/// Result of a time-mix call.
#[derive(Debug, Clone)]
pub struct TimeMixOutput {
    pub output: Tensor,
    /// Pre-mix activation of the last token, the next call's `x_prev`.
    pub x_prev: Tensor,
    /// Updated `(H, N, N)` f32 state.
    pub state: Tensor,
    /// Value projection of layer 0, passed to every deeper layer.
    pub v_first: Tensor,
}

struct Projections {
    r: Tensor,
    decay_preact: Tensor,
    k: Tensor,
    v: Tensor,
    kk: Tensor,
    a: Tensor,
    g: Tensor,
    v_first: Tensor,
}

#[derive(Debug, Clone)]
pub struct TimeMix {
    // Token-shift mixes, (C,)
    x_r: Tensor,
    x_w: Tensor,
    x_k: Tensor,
    x_v: Tensor,
    x_a: Tensor,
    x_g: Tensor,
    // Decay lora
    w0: Tensor,
    w1: Tensor,
    w2: Tensor,
    // In-context learning rate lora
    a0: Tensor,
    a1: Tensor,
    a2: Tensor,
    value_residual: Option<ValueResidual>,
    // Output gate lora
    g1: Tensor,
    g2: Tensor,
    k_k: Tensor,
    k_a: Tensor,
    r_k: Tensor,
    receptance: Weight,
    key: Weight,
    value: Weight,
    output: Weight,
    ln_x_weight: Tensor,
    ln_x_bias: Tensor,
    layer_id: usize,
    n_head: usize,
    head_size: usize,
    kernels: KernelSet,
    span: tracing::Span,
}

impl TimeMix {
    pub fn new(layer_id: usize, weights: &WeightMap, cfg: &RuntimeConfig) -> Result<Self> {
        let dims = weights.dims();
        let p = format!("blocks.{layer_id}.att.");
        let get = |name: &str| weights.get(&format!("{p}{name}")).cloned();
        let weight = |name: &str| weights.weight(&format!("{p}{name}"));
        // Layer 0 checkpoints still carry v0, v1 and v2 but they are never used.
        let value_residual = if layer_id > 0 {
            Some(ValueResidual {
                v0: get("v0")?,
                v1: get("v1")?,
                v2: get("v2")?,
            })
        } else {
            None
        };
        Ok(Self {
            x_r: get("x_r")?,
            x_w: get("x_w")?,
            x_k: get("x_k")?,
            x_v: get("x_v")?,
            x_a: get("x_a")?,
            x_g: get("x_g")?,
            w0: get("w0")?,
            w1: get("w1")?,
            w2: get("w2")?,
            a0: get("a0")?,
            a1: get("a1")?,
            a2: get("a2")?,
            value_residual,
            g1: get("g1")?,
            g2: get("g2")?,
            k_k: get("k_k")?,
            k_a: get("k_a")?,
            r_k: get("r_k")?,
            receptance: weight("receptance.weight")?,
            key: weight("key.weight")?,
            value: weight("value.weight")?,
            output: weight("output.weight")?,
            ln_x_weight: get("ln_x.weight")?,
            ln_x_bias: get("ln_x.bias")?,
            layer_id,
            n_head: dims.n_head,
            head_size: dims.head_size,
            kernels: cfg.kernels.clone(),
            span: tracing::span!(tracing::Level::TRACE, "time-mix", layer_id),
        })
    }

    fn mm(&self, xs: &Tensor, w: &Tensor) -> Result<Tensor> {
        self.kernels.matmul.matmul(xs, w, None)
    }

    fn proj(&self, xs: &Tensor, w: &Weight) -> Result<Tensor> {
        self.kernels.matmul.forward(xs, w)
    }

    fn check_width(&self, xs: &Tensor, x_prev: &Tensor) -> Result<()> {
        let c = self.n_head * self.head_size;
        if xs.dim(D::Minus1)? != c {
            Err(Error::shape_mismatch("time-mix", c, xs.dim(D::Minus1)?))?
        }
        if x_prev.dims() != [c] {
            Err(Error::shape_mismatch("time-mix-x-prev", c, x_prev.shape().clone()))?
        }
        Ok(())
    }

    /// Everything up to the state update, for a `(C,)` token or a `(T, C)` sequence.
    fn project(
        &self,
        xs: &Tensor,
        delta: &Tensor,
        v_first: Option<&Tensor>,
    ) -> Result<Projections> {
        let xr = ops::lerp(xs, delta, &self.x_r)?;
        let xw = ops::lerp(xs, delta, &self.x_w)?;
        let xk = ops::lerp(xs, delta, &self.x_k)?;
        let xv = ops::lerp(xs, delta, &self.x_v)?;
        let xa = ops::lerp(xs, delta, &self.x_a)?;
        let xg = ops::lerp(xs, delta, &self.x_g)?;

        let r = self.proj(&xr, &self.receptance)?;
        let decay_preact = self
            .mm(&self.mm(&xw, &self.w1)?.tanh()?, &self.w2)?
            .broadcast_add(&self.w0)?;
        let k = self.proj(&xk, &self.key)?;
        let v = self.proj(&xv, &self.value)?;
        let a = sigmoid(&self.mm(&self.mm(&xa, &self.a1)?, &self.a2)?.broadcast_add(&self.a0)?)?;
        let g = self.mm(&sigmoid(&self.mm(&xg, &self.g1)?)?, &self.g2)?;

        let kk = ops::l2_normalize(&k.broadcast_mul(&self.k_k)?, self.n_head)?;
        let k = (&k * ((&a - 1.0)?.broadcast_mul(&self.k_a)? + 1.0)?)?;

        let (v, v_first) = match (&self.value_residual, v_first) {
            (None, _) => (v.clone(), v),
            (Some(res), Some(v_first)) => {
                let gate = self.mm(&self.mm(&xv, &res.v1)?, &res.v2)?;
                let gate = sigmoid(&gate.broadcast_add(&res.v0)?)?;
                let v = (&v + (v_first - &v)?.mul(&gate)?)?;
                (v, v_first.clone())
            }
            (Some(_), None) => Err(Error::MissingVFirst {
                layer_id: self.layer_id,
            })?,
        };
        Ok(Projections {
            r,
            decay_preact,
            k,
            v,
            kk,
            a,
            g,
            v_first,
        })
    }

    /// Grouped norm of the state readout plus the per-head bonus, gated then projected.
    fn readout(&self, out: &Tensor, p: &Projections) -> Result<Tensor> {
        let h = self.n_head;
        let out = ops::group_norm(out, h, &self.ln_x_weight, &self.ln_x_bias, ops::GROUP_NORM_EPS)?;
        let bonus = ops::group_sum(&(&p.r * &p.k)?.broadcast_mul(&self.r_k)?, h)?
            .broadcast_mul(&ops::split_last_dim(&p.v, h)?)?
            .reshape(p.v.shape())?;
        let out = ((out + bonus)? * &p.g)?;
        self.proj(&out, &self.output)
    }

    /// Single token step, `x` and `x_prev` are `(C,)`.
    pub fn forward_one(
        &self,
        x: &Tensor,
        x_prev: &Tensor,
        v_first: Option<&Tensor>,
        state: &Tensor,
    ) -> Result<TimeMixOutput> {
        let _enter = self.span.enter();
        if x.rank() != 1 {
            Err(Error::UnsupportedRank {
                op: "time-mix-one",
                rank: x.rank(),
            })?
        }
        self.check_width(x, x_prev)?;
        kernels::check_state(state, self.n_head, self.head_size)?;

        let delta = ops::token_shift(x, x_prev)?;
        let p = self.project(x, &delta, v_first)?;
        let decay = ops::decay(&p.decay_preact)?;
        let (out, state) = kernels::wkv_step(
            state,
            &p.r,
            &decay,
            &p.k,
            &p.v,
            &p.kk.neg()?,
            &(&p.kk * &p.a)?,
            self.n_head,
            self.head_size,
        )?;
        let output = self.readout(&out, &p)?;
        Ok(TimeMixOutput {
            output,
            x_prev: x.clone(),
            state,
            v_first: p.v_first,
        })
    }

    /// Sequence step, `xs` is `(T, C)` and `x_prev` is `(C,)`.
    pub fn forward_seq(
        &self,
        xs: &Tensor,
        x_prev: &Tensor,
        v_first: Option<&Tensor>,
        state: &Tensor,
    ) -> Result<TimeMixOutput> {
        let _enter = self.span.enter();
        let seq_len = match xs.dims() {
            &[0, _] => Err(Error::EmptyInput { op: "time-mix-seq" })?,
            &[t, _] => t,
            _ => Err(Error::UnsupportedRank {
                op: "time-mix-seq",
                rank: xs.rank(),
            })?,
        };
        self.check_width(xs, x_prev)?;

        let delta = ops::token_shift(xs, x_prev)?;
        let p = self.project(xs, &delta, v_first)?;
        let removal = p.kk.neg()?;
        let replacement = (&p.kk * &p.a)?;
        let inputs = Wkv7Inputs {
            receptance: &p.r,
            decay_preact: &p.decay_preact,
            key: &p.k,
            value: &p.v,
            removal: &removal,
            replacement: &replacement,
        };
        let recurrence = &self.kernels.recurrence;
        let (out, state) = recurrence.forward(&inputs, state, self.n_head, self.head_size)?;
        let output = self.readout(&out, &p)?;
        Ok(TimeMixOutput {
            output,
            x_prev: xs.get(seq_len - 1)?,
            state,
            v_first: p.v_first,
        })
    }
}
