use crate::config::RuntimeConfig;
use crate::matmul::{MatMulDispatch, Weight};
use crate::ops;
use crate::weights::WeightMap;
use crate::{Error, Result};
use candle::Tensor;

/// Channel-mix sublayer: a squared-relu feed-forward over the token-shifted input.
#[derive(Debug, Clone)]
pub struct ChannelMix {
    x_k: Tensor,
    key: Weight,
    value: Weight,
    matmul: MatMulDispatch,
    span: tracing::Span,
}

impl ChannelMix {
    pub fn new(layer_id: usize, weights: &WeightMap, cfg: &RuntimeConfig) -> Result<Self> {
        let p = format!("blocks.{layer_id}.ffn.");
        Ok(Self {
            x_k: weights.get(&format!("{p}x_k"))?.clone(),
            key: weights.weight(&format!("{p}key.weight"))?,
            value: weights.weight(&format!("{p}value.weight"))?,
            matmul: cfg.kernels.matmul,
            span: tracing::span!(tracing::Level::TRACE, "channel-mix", layer_id),
        })
    }

    fn mix(&self, xs: &Tensor, delta: &Tensor) -> Result<Tensor> {
        let k = ops::lerp(xs, delta, &self.x_k)?;
        let k = self.matmul.forward(&k, &self.key)?.relu()?.sqr()?;
        self.matmul.forward(&k, &self.value)
    }

    /// Single token, returns the output and the next `x_prev`.
    pub fn forward_one(&self, x: &Tensor, x_prev: &Tensor) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let delta = ops::token_shift(x, x_prev)?;
        Ok((self.mix(x, &delta)?, x.clone()))
    }

    /// `(T, C)` sequence, the next `x_prev` is the last row of `xs`.
    pub fn forward_seq(&self, xs: &Tensor, x_prev: &Tensor) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let seq_len = xs.dim(0)?;
        if seq_len == 0 {
            Err(Error::EmptyInput {
                op: "channel-mix-seq",
            })?
        }
        let delta = ops::token_shift(xs, x_prev)?;
        Ok((self.mix(xs, &delta)?, xs.get(seq_len - 1)?))
    }
}
