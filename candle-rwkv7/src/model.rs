//! RWKV-7 layer stack.
//!
//! Token ids are embedded, normalized, then pushed through every block, each block being a
//! pre-norm [`TimeMix`] followed by a pre-norm [`ChannelMix`] with residual connections. A
//! single token runs the step path, longer inputs run the sequence path. Both paths update
//! the same [`State`].
use crate::channel_mix::ChannelMix;
use crate::config::RuntimeConfig;
use crate::matmul::Weight;
use crate::ops::{self, LAYER_NORM_EPS};
use crate::state::{LayerState, State};
use crate::time_mix::TimeMix;
use crate::weights::{ModelDims, WeightMap};
use crate::{Error, Result};
use candle::{Tensor, D};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Block {
    ln1_weight: Tensor,
    ln1_bias: Tensor,
    ln2_weight: Tensor,
    ln2_bias: Tensor,
    att: TimeMix,
    ffn: ChannelMix,
    span: tracing::Span,
}

impl Block {
    fn new(layer_id: usize, weights: &WeightMap, cfg: &RuntimeConfig) -> Result<Self> {
        let get = |name: &str| weights.get(&format!("blocks.{layer_id}.{name}")).cloned();
        Ok(Self {
            ln1_weight: get("ln1.weight")?,
            ln1_bias: get("ln1.bias")?,
            ln2_weight: get("ln2.weight")?,
            ln2_bias: get("ln2.bias")?,
            att: TimeMix::new(layer_id, weights, cfg)?,
            ffn: ChannelMix::new(layer_id, weights, cfg)?,
            span: tracing::span!(tracing::Level::TRACE, "block", layer_id),
        })
    }

    /// Returns the block output, the layer's next state and `v_first`.
    fn forward_one(
        &self,
        x: &Tensor,
        state: &LayerState,
        v_first: Option<&Tensor>,
    ) -> Result<(Tensor, LayerState, Tensor)> {
        let _enter = self.span.enter();
        let xx = ops::layer_norm(x, &self.ln1_weight, &self.ln1_bias, LAYER_NORM_EPS)?;
        let att = self
            .att
            .forward_one(&xx, &state.att_x_prev, v_first, &state.att_kv)?;
        let x = (x + att.output)?;

        let xx = ops::layer_norm(&x, &self.ln2_weight, &self.ln2_bias, LAYER_NORM_EPS)?;
        let (ffn, ffn_x_prev) = self.ffn.forward_one(&xx, &state.ffn_x_prev)?;
        let next = LayerState {
            att_x_prev: att.x_prev,
            att_kv: att.state,
            ffn_x_prev,
        };
        Ok(((x + ffn)?, next, att.v_first))
    }

    fn forward_seq(
        &self,
        xs: &Tensor,
        state: &LayerState,
        v_first: Option<&Tensor>,
    ) -> Result<(Tensor, LayerState, Tensor)> {
        let _enter = self.span.enter();
        let xx = ops::layer_norm(xs, &self.ln1_weight, &self.ln1_bias, LAYER_NORM_EPS)?;
        let att = self
            .att
            .forward_seq(&xx, &state.att_x_prev, v_first, &state.att_kv)?;
        let xs = (xs + att.output)?;

        let xx = ops::layer_norm(&xs, &self.ln2_weight, &self.ln2_bias, LAYER_NORM_EPS)?;
        let (ffn, ffn_x_prev) = self.ffn.forward_seq(&xx, &state.ffn_x_prev)?;
        let next = LayerState {
            att_x_prev: att.x_prev,
            att_kv: att.state,
            ffn_x_prev,
        };
        Ok(((xs + ffn)?, next, att.v_first))
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    emb: Tensor,
    ln0_weight: Tensor,
    ln0_bias: Tensor,
    blocks: Vec<Block>,
    ln_out_weight: Tensor,
    ln_out_bias: Tensor,
    head: Weight,
    dims: ModelDims,
    cfg: RuntimeConfig,
    span: tracing::Span,
    span_embed: tracing::Span,
}

impl Model {
    pub fn new(weights: &WeightMap, cfg: &RuntimeConfig) -> Result<Self> {
        let dims = *weights.dims();
        let blocks = (0..dims.n_layer)
            .map(|layer_id| Block::new(layer_id, weights, cfg))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            emb: weights.get("emb.weight")?.clone(),
            ln0_weight: weights.get("blocks.0.ln0.weight")?.clone(),
            ln0_bias: weights.get("blocks.0.ln0.bias")?.clone(),
            blocks,
            ln_out_weight: weights.get("ln_out.weight")?.clone(),
            ln_out_bias: weights.get("ln_out.bias")?.clone(),
            head: weights.weight("head.weight")?,
            dims,
            cfg: cfg.clone(),
            span: tracing::span!(tracing::Level::TRACE, "model"),
            span_embed: tracing::span!(tracing::Level::TRACE, "embed"),
        })
    }

    /// Normalizes checkpoint tensors with [`WeightMap::from_checkpoint`] then builds the model.
    pub fn from_checkpoint(tensors: HashMap<String, Tensor>, cfg: &RuntimeConfig) -> Result<Self> {
        let weights = WeightMap::from_checkpoint(tensors, cfg)?;
        Self::new(&weights, cfg)
    }

    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    /// A zero state sized for this model.
    pub fn new_state(&self) -> Result<State> {
        State::new(&self.dims, self.cfg.dtype(), &self.cfg.device)
    }

    /// Embeds `tokens` into a `(T, C)` tensor, before the input layer norm.
    ///
    /// When `external` is given, its rows replace the embeddings at the placeholder token
    /// positions, in order. It may have any rank as long as its last dimension is the
    /// embedding width, and must hold exactly one row per placeholder.
    pub fn embed(&self, tokens: &[u32], external: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span_embed.enter();
        if tokens.is_empty() {
            Err(Error::EmptyInput { op: "embed" })?
        }
        let dev = &self.cfg.device;
        let external = match external {
            None => {
                let ids = Tensor::new(tokens, dev)?;
                return Ok(self.emb.index_select(&ids, 0)?);
            }
            Some(external) => external,
        };

        let c = self.dims.n_embd;
        if external.rank() == 0 || external.dim(D::Minus1)? != c {
            let mut expected = external.dims().to_vec();
            match expected.last_mut() {
                Some(last) => *last = c,
                None => expected.push(c),
            }
            Err(Error::shape_mismatch("embed-external", expected, external.shape().clone()))?
        }
        let external = external.reshape(((), c))?;
        let placeholder = self.cfg.placeholder_token;
        let placeholders = tokens.iter().filter(|&&t| t == placeholder).count();
        let embeddings = external.dim(0)?;
        if placeholders != embeddings {
            Err(Error::PlaceholderCountMismatch {
                placeholders,
                embeddings,
            })?
        }

        // Look up every regular token, then gather from [embeddings; external rows].
        let seq_len = tokens.len();
        let lookup: Vec<u32> = tokens
            .iter()
            .map(|&t| if t == placeholder { 0 } else { t })
            .collect();
        let xs = self.emb.index_select(&Tensor::new(lookup, dev)?, 0)?;
        let external = external.to_device(dev)?.to_dtype(xs.dtype())?;
        let table = Tensor::cat(&[&xs, &external], 0)?;
        let mut next_external = seq_len;
        let mut gather = Vec::with_capacity(seq_len);
        for (i, &t) in tokens.iter().enumerate() {
            if t == placeholder {
                gather.push(next_external as u32);
                next_external += 1;
            } else {
                gather.push(i as u32);
            }
        }
        Ok(table.index_select(&Tensor::new(gather, dev)?, 0)?)
    }

    /// Full forward pass.
    ///
    /// Allocates a zero state when `state` is `None`. A single token returns `(V,)` logits. A
    /// longer sequence returns `(T, V)` logits when `full_output` is set and the last
    /// position's `(V,)` logits otherwise.
    pub fn forward(
        &self,
        tokens: &[u32],
        state: Option<State>,
        full_output: bool,
        external: Option<&Tensor>,
    ) -> Result<(Tensor, State)> {
        let mut state = match state {
            Some(state) => state,
            None => self.new_state()?,
        };
        let xs = self.embed(tokens, external)?;
        let logits = self.forward_embedded(&xs, &mut state, full_output)?;
        Ok((logits, state))
    }

    /// Decodes one token, updating `state` in place.
    pub fn forward_one(&self, token: u32, state: &mut State) -> Result<Tensor> {
        let xs = self.embed(&[token], None)?;
        self.forward_embedded(&xs, state, false)
    }

    /// Prefills a sequence, updating `state` in place.
    pub fn forward_seq(
        &self,
        tokens: &[u32],
        state: &mut State,
        full_output: bool,
    ) -> Result<Tensor> {
        let xs = self.embed(tokens, None)?;
        self.forward_embedded(&xs, state, full_output)
    }

    /// Runs the layer stack. `state` is only written once every layer has succeeded, so a
    /// failed call leaves it untouched.
    fn forward_embedded(
        &self,
        xs: &Tensor,
        state: &mut State,
        full_output: bool,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        if state.num_layers() != self.blocks.len() {
            Err(Error::shape_mismatch("state", self.blocks.len(), state.num_layers()))?
        }
        let seq_len = xs.dim(0)?;
        let xs = ops::layer_norm(xs, &self.ln0_weight, &self.ln0_bias, LAYER_NORM_EPS)?;
        let mut next_layers = Vec::with_capacity(self.blocks.len());
        let mut v_first: Option<Tensor> = None;
        let xs = if seq_len == 1 {
            let mut x = xs.get(0)?;
            for (block, layer) in self.blocks.iter().zip(state.layers()) {
                let (next, layer, vf) = block.forward_one(&x, layer, v_first.as_ref())?;
                x = next;
                next_layers.push(layer);
                v_first = Some(vf);
            }
            x
        } else {
            let mut xs = xs;
            for (block, layer) in self.blocks.iter().zip(state.layers()) {
                let (next, layer, vf) = block.forward_seq(&xs, layer, v_first.as_ref())?;
                xs = next;
                next_layers.push(layer);
                v_first = Some(vf);
            }
            if full_output {
                xs
            } else {
                xs.get(seq_len - 1)?
            }
        };
        let xs = ops::layer_norm(&xs, &self.ln_out_weight, &self.ln_out_bias, LAYER_NORM_EPS)?;
        let logits = self.cfg.kernels.matmul.forward(&xs, &self.head)?;
        state.replace_layers(next_layers);
        Ok(logits)
    }
}
