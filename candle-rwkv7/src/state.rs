//! Recurrent state carried between forward calls.
use crate::weights::ModelDims;
use crate::Result;
use candle::{DType, Device, Tensor};

/// Per-layer recurrent state.
#[derive(Debug, Clone)]
pub struct LayerState {
    /// Last pre-mix activation seen by the time-mix sublayer. Shape: `(n_embd,)`.
    pub att_x_prev: Tensor,
    /// Outer-product memory. Shape: `(n_head, head_size, head_size)`, always f32.
    pub att_kv: Tensor,
    /// Last pre-mix activation seen by the channel-mix sublayer. Shape: `(n_embd,)`.
    pub ffn_x_prev: Tensor,
}

impl LayerState {
    pub fn zeros(dims: &ModelDims, dtype: DType, dev: &Device) -> Result<Self> {
        Ok(Self {
            att_x_prev: Tensor::zeros(dims.n_embd, dtype, dev)?,
            att_kv: Tensor::zeros((dims.n_head, dims.head_size, dims.head_size), DType::F32, dev)?,
            ffn_x_prev: Tensor::zeros(dims.n_embd, dtype, dev)?,
        })
    }
}

/// Full inference state, one [`LayerState`] per layer.
///
/// A state is owned by a single generation session. Forward calls update it in place, so two
/// concurrent calls must never share one.
#[derive(Debug, Clone)]
pub struct State {
    layers: Vec<LayerState>,
}

impl State {
    /// Zero-initialized state, with the token-shift vectors in `dtype`.
    pub fn new(dims: &ModelDims, dtype: DType, dev: &Device) -> Result<Self> {
        let layers = (0..dims.n_layer)
            .map(|_| LayerState::zeros(dims, dtype, dev))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of state tensors, three per layer.
    pub fn num_slots(&self) -> usize {
        3 * self.layers.len()
    }

    pub fn layer(&self, layer_id: usize) -> Option<&LayerState> {
        self.layers.get(layer_id)
    }

    pub fn layer_mut(&mut self, layer_id: usize) -> Option<&mut LayerState> {
        self.layers.get_mut(layer_id)
    }

    pub fn layers(&self) -> &[LayerState] {
        &self.layers
    }

    /// Commits the per-layer states produced by a successful forward call.
    pub(crate) fn replace_layers(&mut self, layers: Vec<LayerState>) {
        self.layers = layers;
    }
}
