//! State recurrence kernels and their selection.
//!
//! The recurrence `state <- state * diag(w) + state @ (a ⊗ b) + v ⊗ k` carries a dependency
//! from one timestep to the next, so a sequence is processed step by step. Two
//! implementations satisfy the same contract: a portable loop over candle tensor ops and a
//! fused cpu op parallelized across heads. A [`KernelSet`] is chosen once when the runtime
//! configuration is built.
mod fused;
mod reference;

pub use fused::FusedCpuKernel;
pub use reference::ReferenceKernel;

use crate::matmul::MatMulDispatch;
use crate::{Error, Result};
use candle::{DType, Device, Tensor};
use std::sync::Arc;

/// Per-timestep inputs of the recurrence for a `(T, C)` sequence, all in the working dtype.
#[derive(Debug, Clone, Copy)]
pub struct Wkv7Inputs<'a> {
    pub receptance: &'a Tensor,
    /// Decay pre-activation `w0 + tanh(x_w W1) W2`, before the decay gate is applied.
    pub decay_preact: &'a Tensor,
    pub key: &'a Tensor,
    pub value: &'a Tensor,
    /// `-kk`, the direction removed from the state.
    pub removal: &'a Tensor,
    /// `kk * a`, the in-context learning rate applied to the removed direction.
    pub replacement: &'a Tensor,
}

impl Wkv7Inputs<'_> {
    /// Checks every operand and the state, returning the sequence length.
    pub fn validate(&self, state: &Tensor, num_heads: usize, head_size: usize) -> Result<usize> {
        let seq_len = match self.receptance.dims() {
            &[t, _] => t,
            _ => Err(Error::UnsupportedRank {
                op: "wkv7",
                rank: self.receptance.rank(),
            })?,
        };
        let expected = (seq_len, num_heads * head_size);
        for xs in [
            self.receptance,
            self.decay_preact,
            self.key,
            self.value,
            self.removal,
            self.replacement,
        ] {
            if xs.dims() != [expected.0, expected.1] {
                Err(Error::shape_mismatch("wkv7", expected, xs.shape().clone()))?
            }
        }
        check_state(state, num_heads, head_size)?;
        Ok(seq_len)
    }
}

pub(crate) fn check_state(state: &Tensor, num_heads: usize, head_size: usize) -> Result<()> {
    let expected = (num_heads, head_size, head_size);
    if state.dims() != [expected.0, expected.1, expected.2] {
        Err(Error::shape_mismatch("wkv7-state", expected, state.shape().clone()))?
    }
    if state.dtype() != DType::F32 {
        Err(Error::UnsupportedDType {
            dtype: state.dtype(),
            op: "wkv7-state",
        })?
    }
    Ok(())
}

/// Sequence-mode recurrence.
///
/// Given a `(H, N, N)` f32 state and `(T, C)` inputs, returns the `(T, C)` readout in the dtype
/// of the receptance along with the f32 state after the last timestep. Implementations must
/// agree with [`wkv_step`] applied once per timestep.
pub trait StateRecurrenceKernel: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn forward(
        &self,
        inputs: &Wkv7Inputs<'_>,
        state: &Tensor,
        num_heads: usize,
        head_size: usize,
    ) -> Result<(Tensor, Tensor)>;
}

/// One recurrence step for a single token, every vector being `(C,)`.
///
/// `decay` holds the gated decay in `(0, 1]`. All operands are upcast to f32 before the outer
/// products, so the state update and the readout run in f32 whatever the working dtype. The
/// readout is cast back to the dtype of `r`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn wkv_step(
    state: &Tensor,
    r: &Tensor,
    decay: &Tensor,
    k: &Tensor,
    v: &Tensor,
    removal: &Tensor,
    replacement: &Tensor,
    num_heads: usize,
    head_size: usize,
) -> Result<(Tensor, Tensor)> {
    let (h, n) = (num_heads, head_size);
    let column = |xs: &Tensor| xs.to_dtype(DType::F32)?.reshape((h, n, 1));
    let row = |xs: &Tensor| xs.to_dtype(DType::F32)?.reshape((h, 1, n));
    let vk = column(v)?.matmul(&row(k)?)?;
    let ab = column(removal)?.matmul(&row(replacement)?)?;
    let state = ((state.broadcast_mul(&row(decay)?)? + state.matmul(&ab)?)? + vk)?;
    let out = state
        .matmul(&column(r)?)?
        .reshape(h * n)?
        .to_dtype(r.dtype())?;
    Ok((out, state))
}

/// Kernels resolved for a given device and working dtype.
#[derive(Debug, Clone)]
pub struct KernelSet {
    pub matmul: MatMulDispatch,
    pub recurrence: Arc<dyn StateRecurrenceKernel>,
}

impl KernelSet {
    /// Portable kernels, available everywhere.
    pub fn reference() -> Self {
        Self {
            matmul: MatMulDispatch::GENERIC,
            recurrence: Arc::new(ReferenceKernel),
        }
    }

    /// Picks the fused kernels when requested and available for `device`, falling back to the
    /// reference implementations otherwise.
    pub fn select(device: &Device, dtype: DType, fused: bool) -> Self {
        let matmul = MatMulDispatch::select(device, dtype, fused);
        let recurrence: Arc<dyn StateRecurrenceKernel> = if fused && device.is_cpu() {
            Arc::new(FusedCpuKernel)
        } else {
            if fused {
                tracing::warn!(
                    ?device,
                    "no fused recurrence kernel for this device, using the reference loop"
                );
            }
            Arc::new(ReferenceKernel)
        };
        tracing::debug!(
            ?dtype,
            float = ?matmul.float,
            quant = ?matmul.quant,
            recurrence = recurrence.name(),
            "selected kernels"
        );
        Self { matmul, recurrence }
    }
}
