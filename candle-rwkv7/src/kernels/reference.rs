use super::{wkv_step, StateRecurrenceKernel, Wkv7Inputs};
use crate::ops;
use crate::Result;
use candle::Tensor;

/// Applies [`wkv_step`] once per timestep. Works on every device and dtype.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceKernel;

impl StateRecurrenceKernel for ReferenceKernel {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn forward(
        &self,
        inputs: &Wkv7Inputs<'_>,
        state: &Tensor,
        num_heads: usize,
        head_size: usize,
    ) -> Result<(Tensor, Tensor)> {
        let seq_len = inputs.validate(state, num_heads, head_size)?;
        let decay = ops::decay(inputs.decay_preact)?;
        let mut state = state.clone();
        let mut outs = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let (out, next) = wkv_step(
                &state,
                &inputs.receptance.get(t)?,
                &decay.get(t)?,
                &inputs.key.get(t)?,
                &inputs.value.get(t)?,
                &inputs.removal.get(t)?,
                &inputs.replacement.get(t)?,
                num_heads,
                head_size,
            )?;
            outs.push(out);
            state = next;
        }
        Ok((Tensor::stack(&outs, 0)?, state))
    }
}
