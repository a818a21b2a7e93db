//! RWKV-7 recurrent inference on top of candle.
//!
//! RWKV-7 replaces attention with a per-head `N x N` memory updated once per token, so the
//! cost of each decoding step does not depend on the length of the history. This crate
//! provides:
//!
//! - [`model::Model`], the layer stack, with a single token path for decoding and a sequence
//!   path for prompt prefill.
//! - [`state::State`], the recurrent state threaded through forward calls.
//! - [`matmul::MatMulDispatch`], multiplying activations by float or 8-bit quantized weights.
//! - [`kernels::StateRecurrenceKernel`], with a portable reference loop and a fused cpu
//!   kernel.
//!
//! ```no_run
//! use candle_rwkv7::{config::Config, model::Model};
//! # fn main() -> anyhow::Result<()> {
//! let cfg = Config::new("cpu fp32".parse()?).with_fused_kernels(true).build()?;
//! let tensors = candle::safetensors::load("rwkv7.safetensors", &cfg.device)?;
//! let model = Model::from_checkpoint(tensors, &cfg)?;
//!
//! let (logits, mut state) = model.forward(&[510, 3158, 4706], None, false, None)?;
//! let next = logits.argmax(0)?.to_scalar::<u32>()?;
//! let _logits = model.forward_one(next, &mut state)?;
//! # Ok(()) }
//! ```
pub mod channel_mix;
pub mod config;
mod error;
pub mod kernels;
pub mod matmul;
pub mod model;
pub mod ops;
pub mod quantized;
pub mod state;
pub mod time_mix;
pub mod weights;

pub use error::{Error, Result};
