//! Checkpoint tensors normalized for inference.
//!
//! Checkpoints store projection matrices as `(out, in)` and the per-channel coefficients as
//! `(1, 1, C)`. At load time the projections are transposed to `(in, out)`, unit dimensions are
//! squeezed away, `att.r_k` is flattened to `(C,)` and everything is cast to the working dtype.
//! With quantization enabled the projections are stored as [`QuantizedWeight`]s instead.
use crate::config::RuntimeConfig;
use crate::matmul::Weight;
use crate::quantized::QuantizedWeight;
use crate::{Error, Result};
use candle::{DType, Tensor};
use std::collections::HashMap;

const PROJECTIONS: [&str; 5] = [
    "receptance.weight",
    "key.weight",
    "value.weight",
    "output.weight",
    "head.weight",
];

fn is_projection(name: &str) -> bool {
    PROJECTIONS.iter().any(|p| name.ends_with(p))
}

/// Model geometry, inferred from the checkpoint tensor shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDims {
    pub n_layer: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub head_size: usize,
    pub vocab_size: usize,
    pub dim_ffn: usize,
}

impl ModelDims {
    /// Reads the geometry from tensors in checkpoint layout: `blocks.0.att.r_k` is
    /// `(heads, head_size)`, `emb.weight` is `(vocab, width)`, `blocks.0.ffn.key.weight` is
    /// `(ffn width, width)` and the layer count is one past the highest `blocks.<i>` index.
    pub fn infer(tensors: &HashMap<String, Tensor>) -> Result<Self> {
        let get = |name: &str| {
            tensors.get(name).ok_or_else(|| Error::MissingWeight {
                name: name.to_string(),
            })
        };
        let (n_head, head_size) = get("blocks.0.att.r_k")?.dims2()?;
        let (vocab_size, n_embd) = get("emb.weight")?.dims2()?;
        let dim_ffn = get("blocks.0.ffn.key.weight")?.dim(0)?;
        if n_head * head_size != n_embd {
            Err(Error::HeadSizeMismatch {
                num_heads: n_head,
                head_size,
                n_embd,
            })?
        }
        let n_layer = tensors
            .keys()
            .filter_map(|k| k.strip_prefix("blocks.")?.split('.').next()?.parse::<usize>().ok())
            .max()
            .map_or(0, |i| i + 1);
        Ok(Self {
            n_layer,
            n_embd,
            n_head,
            head_size,
            vocab_size,
            dim_ffn,
        })
    }
}

/// Immutable name to weight mapping, shared read-only by every forward call.
#[derive(Debug, Clone)]
pub struct WeightMap {
    dims: ModelDims,
    weights: HashMap<String, Weight>,
}

impl WeightMap {
    pub fn from_checkpoint(tensors: HashMap<String, Tensor>, cfg: &RuntimeConfig) -> Result<Self> {
        let dims = ModelDims::infer(&tensors)?;
        tracing::info!(
            n_layer = dims.n_layer,
            n_embd = dims.n_embd,
            n_head = dims.n_head,
            head_size = dims.head_size,
            vocab_size = dims.vocab_size,
            dtype = ?cfg.dtype(),
            quantize = cfg.quantize,
            "loading weights"
        );
        let mut weights = HashMap::with_capacity(tensors.len());
        for (name, tensor) in tensors {
            let projection = is_projection(&name);
            let tensor = if projection { tensor.t()? } else { tensor };
            let tensor = squeeze_all(&tensor)?;
            let tensor = if name.ends_with("att.r_k") {
                tensor.flatten_all()?
            } else {
                tensor
            };
            let tensor = tensor.to_device(&cfg.device)?;
            let weight = if projection && cfg.quantize {
                Weight::Quantized(QuantizedWeight::quantize(&tensor, cfg.dtype())?)
            } else {
                Weight::Float(tensor.to_dtype(cfg.dtype())?.contiguous()?)
            };
            weights.insert(name, weight);
        }
        Ok(Self { dims, weights })
    }

    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    pub fn contains(&self, name: &str) -> bool {
        self.weights.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// A float tensor, quantized entries are rejected.
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        match self.weights.get(name) {
            Some(Weight::Float(t)) => Ok(t),
            Some(Weight::Quantized(_)) => Err(Error::UnsupportedDType {
                dtype: DType::U8,
                op: "weight-map-get",
            }),
            None => Err(Error::MissingWeight {
                name: name.to_string(),
            }),
        }
    }

    /// A projection matrix, float or quantized.
    pub fn weight(&self, name: &str) -> Result<Weight> {
        match self.weights.get(name) {
            Some(w) => Ok(w.clone()),
            None => Err(Error::MissingWeight {
                name: name.to_string(),
            }),
        }
    }
}

fn squeeze_all(xs: &Tensor) -> Result<Tensor> {
    let dims: Vec<usize> = xs.dims().iter().copied().filter(|&d| d != 1).collect();
    if dims.len() == xs.rank() {
        Ok(xs.clone())
    } else {
        Ok(xs.reshape(dims)?)
    }
}
