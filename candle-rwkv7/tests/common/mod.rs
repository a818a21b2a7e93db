#![allow(dead_code)]
use candle::{Device, Result, Shape, Tensor};
use std::collections::HashMap;

/// Geometry of a small checkpoint built in memory.
#[derive(Debug, Clone, Copy)]
pub struct Tiny {
    pub n_layer: usize,
    pub n_head: usize,
    pub head_size: usize,
    pub vocab_size: usize,
    pub dim_ffn: usize,
    pub lora: usize,
}

impl Tiny {
    /// One layer, one head of size 4.
    pub const SCENARIO: Self = Self {
        n_layer: 1,
        n_head: 1,
        head_size: 4,
        vocab_size: 5,
        dim_ffn: 8,
        lora: 2,
    };

    pub const TWO_LAYERS: Self = Self {
        n_layer: 2,
        n_head: 2,
        head_size: 4,
        vocab_size: 11,
        dim_ffn: 16,
        lora: 3,
    };

    pub fn n_embd(&self) -> usize {
        self.n_head * self.head_size
    }

    /// Names and shapes in checkpoint layout, in a fixed order.
    pub fn tensor_specs(&self) -> Vec<(String, Vec<usize>)> {
        let c = self.n_embd();
        let (d, f) = (self.lora, self.dim_ffn);
        let mut specs = vec![
            ("emb.weight".to_string(), vec![self.vocab_size, c]),
            ("blocks.0.ln0.weight".to_string(), vec![c]),
            ("blocks.0.ln0.bias".to_string(), vec![c]),
        ];
        for layer_id in 0..self.n_layer {
            let b = format!("blocks.{layer_id}.");
            for name in ["ln1.weight", "ln1.bias", "ln2.weight", "ln2.bias"] {
                specs.push((format!("{b}{name}"), vec![c]));
            }
            let a = format!("{b}att.");
            for name in ["x_r", "x_w", "x_k", "x_v", "x_a", "x_g"] {
                specs.push((format!("{a}{name}"), vec![1, 1, c]));
            }
            for p in ["w", "a", "v"] {
                specs.push((format!("{a}{p}0"), vec![1, 1, c]));
                specs.push((format!("{a}{p}1"), vec![c, d]));
                specs.push((format!("{a}{p}2"), vec![d, c]));
            }
            specs.push((format!("{a}g1"), vec![c, d]));
            specs.push((format!("{a}g2"), vec![d, c]));
            specs.push((format!("{a}k_k"), vec![1, 1, c]));
            specs.push((format!("{a}k_a"), vec![1, 1, c]));
            specs.push((format!("{a}r_k"), vec![self.n_head, self.head_size]));
            for p in ["receptance", "key", "value", "output"] {
                specs.push((format!("{a}{p}.weight"), vec![c, c]));
            }
            specs.push((format!("{a}ln_x.weight"), vec![c]));
            specs.push((format!("{a}ln_x.bias"), vec![c]));
            let ffn = format!("{b}ffn.");
            specs.push((format!("{ffn}x_k"), vec![1, 1, c]));
            specs.push((format!("{ffn}key.weight"), vec![f, c]));
            specs.push((format!("{ffn}value.weight"), vec![c, f]));
        }
        specs.push(("ln_out.weight".to_string(), vec![c]));
        specs.push(("ln_out.bias".to_string(), vec![c]));
        specs.push(("head.weight".to_string(), vec![self.vocab_size, c]));
        specs
    }

    /// Deterministic weights: element `i` of the `seed`-th tensor is
    /// `((7 i + 3 seed) mod 11) / 10 - 0.5`, norm scales are shifted by one.
    pub fn checkpoint(&self, dev: &Device) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        for (seed, (name, shape)) in self.tensor_specs().into_iter().enumerate() {
            let len = shape.iter().product::<usize>();
            let offset = if shape.len() == 1 && name.ends_with(".weight") {
                1.0
            } else {
                0.0
            };
            let data: Vec<f32> = (0..len)
                .map(|i| ((i * 7 + seed * 3) % 11) as f32 / 10.0 - 0.5 + offset)
                .collect();
            tensors.insert(name, Tensor::from_vec(data, shape, dev)?);
        }
        Ok(tensors)
    }
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let a = a.to_dtype(candle::DType::F32)?;
    let b = b.to_dtype(candle::DType::F32)?;
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

/// `max |a - b| / max |b|`, both compared in f32.
pub fn max_rel_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let scale = b
        .to_dtype(candle::DType::F32)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    Ok(max_abs_diff(a, b)? / scale.max(f32::MIN_POSITIVE))
}

/// Deterministic values in `[-scale, scale]`, a different sequence for each `seed`.
pub fn pattern<S: Into<Shape>>(shape: S, seed: usize, scale: f32, dev: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|i| scale * ((i * 13 + seed * 29 + 1) as f32 * 0.618_034).sin())
        .collect();
    Tensor::from_vec(data, shape, dev)
}
