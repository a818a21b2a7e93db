//! Precision-aware matrix multiplication.
//!
//! [`MatMulDispatch`] is resolved once from the target device, working dtype and the fused
//! kernel flag. It multiplies activations by either float or 8-bit quantized weights, so the
//! operators never need to know how a given projection matrix is stored.
use crate::quantized::{self, QuantParams, QuantizedWeight};
use crate::{Error, Result};
use candle::{DType, Device, Tensor};

/// A projection matrix of shape `(in, out)`, stored either as floats or quantized.
#[derive(Debug, Clone)]
pub enum Weight {
    Float(Tensor),
    Quantized(QuantizedWeight),
}

impl Weight {
    pub fn dims(&self) -> (usize, usize) {
        match self {
            Self::Float(w) => {
                let dims = w.dims();
                (dims[0], dims.get(1).copied().unwrap_or(1))
            }
            Self::Quantized(q) => q.dims(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Float(w) => w.dtype(),
            Self::Quantized(q) => q.weight().dtype(),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }
}

/// Float multiply strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatMatMul {
    /// `a @ b` in the operand dtype.
    Generic,
    /// Half precision operands multiplied in f32 then cast back, restricted to rank 2 and 3
    /// once 1-d inputs are lifted to a row.
    F32Accumulate,
}

/// Quantized multiply strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantMatMul {
    /// Dequantize the full matrix then multiply.
    Reference,
    /// Dequantize on the fly inside a single pass over the u8 matrix.
    Fused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMulDispatch {
    pub float: FloatMatMul,
    pub quant: QuantMatMul,
}

impl MatMulDispatch {
    pub const GENERIC: Self = Self {
        float: FloatMatMul::Generic,
        quant: QuantMatMul::Reference,
    };

    /// Deterministic, side effect free selection.
    ///
    /// The cpu gemm has no bf16 kernel, so bf16 on cpu always multiplies in f32. Otherwise the
    /// fused variants are only picked on cpu when `fused` is set.
    pub fn select(device: &Device, dtype: DType, fused: bool) -> Self {
        let fused = fused && device.is_cpu();
        let float = match dtype {
            DType::BF16 if device.is_cpu() => FloatMatMul::F32Accumulate,
            DType::F16 | DType::BF16 if fused => FloatMatMul::F32Accumulate,
            _ => FloatMatMul::Generic,
        };
        let quant = if fused {
            QuantMatMul::Fused
        } else {
            QuantMatMul::Reference
        };
        Self { float, quant }
    }

    /// Multiplies `a` by `b`. Float `b` must share the dtype of `a`, u8 `b` requires the
    /// quantization side tensors. Any other dtype for `b` is rejected.
    pub fn matmul(&self, a: &Tensor, b: &Tensor, quant: Option<QuantParams<'_>>) -> Result<Tensor> {
        match b.dtype() {
            DType::F16 | DType::BF16 | DType::F32 => {
                if a.dtype() != b.dtype() {
                    Err(Error::DTypeMismatch {
                        lhs: a.dtype(),
                        rhs: b.dtype(),
                        op: "matmul",
                    })?
                }
                match self.float {
                    FloatMatMul::F32Accumulate => matmul_f32_acc(a, b),
                    FloatMatMul::Generic if needs_f32(b) => matmul_f32_acc(a, b),
                    FloatMatMul::Generic => matmul_generic(a, b),
                }
            }
            DType::U8 => {
                let quant = match quant {
                    Some(quant) => quant,
                    None => Err(Error::MissingQuantParams { op: "matmul" })?,
                };
                self.matmul_u8(a, b, &quant)
            }
            dtype => Err(Error::UnsupportedDType { dtype, op: "matmul" }),
        }
    }

    /// Multiplies activations of rank 1, 2 or 3 by a projection matrix.
    pub fn forward(&self, xs: &Tensor, w: &Weight) -> Result<Tensor> {
        match w {
            Weight::Float(w) => self.matmul(xs, w, None),
            Weight::Quantized(q) => self.matmul(xs, q.weight(), Some(q.params())),
        }
    }

    fn matmul_u8(&self, a: &Tensor, w: &Tensor, quant: &QuantParams<'_>) -> Result<Tensor> {
        let fused = self.quant == QuantMatMul::Fused;
        match a.rank() {
            1 => quantized::mm8_one(a, w, quant, fused),
            2 => quantized::mm8_seq(a, w, quant, fused),
            3 => {
                let (b, t, n) = a.dims3()?;
                let ys = quantized::mm8_seq(&a.reshape((b * t, n))?, w, quant, fused)?;
                let m = ys.dim(1)?;
                Ok(ys.reshape((b, t, m))?)
            }
            rank => Err(Error::UnsupportedRank { op: "mm8", rank }),
        }
    }
}

/// Operands the device gemm cannot multiply directly.
fn needs_f32(b: &Tensor) -> bool {
    b.dtype() == DType::BF16 && b.device().is_cpu()
}

fn check_inner(a: &Tensor, b: &Tensor, op: &'static str) -> Result<()> {
    let k = a.dims().last().copied().unwrap_or(0);
    let n = b.dim(0)?;
    if k != n {
        let mut expected = a.dims().to_vec();
        if let Some(last) = expected.last_mut() {
            *last = n
        }
        Err(Error::shape_mismatch(op, expected, a.shape().clone()))?
    }
    Ok(())
}

fn matmul_generic(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if b.rank() != 2 {
        Err(Error::UnsupportedRank {
            op: "matmul",
            rank: b.rank(),
        })?
    }
    check_inner(a, b, "matmul")?;
    let ys = match a.rank() {
        1 => a.unsqueeze(0)?.matmul(b)?.squeeze(0)?,
        2 => a.matmul(b)?,
        3 => a.broadcast_matmul(b)?,
        rank => Err(Error::UnsupportedRank { op: "matmul", rank })?,
    };
    Ok(ys)
}

/// Half precision path: 1-d inputs become a batch of one row, ranks must then match and lie
/// in `{2, 3}`.
fn matmul_f32_acc(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let squeeze = a.rank() == 1;
    let a = if squeeze { a.unsqueeze(0)? } else { a.clone() };
    let b = match (a.rank(), b.rank()) {
        (3, 2) => b.unsqueeze(0)?,
        _ => b.clone(),
    };
    if a.rank() != b.rank() || !(2..=3).contains(&a.rank()) {
        Err(Error::UnsupportedRank {
            op: "matmul-f32-acc",
            rank: a.rank(),
        })?
    }
    let k = a.dims().last().copied().unwrap_or(0);
    let n = b.dim(b.rank() - 2)?;
    if k != n {
        let mut expected = a.dims().to_vec();
        if let Some(last) = expected.last_mut() {
            *last = n
        }
        Err(Error::shape_mismatch("matmul-f32-acc", expected, a.shape().clone()))?
    }
    let dtype = a.dtype();
    let ys = a
        .to_dtype(DType::F32)?
        .broadcast_matmul(&b.to_dtype(DType::F32)?)?
        .to_dtype(dtype)?;
    let ys = if squeeze { ys.squeeze(0)? } else { ys };
    Ok(ys)
}
