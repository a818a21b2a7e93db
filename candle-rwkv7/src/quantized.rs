//! 8-bit affine quantized weights.
//!
//! A `(N, M)` float matrix is stored as `u8` values together with four side tensors:
//! per-column offset/scale `mx, rx: (M,)` and per-row offset/scale `my, ry: (N, 1)`. The
//! approximate float matrix is recovered as `(w + 0.5) * ry * rx + my + mx`.
use crate::{Error, Result};
use candle::{CpuStorage, DType, Layout, Shape, Tensor, D};
use rayon::prelude::*;

const MIN_RANGE: f64 = 1e-30;

/// Borrowed quantization side tensors.
#[derive(Debug, Clone, Copy)]
pub struct QuantParams<'a> {
    pub mx: &'a Tensor,
    pub rx: &'a Tensor,
    pub my: &'a Tensor,
    pub ry: &'a Tensor,
}

#[derive(Debug, Clone)]
pub struct QuantizedWeight {
    w: Tensor,
    mx: Tensor,
    rx: Tensor,
    my: Tensor,
    ry: Tensor,
}

impl QuantizedWeight {
    /// Wraps an already quantized matrix, checking the side tensor shapes.
    pub fn new(w: Tensor, mx: Tensor, rx: Tensor, my: Tensor, ry: Tensor) -> Result<Self> {
        if w.dtype() != DType::U8 {
            Err(Error::UnsupportedDType {
                dtype: w.dtype(),
                op: "quantized-weight",
            })?
        }
        let (n, m) = w.dims2()?;
        let params = QuantParams {
            mx: &mx,
            rx: &rx,
            my: &my,
            ry: &ry,
        };
        check_params("quantized-weight", n, m, &params)?;
        Ok(Self { w, mx, rx, my, ry })
    }

    /// Quantizes a float `(N, M)` matrix. The side tensors use `dtype`, which should be the
    /// working precision of the activations multiplied against this weight.
    pub fn quantize(w: &Tensor, dtype: DType) -> Result<Self> {
        let w = w.to_dtype(DType::F32)?;
        let (n, m) = w.dims2()?;
        // Remove the offsets along the longer side first.
        let (w, my, mx) = if n > m {
            let my = w.min_keepdim(1)?;
            let w = w.broadcast_sub(&my)?;
            let mx = w.min(0)?;
            let w = w.broadcast_sub(&mx)?;
            (w, my, mx)
        } else {
            let mx = w.min(0)?;
            let w = w.broadcast_sub(&mx)?;
            let my = w.min_keepdim(1)?;
            let w = w.broadcast_sub(&my)?;
            (w, my, mx)
        };
        // Constant rows or columns leave a zero range, clamp it so that w stays finite.
        let rx = w.max(0)?.maximum(MIN_RANGE)?;
        let w = w.broadcast_div(&rx)?;
        let ry = w.max_keepdim(1)?.maximum(MIN_RANGE)?;
        let w = w.broadcast_div(&ry)?;
        let w = (w * 256.)?.floor()?.clamp(0f32, 255f32)?.to_dtype(DType::U8)?;
        let mx = mx.to_dtype(dtype)?;
        let rx = (rx / 16.)?.to_dtype(dtype)?;
        let my = my.to_dtype(dtype)?;
        let ry = (ry / 16.)?.to_dtype(dtype)?;
        Self::new(w, mx, rx, my, ry)
    }

    pub fn dims(&self) -> (usize, usize) {
        let dims = self.w.dims();
        (dims[0], dims[1])
    }

    pub fn weight(&self) -> &Tensor {
        &self.w
    }

    pub fn params(&self) -> QuantParams<'_> {
        QuantParams {
            mx: &self.mx,
            rx: &self.rx,
            my: &self.my,
            ry: &self.ry,
        }
    }

    /// The reconstructed float matrix, in the dtype of the side tensors.
    pub fn dequantize(&self) -> Result<Tensor> {
        dequantize(&self.w, &self.params(), self.rx.dtype())
    }
}

fn check_params(op: &'static str, n: usize, m: usize, p: &QuantParams<'_>) -> Result<()> {
    for (t, expected) in [
        (p.mx, Shape::from(m)),
        (p.rx, Shape::from(m)),
        (p.my, Shape::from((n, 1))),
        (p.ry, Shape::from((n, 1))),
    ] {
        if t.shape() != &expected {
            Err(Error::shape_mismatch(op, expected, t.shape().clone()))?
        }
    }
    Ok(())
}

fn check_operands(op: &'static str, xs: &Tensor, w: &Tensor, p: &QuantParams<'_>) -> Result<()> {
    if w.dtype() != DType::U8 {
        Err(Error::UnsupportedDType {
            dtype: w.dtype(),
            op,
        })?
    }
    for side in [p.mx, p.rx, p.my, p.ry] {
        if side.dtype() != xs.dtype() {
            Err(Error::DTypeMismatch {
                lhs: xs.dtype(),
                rhs: side.dtype(),
                op,
            })?
        }
    }
    match xs.dtype() {
        DType::F16 | DType::BF16 | DType::F32 => {}
        dtype => Err(Error::UnsupportedDType { dtype, op })?,
    }
    let (n, m) = w.dims2()?;
    check_params(op, n, m, p)
}

fn dequantize(w: &Tensor, p: &QuantParams<'_>, dtype: DType) -> Result<Tensor> {
    let w = (w.to_dtype(dtype)? + 0.5)?;
    let w = w
        .broadcast_mul(&p.ry.to_dtype(dtype)?)?
        .broadcast_mul(&p.rx.to_dtype(dtype)?)?
        .broadcast_add(&p.my.to_dtype(dtype)?)?
        .broadcast_add(&p.mx.to_dtype(dtype)?)?;
    Ok(w)
}

/// Single vector product, `x: (N,)` and `w: (N, M)` give `(M,)`.
pub fn mm8_one(xs: &Tensor, w: &Tensor, p: &QuantParams<'_>, fused: bool) -> Result<Tensor> {
    check_operands("mm8-one", xs, w, p)?;
    let n = w.dim(0)?;
    if xs.dims() != [n] {
        Err(Error::shape_mismatch("mm8-one", n, xs.shape().clone()))?
    }
    let ys = mm8(&xs.unsqueeze(0)?, w, p, fused)?;
    Ok(ys.squeeze(0)?)
}

/// Batched product, `x: (B, N)` and `w: (N, M)` give `(B, M)`.
pub fn mm8_seq(xs: &Tensor, w: &Tensor, p: &QuantParams<'_>, fused: bool) -> Result<Tensor> {
    check_operands("mm8-seq", xs, w, p)?;
    let n = w.dim(0)?;
    match xs.dims() {
        &[_, xn] if xn == n => mm8(xs, w, p, fused),
        &[b, _] => Err(Error::shape_mismatch("mm8-seq", (b, n), xs.shape().clone())),
        _ => Err(Error::UnsupportedRank {
            op: "mm8-seq",
            rank: xs.rank(),
        }),
    }
}

fn mm8(xs: &Tensor, w: &Tensor, p: &QuantParams<'_>, fused: bool) -> Result<Tensor> {
    if fused && xs.device().is_cpu() {
        let op = Mm8::new(p)?;
        Ok(xs.contiguous()?.apply_op2_no_bwd(&w.contiguous()?, &op)?)
    } else if xs.dtype() == DType::BF16 && xs.device().is_cpu() {
        // No bf16 gemm on cpu.
        let w = dequantize(w, p, DType::F32)?;
        Ok(xs.to_dtype(DType::F32)?.matmul(&w)?.to_dtype(DType::BF16)?)
    } else {
        let w = dequantize(w, p, xs.dtype())?;
        Ok(xs.matmul(&w)?)
    }
}

/// Fused dequantize-and-multiply, never materializing the float matrix.
///
/// With `xr = x * ry`, each output is
/// `rx[m] * sum_n xr[n] (w[n, m] + 0.5) + sum_n x[n] my[n] + mx[m] sum_n x[n]`,
/// accumulated in f32.
struct Mm8 {
    mx: Vec<f32>,
    rx: Vec<f32>,
    my: Vec<f32>,
    ry: Vec<f32>,
}

impl Mm8 {
    fn new(p: &QuantParams<'_>) -> Result<Self> {
        let v = |t: &Tensor| t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>();
        Ok(Self {
            mx: v(p.mx)?,
            rx: v(p.rx)?,
            my: v(p.my)?,
            ry: v(p.ry)?,
        })
    }
}

impl candle::CustomOp2 for Mm8 {
    fn name(&self) -> &'static str {
        "mm8"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> candle::Result<(CpuStorage, Shape)> {
        use candle::backend::BackendStorage;

        fn inner<T>(
            op: &Mm8,
            xs: &[T],
            xs_l: &Layout,
            w: &[u8],
            w_l: &Layout,
        ) -> candle::Result<(CpuStorage, Shape)>
        where
            T: candle::WithDType + num_traits::AsPrimitive<f32> + num_traits::FromPrimitive,
        {
            let xs = match xs_l.contiguous_offsets() {
                None => candle::bail!("input has to be contiguous"),
                Some((o1, o2)) => &xs[o1..o2],
            };
            let w = match w_l.contiguous_offsets() {
                None => candle::bail!("weight has to be contiguous"),
                Some((o1, o2)) => &w[o1..o2],
            };
            let (b, n) = xs_l.shape().dims2()?;
            let (_, m) = w_l.shape().dims2()?;
            let mut dst = vec![T::zero(); b * m];
            xs.par_chunks(n)
                .zip(dst.par_chunks_mut(m))
                .for_each(|(xs, dst)| {
                    let mut acc = vec![0f32; m];
                    let mut sum_x = 0f32;
                    let mut sum_xmy = 0f32;
                    for (i, (x, w_row)) in xs.iter().zip(w.chunks_exact(m)).enumerate() {
                        let x: f32 = x.as_();
                        sum_x += x;
                        sum_xmy += x * op.my[i];
                        let xr = x * op.ry[i];
                        for (acc, &w) in acc.iter_mut().zip(w_row) {
                            *acc += xr * (w as f32 + 0.5)
                        }
                    }
                    for (j, (d, acc)) in dst.iter_mut().zip(acc).enumerate() {
                        let y = acc * op.rx[j] + sum_xmy + op.mx[j] * sum_x;
                        *d = T::from_f32(y).unwrap_or_else(T::zero)
                    }
                });
            let storage = candle::WithDType::to_cpu_storage_owned(dst);
            Ok((storage, Shape::from((b, m))))
        }

        use CpuStorage as C;
        match (s1, s2) {
            (C::BF16(s1), C::U8(s2)) => inner::<half::bf16>(self, s1, l1, s2, l2),
            (C::F16(s1), C::U8(s2)) => inner::<half::f16>(self, s1, l1, s2, l2),
            (C::F32(s1), C::U8(s2)) => inner::<f32>(self, s1, l1, s2, l2),
            _ => candle::bail!("unsupported dtypes for mm8 {:?} {:?}", s1.dtype(), s2.dtype()),
        }
    }
}

/// Largest absolute reconstruction error of `q` against the float matrix it came from.
pub fn max_abs_error(q: &QuantizedWeight, w: &Tensor) -> Result<f32> {
    let diff = (q.dequantize()?.to_dtype(DType::F32)? - w.to_dtype(DType::F32)?)?;
    Ok(diff
        .abs()?
        .flatten_all()?
        .max(D::Minus1)?
        .to_scalar::<f32>()?)
}
