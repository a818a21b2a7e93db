mod common;

use anyhow::Result;
use candle::{test_device, DType, Device, Tensor};
use candle_rwkv7::matmul::{FloatMatMul, MatMulDispatch, QuantMatMul, Weight};
use candle_rwkv7::quantized::{self, QuantizedWeight};
use candle_rwkv7::Error;
use common::{max_abs_diff, pattern};

fn dispatchers(dev: &Device, dtype: DType) -> [MatMulDispatch; 2] {
    [
        MatMulDispatch::GENERIC,
        MatMulDispatch::select(dev, dtype, true),
    ]
}

fn float_ranks(dev: &Device) -> Result<()> {
    let b = pattern((6, 5), 1, 1., dev)?;
    let a3 = pattern((2, 3, 6), 2, 1., dev)?;
    let expected = a3.broadcast_matmul(&b)?;
    for d in dispatchers(dev, DType::F32) {
        let ys = d.matmul(&a3, &b, None)?;
        assert_eq!(ys.dims(), [2, 3, 5]);
        assert!(max_abs_diff(&ys, &expected)? < 1e-5);

        let a2 = a3.get(0)?;
        let ys = d.matmul(&a2, &b, None)?;
        assert_eq!(ys.dims(), [3, 5]);
        assert!(max_abs_diff(&ys, &expected.get(0)?)? < 1e-5);

        let a1 = a2.get(1)?;
        let ys = d.matmul(&a1, &b, None)?;
        assert_eq!(ys.dims(), [5]);
        assert!(max_abs_diff(&ys, &expected.get(0)?.get(1)?)? < 1e-5);
    }
    Ok(())
}

fn half_precision_accumulates_in_f32(dev: &Device) -> Result<()> {
    let a = pattern((4, 16), 3, 1., dev)?;
    let b = pattern((16, 8), 4, 1., dev)?;
    let expected = a.matmul(&b)?;
    for dtype in [DType::F16, DType::BF16] {
        let (a, b) = (a.to_dtype(dtype)?, b.to_dtype(dtype)?);
        for d in dispatchers(dev, dtype) {
            let ys = d.matmul(&a, &b, None)?;
            assert_eq!(ys.dtype(), dtype);
            assert!(max_abs_diff(&ys, &expected)? < 0.5);
        }
    }
    Ok(())
}

fn rejects_bad_operands(dev: &Device) -> Result<()> {
    let d = MatMulDispatch::GENERIC;
    let a = Tensor::ones((2, 3), DType::F32, dev)?;

    let b = Tensor::ones((3, 4), DType::F16, dev)?;
    assert!(matches!(
        d.matmul(&a, &b, None),
        Err(Error::DTypeMismatch {
            lhs: DType::F32,
            rhs: DType::F16,
            ..
        })
    ));

    let b = Tensor::ones((3, 4), DType::U32, dev)?;
    assert!(matches!(
        d.matmul(&a, &b, None),
        Err(Error::UnsupportedDType {
            dtype: DType::U32,
            ..
        })
    ));

    let b = Tensor::ones((3, 4), DType::U8, dev)?;
    assert!(matches!(
        d.matmul(&a, &b, None),
        Err(Error::MissingQuantParams { .. })
    ));

    let b = Tensor::ones((3, 4), DType::F32, dev)?;
    let a4 = Tensor::ones((1, 1, 2, 3), DType::F32, dev)?;
    assert!(matches!(
        d.matmul(&a4, &b, None),
        Err(Error::UnsupportedRank { rank: 4, .. })
    ));

    let a = Tensor::ones((2, 5), DType::F32, dev)?;
    assert!(matches!(
        d.matmul(&a, &b, None),
        Err(Error::ShapeMismatch { .. })
    ));
    Ok(())
}

fn quantized_matches_float(dev: &Device) -> Result<()> {
    let w = pattern((32, 24), 5, 1., dev)?;
    let x = pattern((3, 32), 6, 1., dev)?;
    let range = (w.max_keepdim(0)?.max_keepdim(1)? - w.min_keepdim(0)?.min_keepdim(1)?)?
        .flatten_all()?
        .to_vec1::<f32>()?[0];

    for w in [w.clone(), w.t()?.contiguous()?] {
        let q = QuantizedWeight::quantize(&w, DType::F32)?;
        let err = quantized::max_abs_error(&q, &w)?;
        assert!(err <= range / 256., "{err} {range}");
    }

    let q = QuantizedWeight::quantize(&w, DType::F32)?;
    let expected = x.matmul(&w)?;
    let bound = x.abs()?.sum(1)?.max(0)?.to_scalar::<f32>()? * range / 256.;
    let weight = Weight::Quantized(q);
    for d in dispatchers(dev, DType::F32) {
        let ys = d.forward(&x, &weight)?;
        assert_eq!(ys.dims(), [3, 24]);
        assert!(max_abs_diff(&ys, &expected)? <= bound);

        let ys = d.forward(&x.get(2)?, &weight)?;
        assert_eq!(ys.dims(), [24]);
        assert!(max_abs_diff(&ys, &expected.get(2)?)? <= bound);

        let ys = d.forward(&x.unsqueeze(0)?, &weight)?;
        assert_eq!(ys.dims(), [1, 3, 24]);
    }
    Ok(())
}

test_device!(float_ranks, float_ranks_cpu, float_ranks_gpu, float_ranks_metal);
test_device!(
    half_precision_accumulates_in_f32,
    half_precision_cpu,
    half_precision_gpu,
    half_precision_metal
);
test_device!(
    rejects_bad_operands,
    rejects_bad_operands_cpu,
    rejects_bad_operands_gpu,
    rejects_bad_operands_metal
);
test_device!(
    quantized_matches_float,
    quantized_matches_float_cpu,
    quantized_matches_float_gpu,
    quantized_matches_float_metal
);

#[test]
fn fused_mm8_matches_reference() -> Result<()> {
    let dev = Device::Cpu;
    let w = pattern((48, 20), 7, 1., &dev)?;
    for dtype in [DType::F32, DType::BF16, DType::F16] {
        let q = QuantizedWeight::quantize(&w, dtype)?;
        let x = pattern((5, 48), 8, 1., &dev)?.to_dtype(dtype)?;
        let reference = quantized::mm8_seq(&x, q.weight(), &q.params(), false)?;
        let fused = quantized::mm8_seq(&x, q.weight(), &q.params(), true)?;
        assert_eq!(fused.dtype(), dtype);
        let tol = if dtype == DType::F32 { 1e-4 } else { 0.5 };
        assert!(max_abs_diff(&reference, &fused)? < tol, "{dtype:?}");

        let reference = quantized::mm8_one(&x.get(0)?, q.weight(), &q.params(), false)?;
        let fused = quantized::mm8_one(&x.get(0)?, q.weight(), &q.params(), true)?;
        assert_eq!(fused.dims(), [20]);
        assert!(max_abs_diff(&reference, &fused)? < tol, "{dtype:?}");
    }
    Ok(())
}

#[test]
fn mm8_shape_contract() -> Result<()> {
    let dev = Device::Cpu;
    let w = pattern((8, 6), 9, 1., &dev)?;
    let q = QuantizedWeight::quantize(&w, DType::F32)?;
    let p = q.params();

    let x = Tensor::ones((2, 7), DType::F32, &dev)?;
    assert!(matches!(
        quantized::mm8_seq(&x, q.weight(), &p, false),
        Err(Error::ShapeMismatch { op: "mm8-seq", .. })
    ));
    let x = Tensor::ones(7, DType::F32, &dev)?;
    assert!(matches!(
        quantized::mm8_one(&x, q.weight(), &p, false),
        Err(Error::ShapeMismatch { op: "mm8-one", .. })
    ));

    // Side tensors with swapped roles.
    let bad = QuantizedWeight::new(
        q.weight().clone(),
        p.my.clone(),
        p.rx.clone(),
        p.my.clone(),
        p.ry.clone(),
    );
    assert!(matches!(bad, Err(Error::ShapeMismatch { .. })));

    let x = Tensor::ones((2, 8), DType::BF16, &dev)?;
    assert!(matches!(
        quantized::mm8_seq(&x, q.weight(), &p, false),
        Err(Error::DTypeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn constant_columns_stay_finite() -> Result<()> {
    let dev = Device::Cpu;
    let w = Tensor::new(&[[1f32, 2., 0.5], [1., 3., 0.5], [1., 4., 0.5]], &dev)?;
    let q = QuantizedWeight::quantize(&w, DType::F32)?;
    let deq = q.dequantize()?;
    assert!(max_abs_diff(&deq, &w)? < 2. / 256.);
    Ok(())
}

#[test]
fn kernel_selection() {
    let dev = Device::Cpu;
    let d = MatMulDispatch::select(&dev, DType::F16, true);
    assert_eq!(d.float, FloatMatMul::F32Accumulate);
    assert_eq!(d.quant, QuantMatMul::Fused);
    assert_eq!(
        MatMulDispatch::select(&dev, DType::F16, false),
        MatMulDispatch::GENERIC
    );
    let d = MatMulDispatch::select(&dev, DType::BF16, false);
    assert_eq!(d.float, FloatMatMul::F32Accumulate);
    assert_eq!(d.quant, QuantMatMul::Reference);
}

// The generic path has no bf16 gemm to fall back on for cpu tensors.
#[test]
fn generic_bf16_on_cpu() -> Result<()> {
    let dev = Device::Cpu;
    let a = pattern((3, 16), 7, 1., &dev)?;
    let w = pattern((16, 8), 8, 1., &dev)?;
    let expected = a.matmul(&w)?;
    let d = MatMulDispatch::GENERIC;
    let a = a.to_dtype(DType::BF16)?;

    let ys = d.forward(&a, &Weight::Float(w.to_dtype(DType::BF16)?))?;
    assert_eq!(ys.dtype(), DType::BF16);
    assert!(max_abs_diff(&ys, &expected)? < 0.15);

    let weight = Weight::Quantized(QuantizedWeight::quantize(&w, DType::BF16)?);
    for xs in [a.clone(), a.get(1)?] {
        let ys = d.forward(&xs, &weight)?;
        assert_eq!(ys.dtype(), DType::BF16);
        assert_eq!(ys.dim(candle::D::Minus1)?, 8);
    }
    let ys = d.forward(&a, &weight)?;
    assert!(max_abs_diff(&ys, &expected)? < 0.25);
    Ok(())
}
