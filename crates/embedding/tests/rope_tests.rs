use candle_core::{DType, Device, Result, Tensor};
use embedding::positional::{RopeScalingConfig, RopeVariant, RotaryConfig, RotaryEncoder};
use static_assertions::assert_impl_all;

assert_impl_all!(RotaryEncoder: Send, Sync);

fn allclose(a: &Tensor, b: &Tensor, tol: f32) -> Result<bool> {
    let a = a.flatten_all()?.to_vec1::<f32>()?;
    let b = b.flatten_all()?.to_vec1::<f32>()?;
    Ok(a.len() == b.len() && a.iter().zip(&b).all(|(x, y)| (x - y).abs() <= tol))
}

fn config(dims: usize, scaling: Option<RopeScalingConfig>) -> RotaryConfig {
    RotaryConfig {
        dims,
        base: 10_000.0,
        traditional: false,
        max_position_embeddings: 131_072,
        scaling,
    }
}

fn scaling_from_json(json: &str) -> RopeScalingConfig {
    serde_json::from_str(json).unwrap()
}

fn ramp(shape: (usize, usize, usize, usize)) -> Result<Tensor> {
    let n = shape.0 * shape.1 * shape.2 * shape.3;
    let data: Vec<f32> = (0..n).map(|i| ((i as f32) * 0.37).sin()).collect();
    Tensor::from_vec(data, shape, &Device::Cpu)
}

/// Scalar reference rotation over the leading `dims` features.
fn naive_rotation(x: &[f32], seq_len: usize, head_dim: usize, dims: usize, offset: usize, inv_freq: &[f64], traditional: bool) -> Vec<f32> {
    let mut out = x.to_vec();
    let half = dims / 2;
    for s in 0..seq_len {
        let row = &x[s * head_dim..(s + 1) * head_dim];
        for i in 0..half {
            let angle = (offset + s) as f64 * inv_freq[i];
            let (sin, cos) = (angle.sin() as f32, angle.cos() as f32);
            let (a, b) = if traditional { (2 * i, 2 * i + 1) } else { (i, i + half) };
            out[s * head_dim + a] = row[a] * cos - row[b] * sin;
            out[s * head_dim + b] = row[b] * cos + row[a] * sin;
        }
    }
    out
}

#[test]
fn zero_input_at_offset_zero_stays_zero() -> Result<()> {
    let rope = RotaryEncoder::new(&config(64, None)).unwrap();
    let x = Tensor::zeros((1, 4, 8, 64), DType::F32, &Device::Cpu)?;
    let out = rope.apply(&x, 0)?;
    assert_eq!(out.dims(), x.dims());
    assert!(allclose(&out, &x, 0.0)?);
    Ok(())
}

#[test]
fn vectorised_rotation_matches_scalar_reference() -> Result<()> {
    for traditional in [false, true] {
        let mut cfg = config(8, None);
        cfg.traditional = traditional;
        let rope = RotaryEncoder::new(&cfg).unwrap();
        let x = ramp((1, 1, 5, 8))?;
        let out = rope.apply(&x, 3)?;
        let expected = naive_rotation(&x.flatten_all()?.to_vec1::<f32>()?, 5, 8, 8, 3, rope.inv_freq(), traditional);
        let expected = Tensor::from_vec(expected, (1, 1, 5, 8), &Device::Cpu)?;
        assert!(allclose(&out, &expected, 1e-5)?, "traditional={traditional}");
    }
    Ok(())
}

#[test]
fn tail_dimensions_pass_through_unchanged() -> Result<()> {
    let rope = RotaryEncoder::new(&config(8, None)).unwrap();
    let x = ramp((2, 2, 3, 16))?;
    let out = rope.apply(&x, 11)?;
    let tail_in = x.narrow(3, 8, 8)?.flatten_all()?.to_vec1::<f32>()?;
    let tail_out = out.narrow(3, 8, 8)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(tail_in, tail_out);
    Ok(())
}

#[test]
fn output_preserves_input_dtype() -> Result<()> {
    let rope = RotaryEncoder::new(&config(8, None)).unwrap();
    let x = ramp((1, 2, 4, 8))?.to_dtype(DType::BF16)?;
    let out = rope.apply(&x, 5)?;
    assert_eq!(out.dtype(), DType::BF16);
    assert_eq!(out.dims(), x.dims());
    Ok(())
}

#[test]
fn llama3_with_unit_factors_matches_standard_table() {
    let scaling = scaling_from_json(
        r#"{"rope_type": "llama3", "factor": 1.0, "low_freq_factor": 1.0, "high_freq_factor": 1.0, "original_max_position_embeddings": 8192}"#,
    );
    let plain = RotaryEncoder::new(&config(64, None)).unwrap();
    let llama3 = RotaryEncoder::new(&config(64, Some(scaling))).unwrap();
    assert_eq!(llama3.variant(), RopeVariant::Llama3);
    for (a, b) in llama3.inv_freq().iter().zip(plain.inv_freq()) {
        assert!((a - b).abs() < 1e-15);
    }
}

#[test]
fn every_variant_is_identity_at_offset_zero_up_to_magnitude() -> Result<()> {
    let variants = [
        r#"{"type": "default"}"#,
        r#"{"type": "linear", "factor": 4.0}"#,
        r#"{"rope_type": "llama3", "factor": 8.0, "original_max_position_embeddings": 8192}"#,
        r#"{"type": "yarn", "factor": 4.0, "original_max_position_embeddings": 4096}"#,
        r#"{"type": "su", "short_factor": [1.0, 1.1, 1.2, 1.3], "long_factor": [2.0, 2.0, 3.0, 4.0], "original_max_position_embeddings": 4096}"#,
        r#"{"type": "mrope"}"#,
    ];
    let x = ramp((1, 2, 1, 8))?;
    for json in variants {
        let rope = RotaryEncoder::new(&config(8, Some(scaling_from_json(json)))).unwrap();
        let out = rope.apply(&x, 0)?;
        let expected = (&x * rope.magnitude_scale())?;
        assert!(allclose(&out, &expected, 1e-5)?, "{json}");
    }
    Ok(())
}

#[test]
fn linear_scaling_compresses_positions() -> Result<()> {
    let plain = RotaryEncoder::new(&config(8, None)).unwrap();
    let linear = RotaryEncoder::new(&config(8, Some(scaling_from_json(r#"{"type": "linear", "factor": 2.0}"#)))).unwrap();
    let x = ramp((1, 1, 1, 8))?;
    assert!(allclose(&linear.apply(&x, 6)?, &plain.apply(&x, 3)?, 1e-5)?);
    Ok(())
}

#[test]
fn longrope_switches_tables_past_original_context() -> Result<()> {
    let scaling = scaling_from_json(
        r#"{"type": "longrope", "short_factor": [1.0, 1.0], "long_factor": [4.0, 4.0], "original_max_position_embeddings": 16}"#,
    );
    let mut cfg = config(4, Some(scaling));
    cfg.max_position_embeddings = 16;
    let rope = RotaryEncoder::new(&cfg).unwrap();
    assert_eq!(rope.magnitude_scale(), 1.0);

    let plain = RotaryEncoder::new(&config(4, None)).unwrap();
    let x = ramp((1, 1, 1, 4))?;
    // Within the original window the short table (all ones) equals the base table.
    assert!(allclose(&rope.apply(&x, 15)?, &plain.apply(&x, 15)?, 1e-5)?);
    // Past it, frequencies are divided by four, i.e. positions compress 4x.
    let linear = RotaryEncoder::new(&config(4, Some(scaling_from_json(r#"{"type": "linear", "factor": 4.0}"#)))).unwrap();
    assert!(allclose(&rope.apply(&x, 16)?, &linear.apply(&x, 16)?, 1e-5)?);
    Ok(())
}

#[test]
fn missing_yarn_factor_is_a_configuration_error() {
    let err = RotaryEncoder::new(&config(8, Some(scaling_from_json(r#"{"type": "yarn"}"#)))).unwrap_err();
    assert!(err.to_string().contains("factor"));
}
