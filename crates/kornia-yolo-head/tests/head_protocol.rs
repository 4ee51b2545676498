use approx::assert_relative_eq;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use kornia_yolo_head::{
    DetectionHead, ExportFormat, HeadConfig, HeadError, HeadMode, HeadOutput, HeadVariant,
    BOX_CHANNELS, REG_MAX,
};
use kornia_yolo_nn::ops::interleave_channels;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn build(config: HeadConfig) -> Result<DetectionHead, HeadError> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    DetectionHead::new(config, vb)
}

/// Projected logits whose box sides all peak at bin `d`, class logits zero.
fn one_hot_distances(nc: usize, d: usize, h: usize, w: usize) -> candle_core::Result<Tensor> {
    let no = BOX_CHANNELS + nc;
    let mut data = vec![0f32; no * h * w];
    for side in 0..4 {
        let channel = side * REG_MAX + d;
        data[channel * h * w..(channel + 1) * h * w].fill(100.0);
    }
    Tensor::from_vec(data, (1, no, h, w), &Device::Cpu)
}

fn pyramid(ch: &[usize], sizes: &[(usize, usize)]) -> candle_core::Result<Vec<Tensor>> {
    ch.iter()
        .zip(sizes)
        .map(|(&c, &(h, w))| Tensor::randn(0f32, 1f32, (2, c, h, w), &Device::Cpu))
        .collect()
}

#[test]
fn anchors_are_cached_per_input_shape() -> TestResult {
    let ch = [16, 32];
    let mut head = build(HeadConfig::new(HeadVariant::DetectorTinyV4, 3, ch.to_vec()))?;
    head.set_strides(&[8.0, 16.0])?;
    head.set_mode(HeadMode::Inference);

    let small = pyramid(&ch, &[(8, 8), (4, 4)])?;
    head.forward(&small)?;
    let first = head.anchor_cache().centers().ok_or("no anchors")?.clone();
    head.forward(&small)?;
    let second = head.anchor_cache().centers().ok_or("no anchors")?;
    assert_eq!(head.anchor_cache().recompute_count(), 1);
    assert_eq!(first.to_vec2::<f32>()?, second.to_vec2::<f32>()?);

    let large = pyramid(&ch, &[(12, 10), (6, 5)])?;
    let out = head.forward(&large)?;
    assert_eq!(head.anchor_cache().recompute_count(), 2);
    let anchors = 12 * 10 + 6 * 5;
    assert_eq!(head.anchor_cache().centers().ok_or("no anchors")?.dim(1)?, anchors);
    let prediction = out.prediction().ok_or("no prediction")?;
    assert_eq!(prediction.dims3()?, (2, 4 + 3, anchors));
    Ok(())
}

#[test]
fn dynamic_heads_rebuild_anchors_every_call() -> TestResult {
    let config = HeadConfig {
        dynamic: true,
        ..HeadConfig::new(HeadVariant::DetectorPrototype3, 2, vec![8])
    };
    let mut head = build(config)?;
    head.set_strides(&[8.0])?;
    head.set_mode(HeadMode::Inference);
    let xs = pyramid(&[8], &[(4, 4)])?;
    for _ in 0..3 {
        head.forward(&xs)?;
    }
    assert_eq!(head.anchor_cache().recompute_count(), 3);
    Ok(())
}

#[test]
fn decoded_boxes_sit_on_their_anchors() -> TestResult {
    let nc = 2;
    let no = BOX_CHANNELS + nc;
    let (stride, d) = (8.0, 3);
    let mut head = build(HeadConfig::new(HeadVariant::DetectorPrototype4, nc, vec![no]))?;
    head.set_strides(&[stride])?;
    head.set_mode(HeadMode::Inference);

    let (h, w) = (2, 3);
    let out = head.forward(&[one_hot_distances(nc, d, h, w)?])?;
    let prediction = out.prediction().ok_or("no prediction")?.squeeze(0)?.to_vec2::<f32>()?;

    for row in 0..h {
        for col in 0..w {
            let a = row * w + col;
            assert_relative_eq!(prediction[0][a], (col as f32 + 0.5) * 8.0, epsilon = 1e-3);
            assert_relative_eq!(prediction[1][a], (row as f32 + 0.5) * 8.0, epsilon = 1e-3);
            assert_relative_eq!(prediction[2][a], 2.0 * d as f32 * 8.0, epsilon = 1e-3);
            assert_relative_eq!(prediction[3][a], 2.0 * d as f32 * 8.0, epsilon = 1e-3);
            assert_relative_eq!(prediction[4][a], 0.5, epsilon = 1e-6);
        }
    }
    Ok(())
}

#[test]
fn training_returns_raw_projections() -> TestResult {
    let ch = [8, 16];
    let mut head = build(HeadConfig::new(HeadVariant::NDetect, 4, ch.to_vec()))?;
    let xs = pyramid(&ch, &[(8, 8), (4, 4)])?;

    let HeadOutput::Training(raw) = head.forward(&xs)? else {
        return Err("training mode must return raw projections".into());
    };
    assert_eq!(raw.len(), 2);
    assert_eq!(raw[0].dims4()?, (2, BOX_CHANNELS + 4, 8, 8));
    let min = raw
        .iter()
        .map(|t| t.min_all()?.to_scalar::<f32>())
        .collect::<candle_core::Result<Vec<_>>>()?;
    assert!(min.iter().any(|&m| m < 0.0));
    assert_eq!(head.anchor_cache().recompute_count(), 0);

    head.infer_strides((64, 64), &xs)?;
    head.set_mode(HeadMode::Inference);
    let out = head.forward(&xs)?;
    let scores = out
        .prediction()
        .ok_or("no prediction")?
        .narrow(1, 4, 4)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
    assert_eq!(out.raw().map(<[Tensor]>::len), Some(2));
    Ok(())
}

#[test]
fn shuffle_interleave_alternates_paths() -> TestResult {
    let ones = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu)?;
    let zeros = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu)?;
    let merged = interleave_channels(&ones, &zeros)?.mean((2, 3))?;
    assert_eq!(
        merged.flatten_all()?.to_vec1::<f32>()?,
        vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0]
    );
    Ok(())
}

#[test]
fn quantized_exports_normalize_boxes() -> TestResult {
    let nc = 1;
    let no = BOX_CHANNELS + nc;
    let mut head = build(HeadConfig::new(HeadVariant::DetectorPrototype4, nc, vec![no]))?;
    head.set_strides(&[8.0])?;
    let xs = [one_hot_distances(nc, 1, 4, 4)?];

    let export = |head: &mut DetectionHead, tag: &str| -> Result<Vec<f32>, HeadError> {
        head.set_mode(HeadMode::from_flags(false, true, tag));
        let out = head.forward(&xs)?;
        let HeadOutput::Export(prediction) = out else {
            return Err(HeadError::Config("export mode must return the prediction only".into()));
        };
        Ok(prediction.narrow(1, 0, 4)?.flatten_all()?.to_vec1::<f32>()?)
    };

    let pixels = export(&mut head, "onnx")?;
    assert!(pixels.iter().any(|&v| v > 1.0));
    assert_eq!(export(&mut head, "some_runtime")?, pixels);
    assert_eq!(export(&mut head, "saved_model")?, pixels);

    for tag in ["tflite", "edgetpu"] {
        let normalized = export(&mut head, tag)?;
        assert!(normalized.iter().all(|v| (0.0..=1.0).contains(v)), "{tag}");
        for (n, p) in normalized.iter().zip(&pixels) {
            assert_relative_eq!(n * 32.0, *p, epsilon = 1e-3);
        }
    }
    assert_eq!(
        head.mode().export_format(),
        Some(&ExportFormat::EdgeTpu)
    );
    Ok(())
}

#[test]
fn auxiliary_head_prunes_to_first_stream() -> TestResult {
    let ch = [8, 8, 8, 16, 16, 16];
    let mut head = build(HeadConfig::new(HeadVariant::NDetectAuxDual, 2, ch.to_vec()))?;
    let xs = pyramid(&ch, &[(8, 8), (8, 8), (8, 8), (4, 4), (4, 4), (4, 4)])?;
    head.set_strides(&[8.0, 8.0, 8.0, 16.0, 16.0, 16.0])?;
    head.bias_init()?;
    assert_eq!(head.prior().len(), 6);

    let mut pruned = head.prune_auxiliary();
    pruned.set_mode(HeadMode::Inference);
    let out = pruned.forward(&xs)?;
    assert_eq!(out.raw().map(<[Tensor]>::len), Some(2));
    let strides = pruned.anchor_cache().strides().ok_or("no strides")?;
    let strides = strides.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(strides.len(), 8 * 8 + 4 * 4);
    assert!(strides[..64].iter().all(|&s| s == 8.0));
    assert!(strides[64..].iter().all(|&s| s == 16.0));
    Ok(())
}

#[test]
fn config_file_round_trip() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("head.json");
    let config = HeadConfig {
        k: 5,
        ..HeadConfig::new(HeadVariant::DetectorPrototype3, 20, vec![32, 64, 128])
    };
    std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;

    let loaded = HeadConfig::from_json_file(&path)?;
    assert_eq!(loaded.variant, HeadVariant::DetectorPrototype3);
    assert_eq!(loaded.ch, vec![32, 64, 128]);
    assert_eq!(loaded.k, 5);
    assert!(!loaded.dynamic);

    let head = build(loaded)?;
    assert_eq!(head.config().no(), BOX_CHANNELS + 20);

    assert!(matches!(
        HeadConfig::from_json_file(dir.path().join("missing.json")),
        Err(HeadError::Io(_))
    ));
    Ok(())
}
