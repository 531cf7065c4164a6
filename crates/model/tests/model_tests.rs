use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{EncoderConfig, HeadKind, HeadSpec, MultiTaskNet};
use tempfile::tempdir;

fn build_config() -> EncoderConfig {
    EncoderConfig {
        dropout: 0.0,
        ..EncoderConfig::tiny(16)
    }
}

fn heads() -> Vec<HeadSpec> {
    vec![
        HeadSpec::new("hotel_tagging", HeadKind::Token, 5),
        HeadSpec::new("hotel_sentiment", HeadKind::Sequence, 3),
    ]
}

#[test]
fn token_head_produces_per_position_logits() -> Result<()> {
    let model = MultiTaskNet::new(build_config(), &heads(), &Device::Cpu, true)?;
    let input_ids = Tensor::from_slice(&[2u32, 5, 6, 3, 2, 7, 3, 0], (2, 4), &Device::Cpu)?;
    let labels = Tensor::from_slice(&[0u32, 1, 2, 0, 0, 3, 0, 0], (2, 4), &Device::Cpu)?;

    let out = model.forward(&input_ids, &labels, "hotel_tagging")?;

    assert_eq!(out.logits.dims(), &[2, 4, 5]);
    assert_eq!(out.logits.dtype(), DType::F32);
    assert_eq!(out.labels.dims(), &[2, 4]);
    assert_eq!(out.predictions.dims(), &[2, 4]);
    Ok(())
}

#[test]
fn sequence_head_reads_first_position() -> Result<()> {
    let model = MultiTaskNet::new(build_config(), &heads(), &Device::Cpu, true)?;
    let input_ids = Tensor::from_slice(&[2u32, 5, 3, 2, 6, 3], (2, 3), &Device::Cpu)?;
    let labels = Tensor::from_slice(&[1u32, 2], (2,), &Device::Cpu)?;

    let out = model.forward(&input_ids, &labels, "hotel_sentiment")?;

    assert_eq!(out.logits.dims(), &[2, 3]);
    assert_eq!(out.predictions.dims(), &[2]);
    Ok(())
}

#[test]
fn mismatched_labels_are_rejected() -> Result<()> {
    let model = MultiTaskNet::new(build_config(), &heads(), &Device::Cpu, true)?;
    let input_ids = Tensor::from_slice(&[2u32, 5, 3], (1, 3), &Device::Cpu)?;
    let labels = Tensor::from_slice(&[1u32, 2], (1, 2), &Device::Cpu)?;

    assert!(model.forward(&input_ids, &labels, "hotel_tagging").is_err());
    assert!(model
        .forward(&input_ids, &labels, "restaurant_tagging")
        .is_err());
    Ok(())
}

#[test]
fn frozen_encoder_only_trains_heads() -> Result<()> {
    let model = MultiTaskNet::new(build_config(), &heads(), &Device::Cpu, false)?;
    let input_ids = Tensor::from_slice(&[2u32, 5, 3], (1, 3), &Device::Cpu)?;
    let labels = Tensor::from_slice(&[1u32], (1,), &Device::Cpu)?;

    let out = model.forward(&input_ids, &labels, "hotel_sentiment")?;
    let grads = out.logits.sum_all()?.backward()?;

    for (name, var) in model.named_parameters() {
        let has_grad = grads.get(var.as_tensor()).is_some();
        if name.starts_with("heads.hotel_sentiment") {
            assert!(has_grad, "{name} should receive a gradient");
        } else {
            assert!(!has_grad, "{name} should be frozen");
        }
    }
    assert!(model
        .trainable_parameters()
        .iter()
        .all(|(name, _)| name.starts_with("heads.")));
    Ok(())
}

#[test]
fn shared_layers_register_one_block() -> Result<()> {
    let config = EncoderConfig {
        share_layers: true,
        n_layers: 4,
        ..build_config()
    };
    let model = MultiTaskNet::new(config, &heads(), &Device::Cpu, true)?;
    let names: Vec<String> = model
        .named_parameters()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert!(names.iter().any(|n| n.starts_with("encoder.layer.0.")));
    assert!(!names.iter().any(|n| n.starts_with("encoder.layer.1.")));
    Ok(())
}

#[test]
fn pretrained_weights_load_by_name() -> Result<()> {
    let source = MultiTaskNet::new(build_config(), &heads(), &Device::Cpu, true)?;
    let target = MultiTaskNet::new(build_config(), &heads(), &Device::Cpu, true)?;

    let dir = tempdir()?;
    let path = dir.path().join("encoder.safetensors");
    let tensors: HashMap<String, Tensor> = source
        .named_parameters()
        .into_iter()
        .filter(|(name, _)| name.starts_with("encoder."))
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    let expected = tensors.len();
    candle_core::safetensors::save(&tensors, &path)?;

    assert_eq!(target.load_weights(&path)?, expected);

    let input_ids = Tensor::from_slice(&[2u32, 5, 6, 3], (1, 4), &Device::Cpu)?;
    let a = source.encode(&input_ids)?.flatten_all()?.to_vec1::<f32>()?;
    let b = target.encode(&input_ids)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(a, b);
    Ok(())
}
