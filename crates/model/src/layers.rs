//! Trainable building blocks for the encoder.
//!
//! Every layer owns its parameters as [`Var`]s so gradients reach them through
//! `Tensor::backward`, and reports them through `named_parameters(scope)` using
//! dotted names (`encoder.layer.0.attention.query.weight`). Matmuls run in the
//! dtype of the incoming activations; parameters stay in `f32` and are cast on
//! the fly, which is what lets the trainer run the forward pass in half
//! precision while the optimizer keeps full-precision weights.

use candle_core::{DType, Device, Result, Tensor, Var, D};

/// Weight initialisation scale used by BERT-style encoders.
const INIT_STD: f32 = 0.02;

/// Dense projection `y = x W^T + b` over the last axis.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Var,
    bias: Var,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize, device: &Device) -> Result<Self> {
        let weight = Var::randn(0f32, INIT_STD, (out_dim, in_dim), device)?;
        let bias = Var::zeros(out_dim, DType::F32, device)?;
        Ok(Self {
            weight,
            bias,
            in_dim,
            out_dim,
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let dims = input.dims().to_vec();
        let Some((&last, leading)) = dims.split_last() else {
            candle_core::bail!("linear input must have at least one dimension");
        };
        if last != self.in_dim {
            candle_core::bail!(
                "linear expected trailing dim {} but received {:?}",
                self.in_dim,
                dims
            );
        }
        let rows: usize = leading.iter().product();
        let dtype = input.dtype();
        let weight = self.weight.as_tensor().to_dtype(dtype)?;
        let bias = self.bias.as_tensor().to_dtype(dtype)?;

        let flat = input.reshape((rows, self.in_dim))?;
        let projected = flat.matmul(&weight.t()?)?.broadcast_add(&bias)?;

        let mut out_dims = leading.to_vec();
        out_dims.push(self.out_dim);
        projected.reshape(out_dims)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{scope}.weight"), self.weight.clone()),
            (format!("{scope}.bias"), self.bias.clone()),
        ]
    }
}

/// Layer normalisation with learnable scale and shift.
///
/// Statistics are always reduced in `f32`; the result is cast back to the
/// input dtype.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Var,
    bias: Var,
    epsilon: f64,
}

impl LayerNorm {
    pub fn new(hidden: usize, epsilon: f64, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: Var::ones(hidden, DType::F32, device)?,
            bias: Var::zeros(hidden, DType::F32, device)?,
            epsilon,
        })
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let storage = hidden.dtype();
        let compute = hidden.to_dtype(DType::F32)?;

        let mean = compute.mean_keepdim(D::Minus1)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = variance.affine(1.0, self.epsilon)?.sqrt()?;
        let normalized = centered
            .broadcast_div(&denom)?
            .broadcast_mul(self.weight.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?;

        normalized.to_dtype(storage)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{scope}.weight"), self.weight.clone()),
            (format!("{scope}.bias"), self.bias.clone()),
        ]
    }
}

/// Position-wise `Linear -> GELU -> Linear` stack.
#[derive(Debug, Clone)]
pub struct FeedForward {
    intermediate: Linear,
    output: Linear,
}

impl FeedForward {
    pub fn new(hidden: usize, ff_dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            intermediate: Linear::new(hidden, ff_dim, device)?,
            output: Linear::new(ff_dim, hidden, device)?,
        })
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let expanded = self.intermediate.forward(hidden)?.gelu()?;
        self.output.forward(&expanded)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self
            .intermediate
            .named_parameters(&format!("{scope}.intermediate"));
        params.extend(self.output.named_parameters(&format!("{scope}.output")));
        params
    }
}

/// Inverted dropout, active only while training.
pub fn dropout(input: &Tensor, p: f32, training: bool) -> Result<Tensor> {
    if !training || p <= 0.0 {
        return Ok(input.clone());
    }
    candle_nn::ops::dropout(input, p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_keeps_leading_dims() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::new(4, 3, &device)?;
        let input = Tensor::ones((2, 5, 4), DType::F32, &device)?;
        let out = linear.forward(&input)?;
        assert_eq!(out.dims(), &[2, 5, 3]);
        Ok(())
    }

    #[test]
    fn layer_norm_centres_and_scales() -> Result<()> {
        let device = Device::Cpu;
        let norm = LayerNorm::new(4, 1e-12, &device)?;
        let input = Tensor::from_slice(&[1f32, 2.0, 3.0, 4.0], (1, 1, 4), &device)?;
        let out = norm.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        let var: f32 = out.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn dropout_is_identity_outside_training() -> Result<()> {
        let input = Tensor::ones((3, 3), DType::F32, &Device::Cpu)?;
        let out = dropout(&input, 0.5, false)?;
        assert_eq!(out.to_vec2::<f32>()?, input.to_vec2::<f32>()?);
        Ok(())
    }
}
