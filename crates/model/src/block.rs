use candle_core::{bail, DType, Device, Result, Tensor, Var, D};

use crate::{
    config::EncoderConfig,
    layers::{dropout, FeedForward, LayerNorm, Linear},
};

/// Additive attention bias that hides padded keys: `0` for real tokens and a
/// large negative value for padding, shaped `(batch, 1, 1, seq)`.
pub fn padding_bias(attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, seq) = match attention_mask.dims() {
        [batch, seq] => (*batch, *seq),
        dims => bail!("attention mask must be shaped [batch, seq], got {:?}", dims),
    };
    attention_mask
        .to_dtype(DType::F32)?
        .affine(MASKED_LOGIT.abs(), MASKED_LOGIT)?
        .reshape((batch, 1, 1, seq))
}

const MASKED_LOGIT: f64 = -10_000.0;

/// Bidirectional post-norm transformer layer (self-attention then feed-forward).
#[derive(Debug, Clone)]
pub struct EncoderBlock {
    query: Linear,
    key: Linear,
    value: Linear,
    attn_output: Linear,
    attn_norm: LayerNorm,
    ffn: FeedForward,
    ffn_norm: LayerNorm,
    n_heads: usize,
    head_dim: usize,
    hidden_dim: usize,
    dropout_p: f32,
}

impl EncoderBlock {
    pub fn new(config: &EncoderConfig, device: &Device) -> Result<Self> {
        let hidden = config.hidden_dim;
        Ok(Self {
            query: Linear::new(hidden, hidden, device)?,
            key: Linear::new(hidden, hidden, device)?,
            value: Linear::new(hidden, hidden, device)?,
            attn_output: Linear::new(hidden, hidden, device)?,
            attn_norm: LayerNorm::new(hidden, config.layer_norm_eps, device)?,
            ffn: FeedForward::new(hidden, config.ff_dim, device)?,
            ffn_norm: LayerNorm::new(hidden, config.layer_norm_eps, device)?,
            n_heads: config.n_heads,
            head_dim: config.head_dim(),
            hidden_dim: hidden,
            dropout_p: config.dropout,
        })
    }

    fn split_heads(&self, tensor: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        tensor
            .reshape((batch, seq, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `hidden` is `(batch, seq, hidden)`; `mask_bias` comes from [`padding_bias`].
    pub fn forward(&self, hidden: &Tensor, mask_bias: &Tensor, training: bool) -> Result<Tensor> {
        let (batch, seq, width) = hidden.dims3()?;
        if width != self.hidden_dim {
            bail!(
                "encoder block expected hidden dim {} but received {}",
                self.hidden_dim,
                width
            );
        }
        let dtype = hidden.dtype();

        let q = self.split_heads(&self.query.forward(hidden)?, batch, seq)?;
        let k = self.split_heads(&self.key.forward(hidden)?, batch, seq)?;
        let v = self.split_heads(&self.value.forward(hidden)?, batch, seq)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q
            .matmul(&k.t()?.contiguous()?)?
            .affine(scale, 0.0)?
            .to_dtype(DType::F32)?
            .broadcast_add(mask_bias)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(dtype)?;
        let probs = dropout(&probs, self.dropout_p, training)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, self.hidden_dim))?;
        let attended = dropout(&self.attn_output.forward(&context)?, self.dropout_p, training)?;
        let hidden = self.attn_norm.forward(&(attended + hidden)?)?;

        let ffn_out = dropout(&self.ffn.forward(&hidden)?, self.dropout_p, training)?;
        self.ffn_norm.forward(&(ffn_out + &hidden)?)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = Vec::new();
        params.extend(self.query.named_parameters(&format!("{scope}.attention.query")));
        params.extend(self.key.named_parameters(&format!("{scope}.attention.key")));
        params.extend(self.value.named_parameters(&format!("{scope}.attention.value")));
        params.extend(
            self.attn_output
                .named_parameters(&format!("{scope}.attention.output")),
        );
        params.extend(
            self.attn_norm
                .named_parameters(&format!("{scope}.attention.layer_norm")),
        );
        params.extend(self.ffn.named_parameters(&format!("{scope}.ffn")));
        params.extend(self.ffn_norm.named_parameters(&format!("{scope}.ffn.layer_norm")));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_bias_masks_only_padding() -> Result<()> {
        let mask = Tensor::from_slice(&[1u32, 1, 0], (1, 3), &Device::Cpu)?;
        let bias = padding_bias(&mask)?;
        assert_eq!(bias.dims(), &[1, 1, 1, 3]);
        assert_eq!(bias.flatten_all()?.to_vec1::<f32>()?, vec![0.0, 0.0, -10_000.0]);
        Ok(())
    }

    #[test]
    fn padded_keys_do_not_change_real_positions() -> Result<()> {
        let device = Device::Cpu;
        let config = EncoderConfig {
            dropout: 0.0,
            ..EncoderConfig::tiny(16)
        };
        let block = EncoderBlock::new(&config, &device)?;

        let real = Tensor::randn(0f32, 1.0, (1, 2, config.hidden_dim), &device)?;
        let noise = Tensor::randn(0f32, 1.0, (1, 1, config.hidden_dim), &device)?;
        let padded = Tensor::cat(&[&real, &noise], 1)?;

        let short_mask = Tensor::from_slice(&[1u32, 1], (1, 2), &device)?;
        let long_mask = Tensor::from_slice(&[1u32, 1, 0], (1, 3), &device)?;
        let short = block.forward(&real, &padding_bias(&short_mask)?, false)?;
        let long = block.forward(&padded, &padding_bias(&long_mask)?, false)?;

        let diff = (short - long.narrow(1, 0, 2)?)?
            .abs()?
            .max_keepdim(2)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(diff.iter().all(|d| *d < 1e-3), "diff {diff:?}");
        Ok(())
    }
}
