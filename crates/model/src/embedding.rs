use candle_core::{bail, DType, Device, Result, Tensor, Var};

use crate::{config::EncoderConfig, layers::LayerNorm};

/// Sum of learned token and absolute position embeddings, normalised.
#[derive(Debug, Clone)]
pub struct Embeddings {
    word: Var,
    position: Var,
    norm: LayerNorm,
    vocab_size: usize,
    max_positions: usize,
    hidden_dim: usize,
}

impl Embeddings {
    pub fn new(config: &EncoderConfig, device: &Device) -> Result<Self> {
        let word = Var::randn(0f32, 0.02, (config.vocab_size, config.hidden_dim), device)?;
        let position = Var::randn(0f32, 0.02, (config.max_positions, config.hidden_dim), device)?;
        Ok(Self {
            word,
            position,
            norm: LayerNorm::new(config.hidden_dim, config.layer_norm_eps, device)?,
            vocab_size: config.vocab_size,
            max_positions: config.max_positions,
            hidden_dim: config.hidden_dim,
        })
    }

    /// Looks up `(batch, seq)` token ids and returns `(batch, seq, hidden)` in `f32`.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = match token_ids.dims() {
            [batch, seq] => (*batch, *seq),
            dims => bail!("token ids must be shaped [batch, seq], got {:?}", dims),
        };
        if !token_ids.dtype().is_int() {
            bail!("token ids expected an integer dtype, got {:?}", token_ids.dtype());
        }
        if seq > self.max_positions {
            bail!(
                "sequence length {} exceeds the {} supported positions",
                seq,
                self.max_positions
            );
        }

        let flat = token_ids.to_dtype(DType::U32)?.flatten_all()?;
        if flat.elem_count() > 0 {
            let max_id = flat.max(0)?.to_scalar::<u32>()? as usize;
            if max_id >= self.vocab_size {
                bail!("token id {} exceeds vocab size {}", max_id, self.vocab_size);
            }
        }

        let words = self
            .word
            .as_tensor()
            .index_select(&flat, 0)?
            .reshape((batch, seq, self.hidden_dim))?;
        let positions = self.position.as_tensor().narrow(0, 0, seq)?;
        let summed = words.broadcast_add(&positions)?;
        self.norm.forward(&summed)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = vec![
            (format!("{scope}.word_embeddings.weight"), self.word.clone()),
            (
                format!("{scope}.position_embeddings.weight"),
                self.position.clone(),
            ),
        ];
        params.extend(self.norm.named_parameters(&format!("{scope}.layer_norm")));
        params
    }
}
