use candle_core::{Error, Result};

/// Structural hyperparameters of the shared bidirectional encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub ff_dim: usize,
    pub max_positions: usize,
    pub dropout: f32,
    pub layer_norm_eps: f64,
    /// Reuse a single block for every layer (ALBERT-style cross-layer sharing).
    pub share_layers: bool,
    /// Token id whose positions are masked out of self-attention.
    pub pad_token_id: u32,
}

impl EncoderConfig {
    /// Builds the encoder dimensions for a named backbone.
    ///
    /// `vocab_size` always comes from the loaded tokenizer so that token ids
    /// and embedding rows agree.
    pub fn for_backbone(lm: &str, vocab_size: usize) -> Result<Self> {
        let base = Self {
            vocab_size,
            hidden_dim: 768,
            n_layers: 12,
            n_heads: 12,
            ff_dim: 3072,
            max_positions: 512,
            dropout: 0.1,
            layer_norm_eps: 1e-12,
            share_layers: false,
            pad_token_id: 0,
        };
        let config = match lm {
            "bert" | "xlnet" => base,
            "distilbert" => Self {
                n_layers: 6,
                ..base
            },
            "albert" => Self {
                share_layers: true,
                ..base
            },
            "roberta" => Self {
                max_positions: 514,
                layer_norm_eps: 1e-5,
                ..base
            },
            "tiny" => Self::tiny(vocab_size),
            other => {
                return Err(Error::Msg(format!(
                    "unknown language model backbone '{other}' (expected one of {})",
                    BACKBONES.join(", ")
                )))
            }
        };
        Ok(config)
    }

    /// A small encoder for smoke runs and tests.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_dim: 32,
            n_layers: 2,
            n_heads: 4,
            ff_dim: 64,
            max_positions: 512,
            dropout: 0.1,
            layer_norm_eps: 1e-12,
            share_layers: false,
            pad_token_id: 0,
        }
    }

    pub fn with_pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.n_heads.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.n_layers == 0 {
            return Err(Error::Msg("n_layers must be greater than zero".into()));
        }
        if self.n_heads == 0 {
            return Err(Error::Msg("n_heads must be greater than zero".into()));
        }
        if self.hidden_dim % self.n_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_dim ({}) must be divisible by n_heads ({})",
                self.hidden_dim, self.n_heads
            )));
        }
        if self.ff_dim == 0 {
            return Err(Error::Msg("ff_dim must be greater than zero".into()));
        }
        if self.max_positions == 0 {
            return Err(Error::Msg("max_positions must be greater than zero".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Msg("dropout must be in [0, 1)".into()));
        }
        if self.pad_token_id as usize >= self.vocab_size {
            return Err(Error::Msg(format!(
                "pad_token_id {} is outside the vocabulary of {}",
                self.pad_token_id, self.vocab_size
            )));
        }
        if self.layer_norm_eps <= 0.0 {
            return Err(Error::Msg("layer_norm_eps must be positive".into()));
        }
        Ok(())
    }
}

/// Backbone names accepted by [`EncoderConfig::for_backbone`].
pub const BACKBONES: &[&str] = &["bert", "distilbert", "albert", "roberta", "xlnet", "tiny"];
