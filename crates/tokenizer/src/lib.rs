//! Subword tokenizer loading for the fine-tuning pipeline.
//!
//! The crate wraps a [`tokenizers::Tokenizer`] built from either a bundled
//! `tokenizer.json` or a WordPiece `vocab.txt`, and resolves the structural
//! tokens (`[CLS]`, `[SEP]`, `[PAD]`, `[UNK]` or the RoBERTa-style
//! equivalents) up front so dataset encoding never has to look them up by
//! string again.
//!
//! Words are tokenized one at a time. Callers decide which sub-token is the
//! canonical "head" of a word; this crate only guarantees that every word
//! maps to at least one id (falling back to the unknown token).
//!
//! Built tokenizers are `Send + Sync` and are shared across prefetch threads
//! behind an `Arc`.

pub mod config;
pub mod errors;

mod artifacts;
mod validate;

pub use config::{Config, SpecialTokensCfg};
pub use errors::{Error, Result};

/// Resolved ids of the structural tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialIds {
    pub cls: u32,
    pub sep: u32,
    pub pad: u32,
    pub unk: u32,
}

#[derive(Debug, Clone)]
pub struct SubwordTokenizer {
    inner: tokenizers::Tokenizer,
    special: SpecialTokensCfg,
    ids: SpecialIds,
}

impl SubwordTokenizer {
    pub fn load(cfg: &Config) -> Result<Self> {
        let inner = artifacts::load_tokenizer(cfg)?;
        let ids = validate::resolve_special_ids(&inner, &cfg.special_tokens)?;
        Ok(Self {
            inner,
            special: cfg.special_tokens.clone(),
            ids,
        })
    }

    pub fn special_ids(&self) -> SpecialIds {
        self.ids
    }

    pub fn special_tokens(&self) -> &SpecialTokensCfg {
        &self.special
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Splits a single word into sub-token ids; never returns an empty vector.
    pub fn tokenize_word(&self, word: &str) -> Result<Vec<u32>> {
        if let Some(id) = self.special_id_for(word) {
            return Ok(vec![id]);
        }
        let encoding = self.inner.encode(word, false)?;
        let ids = encoding.get_ids();
        if ids.is_empty() {
            Ok(vec![self.ids.unk])
        } else {
            Ok(ids.to_vec())
        }
    }

    pub fn id_to_token(&self, id: u32) -> String {
        self.inner
            .id_to_token(id)
            .unwrap_or_else(|| self.special.unk.clone())
    }

    pub fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter().map(|&id| self.id_to_token(id)).collect()
    }

    fn special_id_for(&self, word: &str) -> Option<u32> {
        if word == self.special.cls {
            Some(self.ids.cls)
        } else if word == self.special.sep {
            Some(self.ids.sep)
        } else if word == self.special.pad {
            Some(self.ids.pad)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn tokenizer_is_shareable_across_threads() {
        assert_send_sync::<SubwordTokenizer>();
    }

    #[test]
    fn bert_and_roberta_families_differ() {
        assert_eq!(SpecialTokensCfg::for_backbone("bert").cls, "[CLS]");
        assert_eq!(SpecialTokensCfg::for_backbone("distilbert").pad, "[PAD]");
        assert_eq!(SpecialTokensCfg::for_backbone("roberta").cls, "<s>");
        assert!(!Config::for_backbone("vocab.txt", "roberta").lowercase);
        assert!(Config::for_backbone("vocab.txt", "albert").lowercase);
    }
}
