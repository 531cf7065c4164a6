use crate::config::Config;
use crate::errors::{Error, Result};
use std::path::Path;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::bert::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::Tokenizer;

const TOKENIZER_JSON_ERR: &str = "tokenizer json not found at";
const VOCAB_TXT_ERR: &str = "wordpiece vocab not found at";

/// Loads a tokenizer from either a bundled `tokenizer.json` or a WordPiece `vocab.txt`.
pub fn load_tokenizer(cfg: &Config) -> Result<Tokenizer> {
    let path = cfg.artifact.as_path();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => load_tokenizer_from_json(path),
        Some("txt") => load_wordpiece_from_vocab(path, &cfg.special_tokens.unk, cfg.lowercase),
        Some(other) => Err(Error::UnsupportedArtifact(format!(
            "unsupported tokenizer artifact extension '{other}' ({})",
            path.display()
        ))),
        None => Err(Error::UnsupportedArtifact(format!(
            "tokenizer artifact has no extension: {}",
            path.display()
        ))),
    }
}

pub fn load_tokenizer_from_json(path: &Path) -> Result<Tokenizer> {
    ensure_file(path, TOKENIZER_JSON_ERR)?;
    Tokenizer::from_file(path).map_err(Error::from)
}

pub fn load_wordpiece_from_vocab(path: &Path, unk_token: &str, lowercase: bool) -> Result<Tokenizer> {
    ensure_file(path, VOCAB_TXT_ERR)?;
    let vocab = path_to_string(path)?;

    let model = WordPiece::from_file(&vocab)
        .unk_token(unk_token.to_string())
        .build()
        .map_err(Error::from)?;

    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_normalizer(Some(BertNormalizer::new(true, true, None, lowercase)));
    tokenizer.with_pre_tokenizer(Some(BertPreTokenizer));
    Ok(tokenizer)
}

fn ensure_file(path: &Path, context: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::Artifact(format!("{context} {}", path.display())))
    }
}

fn path_to_string(path: &Path) -> Result<String> {
    path.to_str()
        .map(|s| s.to_owned())
        .ok_or_else(|| Error::Artifact(format!("path is not valid UTF-8: {}", path.display())))
}
