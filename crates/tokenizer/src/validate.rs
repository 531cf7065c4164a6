use crate::config::SpecialTokensCfg;
use crate::errors::{Error, Result};
use crate::SpecialIds;
use std::collections::HashSet;
use tokenizers::Tokenizer;

pub fn resolve_special_ids(tok: &Tokenizer, cfg: &SpecialTokensCfg) -> Result<SpecialIds> {
    let mut seen = HashSet::new();
    for token in [&cfg.cls, &cfg.sep, &cfg.pad, &cfg.unk] {
        if !seen.insert(token) {
            return Err(Error::Artifact(format!(
                "special token '{token}' is configured for more than one role"
            )));
        }
    }

    let lookup = |token: &str| {
        tok.token_to_id(token)
            .ok_or_else(|| Error::MissingSpecialToken(token.to_string()))
    };

    Ok(SpecialIds {
        cls: lookup(&cfg.cls)?,
        sep: lookup(&cfg.sep)?,
        pad: lookup(&cfg.pad)?,
        unk: lookup(&cfg.unk)?,
    })
}
