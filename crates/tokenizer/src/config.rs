use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the tokenizer artifacts live and how raw text is normalised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub artifact: PathBuf,
    #[serde(default)]
    pub special_tokens: SpecialTokensCfg,
    #[serde(default = "default_lowercase")]
    pub lowercase: bool,
}

impl Config {
    /// Builds a configuration with the special-token family of a backbone name.
    pub fn for_backbone(artifact: impl Into<PathBuf>, lm: &str) -> Self {
        let special_tokens = SpecialTokensCfg::for_backbone(lm);
        let lowercase = !matches!(lm, "roberta" | "xlnet");
        Self {
            artifact: artifact.into(),
            special_tokens,
            lowercase,
        }
    }
}

/// Names of the structural tokens wrapped around every encoded example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokensCfg {
    pub cls: String,
    pub sep: String,
    pub pad: String,
    pub unk: String,
}

impl SpecialTokensCfg {
    pub fn bert() -> Self {
        Self {
            cls: "[CLS]".into(),
            sep: "[SEP]".into(),
            pad: "[PAD]".into(),
            unk: "[UNK]".into(),
        }
    }

    pub fn roberta() -> Self {
        Self {
            cls: "<s>".into(),
            sep: "</s>".into(),
            pad: "<pad>".into(),
            unk: "<unk>".into(),
        }
    }

    pub fn for_backbone(lm: &str) -> Self {
        match lm {
            "roberta" | "xlnet" => Self::roberta(),
            _ => Self::bert(),
        }
    }
}

impl Default for SpecialTokensCfg {
    fn default() -> Self {
        Self::bert()
    }
}

fn default_lowercase() -> bool {
    true
}
