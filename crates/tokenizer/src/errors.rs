use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    #[error("unsupported tokenizer artifact: {0}")]
    UnsupportedArtifact(String),

    #[error("missing special token '{0}' in tokenizer vocab")]
    MissingSpecialToken(String),

    #[error("artifact error: {0}")]
    Artifact(String),
}
