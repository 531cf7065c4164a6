pub mod block;
pub mod config;
pub mod embedding;
pub mod heads;
pub mod layers;
pub mod model;

pub use block::EncoderBlock;
pub use config::{EncoderConfig, BACKBONES};
pub use heads::{HeadKind, HeadSpec};
pub use model::{ForwardOutput, MultiTaskNet};
