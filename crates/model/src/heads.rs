use candle_core::{Device, IndexOp, Result, Tensor, Var};

use crate::layers::{dropout, Linear};

/// Granularity of a task's predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadKind {
    /// One label per sub-token, logits `(batch, seq, classes)`.
    Token,
    /// One label per example read from the first position, logits `(batch, classes)`.
    Sequence,
}

/// Declares the output head a task needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadSpec {
    pub name: String,
    pub kind: HeadKind,
    pub num_labels: usize,
}

impl HeadSpec {
    pub fn new(name: impl Into<String>, kind: HeadKind, num_labels: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            num_labels,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TaskHead {
    kind: HeadKind,
    classifier: Linear,
}

impl TaskHead {
    pub(crate) fn new(spec: &HeadSpec, hidden: usize, device: &Device) -> Result<Self> {
        if spec.num_labels == 0 {
            candle_core::bail!("task '{}' declares an empty label set", spec.name);
        }
        Ok(Self {
            kind: spec.kind,
            classifier: Linear::new(hidden, spec.num_labels, device)?,
        })
    }

    pub(crate) fn forward(&self, encoded: &Tensor, dropout_p: f32, training: bool) -> Result<Tensor> {
        let features = match self.kind {
            HeadKind::Token => encoded.clone(),
            HeadKind::Sequence => encoded.i((.., 0))?,
        };
        let features = dropout(&features, dropout_p, training)?;
        self.classifier.forward(&features)
    }

    pub(crate) fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        self.classifier.named_parameters(&format!("{scope}.classifier"))
    }
}
