use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::config::{to_runtime_error, FinetuneError, TaskType};

/// Label index tagging losses skip: `<PAD>` positions and non-head sub-tokens.
pub const TAGGING_IGNORE_INDEX: u32 = 0;

/// Cross entropy loss with optional ignore-index handling.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    ignore_index: Option<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn ignore_index(&self) -> Option<u32> {
        self.ignore_index
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, FinetuneError> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(FinetuneError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }

        let num_classes = *dims
            .last()
            .ok_or_else(|| FinetuneError::runtime("logits tensor missing class dimension"))?;
        if num_classes == 0 {
            return Err(FinetuneError::runtime(
                "logits class dimension must be greater than zero",
            ));
        }

        let item_dims = &dims[..dims.len() - 1];
        if targets.dims() != item_dims {
            return Err(FinetuneError::runtime(format!(
                "targets {:?} do not match logits {:?}",
                targets.dims(),
                dims
            )));
        }

        let item_count: usize = item_dims.iter().copied().product();
        if item_count == 0 {
            return Err(FinetuneError::runtime("no items available for loss computation"));
        }

        let device = logits.device();
        let logits_flat = logits
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .reshape((item_count, num_classes))
            .map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

        let targets_flat = targets
            .to_device(device)
            .map_err(to_runtime_error)?
            .reshape((item_count,))
            .map_err(to_runtime_error)?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::I64 | DType::U8 => targets_flat
                .to_dtype(DType::U32)
                .map_err(to_runtime_error)?,
            dtype => {
                return Err(FinetuneError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let valid_mask = if let Some(ignore_index) = self.ignore_index {
            targets_flat
                .ne(ignore_index)
                .map_err(to_runtime_error)?
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?
        } else {
            Tensor::ones((item_count,), DType::F32, device).map_err(to_runtime_error)?
        };

        let total_items = valid_mask
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;
        if total_items == 0 {
            return Err(FinetuneError::runtime(
                "no valid targets remain after applying ignore_index",
            ));
        }

        let nll = log_probs
            .gather(&targets_flat.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?;

        let loss_sum = (&nll * &valid_mask)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?;
        let average_loss = loss_sum
            .affine(1f64 / total_items as f64, 0.0)
            .map_err(to_runtime_error)?;
        let average_loss_value = average_loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        let correct = logits_flat
            .argmax(D::Minus1)
            .map_err(to_runtime_error)?
            .eq(&targets_flat)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;
        let correct_items = (&correct * &valid_mask)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;

        Ok(LossOutput {
            loss: average_loss,
            metrics: LossMetrics {
                average_loss: average_loss_value,
                total_items,
                correct_items,
            },
        })
    }
}

/// Criterion for a task family: tagging ignores label 0, the others count every item.
///
/// The choice is made on the declared [`TaskType`], never on the task's name.
pub fn criterion_for(task_type: TaskType) -> CrossEntropyLoss {
    match task_type {
        TaskType::Tagging => CrossEntropyLoss::new().with_ignore_index(Some(TAGGING_IGNORE_INDEX)),
        TaskType::Classification | TaskType::SpanClassification => CrossEntropyLoss::new(),
    }
}

/// Reshapes logits to `(N, classes)` and labels to `(N,)`.
pub fn flatten_for_loss(logits: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor), FinetuneError> {
    let num_classes = logits
        .dims()
        .last()
        .copied()
        .ok_or_else(|| FinetuneError::runtime("logits must have a class dimension"))?;
    let logits = logits
        .reshape(((), num_classes))
        .map_err(to_runtime_error)?;
    let labels = labels.flatten_all().map_err(to_runtime_error)?;
    if logits.dim(0).map_err(to_runtime_error)? != labels.dim(0).map_err(to_runtime_error)? {
        return Err(FinetuneError::runtime(format!(
            "flattened logits {:?} and labels {:?} disagree",
            logits.dims(),
            labels.dims()
        )));
    }
    Ok((logits, labels))
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    total_items: usize,
    correct_items: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_items(&self) -> usize {
        self.total_items
    }

    pub fn correct_items(&self) -> usize {
        self.correct_items
    }

    pub fn accuracy(&self) -> f32 {
        if self.total_items == 0 {
            0.0
        } else {
            self.correct_items as f32 / self.total_items as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn tagging_ignores_pad_positions() {
        let device = Device::Cpu;
        let logits = Var::from_tensor(
            &Tensor::from_slice(
                &[0.2f32, 1.5, -0.3, 2.0, 0.1, 0.4, 0.9, -1.0, 0.3],
                (3, 3),
                &device,
            )
            .unwrap(),
        )
        .unwrap();
        let targets = Tensor::from_slice(&[1u32, 0, 2], (3,), &device).unwrap();

        let out = criterion_for(TaskType::Tagging)
            .compute(logits.as_tensor(), &targets)
            .unwrap();
        assert_eq!(out.metrics.total_items(), 2);

        let grads = out.loss.backward().unwrap();
        let grad = grads.get(logits.as_tensor()).unwrap().to_vec2::<f32>().unwrap();
        assert!(grad[1].iter().all(|g| *g == 0.0));
        assert!(grad[0].iter().any(|g| *g != 0.0));
    }

    #[test]
    fn classification_counts_label_zero() {
        let device = Device::Cpu;
        let logits = Tensor::from_slice(&[3.0f32, 0.0, 0.0, 3.0], (2, 2), &device).unwrap();
        let targets = Tensor::from_slice(&[0u32, 1], (2,), &device).unwrap();

        let out = criterion_for(TaskType::Classification)
            .compute(&logits, &targets)
            .unwrap();
        assert_eq!(out.metrics.total_items(), 2);
        assert_eq!(out.metrics.correct_items(), 2);
        assert!(criterion_for(TaskType::SpanClassification)
            .ignore_index()
            .is_none());
    }

    #[test]
    fn all_ignored_targets_are_an_error() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let targets = Tensor::zeros((2,), DType::U32, &device).unwrap();
        assert!(criterion_for(TaskType::Tagging)
            .compute(&logits, &targets)
            .is_err());
    }

    #[test]
    fn flatten_merges_batch_and_sequence() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 4, 5), DType::F32, &device).unwrap();
        let labels = Tensor::zeros((2, 4), DType::U32, &device).unwrap();
        let (logits, labels) = flatten_for_loss(&logits, &labels).unwrap();
        assert_eq!(logits.dims(), &[8, 5]);
        assert_eq!(labels.dims(), &[8]);

        let seq_logits = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let seq_labels = Tensor::zeros((2,), DType::U32, &device).unwrap();
        let (logits, labels) = flatten_for_loss(&seq_logits, &seq_labels).unwrap();
        assert_eq!(logits.dims(), &[2, 3]);
        assert_eq!(labels.dims(), &[2]);
    }
}
