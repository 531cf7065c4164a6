use candle_core::{Device, Tensor};

use crate::config::{to_runtime_error, FinetuneError, TaskType};

use super::{
    dataset::{Example, Labels},
    DataBatch, Result,
};

/// Host-side batch padded to a common length, not yet on a device.
#[derive(Debug, Clone)]
pub struct CollatedBatch {
    pub words: Vec<Vec<String>>,
    pub input_ids: Vec<u32>,
    pub is_heads: Vec<Vec<u8>>,
    pub tags: Vec<Vec<String>>,
    pub mask: Vec<u8>,
    pub labels: Vec<u32>,
    pub seqlens: Vec<usize>,
    pub seq_len: usize,
    pub task: String,
    pub task_type: TaskType,
}

impl CollatedBatch {
    pub fn batch_size(&self) -> usize {
        self.seqlens.len()
    }

    /// Moves the padded arrays onto `device`.
    pub fn into_batch(self, device: &Device) -> Result<DataBatch> {
        let batch_size = self.batch_size();
        let input_ids = Tensor::from_vec(self.input_ids, (batch_size, self.seq_len), device)
            .map_err(to_runtime_error)?;
        let mask = Tensor::from_vec(self.mask, (batch_size, self.seq_len), device)
            .map_err(to_runtime_error)?;
        let labels = if self.task_type.is_tagging() {
            Tensor::from_vec(self.labels, (batch_size, self.seq_len), device)
        } else {
            Tensor::from_vec(self.labels, (batch_size,), device)
        }
        .map_err(to_runtime_error)?;

        Ok(DataBatch {
            words: self.words,
            input_ids,
            is_heads: self.is_heads,
            tags: self.tags,
            mask,
            labels,
            seqlens: self.seqlens,
            task: self.task,
            task_type: self.task_type,
        })
    }
}

/// Pads `examples` to the longest one.
///
/// Token ids are padded with `pad_id`; head flags, mask and per-token labels with 0.
pub fn pad(
    examples: &[&Example],
    pad_id: u32,
    task: &str,
    task_type: TaskType,
) -> Result<CollatedBatch> {
    if examples.is_empty() {
        return Err(FinetuneError::runtime("cannot collate an empty batch"));
    }

    let seq_len = examples.iter().map(|ex| ex.seqlen()).max().unwrap_or(0);
    let batch_size = examples.len();

    let mut batch = CollatedBatch {
        words: Vec::with_capacity(batch_size),
        input_ids: Vec::with_capacity(batch_size * seq_len),
        is_heads: Vec::with_capacity(batch_size),
        tags: Vec::with_capacity(batch_size),
        mask: Vec::with_capacity(batch_size * seq_len),
        labels: Vec::with_capacity(batch_size * seq_len),
        seqlens: Vec::with_capacity(batch_size),
        seq_len,
        task: task.to_string(),
        task_type,
    };

    for example in examples {
        let len = example.seqlen();
        let padding = seq_len - len;

        batch.input_ids.extend_from_slice(&example.input_ids);
        batch.input_ids.extend(std::iter::repeat(pad_id).take(padding));

        let mut heads = example.is_heads.clone();
        heads.resize(seq_len, 0);
        batch.is_heads.push(heads);

        batch.mask.extend(std::iter::repeat(1u8).take(len));
        batch.mask.extend(std::iter::repeat(0u8).take(padding));

        match (&example.labels, task_type.is_tagging()) {
            (Labels::PerToken(labels), true) => {
                batch.labels.extend_from_slice(labels);
                batch.labels.extend(std::iter::repeat(0).take(padding));
            }
            (Labels::Single(label), false) => batch.labels.push(*label),
            _ => {
                return Err(FinetuneError::runtime(format!(
                    "example labels do not fit a {} batch",
                    task_type
                )))
            }
        }

        batch.words.push(example.words.clone());
        batch.tags.push(example.tags.clone());
        batch.seqlens.push(len);
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(ids: &[u32]) -> Example {
        Example {
            words: vec!["[CLS]".into(), "w".into(), "[SEP]".into()],
            input_ids: ids.to_vec(),
            is_heads: vec![1; ids.len()],
            tags: vec!["<PAD>".into(), "O".into(), "<PAD>".into()],
            labels: Labels::PerToken(vec![0; ids.len()]),
        }
    }

    #[test]
    fn pads_to_longest_example() {
        let short = tagged(&[2, 5, 3]);
        let long = tagged(&[2, 5, 6, 7, 3]);
        let batch = pad(&[&short, &long], 9, "hotel_tagging", TaskType::Tagging).unwrap();

        assert_eq!(batch.seq_len, 5);
        assert_eq!(batch.seqlens, vec![3, 5]);
        assert_eq!(&batch.input_ids[..5], &[2, 5, 3, 9, 9]);
        assert_eq!(&batch.mask[..5], &[1, 1, 1, 0, 0]);
        assert_eq!(batch.is_heads[0], vec![1, 1, 1, 0, 0]);
        assert_eq!(batch.labels.len(), 10);

        let tensors = batch.into_batch(&Device::Cpu).unwrap();
        assert_eq!(tensors.input_ids.dims(), &[2, 5]);
        assert_eq!(tensors.labels.dims(), &[2, 5]);
    }

    #[test]
    fn classification_labels_stay_per_example() {
        let example = Example {
            words: vec!["[CLS]".into(), "ok".into(), "[SEP]".into()],
            input_ids: vec![2, 8, 3],
            is_heads: vec![1, 1, 1],
            tags: vec!["positive".into()],
            labels: Labels::Single(1),
        };
        let batch = pad(&[&example, &example], 0, "s", TaskType::Classification)
            .unwrap()
            .into_batch(&Device::Cpu)
            .unwrap();
        assert_eq!(batch.labels.dims(), &[2]);
        assert!(pad(&[&example], 0, "s", TaskType::Tagging).is_err());
    }
}
