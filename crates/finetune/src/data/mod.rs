pub mod collate;
pub mod dataset;

use std::{
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
};

use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::config::{FinetuneError, TaskType};

pub use collate::{pad, CollatedBatch};
pub use dataset::{Example, Labels, RawExample, TaskDataset, EVAL_MAX_LEN};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, FinetuneError>;

/// Padded batch of examples from a single task.
#[derive(Debug)]
pub struct DataBatch {
    pub words: Vec<Vec<String>>,
    /// `(batch, seq)` token ids, `u32`.
    pub input_ids: Tensor,
    pub is_heads: Vec<Vec<u8>>,
    pub tags: Vec<Vec<String>>,
    /// `(batch, seq)`, 1 on real positions, `u8`.
    pub mask: Tensor,
    /// `(batch, seq)` for tagging, `(batch,)` otherwise, `u32`.
    pub labels: Tensor,
    pub seqlens: Vec<usize>,
    pub task: String,
    pub task_type: TaskType,
}

impl DataBatch {
    pub fn batch_size(&self) -> usize {
        self.seqlens.len()
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    /// Starts a new pass over the source.
    fn reset(&mut self) -> Result<()>;

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn reset(&mut self) -> Result<()> {
        self.inner.reset()
    }

    pub fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }
}

impl<L> Iterator for BlockingDataLoader<L>
where
    L: DataLoader,
{
    type Item = Result<DataBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    /// Depth of the prefetch channel; 0 collates inline.
    pub num_workers: usize,
}

impl LoaderOptions {
    pub fn training(batch_size: usize, seed: u64, num_workers: usize) -> Self {
        Self {
            batch_size,
            shuffle: true,
            seed,
            num_workers,
        }
    }

    pub fn evaluation(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            seed: 0,
            num_workers: 0,
        }
    }
}

/// Batches one [`TaskDataset`], reshuffling with `seed + epoch` on every reset.
///
/// The last batch keeps the remainder when the dataset size is not a
/// multiple of the batch size.
pub struct TaskBatchLoader {
    dataset: Arc<TaskDataset>,
    options: LoaderOptions,
    pad_id: u32,
    device: Device,
    epoch: u64,
    state: PassState,
}

enum PassState {
    Idle,
    Inline {
        order: Vec<usize>,
        cursor: usize,
    },
    Prefetch {
        receiver: mpsc::Receiver<Result<CollatedBatch>>,
        worker: Option<JoinHandle<()>>,
    },
}

impl TaskBatchLoader {
    pub fn new(
        dataset: Arc<TaskDataset>,
        options: LoaderOptions,
        pad_id: u32,
        device: Device,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(FinetuneError::initialization(
                "batch size must be greater than zero",
            ));
        }
        log::debug!(
            "loader for '{}' ready: {} example(s), batch size {}, shuffle={}, workers={}",
            dataset.task(),
            dataset.len(),
            options.batch_size,
            options.shuffle,
            options.num_workers
        );
        Ok(Self {
            dataset,
            options,
            pad_id,
            device,
            epoch: 0,
            state: PassState::Idle,
        })
    }

    pub fn dataset(&self) -> &TaskDataset {
        &self.dataset
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.options.batch_size)
    }

    fn epoch_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }
        order
    }

    fn spawn_worker(&self, order: Vec<usize>) -> Result<PassState> {
        let (sender, receiver) = mpsc::sync_channel(self.options.num_workers);
        let dataset = Arc::clone(&self.dataset);
        let batch_size = self.options.batch_size;
        let pad_id = self.pad_id;

        let worker = thread::Builder::new()
            .name(format!("prefetch-{}", dataset.task()))
            .spawn(move || {
                for chunk in order.chunks(batch_size) {
                    let batch = collate_indices(&dataset, chunk, pad_id);
                    if sender.send(batch).is_err() {
                        break;
                    }
                }
            })?;

        Ok(PassState::Prefetch {
            receiver,
            worker: Some(worker),
        })
    }

    fn next_collated(&mut self) -> Result<Option<CollatedBatch>> {
        match &mut self.state {
            PassState::Idle => Ok(None),
            PassState::Inline { order, cursor } => {
                if *cursor >= order.len() {
                    return Ok(None);
                }
                let end = (*cursor + self.options.batch_size).min(order.len());
                let batch = collate_indices(&self.dataset, &order[*cursor..end], self.pad_id)?;
                *cursor = end;
                Ok(Some(batch))
            }
            PassState::Prefetch { receiver, worker } => match receiver.recv() {
                Ok(batch) => batch.map(Some),
                Err(_) => {
                    if let Some(handle) = worker.take() {
                        handle.join().map_err(|_| {
                            FinetuneError::runtime("prefetch worker panicked")
                        })?;
                    }
                    Ok(None)
                }
            },
        }
    }

    fn finish_pass(&mut self) {
        if let PassState::Prefetch { receiver, worker } =
            std::mem::replace(&mut self.state, PassState::Idle)
        {
            drop(receiver);
            if let Some(handle) = worker {
                let _ = handle.join();
            }
        }
    }
}

impl DataLoader for TaskBatchLoader {
    fn reset(&mut self) -> Result<()> {
        self.finish_pass();
        let order = self.epoch_order();
        self.epoch += 1;
        self.state = if self.options.num_workers > 0 && !order.is_empty() {
            self.spawn_worker(order)?
        } else {
            PassState::Inline { order, cursor: 0 }
        };
        Ok(())
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(async move {
            match self.next_collated()? {
                Some(batch) => Ok(Some(batch.into_batch(&self.device)?)),
                None => Ok(None),
            }
        })
    }
}

impl Drop for TaskBatchLoader {
    fn drop(&mut self) {
        self.finish_pass();
    }
}

fn collate_indices(dataset: &TaskDataset, indices: &[usize], pad_id: u32) -> Result<CollatedBatch> {
    let examples: Vec<&Example> = indices
        .iter()
        .map(|&index| &dataset.examples()[index])
        .collect();
    pad(&examples, pad_id, dataset.task(), dataset.task_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskType;

    fn dataset(n: usize) -> Arc<TaskDataset> {
        let examples = (0..n as u32)
            .map(|i| Example {
                words: vec![format!("w{i}")],
                input_ids: vec![2, 10 + i, 3],
                is_heads: vec![1, 1, 1],
                tags: vec!["positive".into()],
                labels: Labels::Single(i % 2),
            })
            .collect();
        Arc::new(TaskDataset::from_parts(
            "hotel_sentiment",
            TaskType::Classification,
            vec!["positive".into(), "negative".into()],
            examples,
        ))
    }

    fn first_ids(loader: &mut BlockingDataLoader<TaskBatchLoader>) -> Vec<u32> {
        loader.reset().unwrap();
        let mut ids = Vec::new();
        for batch in loader.by_ref() {
            let batch = batch.unwrap();
            let rows = batch.input_ids.to_vec2::<u32>().unwrap();
            ids.extend(rows.iter().map(|row| row[1]));
        }
        ids
    }

    #[test]
    fn keeps_partial_last_batch() {
        let loader = TaskBatchLoader::new(
            dataset(5),
            LoaderOptions::evaluation(2),
            0,
            Device::Cpu,
        )
        .unwrap();
        assert_eq!(loader.num_batches(), 3);

        let mut loader = BlockingDataLoader::new(loader);
        loader.reset().unwrap();
        let sizes: Vec<usize> = loader.by_ref().map(|b| b.unwrap().batch_size()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn unshuffled_passes_are_ordered_and_repeatable() {
        let loader =
            TaskBatchLoader::new(dataset(4), LoaderOptions::evaluation(3), 0, Device::Cpu).unwrap();
        let mut loader = BlockingDataLoader::new(loader);
        assert_eq!(first_ids(&mut loader), vec![10, 11, 12, 13]);
        assert_eq!(first_ids(&mut loader), vec![10, 11, 12, 13]);
    }

    #[test]
    fn prefetching_matches_inline_order() {
        let inline = TaskBatchLoader::new(
            dataset(9),
            LoaderOptions::training(2, 7, 0),
            0,
            Device::Cpu,
        )
        .unwrap();
        let prefetch = TaskBatchLoader::new(
            dataset(9),
            LoaderOptions::training(2, 7, 2),
            0,
            Device::Cpu,
        )
        .unwrap();

        let mut inline = BlockingDataLoader::new(inline);
        let mut prefetch = BlockingDataLoader::new(prefetch);
        let a = first_ids(&mut inline);
        let b = first_ids(&mut prefetch);
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (10..19).collect::<Vec<u32>>());
    }

    #[test]
    fn empty_dataset_yields_nothing() {
        let loader =
            TaskBatchLoader::new(dataset(0), LoaderOptions::training(4, 1, 1), 0, Device::Cpu)
                .unwrap();
        let mut loader = BlockingDataLoader::new(loader);
        loader.reset().unwrap();
        assert!(loader.next_batch().unwrap().is_none());
    }
}
