use std::{fs, sync::Arc};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor, Var,
};
use model::{EncoderConfig, ForwardOutput, HeadKind, HeadSpec, MultiTaskNet};
use tokenizer::SubwordTokenizer;

use crate::{
    checkpoint::{CheckpointKind, CheckpointWriter},
    config::{to_runtime_error, FinetuneError, Precision, RunConfig, TaskConfig, TaskType},
    data::{
        BlockingDataLoader, DataBatch, DataLoader, Labels, LoaderOptions, TaskBatchLoader,
        TaskDataset,
    },
    logging::{Logger, LoggingSettings},
    loss::{criterion_for, flatten_for_loss, CrossEntropyLoss},
    metrics::{span_f1, EvalReport},
    optimizer::{AdamWConfig, MixedPrecision, TrainerOptimizer},
};

type Result<T> = std::result::Result<T, FinetuneError>;

/// Batches between two loss progress lines.
pub const LOSS_REPORT_INTERVAL: usize = 10;

/// What the trainer needs from a model.
pub trait TaskModel {
    fn forward(
        &self,
        input_ids: &Tensor,
        labels: &Tensor,
        task: &str,
    ) -> candle_core::Result<ForwardOutput>;

    fn set_training(&mut self, training: bool);

    fn named_parameters(&self) -> Vec<(String, Var)>;

    fn trainable_parameters(&self) -> Vec<(String, Var)>;
}

impl TaskModel for MultiTaskNet {
    fn forward(
        &self,
        input_ids: &Tensor,
        labels: &Tensor,
        task: &str,
    ) -> candle_core::Result<ForwardOutput> {
        MultiTaskNet::forward(self, input_ids, labels, task)
    }

    fn set_training(&mut self, training: bool) {
        MultiTaskNet::set_training(self, training)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        MultiTaskNet::named_parameters(self)
    }

    fn trainable_parameters(&self) -> Vec<(String, Var)> {
        MultiTaskNet::trainable_parameters(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Training { epoch: usize },
    Evaluating { epoch: usize },
    Closed,
}

/// Best validation and test scores seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BestScores {
    pub dev: f64,
    pub test: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Improvement {
    pub dev: bool,
    pub test: bool,
}

impl BestScores {
    /// Returns the updated ledger; a watermark moves only on a strictly greater score.
    pub fn observe(self, dev: f64, test: f64) -> (Self, Improvement) {
        let improvement = Improvement {
            dev: dev > self.dev,
            test: test > self.test,
        };
        let next = Self {
            dev: if improvement.dev { dev } else { self.dev },
            test: if improvement.test { test } else { self.test },
        };
        (next, improvement)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub loss: f32,
    /// False when mixed precision skipped the update after an overflow.
    pub applied: bool,
}

/// Diagnostic view of the first example of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SanityDump {
    pub words: Vec<String>,
    pub x: Vec<u32>,
    pub tokens: Vec<String>,
    pub is_heads: Vec<u8>,
    pub y: Labels,
    pub tags: Vec<String>,
    pub mask: Vec<u8>,
    pub seqlen: usize,
    pub task_name: String,
}

impl SanityDump {
    pub fn from_batch(batch: &DataBatch, tokenizer: &SubwordTokenizer) -> Result<Self> {
        let seqlen = batch.seqlens.first().copied().unwrap_or(0);
        let first_row = |tensor: &Tensor| -> Result<Tensor> {
            tensor.get(0).map_err(to_runtime_error)
        };

        let x_full = first_row(&batch.input_ids)?
            .to_vec1::<u32>()
            .map_err(to_runtime_error)?;
        let tokens = tokenizer.convert_ids_to_tokens(&x_full);
        let y = if batch.task_type.is_tagging() {
            let labels = first_row(&batch.labels)?
                .to_vec1::<u32>()
                .map_err(to_runtime_error)?;
            Labels::PerToken(labels.into_iter().take(seqlen).collect())
        } else {
            Labels::Single(
                first_row(&batch.labels)?
                    .to_scalar::<u32>()
                    .map_err(to_runtime_error)?,
            )
        };
        let mask = first_row(&batch.mask)?
            .to_vec1::<u8>()
            .map_err(to_runtime_error)?;

        Ok(Self {
            words: batch.words.first().cloned().unwrap_or_default(),
            x: x_full.iter().take(seqlen).copied().collect(),
            tokens: tokens.into_iter().take(seqlen).collect(),
            is_heads: batch.is_heads.first().cloned().unwrap_or_default(),
            y,
            tags: batch.tags.first().cloned().unwrap_or_default(),
            mask,
            seqlen,
            task_name: batch.task.clone(),
        })
    }

    /// Field names and rendered values, in print order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let y = match &self.y {
            Labels::PerToken(labels) => format!("{:?}", labels),
            Labels::Single(label) => label.to_string(),
        };
        vec![
            ("words", format!("{:?}", self.words)),
            ("x", format!("{:?}", self.x)),
            ("tokens", format!("{:?}", self.tokens)),
            ("is_heads", format!("{:?}", self.is_heads)),
            ("y", y),
            ("tags", format!("{:?}", self.tags)),
            ("mask", format!("{:?}", self.mask)),
            ("seqlen", self.seqlen.to_string()),
            ("task_name", self.task_name.clone()),
        ]
    }
}

#[derive(Debug, Clone, Default)]
pub struct EpochSummary {
    pub steps: usize,
    pub applied_steps: usize,
    pub mean_loss: Option<f32>,
    pub sanity: Option<SanityDump>,
}

#[derive(Debug, Clone)]
pub struct EpochScores {
    pub dev: EvalReport,
    pub test: EvalReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub steps: usize,
    pub dev_score: f64,
    pub test_score: f64,
    pub improvement: Improvement,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub best: BestScores,
    pub optimizer_steps: usize,
    pub epochs: Vec<EpochRecord>,
}

/// Picks Metal, then CUDA, then the CPU, and seeds the device RNG.
pub fn select_device(seed: u64) -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    log::debug!(
        "device detection: cuda_available={} metal_available={}",
        cuda_available,
        metal_available
    );

    let device = if metal_available {
        match Device::new_metal(0) {
            Ok(device) => device,
            Err(err) => {
                log::warn!("failed to initialize metal device, falling back to CPU: {}", err);
                Device::Cpu
            }
        }
    } else if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(err) => {
                log::warn!("cuda reported available but initialization failed: {}", err);
                Device::Cpu
            }
        }
    } else {
        Device::Cpu
    };

    log::info!(
        "device selected: is_cuda={} is_metal={} is_cpu={}",
        device.is_cuda(),
        device.is_metal(),
        device.is_cpu()
    );
    if let Err(err) = device.set_seed(seed) {
        log::debug!("device RNG not seeded: {}", err);
    }
    device
}

/// Drives training and evaluation of one task.
pub struct Trainer<M: TaskModel = MultiTaskNet> {
    config: RunConfig,
    task: TaskConfig,
    label_vocab: Vec<String>,
    device: Device,
    tokenizer: Arc<SubwordTokenizer>,
    model: M,
    optimizer: TrainerOptimizer,
    criterion: CrossEntropyLoss,
    precision: Option<MixedPrecision>,
    logger: Logger,
    checkpoints: Option<CheckpointWriter>,
    state: RunState,
}

impl Trainer<MultiTaskNet> {
    /// Builds the model on the best available device.
    pub fn new(
        config: RunConfig,
        task: TaskConfig,
        tokenizer: Arc<SubwordTokenizer>,
    ) -> Result<Self> {
        config.validate()?;
        let device = select_device(config.seed);
        Self::for_device(config, task, tokenizer, device)
    }

    pub fn for_device(
        config: RunConfig,
        task: TaskConfig,
        tokenizer: Arc<SubwordTokenizer>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;

        let precision = match config.precision() {
            Precision::Fp16 if device.is_cpu() => {
                return Err(FinetuneError::validation(vec![
                    "fp16 requires a CUDA or Metal device".to_string(),
                ]));
            }
            Precision::Fp16 => Some(MixedPrecision::fp16()),
            Precision::Fp32 => None,
        };

        let encoder = EncoderConfig::for_backbone(&config.lm, tokenizer.vocab_size())
            .map_err(|err| FinetuneError::initialization(err.to_string()))?
            .with_pad_token_id(tokenizer.special_ids().pad);
        let kind = match task.task_type {
            TaskType::Tagging => HeadKind::Token,
            TaskType::Classification | TaskType::SpanClassification => HeadKind::Sequence,
        };
        let head = HeadSpec::new(task.name.clone(), kind, task.label_vocab().len());
        let mut model = MultiTaskNet::new(encoder, &[head], &device, config.finetuning)
            .map_err(|err| FinetuneError::initialization(err.to_string()))?;

        if let Some(path) = config.bert_path.as_ref() {
            if !path.is_file() {
                return Err(FinetuneError::initialization(format!(
                    "pretrained weights not found at {}",
                    path.display()
                )));
            }
            let loaded = model
                .load_weights(path)
                .map_err(|err| FinetuneError::initialization(err.to_string()))?;
            log::info!("loaded {} pretrained tensor(s) from {}", loaded, path.display());
        }

        if let Some(precision) = precision.as_ref() {
            model
                .set_compute_dtype(precision.compute_dtype())
                .map_err(|err| FinetuneError::initialization(err.to_string()))?;
        }

        Self::with_model(config, task, tokenizer, model, device, precision)
    }
}

impl<M: TaskModel> Trainer<M> {
    pub fn with_model(
        config: RunConfig,
        task: TaskConfig,
        tokenizer: Arc<SubwordTokenizer>,
        model: M,
        device: Device,
        precision: Option<MixedPrecision>,
    ) -> Result<Self> {
        if config.task != task.name {
            return Err(FinetuneError::validation(vec![format!(
                "run is configured for task '{}' but was given '{}'",
                config.task, task.name
            )]));
        }

        let optimizer = TrainerOptimizer::new(
            model.trainable_parameters(),
            AdamWConfig::from_run(config.lr, &config.optimizer),
        )?;

        fs::create_dir_all(&config.logdir)?;
        let logger = Logger::new(LoggingSettings::new(true, Some(config.logdir.clone())))?;
        let checkpoints = if config.save_model {
            Some(CheckpointWriter::new(&config.logdir, config.run_tag())?)
        } else {
            None
        };

        log::info!(
            "trainer ready for '{}' ({}), run tag {}",
            task.name,
            task.task_type,
            config.run_tag()
        );

        Ok(Self {
            criterion: criterion_for(task.task_type),
            label_vocab: task.label_vocab(),
            config,
            task,
            device,
            tokenizer,
            model,
            optimizer,
            precision,
            logger,
            checkpoints,
            state: RunState::Init,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn task(&self) -> &TaskConfig {
        &self.task
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer.steps()
    }

    pub fn checkpoints(&self) -> Option<&CheckpointWriter> {
        self.checkpoints.as_ref()
    }

    /// Batch source over `dataset` on this trainer's device.
    pub fn batch_source(
        &self,
        dataset: Arc<TaskDataset>,
        options: LoaderOptions,
    ) -> Result<BlockingDataLoader<TaskBatchLoader>> {
        let pad_id = self.tokenizer.special_ids().pad;
        let loader = TaskBatchLoader::new(dataset, options, pad_id, self.device.clone())?;
        Ok(BlockingDataLoader::new(loader))
    }

    /// Forward, loss, backward and one optimizer update for `batch`.
    pub fn train_step(&mut self, batch: &DataBatch) -> Result<StepOutcome> {
        if batch.task != self.task.name {
            return Err(FinetuneError::runtime(format!(
                "batch for task '{}' given to trainer for '{}'",
                batch.task, self.task.name
            )));
        }

        // Gradients live in the GradStore returned by backward, so each step starts clean.
        let output = self
            .model
            .forward(&batch.input_ids, &batch.labels, &batch.task)
            .map_err(to_runtime_error)?;
        let (logits, labels) = flatten_for_loss(&output.logits, &output.labels)?;
        let loss = self.criterion.compute(&logits, &labels)?;

        let applied = match self.precision.as_mut() {
            Some(precision) => {
                let scaled = precision.backward(&loss.loss, self.optimizer.parameters())?;
                precision.step(&mut self.optimizer, scaled)?
            }
            None => {
                let mut grads = loss.loss.backward().map_err(to_runtime_error)?;
                self.optimizer.step(&mut grads)?;
                true
            }
        };

        Ok(StepOutcome {
            loss: loss.metrics.average_loss(),
            applied,
        })
    }

    /// One pass over `loader`; an empty source runs no steps.
    pub fn train_epoch<L: DataLoader>(
        &mut self,
        loader: &mut BlockingDataLoader<L>,
    ) -> Result<EpochSummary> {
        self.model.set_training(true);
        loader.reset()?;

        let mut summary = EpochSummary::default();
        let mut loss_sum = 0f64;
        while let Some(batch) = loader.next_batch()? {
            let index = summary.steps;
            let outcome = self.train_step(&batch)?;

            if index == 0 {
                let dump = SanityDump::from_batch(&batch, &self.tokenizer)?;
                self.logger.log_sanity(&dump);
                summary.sanity = Some(dump);
            }
            if index % LOSS_REPORT_INTERVAL == 0 {
                self.logger.log_step_loss(index, &batch.task, outcome.loss);
            }

            summary.steps += 1;
            if outcome.applied {
                summary.applied_steps += 1;
            }
            loss_sum += outcome.loss as f64;
        }

        if summary.steps > 0 {
            summary.mean_loss = Some((loss_sum / summary.steps as f64) as f32);
        }
        Ok(summary)
    }

    /// Scores the model on `loader` in inference mode.
    pub fn evaluate<L: DataLoader>(
        &mut self,
        loader: &mut BlockingDataLoader<L>,
    ) -> Result<EvalReport> {
        self.model.set_training(false);
        loader.reset()?;

        let task_type = self.task.task_type;
        let mut examples = 0usize;
        let mut gold_tags = Vec::new();
        let mut predicted_tags = Vec::new();
        let mut gold_labels = Vec::new();
        let mut predicted_labels = Vec::new();

        while let Some(batch) = loader.next_batch()? {
            let output = self
                .model
                .forward(&batch.input_ids, &batch.labels, &batch.task)
                .map_err(to_runtime_error)?;
            examples += batch.batch_size();

            if task_type.is_tagging() {
                let gold = output.labels.to_vec2::<u32>().map_err(to_runtime_error)?;
                let predicted = output.predictions.to_vec2::<u32>().map_err(to_runtime_error)?;
                for (row, heads) in batch.is_heads.iter().enumerate() {
                    let (gold_row, predicted_row) =
                        self.head_tags(heads, &gold[row], &predicted[row], batch.seqlens[row]);
                    gold_tags.push(gold_row);
                    predicted_tags.push(predicted_row);
                }
            } else {
                gold_labels.extend(output.labels.to_vec1::<u32>().map_err(to_runtime_error)?);
                predicted_labels
                    .extend(output.predictions.to_vec1::<u32>().map_err(to_runtime_error)?);
            }
        }

        Ok(if task_type.is_tagging() {
            EvalReport::tagging(examples, span_f1(&gold_tags, &predicted_tags))
        } else {
            EvalReport::classification(task_type, &gold_labels, &predicted_labels)
        })
    }

    /// Tags at head positions, skipping the `<PAD>`-labelled structural tokens.
    fn head_tags(
        &self,
        heads: &[u8],
        gold: &[u32],
        predicted: &[u32],
        seqlen: usize,
    ) -> (Vec<String>, Vec<String>) {
        let mut gold_tags = Vec::new();
        let mut predicted_tags = Vec::new();
        for position in 0..seqlen {
            if heads.get(position) != Some(&1) || gold[position] == 0 {
                continue;
            }
            gold_tags.push(self.tag_name(gold[position]));
            predicted_tags.push(match predicted[position] {
                0 => "O".to_string(),
                index => self.tag_name(index),
            });
        }
        (gold_tags, predicted_tags)
    }

    fn tag_name(&self, index: u32) -> String {
        self.label_vocab
            .get(index as usize)
            .cloned()
            .unwrap_or_else(|| "O".to_string())
    }

    /// Evaluates the validation and test sources and records their scalars at `epoch`.
    pub fn eval_on_task<A: DataLoader, B: DataLoader>(
        &mut self,
        epoch: usize,
        valid: &mut BlockingDataLoader<A>,
        test: &mut BlockingDataLoader<B>,
    ) -> Result<EpochScores> {
        let dev = self.evaluate(valid)?;
        let test = self.evaluate(test)?;
        let task = self.task.name.clone();
        self.logger.log_evaluation(epoch, &task, "dev", &dev)?;
        self.logger.log_evaluation(epoch, &task, "test", &test)?;
        Ok(EpochScores { dev, test })
    }

    /// Updates the ledger and persists a checkpoint for every watermark that moved.
    pub fn record_scores(
        &mut self,
        best: BestScores,
        epoch: usize,
        dev_score: f64,
        test_score: f64,
    ) -> Result<(BestScores, Improvement)> {
        let (next, improvement) = best.observe(dev_score, test_score);

        for (improved, kind, score) in [
            (improvement.dev, CheckpointKind::Dev, dev_score),
            (improvement.test, CheckpointKind::Test, test_score),
        ] {
            if !improved {
                continue;
            }
            log::info!(
                "new best {} score {:.4} at epoch {}",
                kind.suffix(),
                score,
                epoch
            );
            if let Some(writer) = self.checkpoints.as_mut() {
                writer.save(&self.model.named_parameters(), kind, epoch, score)?;
            }
        }

        Ok((next, improvement))
    }

    /// Trains for `n_epochs`, evaluating after each, then closes the metric sink.
    pub fn run<T: DataLoader, A: DataLoader, B: DataLoader>(
        &mut self,
        train: &mut BlockingDataLoader<T>,
        valid: &mut BlockingDataLoader<A>,
        test: &mut BlockingDataLoader<B>,
    ) -> Result<RunSummary> {
        if self.state != RunState::Init {
            return Err(FinetuneError::runtime(format!(
                "run cannot start from state {:?}",
                self.state
            )));
        }

        let task = self.task.name.clone();
        let mut best = BestScores::default();
        let mut epochs = Vec::with_capacity(self.config.n_epochs);

        for epoch in 1..=self.config.n_epochs {
            self.state = RunState::Training { epoch };
            let summary = self.train_epoch(train)?;
            if let Some(loss) = summary.mean_loss {
                self.logger.log_train_loss(epoch, &task, loss)?;
            }

            self.state = RunState::Evaluating { epoch };
            self.logger.log_epoch_marker(epoch);
            let scores = self.eval_on_task(epoch, valid, test)?;
            let (dev_score, test_score) = (scores.dev.score(), scores.test.score());
            let (next, improvement) = self.record_scores(best, epoch, dev_score, test_score)?;
            best = next;

            epochs.push(EpochRecord {
                epoch,
                steps: summary.steps,
                dev_score,
                test_score,
                improvement,
            });
        }

        self.logger.close()?;
        self.state = RunState::Closed;
        log::info!(
            "finished '{}': best dev {:.4}, best test {:.4}",
            task,
            best.dev,
            best.test
        );

        Ok(RunSummary {
            best,
            optimizer_steps: self.optimizer.steps(),
            epochs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermarks_move_only_on_strict_improvement() {
        let best = BestScores::default();
        let (best, first) = best.observe(0.5, 0.4);
        assert_eq!(first, Improvement { dev: true, test: true });

        let (best, tie) = best.observe(0.5, 0.3);
        assert_eq!(tie, Improvement::default());
        assert_eq!(best, BestScores { dev: 0.5, test: 0.4 });
    }

    #[test]
    fn sanity_fields_are_ordered() {
        let dump = SanityDump {
            words: vec!["[CLS]".into()],
            x: vec![2],
            tokens: vec!["[CLS]".into()],
            is_heads: vec![1],
            y: Labels::PerToken(vec![0]),
            tags: vec!["<PAD>".into()],
            mask: vec![1],
            seqlen: 1,
            task_name: "t".into(),
        };
        let names: Vec<&str> = dump.fields().iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec!["words", "x", "tokens", "is_heads", "y", "tags", "mask", "seqlen", "task_name"]
        );
    }
}
