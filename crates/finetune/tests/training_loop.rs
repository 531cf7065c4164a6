use std::{fs, path::Path, sync::Arc};

use anyhow::Result;
use candle_core::Device;
use finetune::{
    BestScores, CheckpointKind, FinetuneError, LoaderOptions, RunConfig, RunState, TaskConfig,
    TaskDataset, TaskType, Trainer,
};
use tempfile::{tempdir, TempDir};
use tokenizer::{Config as TokenizerConfig, SubwordTokenizer};

const VOCAB: &[&str] = &[
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "the", "room", "was", "clean", "staff", "friend",
    "##ly", "great", "bad",
];

const TAGGING_TRAIN: &str = "the O\nroom B-AS\nwas O\nclean B-OP\n\nstaff B-AS\nfriendly B-OP\n";

const SENTIMENT_TRAIN: &str = "the room was clean\tpositive\nbad staff\tnegative\ngreat room\tpositive\n";

struct Fixture {
    dir: TempDir,
    tokenizer: Arc<SubwordTokenizer>,
}

impl Fixture {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let vocab_path = dir.path().join("vocab.txt");
        fs::write(&vocab_path, VOCAB.join("\n"))?;
        let tokenizer = SubwordTokenizer::load(&TokenizerConfig::for_backbone(&vocab_path, "tiny"))?;
        Ok(Self {
            dir,
            tokenizer: Arc::new(tokenizer),
        })
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, contents: &str) -> Result<std::path::PathBuf> {
        let path = self.path(name);
        fs::write(&path, contents)?;
        Ok(path)
    }

    fn task(&self, name: &str, task_type: TaskType, vocab: &[&str], data: &Path) -> TaskConfig {
        TaskConfig {
            name: name.to_string(),
            task_type,
            vocab: vocab.iter().map(|label| label.to_string()).collect(),
            trainset: data.to_path_buf(),
            validset: data.to_path_buf(),
            testset: data.to_path_buf(),
        }
    }

    fn tagging_task(&self) -> Result<TaskConfig> {
        let data = self.write("tagging.txt", TAGGING_TRAIN)?;
        Ok(self.task(
            "hotel_tagging",
            TaskType::Tagging,
            &["O", "B-AS", "I-AS", "B-OP", "I-OP"],
            &data,
        ))
    }

    fn config(&self, task: &str) -> RunConfig {
        RunConfig {
            task: task.to_string(),
            lm: "tiny".to_string(),
            batch_size: 2,
            lr: 1e-3,
            n_epochs: 1,
            max_len: 16,
            finetuning: true,
            logdir: self.path("logs"),
            num_workers: 0,
            ..RunConfig::default()
        }
    }

    fn trainer(&self, config: RunConfig, task: &TaskConfig) -> Result<Trainer> {
        Ok(Trainer::for_device(
            config,
            task.clone(),
            Arc::clone(&self.tokenizer),
            Device::Cpu,
        )?)
    }

    fn dataset(&self, task: &TaskConfig, max_len: usize) -> Result<Arc<TaskDataset>> {
        Ok(Arc::new(TaskDataset::load(
            &task.trainset,
            task,
            &self.tokenizer,
            max_len,
        )?))
    }
}

#[test]
fn one_epoch_over_two_examples_takes_one_step() -> Result<()> {
    let fixture = Fixture::new()?;
    let task = fixture.tagging_task()?;
    let mut trainer = fixture.trainer(fixture.config(&task.name), &task)?;
    let dataset = fixture.dataset(&task, 16)?;
    assert_eq!(dataset.len(), 2);

    let mut train = trainer.batch_source(dataset, LoaderOptions::training(2, 7, 0))?;
    let summary = trainer.train_epoch(&mut train)?;

    assert_eq!(summary.steps, 1);
    assert_eq!(trainer.optimizer_steps(), 1);

    let dump = summary.sanity.expect("first batch produces a sanity dump");
    let names: Vec<&str> = dump.fields().iter().map(|(name, _)| *name).collect();
    assert_eq!(
        names,
        ["words", "x", "tokens", "is_heads", "y", "tags", "mask", "seqlen", "task_name"]
    );
    assert_eq!(dump.task_name, "hotel_tagging");
    assert_eq!(dump.x.len(), dump.seqlen);
    assert_eq!(dump.tokens.first().map(String::as_str), Some("[CLS]"));
    assert_eq!(dump.words.first().map(String::as_str), Some("[CLS]"));
    Ok(())
}

#[test]
fn sub_tokens_after_the_first_are_not_heads() -> Result<()> {
    let fixture = Fixture::new()?;
    let task = fixture.tagging_task()?;
    let dataset = fixture.dataset(&task, 16)?;

    let staff = &dataset.examples()[1];
    // [CLS] staff friend ##ly [SEP]
    assert_eq!(staff.input_ids, vec![2, 8, 9, 10, 3]);
    assert_eq!(staff.is_heads, vec![1, 1, 1, 0, 1]);
    match &staff.labels {
        finetune::data::Labels::PerToken(labels) => assert_eq!(labels, &vec![0, 2, 4, 0, 0]),
        other => panic!("expected per-token labels, got {other:?}"),
    }

    let truncated = fixture.dataset(&task, 4)?;
    let room = &truncated.examples()[0];
    assert_eq!(room.seqlen(), 4);
    assert_eq!(room.input_ids.last(), Some(&3));
    Ok(())
}

#[test]
fn empty_training_source_runs_no_steps() -> Result<()> {
    let fixture = Fixture::new()?;
    let task = fixture.tagging_task()?;
    let mut trainer = fixture.trainer(fixture.config(&task.name), &task)?;
    let empty = Arc::new(TaskDataset::from_parts(
        task.name.clone(),
        TaskType::Tagging,
        task.label_vocab(),
        Vec::new(),
    ));

    let mut train = trainer.batch_source(empty, LoaderOptions::training(2, 7, 1))?;
    let summary = trainer.train_epoch(&mut train)?;

    assert_eq!(summary.steps, 0);
    assert!(summary.sanity.is_none());
    assert!(summary.mean_loss.is_none());
    assert_eq!(trainer.optimizer_steps(), 0);
    Ok(())
}

#[test]
fn dev_checkpoint_written_only_on_strict_improvement() -> Result<()> {
    let fixture = Fixture::new()?;
    let task = fixture.tagging_task()?;
    let config = RunConfig {
        save_model: true,
        ..fixture.config(&task.name)
    };
    let run_tag = config.run_tag();
    let mut trainer = fixture.trainer(config, &task)?;

    let mut best = BestScores {
        dev: 0.5,
        test: 0.0,
    };
    let mut dev_write_epochs = Vec::new();
    for (epoch, dev) in [(1, 0.5), (2, 0.7), (3, 0.6)] {
        let (next, improvement) = trainer.record_scores(best, epoch, dev, 0.0)?;
        assert!(next.dev >= best.dev);
        if improvement.dev {
            dev_write_epochs.push(epoch);
        }
        best = next;
    }

    assert_eq!(dev_write_epochs, vec![2]);
    assert_eq!(best.dev, 0.7);
    let writer = trainer.checkpoints().expect("checkpointing enabled");
    assert_eq!(writer.writes(CheckpointKind::Dev), 1);
    assert_eq!(writer.writes(CheckpointKind::Test), 0);

    let weights = fixture.path("logs").join(format!("{run_tag}_dev.safetensors"));
    let manifest = finetune::verify_checkpoint(&weights)?;
    assert_eq!(manifest.epoch, 2);
    assert_eq!(manifest.score, 0.7);
    Ok(())
}

#[test]
fn test_watermark_tracks_the_test_score() -> Result<()> {
    let fixture = Fixture::new()?;
    let task = fixture.tagging_task()?;
    let mut trainer = fixture.trainer(fixture.config(&task.name), &task)?;

    let (best, first) = trainer.record_scores(BestScores::default(), 1, 0.9, 0.2)?;
    let (best, second) = trainer.record_scores(best, 2, 0.8, 0.3)?;

    assert!(first.dev && first.test);
    assert!(!second.dev && second.test);
    assert_eq!(best.dev, 0.9);
    assert_eq!(best.test, 0.3);
    assert!(trainer.checkpoints().is_none());
    Ok(())
}

#[test]
fn evaluation_is_repeatable() -> Result<()> {
    let fixture = Fixture::new()?;
    let task = fixture.tagging_task()?;
    let mut trainer = fixture.trainer(fixture.config(&task.name), &task)?;
    let dataset = fixture.dataset(&task, finetune::EVAL_MAX_LEN)?;
    let mut valid = trainer.batch_source(dataset, LoaderOptions::evaluation(1))?;

    let first = trainer.evaluate(&mut valid)?;
    let second = trainer.evaluate(&mut valid)?;

    assert_eq!(first, second);
    assert_eq!(first.examples, 2);
    assert!((0.0..=1.0).contains(&first.score()));
    Ok(())
}

#[test]
fn full_run_visits_every_epoch_then_closes() -> Result<()> {
    let fixture = Fixture::new()?;
    let task = fixture.tagging_task()?;
    let config = RunConfig {
        n_epochs: 2,
        ..fixture.config(&task.name)
    };
    let mut trainer = fixture.trainer(config, &task)?;
    let train_set = fixture.dataset(&task, 16)?;
    let eval_set = fixture.dataset(&task, finetune::EVAL_MAX_LEN)?;

    let mut train = trainer.batch_source(train_set, LoaderOptions::training(2, 1, 1))?;
    let mut valid = trainer.batch_source(Arc::clone(&eval_set), LoaderOptions::evaluation(2))?;
    let mut test = trainer.batch_source(eval_set, LoaderOptions::evaluation(2))?;

    let summary = trainer.run(&mut train, &mut valid, &mut test)?;

    assert_eq!(summary.epochs.len(), 2);
    assert_eq!(summary.optimizer_steps, 2);
    assert_eq!(trainer.state(), RunState::Closed);
    assert!(fs::read_dir(fixture.path("logs"))?
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_name().to_string_lossy().starts_with("events.out.tfevents")));

    assert!(trainer.run(&mut train, &mut valid, &mut test).is_err());
    Ok(())
}

#[test]
fn classification_batches_train_and_score_accuracy() -> Result<()> {
    let fixture = Fixture::new()?;
    let data = fixture.write("sentiment.txt", SENTIMENT_TRAIN)?;
    let task = fixture.task(
        "hotel_sentiment",
        TaskType::Classification,
        &["positive", "negative"],
        &data,
    );
    let mut trainer = fixture.trainer(fixture.config(&task.name), &task)?;
    let dataset = fixture.dataset(&task, 16)?;
    assert!(dataset.examples().iter().all(|ex| ex.is_heads.iter().all(|&h| h == 1)));

    let mut train = trainer.batch_source(Arc::clone(&dataset), LoaderOptions::training(2, 3, 0))?;
    let summary = trainer.train_epoch(&mut train)?;
    assert_eq!(summary.steps, 2);

    let mut valid = trainer.batch_source(dataset, LoaderOptions::evaluation(2))?;
    let report = trainer.evaluate(&mut valid)?;
    assert_eq!(report.examples, 3);
    assert_eq!(report.score(), report.accuracy);
    Ok(())
}

#[test]
fn fp16_without_an_accelerator_is_a_config_error() -> Result<()> {
    let fixture = Fixture::new()?;
    let task = fixture.tagging_task()?;
    let config = RunConfig {
        fp16: true,
        ..fixture.config(&task.name)
    };
    let result = Trainer::for_device(config, task, Arc::clone(&fixture.tokenizer), Device::Cpu);
    assert!(matches!(result, Err(FinetuneError::Validation(_))));
    Ok(())
}

#[test]
fn batches_from_another_task_are_rejected() -> Result<()> {
    let fixture = Fixture::new()?;
    let task = fixture.tagging_task()?;
    let mut trainer = fixture.trainer(fixture.config(&task.name), &task)?;
    let other = TaskConfig {
        name: "restaurant_tagging".into(),
        ..task.clone()
    };
    let dataset = fixture.dataset(&other, 16)?;
    let mut loader = trainer.batch_source(dataset, LoaderOptions::evaluation(2))?;
    loader.reset()?;
    let batch = loader.next_batch()?.expect("one batch");
    assert!(trainer.train_step(&batch).is_err());
    Ok(())
}
