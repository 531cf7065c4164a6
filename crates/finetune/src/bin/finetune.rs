use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use finetune::{
    FinetuneError, LoaderOptions, RunConfig, TaskDataset, TaskRegistry, Trainer, EVAL_MAX_LEN,
};
use tokenizer::{Config as TokenizerConfig, SubwordTokenizer};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("fine-tuning failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-task fine-tuning CLI", long_about = None)]
struct Args {
    #[arg(long, default_value = "hotel_tagging")]
    task: String,

    #[arg(long, default_value = "bert", help = "Backbone preset")]
    lm: String,

    #[arg(long = "run_id", default_value_t = 0)]
    run_id: u32,

    #[arg(long = "batch_size", default_value_t = 128)]
    batch_size: usize,

    #[arg(long, default_value_t = 1e-4)]
    lr: f64,

    #[arg(long = "n_epochs", default_value_t = 30)]
    n_epochs: usize,

    #[arg(long = "max_len", default_value_t = 64)]
    max_len: usize,

    #[arg(long, help = "Update the encoder as well as the task head")]
    finetuning: bool,

    #[arg(long, help = "Mixed-precision training (requires CUDA or Metal)")]
    fp16: bool,

    #[arg(long = "save_model", help = "Write best dev/test checkpoints to logdir")]
    save_model: bool,

    #[arg(long, value_name = "DIR", default_value = "checkpoints/")]
    logdir: PathBuf,

    #[arg(long = "bert_path", value_name = "PATH", help = "Pretrained encoder weights (safetensors)")]
    bert_path: Option<PathBuf>,

    #[arg(long, value_name = "PATH", default_value = "configs.json")]
    configs: PathBuf,

    #[arg(long, value_name = "PATH", default_value = "tokenizer.json", help = "tokenizer.json or vocab.txt")]
    tokenizer: PathBuf,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long = "num_workers", default_value_t = 1)]
    num_workers: usize,
}

impl From<Args> for RunConfig {
    fn from(args: Args) -> Self {
        RunConfig {
            task: args.task,
            lm: args.lm,
            run_id: args.run_id,
            batch_size: args.batch_size,
            lr: args.lr,
            n_epochs: args.n_epochs,
            max_len: args.max_len,
            finetuning: args.finetuning,
            fp16: args.fp16,
            save_model: args.save_model,
            logdir: args.logdir,
            bert_path: args.bert_path,
            configs: args.configs,
            tokenizer: args.tokenizer,
            seed: args.seed,
            num_workers: args.num_workers,
            ..RunConfig::default()
        }
    }
}

fn run() -> Result<(), FinetuneError> {
    let config = RunConfig::from(Args::parse());
    config.validate()?;

    let registry = TaskRegistry::from_path(&config.configs)?;
    let task = registry.get(&config.task)?.clone();

    let tokenizer = Arc::new(SubwordTokenizer::load(&TokenizerConfig::for_backbone(
        &config.tokenizer,
        &config.lm,
    ))?);

    let train_set = Arc::new(TaskDataset::load(
        &task.trainset,
        &task,
        &tokenizer,
        config.max_len,
    )?);
    let valid_set = Arc::new(TaskDataset::load(&task.validset, &task, &tokenizer, EVAL_MAX_LEN)?);
    let test_set = Arc::new(TaskDataset::load(&task.testset, &task, &tokenizer, EVAL_MAX_LEN)?);

    let batch_size = config.batch_size;
    let seed = config.seed;
    let num_workers = config.num_workers;
    let mut trainer = Trainer::new(config, task, tokenizer)?;

    let mut train = trainer.batch_source(
        train_set,
        LoaderOptions::training(batch_size, seed, num_workers),
    )?;
    let mut valid = trainer.batch_source(valid_set, LoaderOptions::evaluation(batch_size))?;
    let mut test = trainer.batch_source(test_set, LoaderOptions::evaluation(batch_size))?;

    let summary = trainer.run(&mut train, &mut valid, &mut test)?;
    log::info!(
        "{} optimizer step(s); best dev {:.4}, best test {:.4}",
        summary.optimizer_steps,
        summary.best.dev,
        summary.best.test
    );
    Ok(())
}
