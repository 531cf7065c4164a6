use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
};

use model::{EncoderConfig, BACKBONES};
use serde::{Deserialize, Serialize};

/// Label every tagging vocabulary is prefixed with; index 0 is ignored by the loss.
pub const PAD_TAG: &str = "<PAD>";

/// The closed set of supported task families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Tagging,
    Classification,
    SpanClassification,
}

impl TaskType {
    pub fn is_tagging(self) -> bool {
        matches!(self, TaskType::Tagging)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Tagging => "tagging",
            TaskType::Classification => "classification",
            TaskType::SpanClassification => "span_classification",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record of the task configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub task_type: TaskType,
    pub vocab: Vec<String>,
    pub trainset: PathBuf,
    pub validset: PathBuf,
    pub testset: PathBuf,
}

impl TaskConfig {
    /// Labels indexed the way the model's head predicts them.
    ///
    /// Tagging vocabularies get [`PAD_TAG`] at index 0 unless the file already
    /// lists it first.
    pub fn label_vocab(&self) -> Vec<String> {
        let mut labels = Vec::with_capacity(self.vocab.len() + 1);
        if self.task_type.is_tagging() && self.vocab.first().map(String::as_str) != Some(PAD_TAG) {
            labels.push(PAD_TAG.to_string());
        }
        labels.extend(self.vocab.iter().cloned());
        labels
    }

    fn apply_base_path(&mut self, base: &Path) {
        for path in [&mut self.trainset, &mut self.validset, &mut self.testset] {
            absolutize_in_place(path, base);
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.name.trim().is_empty() {
            errors.push("task name must not be empty".to_string());
        }
        if self.vocab.is_empty() {
            errors.push(format!("task '{}' has an empty label vocab", self.name));
        }
        let mut seen = HashSet::new();
        for label in &self.vocab {
            if !seen.insert(label) {
                errors.push(format!(
                    "task '{}' lists label '{}' more than once",
                    self.name, label
                ));
            }
        }
    }
}

/// Task records loaded from a configuration file, looked up by name.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: Vec<TaskConfig>,
}

#[derive(Deserialize)]
struct TomlTasks {
    tasks: Vec<TaskConfig>,
}

impl TaskRegistry {
    /// Loads a JSON array of task records, or a TOML file with `[[tasks]]` tables.
    ///
    /// Relative dataset paths are resolved against the file's directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FinetuneError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut tasks: Vec<TaskConfig> = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") | None => serde_json::from_str(&contents)?,
            Some("toml") => toml::from_str::<TomlTasks>(&contents)?.tasks,
            Some(other) => {
                return Err(FinetuneError::ConfigFormat(format!(
                    "unsupported task configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        for task in &mut tasks {
            task.apply_base_path(base_dir);
        }

        Self::new(tasks)
    }

    pub fn new(tasks: Vec<TaskConfig>) -> Result<Self, FinetuneError> {
        let registry = Self { tasks };
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), FinetuneError> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();
        for task in &self.tasks {
            task.collect_errors(&mut errors);
            if !names.insert(task.name.as_str()) {
                errors.push(format!("task '{}' is defined more than once", task.name));
            }
        }
        if !errors.is_empty() {
            return Err(FinetuneError::validation(errors));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&TaskConfig, FinetuneError> {
        self.tasks
            .iter()
            .find(|task| task.name == name)
            .ok_or_else(|| FinetuneError::UnknownTask(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|task| task.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
}

/// AdamW hyperparameters other than the learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            weight_decay: 0.0,
        }
    }
}

/// Hyperparameters of a single fine-tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_task")]
    pub task: String,
    #[serde(default = "default_lm")]
    pub lm: String,
    #[serde(default)]
    pub run_id: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub lr: f64,
    #[serde(default = "default_n_epochs")]
    pub n_epochs: usize,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default)]
    pub finetuning: bool,
    #[serde(default)]
    pub fp16: bool,
    #[serde(default)]
    pub save_model: bool,
    #[serde(default = "default_logdir")]
    pub logdir: PathBuf,
    #[serde(default)]
    pub bert_path: Option<PathBuf>,
    #[serde(default = "default_configs")]
    pub configs: PathBuf,
    #[serde(default = "default_tokenizer")]
    pub tokenizer: PathBuf,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            task: default_task(),
            lm: default_lm(),
            run_id: 0,
            batch_size: default_batch_size(),
            lr: default_learning_rate(),
            n_epochs: default_n_epochs(),
            max_len: default_max_len(),
            finetuning: false,
            fp16: false,
            save_model: false,
            logdir: default_logdir(),
            bert_path: None,
            configs: default_configs(),
            tokenizer: default_tokenizer(),
            seed: default_seed(),
            num_workers: default_num_workers(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl RunConfig {
    /// `baseline_task_<task>_lm_<lm>_batch_size_<bs>_run_id_<id>`.
    pub fn run_tag(&self) -> String {
        format!(
            "baseline_task_{}_lm_{}_batch_size_{}_run_id_{}",
            self.task, self.lm, self.batch_size, self.run_id
        )
    }

    pub fn precision(&self) -> Precision {
        if self.fp16 {
            Precision::Fp16
        } else {
            Precision::Fp32
        }
    }

    pub fn validate(&self) -> Result<(), FinetuneError> {
        let mut errors = Vec::new();

        if self.task.trim().is_empty() {
            errors.push("task must not be empty".to_string());
        }

        if !BACKBONES.contains(&self.lm.as_str()) {
            errors.push(format!(
                "lm '{}' is not one of {}",
                self.lm,
                BACKBONES.join(", ")
            ));
        }

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }

        if !(self.lr.is_finite() && self.lr > 0.0) {
            errors.push("lr must be a positive finite number".to_string());
        }

        if self.max_len < MIN_MAX_LEN {
            errors.push(format!("max_len must be at least {}", MIN_MAX_LEN));
        }

        // Vocabulary size does not affect the position table.
        if let Ok(encoder) = EncoderConfig::for_backbone(&self.lm, 1) {
            if self.max_len > encoder.max_positions {
                errors.push(format!(
                    "max_len {} exceeds the {} positions supported by '{}'",
                    self.max_len, encoder.max_positions, self.lm
                ));
            }
        }

        if self.logdir.as_os_str().is_empty() {
            errors.push("logdir must not be empty".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !errors.is_empty() {
            return Err(FinetuneError::validation(errors));
        }

        Ok(())
    }
}

/// `[CLS]`, one word and `[SEP]`.
const MIN_MAX_LEN: usize = 3;

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_task() -> String {
    "hotel_tagging".to_string()
}

fn default_lm() -> String {
    "bert".to_string()
}

fn default_batch_size() -> usize {
    128
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_n_epochs() -> usize {
    30
}

fn default_max_len() -> usize {
    64
}

fn default_logdir() -> PathBuf {
    PathBuf::from("checkpoints/")
}

fn default_configs() -> PathBuf {
    PathBuf::from("configs.json")
}

fn default_tokenizer() -> PathBuf {
    PathBuf::from("tokenizer.json")
}

fn default_seed() -> u64 {
    42
}

fn default_num_workers() -> usize {
    1
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-6
}

#[derive(Debug)]
pub enum FinetuneError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    UnknownTask(String),
}

impl FinetuneError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for FinetuneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinetuneError::Io(err) => write!(f, "I/O error: {}", err),
            FinetuneError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            FinetuneError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            FinetuneError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            FinetuneError::Runtime(msg) => write!(f, "training failed: {}", msg),
            FinetuneError::UnknownTask(name) => {
                write!(f, "task '{}' is not defined in the task configuration", name)
            }
        }
    }
}

impl std::error::Error for FinetuneError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FinetuneError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FinetuneError {
    fn from(value: std::io::Error) -> Self {
        FinetuneError::Io(value)
    }
}

impl From<toml::de::Error> for FinetuneError {
    fn from(value: toml::de::Error) -> Self {
        FinetuneError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for FinetuneError {
    fn from(value: serde_json::Error) -> Self {
        FinetuneError::ConfigFormat(value.to_string())
    }
}

impl From<tokenizer::Error> for FinetuneError {
    fn from(value: tokenizer::Error) -> Self {
        FinetuneError::Initialization(format!("tokenizer: {}", value))
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> FinetuneError {
    FinetuneError::runtime(err.to_string())
}
