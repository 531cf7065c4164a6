use std::{collections::HashMap, fs, path::Path};

use tokenizer::SubwordTokenizer;

use crate::config::{FinetuneError, TaskConfig, TaskType, PAD_TAG};

use super::Result;

/// Sequence cap for validation and test sets, which are not truncated to `max_len`.
pub const EVAL_MAX_LEN: usize = 512;

/// Labels of one encoded example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Labels {
    /// One label per sub-token, 0 off the heads.
    PerToken(Vec<u32>),
    /// One label for the whole example.
    Single(u32),
}

/// One example after tokenization, aligned position by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub words: Vec<String>,
    pub input_ids: Vec<u32>,
    pub is_heads: Vec<u8>,
    pub tags: Vec<String>,
    pub labels: Labels,
}

impl Example {
    pub fn seqlen(&self) -> usize {
        self.input_ids.len()
    }
}

/// A record as read from a dataset file, before tokenization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawExample {
    Tagged {
        words: Vec<String>,
        tags: Vec<String>,
    },
    Text {
        text: String,
        span: Option<String>,
        label: String,
    },
}

/// Encoded examples of one split of one task.
#[derive(Debug, Clone)]
pub struct TaskDataset {
    task: String,
    task_type: TaskType,
    label_vocab: Vec<String>,
    examples: Vec<Example>,
}

impl TaskDataset {
    /// Reads `path` in the format of `task`'s type and encodes every record.
    pub fn load(
        path: impl AsRef<Path>,
        task: &TaskConfig,
        tokenizer: &SubwordTokenizer,
        max_len: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            FinetuneError::initialization(format!("cannot read {}: {}", path.display(), err))
        })?;
        let records = parse_records(&contents, task.task_type, &path.display().to_string())?;
        let dataset = Self::encode(records, task, tokenizer, max_len)?;
        log::info!(
            "loaded {} example(s) for task '{}' from {}",
            dataset.len(),
            task.name,
            path.display()
        );
        Ok(dataset)
    }

    pub fn encode(
        records: Vec<RawExample>,
        task: &TaskConfig,
        tokenizer: &SubwordTokenizer,
        max_len: usize,
    ) -> Result<Self> {
        let label_vocab = task.label_vocab();
        let examples = {
            let encoder = ExampleEncoder::new(tokenizer, &label_vocab, max_len)?;
            records
                .into_iter()
                .map(|record| encoder.encode(record))
                .collect::<Result<Vec<_>>>()?
        };

        Ok(Self {
            task: task.name.clone(),
            task_type: task.task_type,
            label_vocab,
            examples,
        })
    }

    pub fn from_parts(
        task: impl Into<String>,
        task_type: TaskType,
        label_vocab: Vec<String>,
        examples: Vec<Example>,
    ) -> Self {
        Self {
            task: task.into(),
            task_type,
            label_vocab,
            examples,
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn label_vocab(&self) -> &[String] {
        &self.label_vocab
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

/// Splits a dataset file into records.
///
/// Tagging files hold `word tag` lines with blank lines between examples.
/// Classification files hold `text<TAB>label` lines and span classification
/// files `text<TAB>span<TAB>label` lines.
pub fn parse_records(contents: &str, task_type: TaskType, source: &str) -> Result<Vec<RawExample>> {
    match task_type {
        TaskType::Tagging => parse_conll(contents, source),
        TaskType::Classification => parse_tab_separated(contents, source, false),
        TaskType::SpanClassification => parse_tab_separated(contents, source, true),
    }
}

fn parse_conll(contents: &str, source: &str) -> Result<Vec<RawExample>> {
    let mut records = Vec::new();
    let mut words = Vec::new();
    let mut tags = Vec::new();

    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            flush_tagged(&mut records, &mut words, &mut tags);
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            return Err(format_error(source, line_no, "expected 'word tag'"));
        }
        words.push(fields[0].to_string());
        tags.push(fields[fields.len() - 1].to_string());
    }
    flush_tagged(&mut records, &mut words, &mut tags);
    Ok(records)
}

fn flush_tagged(records: &mut Vec<RawExample>, words: &mut Vec<String>, tags: &mut Vec<String>) {
    if words.is_empty() {
        return;
    }
    records.push(RawExample::Tagged {
        words: std::mem::take(words),
        tags: std::mem::take(tags),
    });
}

fn parse_tab_separated(contents: &str, source: &str, with_span: bool) -> Result<Vec<RawExample>> {
    let expected = if with_span { 3 } else { 2 };
    let mut records = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        if fields.len() != expected {
            let layout = if with_span {
                "expected 'text<TAB>span<TAB>label'"
            } else {
                "expected 'text<TAB>label'"
            };
            return Err(format_error(source, line_no, layout));
        }
        records.push(RawExample::Text {
            text: fields[0].to_string(),
            span: with_span.then(|| fields[1].to_string()),
            label: fields[expected - 1].to_string(),
        });
    }
    Ok(records)
}

fn format_error(source: &str, line_no: usize, message: &str) -> FinetuneError {
    FinetuneError::ConfigFormat(format!("{}:{}: {}", source, line_no + 1, message))
}

struct ExampleEncoder<'a> {
    tokenizer: &'a SubwordTokenizer,
    label_index: HashMap<&'a str, u32>,
    max_len: usize,
}

impl<'a> ExampleEncoder<'a> {
    fn new(tokenizer: &'a SubwordTokenizer, label_vocab: &'a [String], max_len: usize) -> Result<Self> {
        if max_len < 3 {
            return Err(FinetuneError::initialization(
                "max_len must leave room for the structural tokens",
            ));
        }
        let label_index = label_vocab
            .iter()
            .enumerate()
            .map(|(index, label)| (label.as_str(), index as u32))
            .collect();
        Ok(Self {
            tokenizer,
            label_index,
            max_len,
        })
    }

    fn encode(&self, record: RawExample) -> Result<Example> {
        match record {
            RawExample::Tagged { words, tags } => self.encode_tagged(words, tags),
            RawExample::Text { text, span, label } => self.encode_text(&text, span.as_deref(), label),
        }
    }

    fn label_id(&self, label: &str) -> Result<u32> {
        self.label_index.get(label).copied().ok_or_else(|| {
            FinetuneError::validation(vec![format!("label '{}' is not in the task vocab", label)])
        })
    }

    fn encode_tagged(&self, words: Vec<String>, tags: Vec<String>) -> Result<Example> {
        let specials = self.tokenizer.special_tokens();
        let ids = self.tokenizer.special_ids();

        let mut all_words = Vec::with_capacity(words.len() + 2);
        all_words.push(specials.cls.clone());
        all_words.extend(words);
        all_words.push(specials.sep.clone());

        let mut all_tags = Vec::with_capacity(tags.len() + 2);
        all_tags.push(PAD_TAG.to_string());
        all_tags.extend(tags);
        all_tags.push(PAD_TAG.to_string());

        let mut input_ids = Vec::new();
        let mut is_heads = Vec::new();
        let mut labels = Vec::new();
        for (word, tag) in all_words.iter().zip(&all_tags) {
            let tag_id = self.label_id(tag)?;
            let pieces = self.tokenizer.tokenize_word(word)?;
            for (index, piece) in pieces.into_iter().enumerate() {
                input_ids.push(piece);
                is_heads.push(u8::from(index == 0));
                labels.push(if index == 0 { tag_id } else { 0 });
            }
        }

        if input_ids.len() > self.max_len {
            input_ids.truncate(self.max_len - 1);
            is_heads.truncate(self.max_len - 1);
            labels.truncate(self.max_len - 1);
            input_ids.push(ids.sep);
            is_heads.push(1);
            labels.push(0);
        }

        Ok(Example {
            words: all_words,
            input_ids,
            is_heads,
            tags: all_tags,
            labels: Labels::PerToken(labels),
        })
    }

    fn encode_text(&self, text: &str, span: Option<&str>, label: String) -> Result<Example> {
        let label_id = self.label_id(&label)?;
        let specials = self.tokenizer.special_tokens();
        let ids = self.tokenizer.special_ids();

        let mut text_ids = self.tokenize_words(text)?;
        let mut span_ids = match span {
            Some(span) => self.tokenize_words(span)?,
            None => Vec::new(),
        };

        let structural = if span.is_some() { 3 } else { 2 };
        let budget = self.max_len - structural;
        if text_ids.len() + span_ids.len() > budget {
            let text_budget = budget.saturating_sub(span_ids.len()).max(budget / 2);
            text_ids.truncate(text_budget);
            span_ids.truncate(budget - text_ids.len());
        }

        let mut words = vec![specials.cls.clone()];
        words.extend(text.split_whitespace().map(str::to_string));
        words.push(specials.sep.clone());

        let mut input_ids = Vec::with_capacity(self.max_len);
        input_ids.push(ids.cls);
        input_ids.extend(text_ids);
        input_ids.push(ids.sep);
        if let Some(span) = span {
            words.extend(span.split_whitespace().map(str::to_string));
            words.push(specials.sep.clone());
            input_ids.extend(span_ids);
            input_ids.push(ids.sep);
        }

        Ok(Example {
            words,
            is_heads: vec![1; input_ids.len()],
            input_ids,
            tags: vec![label],
            labels: Labels::Single(label_id),
        })
    }

    fn tokenize_words(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for word in text.split_whitespace() {
            ids.extend(self.tokenizer.tokenize_word(word)?);
        }
        Ok(ids)
    }
}
