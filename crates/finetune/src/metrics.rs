use std::collections::{BTreeMap, HashSet};

use crate::config::{TaskType, PAD_TAG};

/// A labelled span `[start, end)` over tag positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    pub label: String,
    pub start: usize,
    pub end: usize,
}

/// Decodes BIO tags into spans.
///
/// `O` and `<PAD>` close any open span. An `I-X` that does not continue an
/// open `X` span starts a new one. Tags without a `B-`/`I-` prefix behave like
/// `I-` tags of their own label.
pub fn extract_spans(tags: &[String]) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut open: Option<(String, usize)> = None;

    for (position, tag) in tags.iter().enumerate() {
        let (begins, label) = match tag.as_str() {
            "O" | PAD_TAG => {
                close_span(&mut spans, &mut open, position);
                continue;
            }
            tag => match tag.split_once('-') {
                Some(("B", label)) => (true, label),
                Some(("I", label)) => (false, label),
                _ => (false, tag),
            },
        };

        let continues = matches!(&open, Some((current, _)) if current == label) && !begins;
        if !continues {
            close_span(&mut spans, &mut open, position);
            open = Some((label.to_string(), position));
        }
    }
    close_span(&mut spans, &mut open, tags.len());
    spans
}

fn close_span(spans: &mut Vec<Span>, open: &mut Option<(String, usize)>, end: usize) {
    if let Some((label, start)) = open.take() {
        spans.push(Span { label, start, end });
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PrecisionRecall {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl PrecisionRecall {
    pub fn from_counts(true_positives: usize, predicted: usize, gold: usize) -> Self {
        let precision = ratio(true_positives, predicted);
        let recall = ratio(true_positives, gold);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            f1,
        }
    }
}

/// Micro-averaged span precision, recall and F1 over aligned tag sequences.
pub fn span_f1(gold: &[Vec<String>], predicted: &[Vec<String>]) -> PrecisionRecall {
    let mut true_positives = 0;
    let mut gold_total = 0;
    let mut predicted_total = 0;

    for (gold_tags, predicted_tags) in gold.iter().zip(predicted) {
        let gold_spans: HashSet<Span> = extract_spans(gold_tags).into_iter().collect();
        let predicted_spans: HashSet<Span> = extract_spans(predicted_tags).into_iter().collect();
        true_positives += gold_spans.intersection(&predicted_spans).count();
        gold_total += gold_spans.len();
        predicted_total += predicted_spans.len();
    }

    PrecisionRecall::from_counts(true_positives, predicted_total, gold_total)
}

pub fn accuracy(gold: &[u32], predicted: &[u32]) -> f64 {
    let correct = gold
        .iter()
        .zip(predicted)
        .filter(|(gold, predicted)| gold == predicted)
        .count();
    ratio(correct, gold.len())
}

/// Unweighted mean of per-class F1 over every class seen in gold or predictions.
pub fn macro_f1(gold: &[u32], predicted: &[u32]) -> f64 {
    let mut counts: BTreeMap<u32, (usize, usize, usize)> = BTreeMap::new();
    for (&gold, &predicted) in gold.iter().zip(predicted) {
        if gold == predicted {
            counts.entry(gold).or_default().0 += 1;
        }
        counts.entry(predicted).or_default().1 += 1;
        counts.entry(gold).or_default().2 += 1;
    }
    if counts.is_empty() {
        return 0.0;
    }
    let total: f64 = counts
        .values()
        .map(|&(tp, predicted, gold)| PrecisionRecall::from_counts(tp, predicted, gold).f1)
        .sum();
    total / counts.len() as f64
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Metrics of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub task_type: TaskType,
    pub examples: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
}

impl EvalReport {
    pub fn tagging(examples: usize, spans: PrecisionRecall) -> Self {
        Self {
            task_type: TaskType::Tagging,
            examples,
            precision: spans.precision,
            recall: spans.recall,
            f1: spans.f1,
            accuracy: 0.0,
        }
    }

    pub fn classification(task_type: TaskType, gold: &[u32], predicted: &[u32]) -> Self {
        Self {
            task_type,
            examples: gold.len(),
            precision: 0.0,
            recall: 0.0,
            f1: macro_f1(gold, predicted),
            accuracy: accuracy(gold, predicted),
        }
    }

    /// Span F1 for tagging, accuracy for classification, macro F1 for span classification.
    pub fn score(&self) -> f64 {
        match self.task_type {
            TaskType::Tagging => self.f1,
            TaskType::Classification => self.accuracy,
            TaskType::SpanClassification => self.f1,
        }
    }

    /// `(name, value)` pairs written to the metric sink.
    pub fn scalars(&self) -> Vec<(&'static str, f64)> {
        match self.task_type {
            TaskType::Tagging => vec![
                ("precision", self.precision),
                ("recall", self.recall),
                ("f1", self.f1),
            ],
            TaskType::Classification | TaskType::SpanClassification => {
                vec![("acc", self.accuracy), ("f1", self.f1)]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bio_spans_open_on_stray_inside_tags() {
        let spans = extract_spans(&tags(&["B-AS", "I-AS", "O", "I-OP", "I-OP", "B-OP", "I-AS"]));
        let labelled: Vec<(&str, usize, usize)> = spans
            .iter()
            .map(|s| (s.label.as_str(), s.start, s.end))
            .collect();
        assert_eq!(
            labelled,
            vec![("AS", 0, 2), ("OP", 3, 5), ("OP", 5, 6), ("AS", 6, 7)]
        );
    }

    #[test]
    fn span_f1_is_micro_averaged() {
        let gold = vec![tags(&["B-AS", "I-AS", "O"]), tags(&["B-OP", "O", "B-AS"])];
        let predicted = vec![tags(&["B-AS", "I-AS", "O"]), tags(&["B-OP", "O", "O"])];
        let scores = span_f1(&gold, &predicted);
        assert_eq!(scores.precision, 1.0);
        assert!((scores.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((scores.f1 - 0.8).abs() < 1e-12);
    }

    #[test]
    fn no_predictions_score_zero() {
        let scores = span_f1(&[tags(&["B-AS"])], &[tags(&["O"])]);
        assert_eq!(scores, PrecisionRecall::default());
    }

    #[test]
    fn classification_scores_follow_task_type() {
        let gold = [0, 0, 1, 1];
        let predicted = [0, 0, 0, 1];
        let report = EvalReport::classification(TaskType::Classification, &gold, &predicted);
        assert_eq!(report.score(), 0.75);

        let span = EvalReport::classification(TaskType::SpanClassification, &gold, &predicted);
        let expected = (0.8 + 2.0 / 3.0) / 2.0;
        assert!((span.score() - expected).abs() < 1e-12);
    }
}
