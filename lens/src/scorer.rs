//! Evaluation scoring: predicted labels, per-row verdicts and aggregate accuracy.

use serde::{Deserialize, Serialize};

use crate::common::SampleRecord;

/// The winning class of a prediction and its score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub label: usize,
    pub confidence: f64,
}

impl Prediction {
    /// Confidence as a percentage rounded to one decimal, as shown in reports.
    pub fn confidence_percent(&self) -> String {
        format!("{:.1}", self.confidence * 100.0)
    }
}

/// Index and value of the maximum score. Ties keep the earliest index.
pub fn argmax(scores: &[f64]) -> Option<Prediction> {
    let (&first, rest) = scores.split_first()?;
    let mut best = Prediction {
        label: 0,
        confidence: first,
    };
    for (i, &v) in rest.iter().enumerate() {
        if v > best.confidence {
            best = Prediction {
                label: i + 1,
                confidence: v,
            };
        }
    }
    Some(best)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Verdict {
    Correct,
    Incorrect,
    /// The row carries no prediction, so nothing can be compared.
    NoVerdict,
}

/// Score one record. A missing ground-truth label never matches.
pub fn verdict(record: &SampleRecord) -> Verdict {
    match argmax(&record.predicted_distribution) {
        None => Verdict::NoVerdict,
        Some(p) => {
            let matches = record
                .true_label
                .and_then(|l| usize::try_from(l).ok())
                .is_some_and(|l| l == p.label);
            if matches {
                Verdict::Correct
            } else {
                Verdict::Incorrect
            }
        }
    }
}

/// How rows without a prediction enter the accuracy aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoVerdictPolicy {
    /// Counted in the denominator and reported as incorrect.
    #[default]
    CountAsIncorrect,
    /// Left out of the denominator and out of the incorrect count.
    Exclude,
}

impl std::str::FromStr for NoVerdictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "incorrect" | "count_as_incorrect" => Ok(Self::CountAsIncorrect),
            "exclude" => Ok(Self::Exclude),
            other => Err(format!(
                "unknown no-verdict policy '{other}' (expected 'incorrect' or 'exclude')"
            )),
        }
    }
}

/// Aggregate scores over a record set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationSummary {
    /// Every record, including those without a verdict.
    pub total: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub no_verdict: usize,
    /// Percentage rounded to two decimals; 0 when nothing can be scored.
    pub accuracy: f64,
    pub policy: NoVerdictPolicy,
}

pub fn summarize(records: &[SampleRecord], policy: NoVerdictPolicy) -> EvaluationSummary {
    let mut correct = 0usize;
    let mut wrong = 0usize;
    let mut no_verdict = 0usize;
    for record in records {
        match verdict(record) {
            Verdict::Correct => correct += 1,
            Verdict::Incorrect => wrong += 1,
            Verdict::NoVerdict => no_verdict += 1,
        }
    }

    let total = records.len();
    let (denominator, incorrect) = match policy {
        NoVerdictPolicy::CountAsIncorrect => (total, total - correct),
        NoVerdictPolicy::Exclude => (total - no_verdict, wrong),
    };
    let accuracy = if denominator == 0 {
        0.0
    } else {
        round2(correct as f64 / denominator as f64 * 100.0)
    };

    EvaluationSummary {
        total,
        correct,
        incorrect,
        no_verdict,
        accuracy,
        policy,
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
