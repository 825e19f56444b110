use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: String,
    pub confidence: f32,
}

impl ClassificationResult {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Ranked results of one pipeline run plus the time spent inside the model.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub results: Vec<ClassificationResult>,
    /// Forward pass only; preprocessing is not counted.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "elapsed_ms")]
    pub elapsed: Duration,
    pub classified_at: DateTime<Utc>,
}

impl Classification {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }

    pub fn top(&self) -> Option<&ClassificationResult> {
        self.results.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_serializes_as_whole_milliseconds() {
        let classification = Classification {
            results: vec![ClassificationResult::new("tabby", 0.75)],
            elapsed: Duration::from_millis(12),
            classified_at: Utc::now(),
        };
        let value = serde_json::to_value(&classification).unwrap();
        assert_eq!(value["elapsed_ms"], 12);
        assert_eq!(value["results"][0]["label"], "tabby");
        assert_eq!(classification.elapsed_ms(), 12);
    }
}
