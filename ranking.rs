use crate::labels::LabelTable;
use crate::models::ClassificationResult;
use std::cmp::Ordering;

/// Labels every output index and keeps the `k` most confident, best first.
///
/// Confidences pass through untouched. Equal confidences keep index order.
/// NaN outputs sort last.
pub fn rank(output: &[f32], labels: &LabelTable, k: usize) -> Vec<ClassificationResult> {
    if k == 0 {
        return Vec::new();
    }
    let mut scored: Vec<(usize, f32)> = output.iter().copied().enumerate().collect();
    scored.sort_by(|a, b| descending(a.1, b.1));
    scored.truncate(k);
    scored
        .into_iter()
        .map(|(index, confidence)| ClassificationResult::new(labels.label_for(index), confidence))
        .collect()
}

fn descending(a: f32, b: f32) -> Ordering {
    sort_key(b).total_cmp(&sort_key(a))
}

fn sort_key(value: f32) -> f32 {
    if value.is_nan() {
        f32::NEG_INFINITY
    } else if value == 0.0 {
        // folds -0.0 into 0.0 so the two tie
        0.0
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::UNKNOWN_LABEL;

    fn labels(n: usize) -> LabelTable {
        (0..n).map(|i| format!("class_{i}")).collect()
    }

    #[test]
    fn returns_top_k_in_descending_order() {
        let output = [0.1, 0.4, 0.05, 0.3, 0.15];
        let ranked = rank(&output, &labels(5), 3);
        let names: Vec<&str> = ranked.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(names, ["class_1", "class_3", "class_4"]);
        assert_eq!(ranked[0].confidence, 0.4);
    }

    #[test]
    fn length_is_min_of_k_and_output() {
        assert_eq!(rank(&[0.5, 0.5], &labels(2), 5).len(), 2);
        assert_eq!(rank(&[0.2; 1000], &labels(1000), 5).len(), 5);
        assert!(rank(&[], &labels(3), 5).is_empty());
        assert!(rank(&[0.9, 0.1], &labels(2), 0).is_empty());
    }

    #[test]
    fn returned_confidences_match_claimed_index() {
        let output: Vec<f32> = (0..50).map(|i| ((i * 37) % 50) as f32 / 50.0).collect();
        let table = labels(50);
        let ranked = rank(&output, &table, 10);
        for pair in ranked.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
        for result in &ranked {
            let index: usize = result.label.trim_start_matches("class_").parse().unwrap();
            assert_eq!(output[index], result.confidence);
        }
    }

    #[test]
    fn ties_keep_index_order() {
        let output = [0.2, 0.5, 0.2, 0.5, 0.0, -0.0];
        let ranked = rank(&output, &labels(6), 6);
        let names: Vec<&str> = ranked.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(
            names,
            ["class_1", "class_3", "class_0", "class_2", "class_4", "class_5"]
        );
    }

    #[test]
    fn indices_beyond_labels_are_unknown() {
        let output = [0.1, 0.2, 0.7];
        let ranked = rank(&output, &labels(2), 5);
        assert_eq!(ranked[0].label, UNKNOWN_LABEL);
        assert_eq!(ranked[0].confidence, 0.7);
        assert_eq!(ranked[1].label, "class_1");
    }

    #[test]
    fn nan_sorts_last() {
        let ranked = rank(&[f32::NAN, 0.3, 0.6], &labels(3), 3);
        assert_eq!(ranked[0].label, "class_2");
        assert_eq!(ranked[1].label, "class_1");
        assert!(ranked[2].confidence.is_nan());
    }

    #[test]
    fn retriever_scenario() {
        let mut names = vec![
            "golden retriever".to_string(),
            "Labrador retriever".to_string(),
            "cocker spaniel".to_string(),
        ];
        names.extend((3..1000).map(|i| format!("class_{i}")));
        let table = LabelTable::new(names);
        let mut output = vec![0.0001f32; 1000];
        output[0] = 0.89;
        output[1] = 0.05;
        output[2] = 0.03;

        let ranked = rank(&output, &table, 5);
        assert_eq!(ranked.len(), 5);
        assert_eq!(
            &ranked[..3],
            &[
                ClassificationResult::new("golden retriever", 0.89),
                ClassificationResult::new("Labrador retriever", 0.05),
                ClassificationResult::new("cocker spaniel", 0.03),
            ]
        );
    }
}
