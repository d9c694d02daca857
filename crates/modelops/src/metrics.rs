use crate::ClassMetrics;

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Binary classification metrics with class 1 as positive. Undefined ratios
/// (no predicted or no actual positives) are reported as 0.
pub fn evaluate(truth: &[u8], predicted: &[u8]) -> ClassMetrics {
    let (mut tp, mut fp, mut tn, mut fn_) = (0, 0, 0, 0);
    for (&t, &p) in truth.iter().zip(predicted) {
        match (t, p) {
            (1, 1) => tp += 1,
            (0, 1) => fp += 1,
            (1, _) => fn_ += 1,
            _ => tn += 1,
        }
    }

    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1_score = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    ClassMetrics {
        accuracy: ratio(tp + tn, truth.len()),
        precision,
        recall,
        f1_score,
        true_positives: tp,
        false_positives: fp,
        true_negatives: tn,
        false_negatives: fn_,
    }
}

pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confusion_and_scores() {
        let truth = [1, 1, 1, 0, 0, 0, 0, 1];
        let pred = [1, 1, 0, 0, 1, 0, 0, 1];
        let m = evaluate(&truth, &pred);
        assert_eq!(
            (m.true_positives, m.false_positives, m.true_negatives, m.false_negatives),
            (3, 1, 3, 1)
        );
        assert_eq!(m.accuracy, 0.75);
        assert_eq!(m.precision, 0.75);
        assert_eq!(m.recall, 0.75);
        assert!((m.f1_score - 0.75).abs() < 1e-12);
    }

    #[test]
    fn no_positive_predictions_scores_zero() {
        let m = evaluate(&[1, 0, 1], &[0, 0, 0]);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.recall, 0.0);
        assert_eq!(m.f1_score, 0.0);
    }

    #[test]
    fn mean_and_population_std() {
        let (m, s) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(m, 5.0);
        assert_eq!(s, 2.0);
    }
}
