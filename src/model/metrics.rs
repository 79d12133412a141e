//! Held-out diagnostics. Reported only; nothing gates on them.

/// Fraction of rows whose thresholded probability matches the label.
pub fn accuracy(labels: &[u8], probabilities: &[f64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let hits = labels
        .iter()
        .zip(probabilities)
        .filter(|&(&y, &p)| u8::from(p >= 0.5) == y)
        .count();
    hits as f64 / labels.len() as f64
}

/// Area under the ROC curve via the Mann-Whitney statistic.
///
/// Tied scores across classes earn half credit. Returns 0.5 when the
/// labels contain a single class.
pub fn roc_auc(labels: &[u8], scores: &[f64]) -> f64 {
    let mut pairs: Vec<(f64, u8)> = scores.iter().copied().zip(labels.iter().copied()).collect();
    let positives = pairs.iter().filter(|(_, y)| *y > 0).count();
    let negatives = pairs.len() - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    // Average ranks, 1-based, shared across ties.
    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < pairs.len() {
        let mut j = i;
        while j + 1 < pairs.len() && pairs[j + 1].0 == pairs[i].0 {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        rank_sum_pos += avg_rank * pairs[i..=j].iter().filter(|(_, y)| *y > 0).count() as f64;
        i = j + 1;
    }

    let p = positives as f64;
    let u = rank_sum_pos - p * (p + 1.0) / 2.0;
    u / (p * negatives as f64)
}
