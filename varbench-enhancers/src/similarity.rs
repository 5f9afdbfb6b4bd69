//! Token-overlap similarity for dev-set scoring.
//!
//! When the evolutionary search is configured with a reference dev set,
//! candidates are scored by unigram F1 between each produced output and its
//! reference, averaged over the set.

use std::collections::HashMap;

fn unigram_counts(text: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for token in text.split_whitespace() {
        *counts.entry(token.to_lowercase()).or_insert(0) += 1;
    }
    counts
}

/// Unigram F1 between a prediction and a reference, in [0, 1].
pub fn unigram_f1(prediction: &str, reference: &str) -> f64 {
    let pred = unigram_counts(prediction);
    let reference = unigram_counts(reference);
    let pred_total: usize = pred.values().sum();
    let ref_total: usize = reference.values().sum();
    if pred_total == 0 || ref_total == 0 {
        return 0.0;
    }
    let overlap: usize = pred
        .iter()
        .map(|(token, count)| count.min(reference.get(token).unwrap_or(&0)))
        .sum();
    2.0 * overlap as f64 / (pred_total + ref_total) as f64
}

/// Mean unigram F1 over paired predictions and references. Unpaired entries
/// on either side are ignored; an empty pairing scores 0.
pub fn mean_unigram_f1(predictions: &[String], references: &[String]) -> f64 {
    let paired: Vec<f64> = predictions
        .iter()
        .zip(references)
        .map(|(pred, reference)| unigram_f1(pred, reference))
        .collect();
    if paired.is_empty() {
        return 0.0;
    }
    paired.iter().sum::<f64>() / paired.len() as f64
}
