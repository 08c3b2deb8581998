use crate::model::LabelMap;
use crate::models::Prediction;

/// Turns a probability vector into thresholded, named, ordered predictions.
pub struct ResultRanker<'a> {
    labels: &'a LabelMap,
}

impl<'a> ResultRanker<'a> {
    pub fn new(labels: &'a LabelMap) -> Self {
        Self { labels }
    }

    /// Rounds every probability to two decimals, keeps those whose rounded
    /// confidence is `>= threshold` and sorts by confidence descending, then
    /// class index ascending. The reported confidence therefore always meets
    /// the threshold it was ranked against.
    pub fn rank(&self, probabilities: &[f32], threshold: f64) -> Vec<Prediction> {
        let mut kept: Vec<(usize, f64)> = probabilities
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_finite())
            .map(|(idx, p)| (idx, round2(*p as f64)))
            .filter(|(_, confidence)| *confidence >= threshold)
            .collect();
        kept.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        kept.into_iter()
            .map(|(idx, confidence)| Prediction {
                id: idx.to_string(),
                name: self.labels.name(idx),
                confidence,
            })
            .collect()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn softmax(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let max_val = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut exps = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for v in values {
        let e = (v - max_val).exp();
        exps.push(e);
        sum += e;
    }
    if sum <= 0.0 || !sum.is_finite() {
        return vec![0.0; values.len()];
    }
    exps.iter().map(|e| e / sum).collect()
}
