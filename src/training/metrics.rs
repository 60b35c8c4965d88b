//! Evaluation metrics for causal language modeling
//!
//! Logits are reduced to predicted token ids before accumulation, then
//! scored with next-token accuracy: the prediction at position `t` is
//! compared with the label at `t + 1`.

use ndarray::{Array2, ArrayView1, ArrayView3, Axis};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::constants::files::ALL_RESULTS_NAME;
use crate::error::{Error, Result};

/// Metric name → value
pub type Metrics = BTreeMap<String, f64>;

/// Model output handed to metric computation
#[derive(Debug, Clone)]
pub enum Predictions {
    /// Raw logits of shape `[batch, seq, vocab]`
    Logits(ndarray::Array3<f32>),
    /// Already-reduced token ids of shape `[batch, seq]`
    Ids(Array2<i64>),
}

/// Reduce logits to predicted ids by argmax over the vocabulary axis
///
/// Ties resolve to the lowest index; NaN never wins.
pub fn preprocess_logits_for_metrics(logits: ArrayView3<'_, f32>) -> Array2<i64> {
    logits.map_axis(Axis(2), |row| argmax(row) as i64)
}

fn argmax(row: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &value) in row.iter().enumerate() {
        if value > best_value {
            best = i;
            best_value = value;
        }
    }
    best
}

/// Fraction of equal positions
pub fn accuracy(predictions: &[i64], references: &[i64]) -> Result<f64> {
    if predictions.len() != references.len() {
        return Err(Error::invalid_data(format!(
            "predictions ({}) and references ({}) differ in length",
            predictions.len(),
            references.len()
        )));
    }
    if predictions.is_empty() {
        return Ok(0.0);
    }
    let correct = predictions
        .iter()
        .zip(references)
        .filter(|(p, r)| p == r)
        .count();
    Ok(correct as f64 / predictions.len() as f64)
}

/// Shifted next-token accuracy
///
/// Labels drop their first position and predictions their last; both are
/// then flattened and compared.
pub fn compute_metrics(predictions: &Predictions, labels: &Array2<i64>) -> Result<Metrics> {
    let ids = match predictions {
        Predictions::Logits(logits) => preprocess_logits_for_metrics(logits.view()),
        Predictions::Ids(ids) => ids.clone(),
    };
    if ids.shape() != labels.shape() {
        return Err(Error::invalid_data(format!(
            "prediction shape {:?} does not match label shape {:?}",
            ids.shape(),
            labels.shape()
        )));
    }

    let seq = labels.ncols();
    let mut flat_predictions = Vec::new();
    let mut flat_labels = Vec::new();
    if seq > 1 {
        for (pred_row, label_row) in ids.outer_iter().zip(labels.outer_iter()) {
            flat_predictions.extend(pred_row.iter().take(seq - 1).copied());
            flat_labels.extend(label_row.iter().skip(1).copied());
        }
    }

    let mut metrics = Metrics::new();
    metrics.insert("accuracy".to_string(), accuracy(&flat_predictions, &flat_labels)?);
    Ok(metrics)
}

/// Perplexity from mean token cross-entropy; overflow reports infinity
pub fn perplexity(loss: f64) -> f64 {
    let value = loss.exp();
    if value.is_finite() {
        value
    } else {
        f64::INFINITY
    }
}

/// Bundles the two hooks a trainer calls during evaluation
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsEngine;

impl MetricsEngine {
    pub fn preprocess_logits(&self, logits: ArrayView3<'_, f32>) -> Array2<i64> {
        preprocess_logits_for_metrics(logits)
    }

    pub fn compute(&self, predictions: &Predictions, labels: &Array2<i64>) -> Result<Metrics> {
        compute_metrics(predictions, labels)
    }
}

/// Log every metric of a split, in key order
pub fn log_metrics(split: &str, metrics: &Metrics) {
    info!("***** {} metrics *****", split);
    for (key, value) in metrics {
        info!("  {} = {}", key, value);
    }
}

fn to_json(metrics: &Metrics) -> Map<String, Value> {
    metrics
        .iter()
        .map(|(k, v)| {
            let value = serde_json::Number::from_f64(*v)
                .map(Value::Number)
                // JSON has no infinity; keep it readable
                .unwrap_or_else(|| Value::String(v.to_string()));
            (k.clone(), value)
        })
        .collect()
}

/// Write `<split>_results.json` and merge into `all_results.json`
pub fn save_metrics(output_dir: &Path, split: &str, metrics: &Metrics) -> Result<()> {
    fs::create_dir_all(output_dir)?;
    let split_json = to_json(metrics);
    fs::write(
        output_dir.join(format!("{}_results.json", split)),
        serde_json::to_string_pretty(&split_json)?,
    )?;

    let all_path = output_dir.join(ALL_RESULTS_NAME);
    let mut all: Map<String, Value> = if all_path.exists() {
        serde_json::from_str(&fs::read_to_string(&all_path)?)?
    } else {
        Map::new()
    };
    all.extend(split_json);
    fs::write(&all_path, serde_json::to_string_pretty(&all)?)?;
    Ok(())
}
