use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RetrievalError;

pub const DEFAULT_C: f64 = 1.0;
pub const LEARNING_RATE: f64 = 0.1;
pub const MAX_ITER: usize = 1000;
pub const TOLERANCE: f64 = 1e-6;

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Binary logistic regression on standardized features with L2 penalty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    /// `[negative, positive]` class labels.
    pub classes: [i64; 2],
    pub weights: Vec<f64>,
    pub bias: f64,
    pub feature_mean: Vec<f64>,
    pub feature_std: Vec<f64>,
    pub iterations: usize,
}

impl LogisticRegression {
    /// Fit on rows `x` with targets `y`; `labels[1]` is the positive class.
    pub fn fit(x: &[Vec<f64>], y: &[i64], labels: &[i64]) -> Result<Self> {
        let classes = match labels {
            [neg, pos] if neg != pos => [*neg, *pos],
            _ => {
                return Err(RetrievalError::InvalidLabels(format!(
                    "expected two distinct labels, got {labels:?}"
                ))
                .into())
            }
        };
        if x.len() != y.len() || x.is_empty() {
            return Err(RetrievalError::InvalidArgument(format!(
                "{} feature rows for {} targets",
                x.len(),
                y.len()
            ))
            .into());
        }
        if let Some(bad) = y.iter().find(|&&v| !classes.contains(&v)) {
            return Err(RetrievalError::InvalidLabels(format!(
                "target {bad} is not one of {classes:?}"
            ))
            .into());
        }
        if !classes.iter().all(|c| y.contains(c)) {
            return Err(RetrievalError::InvalidLabels(format!(
                "training targets must contain both classes {classes:?}"
            ))
            .into());
        }

        let n = x.len();
        let d = x[0].len();
        if x.iter().any(|row| row.len() != d) {
            return Err(
                RetrievalError::InvalidArgument("ragged feature rows".to_string()).into(),
            );
        }

        let raw = DMatrix::from_fn(n, d, |i, j| x[i][j]);
        let feature_mean: Vec<f64> = (0..d).map(|j| raw.column(j).mean()).collect();
        let feature_std: Vec<f64> = (0..d)
            .map(|j| {
                let sd = raw.column(j).variance().sqrt();
                if sd > 0.0 {
                    sd
                } else {
                    1.0
                }
            })
            .collect();
        let xs = DMatrix::from_fn(n, d, |i, j| (raw[(i, j)] - feature_mean[j]) / feature_std[j]);
        let target = DVector::from_iterator(
            n,
            y.iter().map(|&v| if v == classes[1] { 1.0 } else { 0.0 }),
        );

        let penalty = 1.0 / (DEFAULT_C * n as f64);
        let mut w = DVector::<f64>::zeros(d);
        let mut b = 0.0f64;
        let mut iterations = 0;

        for it in 0..MAX_ITER {
            iterations = it + 1;
            let z = &xs * &w;
            let residual = DVector::from_iterator(
                n,
                z.iter().zip(target.iter()).map(|(&z, &t)| sigmoid(z + b) - t),
            );

            let grad_w = xs.transpose() * &residual / n as f64 + &w * penalty;
            let grad_b = residual.sum() / n as f64;

            w -= &grad_w * LEARNING_RATE;
            b -= grad_b * LEARNING_RATE;

            if (grad_w.norm_squared() + grad_b * grad_b).sqrt() < TOLERANCE {
                break;
            }
        }
        debug!(iterations, "logistic regression converged");

        Ok(Self {
            classes,
            weights: w.iter().copied().collect(),
            bias: b,
            feature_mean,
            feature_std,
            iterations,
        })
    }

    fn decision(&self, row: &[f64]) -> f64 {
        row.iter()
            .zip(&self.weights)
            .zip(self.feature_mean.iter().zip(&self.feature_std))
            .map(|((x, w), (m, s))| w * (x - m) / s)
            .sum::<f64>()
            + self.bias
    }

    /// Probability of the positive class for each row.
    pub fn predict_proba(&self, x: &[Vec<f64>]) -> Vec<f64> {
        x.iter().map(|row| sigmoid(self.decision(row))).collect()
    }

    pub fn predict(&self, x: &[Vec<f64>]) -> Vec<i64> {
        self.predict_proba(x)
            .into_iter()
            .map(|p| if p >= 0.5 { self.classes[1] } else { self.classes[0] })
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .context("serialize logistic regression")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parse logistic regression {}", path.display()))
    }
}
