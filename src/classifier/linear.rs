//! Single-layer softmax estimator over standardized features.

use anyhow::{ensure, Result};
use serde::Deserialize;

use super::{check_window, Classifier, ClassifyError};
use crate::features::FeatureWindow;
use crate::Label;

#[derive(Debug, Clone, Deserialize)]
pub struct LinearModel {
    input_schema: Vec<String>,
    /// One weight vector per class, each as long as the schema.
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
    #[serde(default)]
    mean: Option<Vec<f64>>,
    #[serde(default)]
    std: Option<Vec<f64>>,
}

impl LinearModel {
    pub fn new(input_schema: Vec<String>, weights: Vec<Vec<f64>>, bias: Vec<f64>) -> Result<Self> {
        let model = Self {
            input_schema,
            weights,
            bias,
            mean: None,
            std: None,
        };
        model.validate()?;
        Ok(model)
    }

    pub fn with_standardization(mut self, mean: Vec<f64>, std: Vec<f64>) -> Result<Self> {
        self.mean = Some(mean);
        self.std = Some(std);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let width = self.input_schema.len();
        ensure!(width > 0, "Linear model has an empty input schema");
        ensure!(
            self.weights.len() == 3 && self.bias.len() == 3,
            "Linear model must have exactly three classes"
        );
        for (class, w) in self.weights.iter().enumerate() {
            ensure!(
                w.len() == width,
                "Class {} has {} weights for {} features",
                class,
                w.len(),
                width
            );
        }
        if let Some(mean) = &self.mean {
            ensure!(mean.len() == width, "Mean vector does not match the schema");
        }
        if let Some(std) = &self.std {
            ensure!(std.len() == width, "Std vector does not match the schema");
            ensure!(
                std.iter().all(|s| *s > 0.0),
                "Std vector must be strictly positive"
            );
        }
        Ok(())
    }

    fn standardize(&self, idx: usize, value: f64) -> f64 {
        let mean = self.mean.as_ref().map_or(0.0, |m| m[idx]);
        let std = self.std.as_ref().map_or(1.0, |s| s[idx]);
        (value - mean) / std
    }

    fn classify(&self, row: &[f64]) -> Result<usize, ClassifyError> {
        let x: Vec<f64> = row
            .iter()
            .enumerate()
            .map(|(i, v)| self.standardize(i, *v))
            .collect();

        let mut best: Option<(usize, f64)> = None;
        for (class, (w, b)) in self.weights.iter().zip(&self.bias).enumerate() {
            let logit = w.iter().zip(&x).map(|(w, x)| w * x).sum::<f64>() + b;
            if !logit.is_finite() {
                return Err(ClassifyError::Model(format!(
                    "non-finite logit {} for class {}",
                    logit, class
                )));
            }
            if best.map_or(true, |(_, top)| logit > top) {
                best = Some((class, logit));
            }
        }
        best.map(|(class, _)| class)
            .ok_or_else(|| ClassifyError::Model("no classes".to_string()))
    }
}

impl Classifier for LinearModel {
    fn name(&self) -> &str {
        "linear"
    }

    fn input_schema(&self) -> &[String] {
        &self.input_schema
    }

    fn predict(&self, window: &FeatureWindow) -> Result<Vec<Label>, ClassifyError> {
        check_window(window, &self.input_schema)?;
        window
            .rows()
            .iter()
            .map(|row| {
                let class = self.classify(row)?;
                Label::from_class(class).ok_or(ClassifyError::UnknownClass(class))
            })
            .collect()
    }
}
