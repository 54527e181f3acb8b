//! Uniform prediction contract over the fairness classifier backends

pub mod forest;
pub mod linear;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::error::Severity;
use crate::features::FeatureWindow;
use crate::Label;

pub use forest::DecisionForest;
pub use linear::LinearModel;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("feature window is empty")]
    EmptyWindow,
    #[error("feature window columns {found:?} do not match input schema {expected:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("row {row} has {found} values but the schema has {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("model produced {found} labels for {expected} rows")]
    PredictionCount { expected: usize, found: usize },
    #[error("model produced unknown class {0}")]
    UnknownClass(usize),
    #[error("model failure: {0}")]
    Model(String),
}

impl ClassifyError {
    /// Precondition violations on the input window are recoverable; anything
    /// the model itself gets wrong is not.
    pub fn severity(&self) -> Severity {
        match self {
            Self::EmptyWindow | Self::SchemaMismatch { .. } | Self::RaggedRow { .. } => {
                Severity::Recoverable
            }
            Self::PredictionCount { .. } | Self::UnknownClass(_) | Self::Model(_) => {
                Severity::Fatal
            }
        }
    }
}

/// A fairness classifier.
pub trait Classifier: Send {
    fn name(&self) -> &str;

    /// Ordered feature names the model expects as columns.
    fn input_schema(&self) -> &[String];

    /// Whether the model handles NaN inputs natively.
    fn accepts_missing(&self) -> bool {
        false
    }

    /// One label per row of `window`.
    fn predict(&self, window: &FeatureWindow) -> Result<Vec<Label>, ClassifyError>;
}

/// Validate `window` against `schema` before handing it to a model.
pub fn check_window(window: &FeatureWindow, schema: &[String]) -> Result<(), ClassifyError> {
    if window.is_empty() {
        return Err(ClassifyError::EmptyWindow);
    }
    if window.names() != schema {
        return Err(ClassifyError::SchemaMismatch {
            expected: schema.to_vec(),
            found: window.names().to_vec(),
        });
    }
    for (row, values) in window.rows().iter().enumerate() {
        if values.len() != schema.len() {
            return Err(ClassifyError::RaggedRow {
                row,
                expected: schema.len(),
                found: values.len(),
            });
        }
    }
    Ok(())
}

/// Reduce per-row labels to the label acted upon: the most recent row's.
pub fn condense(labels: &[Label]) -> Result<Label, ClassifyError> {
    labels.last().copied().ok_or(ClassifyError::PredictionCount {
        expected: 1,
        found: 0,
    })
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Artifact {
    Forest(DecisionForest),
    Linear(LinearModel),
}

/// Load a serialized classifier from `path`.
pub fn load_classifier(path: impl AsRef<Path>) -> Result<Box<dyn Classifier>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Model does not exist: {:?}", path))?;
    let artifact: Artifact = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse model artifact {:?}", path))?;

    let classifier: Box<dyn Classifier> = match artifact {
        Artifact::Forest(forest) => {
            forest.validate()?;
            Box::new(forest)
        }
        Artifact::Linear(linear) => {
            linear.validate()?;
            Box::new(linear)
        }
    };
    info!(
        "Loaded {} classifier from {:?} with {} input features",
        classifier.name(),
        path,
        classifier.input_schema().len()
    );
    Ok(classifier)
}
