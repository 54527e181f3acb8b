//! Decision forest backend: majority vote over binary decision trees.

use anyhow::{ensure, Result};
use serde::Deserialize;

use super::{check_window, Classifier, ClassifyError};
use crate::features::FeatureWindow;
use crate::Label;

const NUM_CLASSES: usize = 3;

fn default_missing_left() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        /// Branch taken when the feature value is missing (NaN).
        #[serde(default = "default_missing_left")]
        missing_left: bool,
    },
    Leaf {
        leaf: usize,
    },
}

/// Nodes are stored in pre-order; node 0 is the root.
#[derive(Debug, Clone, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    fn classify(&self, row: &[f64]) -> usize {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { leaf } => return *leaf,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    missing_left,
                } => {
                    let value = row[*feature];
                    let go_left = if value.is_nan() {
                        *missing_left
                    } else {
                        value <= *threshold
                    };
                    idx = if go_left { *left } else { *right };
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionForest {
    input_schema: Vec<String>,
    trees: Vec<Tree>,
}

impl DecisionForest {
    pub fn new(input_schema: Vec<String>, trees: Vec<Tree>) -> Result<Self> {
        let forest = Self {
            input_schema,
            trees,
        };
        forest.validate()?;
        Ok(forest)
    }

    /// Structural checks so that `predict` cannot index out of bounds or loop.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.input_schema.is_empty(), "Forest has an empty input schema");
        ensure!(!self.trees.is_empty(), "Forest has no trees");
        for (t, tree) in self.trees.iter().enumerate() {
            ensure!(!tree.nodes.is_empty(), "Tree {} has no nodes", t);
            for (n, node) in tree.nodes.iter().enumerate() {
                match node {
                    Node::Leaf { leaf } => {
                        ensure!(
                            *leaf < NUM_CLASSES,
                            "Tree {} node {}: unknown class {}",
                            t,
                            n,
                            leaf
                        )
                    }
                    Node::Split {
                        feature,
                        threshold,
                        left,
                        right,
                        ..
                    } => {
                        ensure!(
                            *feature < self.input_schema.len(),
                            "Tree {} node {}: feature index {} out of range",
                            t,
                            n,
                            feature
                        );
                        ensure!(!threshold.is_nan(), "Tree {} node {}: NaN threshold", t, n);
                        for child in [left, right] {
                            ensure!(
                                *child > n && *child < tree.nodes.len(),
                                "Tree {} node {}: child {} must follow its parent",
                                t,
                                n,
                                child
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn vote(&self, row: &[f64]) -> usize {
        let mut votes = [0usize; NUM_CLASSES];
        for tree in &self.trees {
            votes[tree.classify(row)] += 1;
        }
        // Ties go to the lowest class index.
        let mut best = 0;
        for class in 1..NUM_CLASSES {
            if votes[class] > votes[best] {
                best = class;
            }
        }
        best
    }
}

impl Classifier for DecisionForest {
    fn name(&self) -> &str {
        "forest"
    }

    fn input_schema(&self) -> &[String] {
        &self.input_schema
    }

    fn accepts_missing(&self) -> bool {
        true
    }

    fn predict(&self, window: &FeatureWindow) -> Result<Vec<Label>, ClassifyError> {
        check_window(window, &self.input_schema)?;
        window
            .rows()
            .iter()
            .map(|row| {
                let class = self.vote(row);
                Label::from_class(class).ok_or(ClassifyError::UnknownClass(class))
            })
            .collect()
    }
}
