use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::features::{FeatureRow, FEATURE_COLUMNS};

/// Classifier output label, rendered `"y"`/`"n"` in artifacts and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    #[serde(rename = "y")]
    Aki,
    #[serde(rename = "n")]
    NotAki,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Aki => "y",
            Label::NotAki => "n",
        }
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, Label::Aki)
    }
}

/// An opaque classifier over the fixed feature vector. Implementations are
/// pure: no state is carried across calls.
pub trait Predictor: Send + Sync {
    fn predict(&self, row: &FeatureRow) -> Label;
}

/// One node of the serialized tree. Split nodes route on
/// `feature <= threshold`: left when true, right otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        label: Label,
    },
}

/// Decision tree loaded from a JSON artifact. Node 0 is the root; child
/// indices must point forward in the node array, so traversal always
/// terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTreeModel {
    nodes: Vec<TreeNode>,
}

impl DecisionTreeModel {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::Model(format!("cannot read model artifact {}: {}", path.display(), e))
        })?;
        let model: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Model(format!("malformed model artifact: {}", e)))?;
        model.validate()?;
        info!("Loaded decision tree model with {} nodes", model.nodes.len());
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Model("model artifact has no nodes".to_string()));
        }
        for (index, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                if *feature >= FEATURE_COLUMNS.len() {
                    return Err(Error::Model(format!(
                        "node {} splits on unknown feature {}",
                        index, feature
                    )));
                }
                if *left >= self.nodes.len() || *right >= self.nodes.len() {
                    return Err(Error::Model(format!(
                        "node {} references an out-of-range child",
                        index
                    )));
                }
                if *left <= index || *right <= index {
                    return Err(Error::Model(format!(
                        "node {} references a backward child; nodes must be topologically ordered",
                        index
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Predictor for DecisionTreeModel {
    fn predict(&self, row: &FeatureRow) -> Label {
        let vector = row.as_vector();
        let mut node = &self.nodes[0];
        loop {
            match node {
                TreeNode::Leaf { label } => return *label,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let next = if vector[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                    node = &self.nodes[next];
                }
            }
        }
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
