//! Adapter target resolution
//!
//! Walks a model's module tree and collects the short names of every layer
//! eligible for a low-rank adapter. The output head is never a target.

use std::collections::BTreeSet;
use tracing::debug;

use crate::config::QuantMode;
use crate::constants::lora::OUTPUT_HEAD_MARKER;

/// What a module is, as far as adapter injection is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Linear,
    /// Linear layer with int8 weights
    Linear8bit,
    /// Linear layer with packed 4-bit weights
    Linear4bit,
    Embedding,
    Norm,
    /// Pure container or anything else
    Other,
}

impl Capability {
    /// Whether a module with this capability is targeted under `quant`
    ///
    /// Quantized linear layers are still linear layers, so without
    /// quantization every linear flavour counts.
    pub fn is_target_for(&self, quant: QuantMode) -> bool {
        match quant {
            QuantMode::None => matches!(
                self,
                Capability::Linear | Capability::Linear8bit | Capability::Linear4bit
            ),
            QuantMode::Int8 => *self == Capability::Linear8bit,
            QuantMode::Int4 => *self == Capability::Linear4bit,
        }
    }
}

/// A node of a model's module hierarchy
pub trait ModuleNode {
    /// Local name (one path segment); empty for the root
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    fn children(&self) -> Vec<&dyn ModuleNode>;
}

/// Short names of all adapter-eligible layers, sorted and deduplicated
///
/// A layer is eligible when its capability matches `quant` and its fully
/// qualified name does not contain the output head marker.
pub fn find_all_linear_names(root: &dyn ModuleNode, quant: QuantMode) -> Vec<String> {
    let mut names = BTreeSet::new();
    let mut stack: Vec<(String, &dyn ModuleNode)> = vec![(root.name().to_string(), root)];

    while let Some((qualified, node)) = stack.pop() {
        if node.capability().is_target_for(quant) && !qualified.contains(OUTPUT_HEAD_MARKER) {
            let short = qualified.rsplit('.').next().unwrap_or(&qualified);
            if !short.is_empty() {
                names.insert(short.to_string());
            }
        }
        for child in node.children() {
            let child_name = if qualified.is_empty() {
                child.name().to_string()
            } else {
                format!("{}.{}", qualified, child.name())
            };
            stack.push((child_name, child));
        }
    }

    let names: Vec<String> = names.into_iter().collect();
    debug!(?quant, targets = ?names, "Resolved adapter targets");
    names
}
