//! Module hierarchy reconstructed from checkpoint tensor names
//!
//! Only safetensors headers are read. Every tensor `a.b.c.weight` makes
//! `a.b.c` a module; its capability is inferred from the tensor shapes and
//! dtypes it owns.

use memmap2::Mmap;
use safetensors::SafeTensors;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::targets::{Capability, ModuleNode};
use crate::constants::limits::MIN_SAFETENSORS_SIZE;
use crate::error::{Error, Result};

/// Concrete module tree node
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    name: String,
    capability: Capability,
    children: Vec<Module>,
}

impl Module {
    pub fn new(name: impl Into<String>, capability: Capability) -> Self {
        Self {
            name: name.into(),
            capability,
            children: Vec::new(),
        }
    }

    pub fn container(name: impl Into<String>) -> Self {
        Self::new(name, Capability::Other)
    }

    pub fn child(&self, name: &str) -> Option<&Module> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child_mut_or_insert(&mut self, name: &str) -> &mut Module {
        let index = match self.children.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                self.children.push(Module::container(name));
                self.children.len() - 1
            }
        };
        &mut self.children[index]
    }

    /// Insert (or retag) the module at a dotted path, creating containers
    pub fn insert_path(&mut self, path: &str, capability: Capability) {
        let mut node = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            node = node.child_mut_or_insert(segment);
        }
        node.capability = capability;
    }

    /// Look up a module by dotted path
    pub fn get(&self, path: &str) -> Option<&Module> {
        path.split('.')
            .filter(|s| !s.is_empty())
            .try_fold(self, |node, segment| node.child(segment))
    }
}

impl ModuleNode for Module {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn children(&self) -> Vec<&dyn ModuleNode> {
        self.children.iter().map(|c| c as &dyn ModuleNode).collect()
    }
}

/// Header entry of one tensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub dtype: String,
    pub shape: Vec<usize>,
}

impl TensorSpec {
    pub fn numel(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product()
    }
}

/// Module tree plus parameter totals of a checkpoint
#[derive(Debug, Clone)]
pub struct ModuleGraph {
    pub root: Module,
    pub total_parameters: u64,
}

impl ModuleGraph {
    /// Build from `(tensor name, spec)` pairs
    pub fn from_tensors<'a, I>(tensors: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a TensorSpec)>,
    {
        let mut owners: BTreeMap<&str, HashMap<&str, &TensorSpec>> = BTreeMap::new();
        let mut total_parameters = 0;
        for (name, spec) in tensors {
            total_parameters += spec.numel();
            let (owner, param) = split_parameter(name);
            owners.entry(owner).or_default().insert(param, spec);
        }

        let mut root = Module::container("");
        for (owner, params) in &owners {
            if owner.is_empty() {
                continue;
            }
            let local = owner.rsplit('.').next().unwrap_or(owner);
            root.insert_path(owner, classify(local, params));
        }
        Self {
            root,
            total_parameters,
        }
    }

    /// Read every safetensors header under a model directory
    ///
    /// Uses `model.safetensors` if present, otherwise all sorted
    /// `model-*.safetensors` shards.
    pub fn from_safetensors_dir(dir: &Path) -> Result<Self> {
        let files = safetensors_files(dir)?;
        let mut headers = Vec::with_capacity(files.len());
        for file in &files {
            headers.push(read_safetensors_header(file)?);
        }
        let graph = Self::from_tensors(
            headers
                .iter()
                .flat_map(|h| h.iter().map(|(name, spec)| (name.as_str(), spec))),
        );
        info!(
            dir = %dir.display(),
            files = files.len(),
            parameters = graph.total_parameters,
            "Built module graph from checkpoint headers"
        );
        Ok(graph)
    }
}

/// Split a tensor name into owning module and parameter name
///
/// Quantization state is stored beneath the weight (`fc.weight.absmax`)
/// and belongs to the module owning that weight.
fn split_parameter(name: &str) -> (&str, &str) {
    if let Some(index) = name.find(".weight.") {
        return (&name[..index], &name[index + 1..]);
    }
    name.rsplit_once('.').unwrap_or(("", name))
}

/// Infer what a module is from the tensors it owns
fn classify(local_name: &str, params: &HashMap<&str, &TensorSpec>) -> Capability {
    let weight = match params.get("weight") {
        Some(weight) => weight,
        None => return Capability::Other,
    };
    let has = |marker: &str| params.keys().any(|k| k.contains(marker));

    match (weight.dtype.as_str(), weight.shape.len()) {
        ("I8", 2) if has("SCB") => Capability::Linear8bit,
        ("U8", _) if has("quant_state") || has("absmax") => Capability::Linear4bit,
        (_, 2) if is_embedding_name(local_name) => Capability::Embedding,
        ("F32" | "F16" | "BF16" | "F64", 2) => Capability::Linear,
        (_, 1) => Capability::Norm,
        _ => Capability::Other,
    }
}

fn is_embedding_name(name: &str) -> bool {
    name.contains("embed") || name == "wte" || name == "wpe"
}

/// Checkpoint files making up a model directory
pub fn safetensors_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let single = dir.join("model.safetensors");
    if single.exists() {
        return Ok(vec![single]);
    }

    let mut shards = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with("model-") && name.ends_with(".safetensors") {
                shards.push(entry.path());
            }
        }
    }
    if shards.is_empty() {
        return Err(Error::Checkpoint(format!(
            "No safetensors files found in {}",
            dir.display()
        )));
    }
    shards.sort();
    debug!(shards = shards.len(), "Found safetensors shards");
    Ok(shards)
}

/// Read and validate the header of one safetensors file
///
/// The file is memory mapped so only the header pages are touched; the
/// tensor offsets are checked against the file length.
pub fn read_safetensors_header(path: &Path) -> Result<BTreeMap<String, TensorSpec>> {
    let file = File::open(path)?;
    if file.metadata()?.len() < MIN_SAFETENSORS_SIZE {
        return Err(Error::Checkpoint(format!(
            "{} is too small to be a valid SafeTensors file",
            path.display()
        )));
    }

    // Safety: the mapping is read-only and dropped before returning
    let mmap = unsafe { Mmap::map(&file)? };
    let (_, metadata) = SafeTensors::read_metadata(&mmap)
        .map_err(|e| Error::Checkpoint(format!("{}: {:?}", path.display(), e)))?;

    Ok(metadata
        .tensors()
        .into_iter()
        .map(|(name, info)| {
            let spec = TensorSpec {
                dtype: format!("{:?}", info.dtype),
                shape: info.shape.clone(),
            };
            (name, spec)
        })
        .collect())
}
