use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::Path;

use crate::view::{TensorEntry, register_tensor_registry_formats};
use crate::Tensor;

/// Read-only mapping from parameter name to dense tensor.
///
/// The store is filled once by a loader and then only read; the analysis
/// never writes back into it.
#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    tensors: HashMap<String, Tensor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonTensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keyed by the tensor's own name; returns any tensor it replaced.
    pub fn insert(&mut self, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(tensor.name().to_string(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensors ordered by name.
    pub fn sorted(&self) -> Vec<&Tensor> {
        let mut all: Vec<&Tensor> = self.tensors.values().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// `{ "<name>": { "shape": [..], "data": [..] } }`
    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self> {
        let raw: BTreeMap<String, JsonTensor> =
            serde_json::from_reader(reader).context("parsing weight JSON")?;

        let mut store = Self::new();
        for (name, t) in raw {
            store.insert(Tensor::new(name, &t.shape, t.data)?);
        }
        debug!("loaded {} tensors from JSON", store.len());
        Ok(store)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening weights {}", path.display()))?;
        Self::from_json_reader(std::io::BufReader::new(file))
    }

    /// Raw little-endian blob described by a JSON array of [`TensorEntry`].
    pub fn from_blob(index_json: &str, blob: &[u8]) -> Result<Self> {
        register_tensor_registry_formats();

        let entries: Vec<TensorEntry<'_>> =
            serde_json::from_str(index_json).context("parsing tensor index")?;

        let mut store = Self::new();
        for entry in &entries {
            let view = entry.view(blob)?;
            store.insert(view.to_tensor(&entry.name)?);
        }
        debug!("loaded {} tensors from blob ({} bytes)", store.len(), blob.len());
        Ok(store)
    }

    pub fn from_blob_files(index_path: &Path, blob_path: &Path) -> Result<Self> {
        let index = std::fs::read_to_string(index_path)
            .with_context(|| format!("reading index {}", index_path.display()))?;
        let blob = std::fs::read(blob_path)
            .with_context(|| format!("reading blob {}", blob_path.display()))?;
        Self::from_blob(&index, &blob)
    }

    pub fn to_json_writer<W: Write>(&self, writer: W) -> Result<()> {
        let out: BTreeMap<&str, JsonTensor> = self
            .tensors
            .iter()
            .map(|(name, t)| {
                (
                    name.as_str(),
                    JsonTensor {
                        shape: t.shape().to_vec(),
                        data: t.data().to_vec(),
                    },
                )
            })
            .collect();
        serde_json::to_writer(writer, &out)?;
        Ok(())
    }
}
