use anyhow::{Result, anyhow, bail};
use log::trace;
use once_cell::sync::OnceCell;
use std::borrow::Cow;
use std::collections::HashMap;

use crate::{ShapeBuf, Tensor};

/// A lightweight descriptor for one tensor blob inside a raw weight file.
/// Read straight from the JSON index that sits next to the blob.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TensorEntry<'a> {
    /// Parameter name (e.g. `"attn.attn.in_proj_weight"`).
    pub name: Cow<'a, str>,
    /// Storage kind.
    pub kind: TensorKind,
    /// Byte offset from the beginning of the blob.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
    /// Logical dimensions, outermost first.
    pub shape: Vec<u64>,
}

/// Tensor View -> a borrowed window into a blob
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    pub data: &'a [u8],
    pub shape: Cow<'a, [u64]>,
    pub dtype: DType,
}

impl<'a> TensorView<'a> {
    #[inline(always)]
    pub const fn element_size(&self) -> usize {
        match self.dtype {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    #[inline(always)]
    pub fn num_elements(&self) -> usize {
        self.shape.iter().map(|&x| x as usize).product()
    }

    #[inline(always)]
    pub fn expected_byte_len(&self) -> usize {
        self.num_elements() * self.element_size()
    }

    /// Little-endian decode into `f64`, widening `f32` storage.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let expected_len = self.expected_byte_len();
        if self.data.len() != expected_len {
            bail!(
                "Tensor data length mismatch: got {}, expected {}",
                self.data.len(),
                expected_len
            );
        }

        let out = match self.dtype {
            DType::F32 => self
                .data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
                .collect(),
            DType::F64 => self
                .data
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect(),
        };
        Ok(out)
    }

    pub fn to_tensor(&self, name: &str) -> Result<Tensor> {
        let shape: ShapeBuf = self.shape.iter().map(|&d| d as usize).collect();
        Tensor::new(name, &shape, self.to_f64_vec()?)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum DType {
    F32,
    F64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorKind {
    F32,
    F64,
    #[serde(other)]
    Unknown,
}

/// decoder trait - zero-copy view construction
pub trait TensorDecoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn decode<'a>(&self, bytes: &'a [u8], shape: &[u64]) -> Result<TensorView<'a>>;
}

struct PlainFormat(DType);

impl TensorDecoder for PlainFormat {
    fn name(&self) -> &'static str {
        match self.0 {
            DType::F32 => "F32",
            DType::F64 => "F64",
        }
    }

    fn decode<'a>(&self, bytes: &'a [u8], shape: &[u64]) -> Result<TensorView<'a>> {
        Ok(TensorView {
            data: bytes,
            shape: Cow::Owned(shape.to_vec()),
            dtype: self.0,
        })
    }
}

type Registry = HashMap<TensorKind, Box<dyn TensorDecoder>>;

/// Tensor registry - initialized once, accessed many
static TENSOR_REGISTRY: OnceCell<Registry> = OnceCell::new();

pub fn register_tensor_registry_formats() {
    TENSOR_REGISTRY.get_or_init(|| {
        let mut registry: Registry = HashMap::with_capacity(2);
        registry.insert(TensorKind::F32, Box::new(PlainFormat(DType::F32)));
        registry.insert(TensorKind::F64, Box::new(PlainFormat(DType::F64)));
        registry
    });
}

#[inline(always)]
fn get_format(kind: TensorKind) -> Option<&'static dyn TensorDecoder> {
    TENSOR_REGISTRY
        .get()
        .and_then(|m| m.get(&kind))
        .map(|boxed| &**boxed)
}

impl TensorEntry<'_> {
    /// View creation - bounds checked, zero-copy
    pub fn view<'a>(&self, blob: &'a [u8]) -> Result<TensorView<'a>> {
        let end = self.offset.saturating_add(self.size);

        if end as usize > blob.len() {
            bail!(
                "tensor '{}' slice out of bounds: end={} > blob_len={}",
                self.name,
                end,
                blob.len()
            );
        }

        let fmt =
            get_format(self.kind).ok_or_else(|| anyhow!("unknown tensor kind {:?}", self.kind))?;

        trace!("decode '{}' as {} shape={:?}", self.name, fmt.name(), self.shape);
        let slice = &blob[self.offset as usize..end as usize];
        fmt.decode(slice, &self.shape)
    }
}

/// Little-endian `f64` bytes, the inverse of an `F64` view.
pub fn encode_f64_le(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
