//! Host-side tensors and ordered parameter mappings.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error::{EngineError, Result};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[serde(alias = "float32", alias = "fp32")]
    F32,
    #[serde(alias = "float16", alias = "fp16")]
    F16,
    #[serde(alias = "bfloat16")]
    BF16,
    I64,
    I32,
    I8,
    U8,
    Bool,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::Bool => "bool",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dense little-endian tensor in host memory
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<u8>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_bytes();
        if data.len() != expected {
            return Err(EngineError::model_load(format!(
                "tensor data is {} bytes, shape {:?} of {} needs {}",
                data.len(),
                shape,
                dtype,
                expected
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size_bytes();
        Self {
            shape,
            dtype,
            data: vec![0; len],
        }
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(shape, DType::F32, data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype.size_bytes()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Values widened to f32. Only defined for floating tensors.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        decode_float(self.dtype, &self.data)
    }

    /// Convert between floating precisions. Same-dtype conversion is a move.
    pub fn to_dtype(self, dtype: DType) -> Result<Tensor> {
        if self.dtype == dtype {
            return Ok(self);
        }
        if !self.dtype.is_floating_point() || !dtype.is_floating_point() {
            return Err(EngineError::model_load(format!(
                "cannot convert {} tensor to {}",
                self.dtype, dtype
            )));
        }
        let values = decode_float(self.dtype, &self.data)?;
        Ok(Tensor {
            shape: self.shape,
            dtype,
            data: encode_float(dtype, &values),
        })
    }
}

/// Element count × element byte width
pub fn estimate_size(tensor: &Tensor) -> usize {
    tensor.size_bytes()
}

fn decode_float(dtype: DType, data: &[u8]) -> Result<Vec<f32>> {
    let values = match dtype {
        DType::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DType::F16 => data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::BF16 => data
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        other => {
            return Err(EngineError::model_load(format!(
                "{other} is not a floating dtype"
            )))
        }
    };
    Ok(values)
}

fn encode_float(dtype: DType, values: &[f32]) -> Vec<u8> {
    match dtype {
        DType::F16 => values
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect(),
        DType::BF16 => values
            .iter()
            .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
            .collect(),
        _ => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}

/// Name → tensor mapping that keeps insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterMap<T = Tensor> {
    entries: Vec<(String, T)>,
    index: HashMap<String, usize>,
}

impl<T> Default for ParameterMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> ParameterMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace in place; a replaced key keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, value: T) {
        let name = name.into();
        match self.index.get(&name) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, value));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.index.get(name).map(|&pos| &self.entries[pos].1)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl ParameterMap<Tensor> {
    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|(_, t)| estimate_size(t)).sum()
    }
}

impl<T> IntoIterator for ParameterMap<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<T> FromIterator<(String, T)> for ParameterMap<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        let mut map = ParameterMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}
