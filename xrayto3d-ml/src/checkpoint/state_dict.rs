//! Named tensor maps and their safetensors encoding.

use crate::checkpoint::path::ParamPath;
use crate::error::MlError;
use safetensors::tensor::{Dtype, SafeTensors, View};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Raw tensor payload: element type, shape and little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl TensorRecord {
    /// Zero-filled `f32` tensor.
    pub fn zeros(shape: &[usize]) -> Self {
        let count: usize = shape.iter().product();
        Self {
            dtype: Dtype::F32,
            shape: shape.to_vec(),
            data: vec![0u8; count * std::mem::size_of::<f32>()],
        }
    }

    /// `f32` tensor from values; the value count must match the shape.
    pub fn from_f32(shape: &[usize], values: &[f32]) -> Result<Self, MlError> {
        let count: usize = shape.iter().product();
        if count != values.len() {
            return Err(MlError::invalid_input(format!(
                "shape {shape:?} holds {count} elements, got {}",
                values.len()
            )));
        }
        Ok(Self {
            dtype: Dtype::F32,
            shape: shape.to_vec(),
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        })
    }

    /// Decode an `f32` tensor back into values.
    pub fn to_f32(&self) -> Result<Vec<f32>, MlError> {
        if self.dtype != Dtype::F32 {
            return Err(MlError::load(format!(
                "expected F32 tensor, found {:?}",
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

impl View for &TensorRecord {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Ordered mapping from parameter path to tensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    tensors: BTreeMap<ParamPath, TensorRecord>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: ParamPath, tensor: TensorRecord) -> Option<TensorRecord> {
        self.tensors.insert(path, tensor)
    }

    pub fn get(&self, path: &ParamPath) -> Option<&TensorRecord> {
        self.tensors.get(path)
    }

    pub fn contains(&self, path: &ParamPath) -> bool {
        self.tensors.contains_key(path)
    }

    pub fn remove(&mut self, path: &ParamPath) -> Option<TensorRecord> {
        self.tensors.remove(path)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ParamPath> {
        self.tensors.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamPath, &TensorRecord)> {
        self.tensors.iter()
    }
}

impl IntoIterator for StateDict {
    type Item = (ParamPath, TensorRecord);
    type IntoIter = std::collections::btree_map::IntoIter<ParamPath, TensorRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

impl FromIterator<(ParamPath, TensorRecord)> for StateDict {
    fn from_iter<T: IntoIterator<Item = (ParamPath, TensorRecord)>>(iter: T) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

/// A persisted checkpoint: weights plus free-form string metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    pub state_dict: StateDict,
    pub metadata: BTreeMap<String, String>,
}

impl Checkpoint {
    pub fn new(state_dict: StateDict) -> Self {
        Self {
            state_dict,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Decode a safetensors buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MlError> {
        let tensors = SafeTensors::deserialize(bytes)?;
        let mut state_dict = StateDict::new();
        for (name, view) in tensors.tensors() {
            let path: ParamPath = name.parse()?;
            state_dict.insert(
                path,
                TensorRecord {
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                    data: view.data().to_vec(),
                },
            );
        }

        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header
            .metadata()
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(Self {
            state_dict,
            metadata,
        })
    }

    /// Encode as a safetensors buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MlError> {
        let metadata: Option<HashMap<String, String>> = if self.metadata.is_empty() {
            None
        } else {
            Some(
                self.metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
        };
        let views = self
            .state_dict
            .iter()
            .map(|(path, tensor)| (path.to_string(), tensor));
        Ok(safetensors::serialize(views, &metadata)?)
    }

    /// Write atomically to `path`.
    pub fn save(&self, path: &Path) -> Result<(), MlError> {
        let bytes = self.to_bytes()?;
        crate::persistence::atomic_write(path, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> ParamPath {
        s.parse().unwrap()
    }

    #[test]
    fn test_zeros_byte_length() {
        let t = TensorRecord::zeros(&[4, 1, 3, 3]);
        assert_eq!(t.numel(), 36);
        assert_eq!(t.data.len(), 144);
    }

    #[test]
    fn test_from_f32_rejects_wrong_count() {
        assert!(TensorRecord::from_f32(&[2, 2], &[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_checkpoint_bytes_preserve_tensors_and_metadata() {
        let mut state = StateDict::new();
        state.insert(
            path("model.encoder.0.conv.weight"),
            TensorRecord::from_f32(&[2, 1], &[0.5, -1.25]).unwrap(),
        );
        state.insert(path("loss_function.pos_weight"), TensorRecord::zeros(&[1, 2, 2, 2]));

        let ckpt = Checkpoint::new(state).with_metadata("architecture", "CustomAutoEncoder");
        let bytes = ckpt.to_bytes().unwrap();
        let decoded = Checkpoint::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.state_dict.len(), 2);
        let weight = decoded
            .state_dict
            .get(&path("model.encoder.0.conv.weight"))
            .unwrap();
        assert_eq!(weight.to_f32().unwrap(), vec![0.5, -1.25]);
        assert_eq!(
            decoded.metadata.get("architecture").map(String::as_str),
            Some("CustomAutoEncoder")
        );
    }

    #[test]
    fn test_garbage_bytes_fail() {
        assert!(Checkpoint::from_bytes(b"not a checkpoint").is_err());
    }
}
