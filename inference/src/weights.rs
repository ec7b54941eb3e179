use std::collections::BTreeMap;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::quant::QuantizedMatrix;
use crate::tensor::Tensor;

/// Named tensors handed over by a model loader
#[derive(Debug, Default)]
pub struct WeightMap {
    tensors: BTreeMap<String, Tensor>,
}

impl WeightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, dims, dtype, bytes)` records.
    ///
    /// Byte lengths must match the declared shape exactly.
    pub fn from_records<'a, I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [usize], DType, &'a [u8])>,
    {
        let mut map = Self::new();
        for (name, dims, dtype, bytes) in records {
            map.insert(name, Tensor::from_bytes(dims, dtype, bytes)?);
        }
        log::debug!(
            "weight map: {} tensors, {} bytes",
            map.len(),
            map.total_bytes()
        );
        Ok(map)
    }

    /// Insert a tensor, returning any previous tensor of that name
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::MissingTensor(String::from(name)))
    }

    /// Remove and return a tensor, e.g. to move it into a layer
    pub fn take(&mut self, name: &str) -> Result<Tensor> {
        self.tensors
            .remove(name)
            .ok_or_else(|| Error::MissingTensor(String::from(name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Tensor names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Storage bytes over all tensors
    pub fn total_bytes(&self) -> usize {
        self.tensors.values().map(Tensor::byte_size).sum()
    }

    /// Assemble a [`QuantizedMatrix`] from a `Q4 [rows, cols]` weight and an
    /// `FP32 [rows]` scale tensor
    pub fn quantized(&self, weight: &str, scales: &str) -> Result<QuantizedMatrix> {
        QuantizedMatrix::from_tensors(self.get(weight)?, self.get(scales)?)
    }
}

impl FromIterator<(String, Tensor)> for WeightMap {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for WeightMap {
    type Item = (String, Tensor);
    type IntoIter = std::collections::btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_records() {
        let w: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]).to_vec();
        let map = WeightMap::from_records([
            ("layer.0.weight", &[2usize, 2][..], DType::F32, w.as_slice()),
            ("layer.0.mask", &[3usize][..], DType::I8, &[1u8, 0, 1][..]),
        ])
        .unwrap();

        assert_eq!(map.len(), 2);
        assert!(map.contains("layer.0.weight"));
        assert_eq!(map.names().collect::<Vec<_>>(), vec!["layer.0.mask", "layer.0.weight"]);
        assert_eq!(map.total_bytes(), 16 + 3);
        assert_eq!(
            map.get("layer.0.weight").unwrap().as_slice::<f32>().unwrap(),
            &[1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn test_bad_record_length() {
        let result = WeightMap::from_records([("w", &[2usize, 2][..], DType::F32, &[0u8; 15][..])]);
        assert!(matches!(result, Err(Error::InvalidShape(_))));
    }

    #[test]
    fn test_missing_and_take() {
        let mut map = WeightMap::new();
        assert!(matches!(map.get("nope"), Err(Error::MissingTensor(_))));
        map.insert("bias", Tensor::from_f32(&[2], &[1.0, 2.0]).unwrap());
        let bias = map.take("bias").unwrap();
        assert_eq!(bias.numel(), 2);
        assert!(map.is_empty());
        assert!(matches!(map.take("bias"), Err(Error::MissingTensor(_))));
    }

    #[test]
    fn test_quantized_assembly() {
        let q = QuantizedMatrix::quantize(&[0.5, -1.0, 0.25, 2.0, 0.0, -2.0], 2, 3).unwrap();
        let mut map = WeightMap::new();
        map.insert("proj.weight", q.to_tensor().unwrap());
        map.insert("proj.scales", Tensor::from_f32(&[2], q.scales()).unwrap());

        let back = map.quantized("proj.weight", "proj.scales").unwrap();
        assert_eq!(back, q);
        assert!(map.quantized("proj.weight", "missing").is_err());
        // scales tensor must be FP32 [rows]
        assert!(map.quantized("proj.scales", "proj.weight").is_err());
    }
}
