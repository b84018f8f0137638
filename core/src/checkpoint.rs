//! Checkpointing and Serialization.
//!
//! Update-rule parameters are stored in the `safetensors` format: one little-endian `f32`
//! tensor per parameter, keyed `<prefix>/<name>`. Shapes are written for inspection, but on
//! load the parameter store's registered shapes are authoritative.

use crate::Matrix;
use crate::error::{OptimError, Result};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::path::Path;

/// Saves named matrices to a safetensors file.
///
/// # Errors
///
/// Returns `OptimError::Checkpoint` if encoding or writing the file fails.
pub fn save_checkpoint<P: AsRef<Path>>(path: P, tensors: &[(String, Matrix)]) -> Result<()> {
    // Views borrow these buffers, so they must outlive the map.
    let encoded: Vec<(&str, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, tensor)| {
            let bytes = tensor
                .data()
                .iter()
                .flat_map(|value| value.to_le_bytes())
                .collect();
            (name.as_str(), tensor.shape().to_vec(), bytes)
        })
        .collect();

    let mut views = HashMap::with_capacity(encoded.len());
    for (name, shape, bytes) in &encoded {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
            .map_err(|e| OptimError::Checkpoint(format!("tensor '{name}': {e:?}")))?;
        views.insert(name.to_string(), view);
    }

    safetensors::serialize_to_file(&views, &None, path.as_ref())
        .map_err(|e| OptimError::Checkpoint(format!("failed to save checkpoint: {e:?}")))?;
    Ok(())
}

/// Loads every tensor of a safetensors file as a flat `f32` vector.
///
/// # Errors
///
/// Returns `OptimError::Io` if the file cannot be read and `OptimError::Checkpoint` if it is
/// not a valid safetensors file or holds a tensor that is not `f32`.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Vec<f32>>> {
    let file_content = std::fs::read(path)?;
    let safetensors = SafeTensors::deserialize(&file_content)
        .map_err(|e| OptimError::Checkpoint(format!("failed to deserialize checkpoint: {e:?}")))?;

    let mut tensors = HashMap::new();
    for (name, view) in safetensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(OptimError::Checkpoint(format!(
                "tensor '{name}' has dtype {:?}, expected F32",
                view.dtype()
            )));
        }
        let data = view
            .data()
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        tensors.insert(name, data);
    }
    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.safetensors");
        let tensors = vec![
            (
                "optimizer_core/w_in".to_string(),
                Tensor::new(vec![1.0, -2.5, 3.25, 1e-7], [2, 2]).unwrap(),
            ),
            ("optimizer_core/b_in".to_string(), Tensor::zeros([1, 3])),
        ];
        save_checkpoint(&path, &tensors).unwrap();

        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["optimizer_core/w_in"], vec![1.0, -2.5, 3.25, 1e-7]);
        assert_eq!(loaded["optimizer_core/b_in"], vec![0.0; 3]);
    }

    #[test]
    fn test_empty_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");
        save_checkpoint(&path, &[]).unwrap();
        assert!(load_checkpoint(&path).unwrap().is_empty());
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_checkpoint(dir.path().join("missing.safetensors")),
            Err(OptimError::Io(_))
        ));

        let garbage = dir.path().join("garbage.safetensors");
        std::fs::write(&garbage, b"not a checkpoint").unwrap();
        assert!(matches!(
            load_checkpoint(&garbage),
            Err(OptimError::Checkpoint(_))
        ));
    }
}
