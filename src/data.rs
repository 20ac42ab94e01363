//! Embedding matrix and aligned text corpus loading
//!
//! The embedding matrix is the only numeric input of a run. Text is optional
//! and only used to make registry entries readable.

use std::collections::HashSet;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{SaeError, SaeResult};

/// Name looked up in multi-tensor safetensors files.
pub const EMBEDDINGS_TENSOR: &str = "embeddings";

/// Immutable (N, D) matrix of f32 embeddings, row i aligned to example i.
#[derive(Debug, Clone)]
pub struct EmbeddingMatrix {
    data: Tensor,
}

impl EmbeddingMatrix {
    /// Wrap a 2-D tensor. Converts to f32.
    pub fn new(data: Tensor) -> SaeResult<Self> {
        let dims = data.dims();
        if dims.len() != 2 {
            return Err(SaeError::shape("embedding matrix", "rank 2", format!("{dims:?}")));
        }
        let data = data.to_dtype(DType::F32)?;
        Ok(Self { data })
    }

    /// Build from row-major values.
    pub fn from_rows(rows: &[Vec<f32>], device: &Device) -> SaeResult<Self> {
        let n = rows.len();
        let d = rows.first().map_or(0, Vec::len);
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != d) {
            return Err(SaeError::shape(
                format!("embedding row {i}"),
                d,
                row.len(),
            ));
        }
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Self::new(Tensor::from_vec(flat, (n, d), device)?)
    }

    /// Load from `.npy` or `.safetensors`.
    ///
    /// A safetensors file must hold either a single 2-D tensor or one named
    /// [`EMBEDDINGS_TENSOR`].
    pub fn load(path: &Path, device: &Device) -> SaeResult<Self> {
        if !path.exists() {
            return Err(SaeError::MissingFile(path.to_path_buf()));
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let tensor = match ext.as_str() {
            "npy" => Tensor::read_npy(path)?.to_device(device)?,
            "safetensors" => {
                let bytes = std::fs::read(path)?;
                let st = SafeTensors::deserialize(&bytes)?;
                let names = st.names();
                let name = if names.iter().any(|n| n.as_str() == EMBEDDINGS_TENSOR) {
                    EMBEDDINGS_TENSOR.to_string()
                } else if names.len() == 1 {
                    names[0].to_string()
                } else {
                    return Err(SaeError::config(format!(
                        "{} holds {} tensors and none is named '{EMBEDDINGS_TENSOR}'",
                        path.display(),
                        names.len()
                    )));
                };
                tensor_from_view(&st.tensor(&name)?, device)?
            }
            other => {
                return Err(SaeError::config(format!(
                    "unsupported embeddings format '.{other}' (expected .npy or .safetensors)"
                )))
            }
        };
        let matrix = Self::new(tensor)?;
        info!(
            "Loaded embeddings {}: {} rows x {} dims",
            path.display(),
            matrix.n_rows(),
            matrix.dim()
        );
        Ok(matrix)
    }

    /// Number of examples N.
    pub fn n_rows(&self) -> usize {
        self.data.dims()[0]
    }

    /// Embedding dimension D.
    pub fn dim(&self) -> usize {
        self.data.dims()[1]
    }

    pub fn tensor(&self) -> &Tensor {
        &self.data
    }

    pub fn device(&self) -> &Device {
        self.data.device()
    }

    /// Gather rows by index, in the given order.
    pub fn rows(&self, indices: &[usize]) -> SaeResult<Tensor> {
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, indices.len(), self.data.device())?;
        Ok(self.data.index_select(&idx, 0)?)
    }
}

/// A single text unit aligned to an embedding row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextSample {
    /// Stable identifier; defaults to the row index
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(alias = "sentence")]
    pub text: String,
}

/// Raw JSON structure for loading
#[derive(Debug, Deserialize)]
struct TextFile {
    samples: Vec<TextSample>,
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
}

/// Ordered text units with stable identifiers.
#[derive(Debug, Clone, Default)]
pub struct TextCorpus {
    samples: Vec<TextSample>,
}

impl TextCorpus {
    pub fn new(samples: Vec<TextSample>) -> Self {
        Self { samples }
    }

    /// One sample per text, ids are row indices.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            samples: texts
                .into_iter()
                .map(|t| TextSample {
                    id: None,
                    text: t.into(),
                })
                .collect(),
        }
    }

    /// Load from a `.json` samples file or a newline-delimited `.txt` file.
    pub fn load(path: &Path) -> SaeResult<Self> {
        if !path.exists() {
            return Err(SaeError::MissingFile(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let corpus = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let file: TextFile = serde_json::from_str(&content)?;
            Self::new(file.samples)
        } else {
            Self::from_texts(content.lines().map(str::to_string))
        };
        debug!("Loaded {} text samples from {}", corpus.len(), path.display());
        Ok(corpus)
    }

    /// Example identifiers, one per row. Fails on duplicates.
    pub fn example_ids(&self) -> SaeResult<Vec<u64>> {
        let ids: Vec<u64> = self
            .samples
            .iter()
            .enumerate()
            .map(|(row, s)| s.id.unwrap_or(row as u64))
            .collect();
        let mut seen = HashSet::with_capacity(ids.len());
        if let Some(dup) = ids.iter().find(|id| !seen.insert(**id)) {
            return Err(SaeError::config(format!("duplicate example id {dup}")));
        }
        Ok(ids)
    }

    /// Texts in row order.
    pub fn texts(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.text.clone()).collect()
    }

    /// Fail unless the corpus has one sample per embedding row.
    pub fn check_aligned(&self, embeddings: &EmbeddingMatrix) -> SaeResult<()> {
        if self.len() != embeddings.n_rows() {
            return Err(SaeError::config(format!(
                "text corpus has {} samples but embedding matrix has {} rows",
                self.len(),
                embeddings.n_rows()
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[TextSample] {
        &self.samples
    }
}

/// Row identifiers `0..n` for runs without a text corpus.
pub fn row_ids(n: usize) -> Vec<u64> {
    (0..n as u64).collect()
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
pub(crate) fn tensor_from_view(
    view: &safetensors::tensor::TensorView<'_>,
    device: &Device,
) -> SaeResult<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        safetensors::Dtype::F64 => DType::F64,
        other => {
            return Err(SaeError::config(format!(
                "unsupported tensor dtype: {other:?}"
            )))
        }
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, shape.as_slice(), device)?;
    Ok(tensor.to_dtype(DType::F32)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows_shape() {
        let rows = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let m = EmbeddingMatrix::from_rows(&rows, &Device::Cpu).unwrap();
        assert_eq!(m.n_rows(), 2);
        assert_eq!(m.dim(), 3);
    }

    #[test]
    fn test_from_rows_ragged_fails() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(matches!(
            EmbeddingMatrix::from_rows(&rows, &Device::Cpu),
            Err(SaeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rows_gather_order() {
        let rows = vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]];
        let m = EmbeddingMatrix::from_rows(&rows, &Device::Cpu).unwrap();
        let picked: Vec<Vec<f32>> = m.rows(&[2, 0]).unwrap().to_vec2().unwrap();
        assert_eq!(picked, vec![vec![2.0, 2.0], vec![0.0, 0.0]]);
    }

    #[test]
    fn test_example_ids_default_to_rows() {
        let corpus = TextCorpus::from_texts(["a", "b", "c"]);
        assert_eq!(corpus.example_ids().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_example_ids_duplicate() {
        let corpus = TextCorpus::new(vec![
            TextSample {
                id: Some(7),
                text: "a".into(),
            },
            TextSample {
                id: Some(7),
                text: "b".into(),
            },
        ]);
        assert!(corpus.example_ids().is_err());
    }

    #[test]
    fn test_rank_check() {
        let t = Tensor::zeros((4,), DType::F32, &Device::Cpu).unwrap();
        assert!(EmbeddingMatrix::new(t).is_err());
    }
}
