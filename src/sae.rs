//! Sparse autoencoder model
//!
//! # Architecture
//!
//! ```text
//! Encode:  f     = ReLU(x @ W_enc + b_enc)     W_enc: [D, F], b_enc: [F]
//! Decode:  x_hat = f @ W_dec + b_dec           W_dec: [F, D], b_dec: [D]
//! ```
//!
//! Row `j` of `W_dec` is feature `j`'s dictionary vector. Rows are kept at
//! unit L2 norm so that activation magnitude alone carries feature strength;
//! otherwise the L1 penalty could be defeated by shrinking `f` and growing
//! `W_dec`.
//!
//! # Checkpoint layout
//!
//! `sae.safetensors` holds `encoder.weight`, `encoder.bias`,
//! `decoder.weight` and `decoder.bias` in F32. D and F are recovered from
//! the shapes, so loading needs no training-time state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};
use rand::{Rng, SeedableRng};
use safetensors::tensor::SafeTensors;
use tracing::debug;

use crate::data::tensor_from_view;
use crate::error::{SaeError, SaeResult};

/// Weights file name inside a checkpoint directory.
pub const WEIGHTS_FILE: &str = "sae.safetensors";

const ENCODER_WEIGHT: &str = "encoder.weight";
const ENCODER_BIAS: &str = "encoder.bias";
const DECODER_WEIGHT: &str = "decoder.weight";
const DECODER_BIAS: &str = "decoder.bias";

/// Guards the decoder renormalization against all-zero rows.
const NORM_EPS: f32 = 1e-12;

/// Encoder/decoder pair with learnable parameters.
pub struct SparseAutoencoder {
    w_enc: Var, // [d_model, n_features]
    b_enc: Var, // [n_features]
    w_dec: Var, // [n_features, d_model]
    b_dec: Var, // [d_model]
    d_model: usize,
    n_features: usize,
}

impl std::fmt::Debug for SparseAutoencoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseAutoencoder")
            .field("d_model", &self.d_model)
            .field("n_features", &self.n_features)
            .finish_non_exhaustive()
    }
}

impl SparseAutoencoder {
    /// Fresh model with seeded uniform init `±1/sqrt(fan_in)`, zero biases
    /// and unit-norm decoder rows.
    pub fn new(d_model: usize, n_features: usize, seed: u64, device: &Device) -> SaeResult<Self> {
        if d_model == 0 || n_features == 0 {
            return Err(SaeError::config(format!(
                "SAE dimensions must be non-zero (d_model={d_model}, n_features={n_features})"
            )));
        }
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

        let enc_bound = 1.0 / (d_model as f32).sqrt();
        let w_enc: Vec<f32> = (0..d_model * n_features)
            .map(|_| rng.gen_range(-enc_bound..enc_bound))
            .collect();
        let dec_bound = 1.0 / (n_features as f32).sqrt();
        let w_dec: Vec<f32> = (0..n_features * d_model)
            .map(|_| rng.gen_range(-dec_bound..dec_bound))
            .collect();

        let model = Self::from_tensors(
            Tensor::from_vec(w_enc, (d_model, n_features), device)?,
            Tensor::zeros(n_features, DType::F32, device)?,
            Tensor::from_vec(w_dec, (n_features, d_model), device)?,
            Tensor::zeros(d_model, DType::F32, device)?,
        )?;
        model.normalize_decoder()?;
        debug!(
            "Initialized SAE d_model={d_model} n_features={n_features} params={}",
            model.parameter_count()
        );
        Ok(model)
    }

    /// Assemble a model from explicit parameters, validating their shapes.
    pub fn from_tensors(
        w_enc: Tensor,
        b_enc: Tensor,
        w_dec: Tensor,
        b_dec: Tensor,
    ) -> SaeResult<Self> {
        let (d_model, n_features) = w_enc
            .dims2()
            .map_err(|_| SaeError::shape(ENCODER_WEIGHT, "[D, F]", format!("{:?}", w_enc.dims())))?;
        if b_enc.dims() != [n_features] {
            return Err(SaeError::shape(
                ENCODER_BIAS,
                format!("[{n_features}]"),
                format!("{:?}", b_enc.dims()),
            ));
        }
        if w_dec.dims() != [n_features, d_model] {
            return Err(SaeError::shape(
                DECODER_WEIGHT,
                format!("[{n_features}, {d_model}]"),
                format!("{:?}", w_dec.dims()),
            ));
        }
        if b_dec.dims() != [d_model] {
            return Err(SaeError::shape(
                DECODER_BIAS,
                format!("[{d_model}]"),
                format!("{:?}", b_dec.dims()),
            ));
        }
        Ok(Self {
            w_enc: Var::from_tensor(&w_enc.to_dtype(DType::F32)?)?,
            b_enc: Var::from_tensor(&b_enc.to_dtype(DType::F32)?)?,
            w_dec: Var::from_tensor(&w_dec.to_dtype(DType::F32)?)?,
            b_dec: Var::from_tensor(&b_dec.to_dtype(DType::F32)?)?,
            d_model,
            n_features,
        })
    }

    /// Embedding dimension D.
    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// Latent width F.
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn device(&self) -> &Device {
        self.w_enc.device()
    }

    pub fn parameter_count(&self) -> usize {
        2 * self.d_model * self.n_features + self.d_model + self.n_features
    }

    /// Trainable parameters, for the optimizer.
    pub fn vars(&self) -> Vec<Var> {
        vec![
            self.w_enc.clone(),
            self.b_enc.clone(),
            self.w_dec.clone(),
            self.b_dec.clone(),
        ]
    }

    // --- Forward ---

    /// `ReLU(x @ W_enc + b_enc)`, shape `[B, F]`, all entries >= 0.
    pub fn encode(&self, batch: &Tensor) -> SaeResult<Tensor> {
        let (_, d) = batch
            .dims2()
            .map_err(|_| SaeError::shape("encode input", "[B, D]", format!("{:?}", batch.dims())))?;
        if d != self.d_model {
            return Err(SaeError::shape("encode input columns", self.d_model, d));
        }
        let pre = batch
            .matmul(self.w_enc.as_tensor())?
            .broadcast_add(self.b_enc.as_tensor())?;
        Ok(pre.relu()?)
    }

    /// `f @ W_dec + b_dec`, shape `[B, D]`.
    pub fn decode(&self, activations: &Tensor) -> SaeResult<Tensor> {
        let (_, f) = activations.dims2().map_err(|_| {
            SaeError::shape("decode input", "[B, F]", format!("{:?}", activations.dims()))
        })?;
        if f != self.n_features {
            return Err(SaeError::shape("decode input columns", self.n_features, f));
        }
        Ok(activations
            .matmul(self.w_dec.as_tensor())?
            .broadcast_add(self.b_dec.as_tensor())?)
    }

    /// Returns `(activations, reconstruction)`.
    pub fn forward(&self, batch: &Tensor) -> SaeResult<(Tensor, Tensor)> {
        let activations = self.encode(batch)?;
        let reconstruction = self.decode(&activations)?;
        Ok((activations, reconstruction))
    }

    // --- Constraints ---

    /// Rescale every decoder row to unit L2 norm. All-zero rows stay zero.
    pub fn normalize_decoder(&self) -> SaeResult<()> {
        let w = self.w_dec.as_tensor().detach();
        let norms = w.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(NORM_EPS)?;
        let normalized = w.broadcast_div(&norms)?;
        self.w_dec.set(&normalized)?;
        Ok(())
    }

    /// L2 norm of every decoder row.
    pub fn decoder_row_norms(&self) -> SaeResult<Vec<f32>> {
        Ok(self
            .w_dec
            .as_tensor()
            .sqr()?
            .sum(1)?
            .sqrt()?
            .to_vec1::<f32>()?)
    }

    /// Fail with [`SaeError::NonFiniteWeights`] if any parameter holds NaN/Inf.
    ///
    /// Checks the parameter sum: NaN and Inf both propagate through it.
    pub fn check_finite(&self) -> SaeResult<()> {
        for (name, var) in self.named_parameters() {
            let total = var.as_tensor().sum_all()?.to_scalar::<f32>()?;
            if !total.is_finite() {
                return Err(SaeError::NonFiniteWeights {
                    parameter: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn named_parameters(&self) -> [(&'static str, &Var); 4] {
        [
            (ENCODER_WEIGHT, &self.w_enc),
            (ENCODER_BIAS, &self.b_enc),
            (DECODER_WEIGHT, &self.w_dec),
            (DECODER_BIAS, &self.b_dec),
        ]
    }

    // --- Persistence ---

    /// Write `sae.safetensors` into `dir`. Returns the file path.
    pub fn save(&self, dir: &Path) -> SaeResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(WEIGHTS_FILE);
        let tensors: HashMap<&str, Tensor> = self
            .named_parameters()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().detach()))
            .collect();
        candle_core::safetensors::save(&tensors, &path)?;
        Ok(path)
    }

    /// Load from a weights file or a checkpoint directory containing one.
    pub fn load(path: &Path, device: &Device) -> SaeResult<Self> {
        let path = if path.is_dir() {
            path.join(WEIGHTS_FILE)
        } else {
            path.to_path_buf()
        };
        if !path.exists() {
            return Err(SaeError::MissingFile(path));
        }
        let data = std::fs::read(&path)?;
        let st = SafeTensors::deserialize(&data)?;
        let model = Self::from_tensors(
            tensor_from_view(&st.tensor(ENCODER_WEIGHT)?, device)?,
            tensor_from_view(&st.tensor(ENCODER_BIAS)?, device)?,
            tensor_from_view(&st.tensor(DECODER_WEIGHT)?, device)?,
            tensor_from_view(&st.tensor(DECODER_BIAS)?, device)?,
        )?;
        debug!(
            "Loaded SAE from {} (d_model={}, n_features={})",
            path.display(),
            model.d_model,
            model.n_features
        );
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(rows: usize, cols: usize, seed: u64) -> Tensor {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-2.0..2.0)).collect();
        Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_shapes() {
        let sae = SparseAutoencoder::new(8, 32, 0, &Device::Cpu).unwrap();
        let (acts, recon) = sae.forward(&batch(5, 8, 1)).unwrap();
        assert_eq!(acts.dims(), &[5, 32]);
        assert_eq!(recon.dims(), &[5, 8]);
        assert_eq!(sae.parameter_count(), 2 * 8 * 32 + 8 + 32);
    }

    #[test]
    fn test_activations_non_negative() {
        let sae = SparseAutoencoder::new(8, 32, 3, &Device::Cpu).unwrap();
        let acts: Vec<Vec<f32>> = sae.encode(&batch(20, 8, 4)).unwrap().to_vec2().unwrap();
        assert!(acts.iter().flatten().all(|&v| v >= 0.0));
        // ReLU should leave some features active on random inputs
        assert!(acts.iter().flatten().any(|&v| v > 0.0));
    }

    #[test]
    fn test_encode_shape_mismatch() {
        let sae = SparseAutoencoder::new(8, 16, 0, &Device::Cpu).unwrap();
        assert!(matches!(
            sae.encode(&batch(2, 7, 0)),
            Err(SaeError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            sae.decode(&batch(2, 15, 0)),
            Err(SaeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_decoder_rows_unit_norm_after_init() {
        let sae = SparseAutoencoder::new(16, 64, 9, &Device::Cpu).unwrap();
        for norm in sae.decoder_row_norms().unwrap() {
            assert!((norm - 1.0).abs() < 1e-5, "norm={norm}");
        }
    }

    #[test]
    fn test_normalize_keeps_zero_rows() {
        let w_dec = Tensor::from_vec(vec![3.0f32, 4.0, 0.0, 0.0], (2, 2), &Device::Cpu).unwrap();
        let sae = SparseAutoencoder::from_tensors(
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
            Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap(),
            w_dec,
            Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap(),
        )
        .unwrap();
        sae.normalize_decoder().unwrap();
        let norms = sae.decoder_row_norms().unwrap();
        assert!((norms[0] - 1.0).abs() < 1e-6);
        assert_eq!(norms[1], 0.0);
    }

    #[test]
    fn test_seeded_init_is_deterministic() {
        let a = SparseAutoencoder::new(4, 8, 11, &Device::Cpu).unwrap();
        let b = SparseAutoencoder::new(4, 8, 11, &Device::Cpu).unwrap();
        let x = batch(3, 4, 2);
        let fa: Vec<Vec<f32>> = a.encode(&x).unwrap().to_vec2().unwrap();
        let fb: Vec<Vec<f32>> = b.encode(&x).unwrap().to_vec2().unwrap();
        assert_eq!(fa, fb);
    }

    #[test]
    fn test_check_finite_detects_nan() {
        let sae = SparseAutoencoder::from_tensors(
            Tensor::from_vec(vec![f32::NAN, 0.0], (1, 2), &Device::Cpu).unwrap(),
            Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap(),
            Tensor::ones((2, 1), DType::F32, &Device::Cpu).unwrap(),
            Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
        )
        .unwrap();
        match sae.check_finite() {
            Err(SaeError::NonFiniteWeights { parameter }) => assert_eq!(parameter, "encoder.weight"),
            other => panic!("expected NonFiniteWeights, got {other:?}"),
        }
    }

    #[test]
    fn test_from_tensors_rejects_bad_decoder() {
        let result = SparseAutoencoder::from_tensors(
            Tensor::zeros((4, 8), DType::F32, &Device::Cpu).unwrap(),
            Tensor::zeros(8, DType::F32, &Device::Cpu).unwrap(),
            Tensor::zeros((4, 8), DType::F32, &Device::Cpu).unwrap(),
            Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(matches!(result, Err(SaeError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sae = SparseAutoencoder::new(6, 12, 5, &Device::Cpu).unwrap();
        sae.save(dir.path()).unwrap();

        let loaded = SparseAutoencoder::load(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(loaded.d_model(), 6);
        assert_eq!(loaded.n_features(), 12);

        let x = batch(4, 6, 8);
        let a: Vec<Vec<f32>> = sae.forward(&x).unwrap().1.to_vec2().unwrap();
        let b: Vec<Vec<f32>> = loaded.forward(&x).unwrap().1.to_vec2().unwrap();
        assert_eq!(a, b);
    }
}
