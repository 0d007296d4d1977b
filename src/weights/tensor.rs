//! Tensor storage and initialization rules for a single weight layer (C2).

use crate::error::{AgentDbError, Result};
use crate::primitives::Mulberry32;
use serde::{Deserialize, Serialize};

/// Initialization scheme for a weight matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Initialization {
    Xavier,
    He,
    Random,
    Zeros,
}

/// A dense `rows x cols` row-major Float32 weight matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightTensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl WeightTensor {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Initializes a tensor per spec.md §4.2: Xavier `sigma^2 = 2/(in+out)`,
    /// He `sigma^2 = 2/in`, uniform random in `[-1/2 sigma sqrt(12), +..]`,
    /// or all-zero. Gaussians are sampled via Box-Muller on a Mulberry32
    /// generator when `seed` is supplied, for reproducibility.
    pub fn initialize(rows: usize, cols: usize, init: Initialization, seed: Option<u32>) -> Self {
        let mut rng = Mulberry32::new(seed.unwrap_or(0x5EED));
        let len = rows * cols;
        let data = match init {
            Initialization::Zeros => vec![0.0; len],
            Initialization::Xavier => {
                let sigma2 = 2.0 / (rows + cols) as f32;
                let sigma = sigma2.sqrt();
                (0..len).map(|_| rng.next_gaussian() * sigma).collect()
            }
            Initialization::He => {
                let sigma2 = 2.0 / rows as f32;
                let sigma = sigma2.sqrt();
                (0..len).map(|_| rng.next_gaussian() * sigma).collect()
            }
            Initialization::Random => {
                // sigma is taken from a He-style fan-in scale so the
                // uniform bound `[-1/2 sigma sqrt(12), +1/2 sigma sqrt(12)]`
                // has a comparable variance to the Gaussian schemes above.
                let sigma = (2.0 / rows as f32).sqrt();
                let half_width = 0.5 * sigma * 12.0_f32.sqrt();
                (0..len)
                    .map(|_| rng.next_range(-half_width, half_width))
                    .collect()
            }
        };
        Self { rows, cols, data }
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        let cols = self.cols;
        &mut self.data[r * cols..(r + 1) * cols]
    }

    pub fn total_params(&self) -> usize {
        self.rows * self.cols
    }

    /// Structural + numerical validation: dimensions consistent with
    /// `data.len()`, optional expected shape match, no NaN/non-finite.
    /// All-zero or `max|w| > 100` are logged as warnings, not rejected.
    pub fn validate(&self, expected_shape: Option<(usize, usize)>) -> Result<()> {
        if self.data.len() != self.rows * self.cols {
            return Err(AgentDbError::validation(format!(
                "tensor data length {} does not match {}x{}",
                self.data.len(),
                self.rows,
                self.cols
            )));
        }
        if let Some((er, ec)) = expected_shape {
            if er != self.rows || ec != self.cols {
                return Err(AgentDbError::validation(format!(
                    "tensor shape {}x{} does not match expected {}x{}",
                    self.rows, self.cols, er, ec
                )));
            }
        }
        if self.data.iter().any(|v| !v.is_finite()) {
            return Err(AgentDbError::validation(
                "tensor contains NaN or non-finite values",
            ));
        }
        let max_abs = self.data.iter().fold(0.0_f32, |m, v| m.max(v.abs()));
        if max_abs == 0.0 {
            tracing::warn!("tensor is all-zero");
        } else if max_abs > 100.0 {
            tracing::warn!(max_abs, "tensor weight magnitude exceeds 100");
        }
        Ok(())
    }

    /// Encodes `[rows:u32 LE][cols:u32 LE][row-major f32 LE...]`, matching
    /// the external weight binary format of spec.md §6.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.data.len() * 4);
        buf.extend_from_slice(&(self.rows as u32).to_le_bytes());
        buf.extend_from_slice(&(self.cols as u32).to_le_bytes());
        for v in &self.data {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(AgentDbError::validation("weight buffer shorter than header"));
        }
        let rows = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let cols = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let expected_len = 8 + rows * cols * 4;
        if bytes.len() != expected_len {
            return Err(AgentDbError::validation(format!(
                "weight buffer length {} does not match header-declared {}x{} ({} bytes)",
                bytes.len(),
                rows,
                cols,
                expected_len
            )));
        }
        let mut data = Vec::with_capacity(rows * cols);
        let mut offset = 8;
        for _ in 0..(rows * cols) {
            let v = f32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
            data.push(v);
            offset += 4;
        }
        Ok(Self { rows, cols, data })
    }

    /// MD5 checksum (hex) of the encoded tensor, used for atomic-save
    /// verification and the weight metadata sidecar.
    pub fn checksum(&self) -> String {
        let bytes = self.to_bytes();
        format!("{:x}", md5::compute(bytes))
    }
}
