//! Weight regularization over explicitly registered layers.
//!
//! Every weight-normalized convolution and affine batch-norm registers
//! itself here at construction, so the penalties never have to walk the
//! module tree looking for layers of a given type.

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::BatchNorm;

use crate::nn::wn_conv::NormalizedWeight;

/// Handles to every regularized parameter in the model, collected while the
/// towers are built.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    convs: Vec<NormalizedWeight>,
    bn_gammas: Vec<Tensor>,
}

impl LayerRegistry {
    pub fn register_conv(&mut self, weight: NormalizedWeight) {
        self.convs.push(weight);
    }

    pub fn register_bn(&mut self, bn: &BatchNorm) {
        if let Some((gamma, _beta)) = bn.weight_and_bias() {
            self.bn_gammas.push(gamma.clone());
        }
    }

    pub fn num_convs(&self) -> usize {
        self.convs.len()
    }

    pub fn num_bns(&self) -> usize {
        self.bn_gammas.len()
    }
}

/// Per-shape left/right singular-vector estimates persisted across training
/// steps. Owned by the orchestrator and handed to [`spectral_loss`]; power
/// iteration refines the stored vectors instead of restarting.
#[derive(Debug)]
pub struct SpectralState {
    left: HashMap<(usize, usize), Tensor>,
    right: HashMap<(usize, usize), Tensor>,
    num_power_iter: usize,
}

impl Default for SpectralState {
    fn default() -> Self {
        Self {
            left: HashMap::new(),
            right: HashMap::new(),
            num_power_iter: 4,
        }
    }
}

impl SpectralState {
    pub fn with_power_iterations(num_power_iter: usize) -> Self {
        Self {
            num_power_iter,
            ..Default::default()
        }
    }
}

fn normalize_rows(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(1e-3)?;
    x.broadcast_div(&norm)
}

/// Sum of estimated top singular values over all realized weight matrices.
///
/// Matrices are grouped by shape and stacked so each group power-iterates as
/// one batched matmul. The iterations run on detached weights; only the final
/// Rayleigh quotient keeps the graph, so gradients reach the weights through
/// `u^T W v` alone.
pub fn spectral_loss(registry: &LayerRegistry, state: &mut SpectralState) -> Result<Tensor> {
    let mut groups: HashMap<(usize, usize), Vec<Tensor>> = HashMap::new();
    for weight in &registry.convs {
        let mat = weight.realized_matrix()?;
        let (rows, cols) = mat.dims2()?;
        groups.entry((rows, cols)).or_default().push(mat);
    }

    let device = match registry.convs.first() {
        Some(w) => w.realized()?.device().clone(),
        None => Device::Cpu,
    };
    let mut loss = Tensor::zeros((), DType::F32, &device)?;
    for (shape, mats) in groups {
        let stacked = Tensor::stack(&mats, 0)?;
        let (n, rows, cols) = stacked.dims3()?;
        debug_assert_eq!((rows, cols), shape);

        let frozen = stacked.detach();
        let mut num_iter = state.num_power_iter;
        if !state.left.contains_key(&shape) {
            let u = Tensor::randn(0f32, 1f32, (n, rows), frozen.device())?;
            let v = Tensor::randn(0f32, 1f32, (n, cols), frozen.device())?;
            state.left.insert(shape, normalize_rows(&u)?);
            state.right.insert(shape, normalize_rows(&v)?);
            // spend extra iterations the first time a shape shows up
            num_iter *= 10;
        }
        let mut u = state.left[&shape].clone();
        let mut v = state.right[&shape].clone();
        for _ in 0..num_iter {
            // u^T W approximates the right singular vector, W v the left one
            v = normalize_rows(&u.unsqueeze(1)?.matmul(&frozen)?.squeeze(1)?)?;
            u = normalize_rows(&frozen.matmul(&v.unsqueeze(2)?)?.squeeze(2)?)?;
        }
        state.left.insert(shape, u.detach());
        state.right.insert(shape, v.detach());

        let sigma = u
            .unsqueeze(1)?
            .matmul(&stacked.matmul(&v.unsqueeze(2)?)?)?;
        loss = (loss + sigma.sum_all()?)?;
    }
    Ok(loss)
}

/// Sum over batch-norm layers of the largest absolute scale parameter.
pub fn batchnorm_loss(registry: &LayerRegistry) -> Result<Tensor> {
    let device = match registry.bn_gammas.first() {
        Some(g) => g.device().clone(),
        None => Device::Cpu,
    };
    let mut loss = Tensor::zeros((), DType::F32, &device)?;
    for gamma in &registry.bn_gammas {
        loss = (loss + gamma.abs()?.max(0)?)?;
    }
    Ok(loss)
}
