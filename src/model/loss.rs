//! Loss schedules and KL accounting.

use candle_core::{DType, Device, Result, Tensor};

use crate::nn::DiscMixLogistic;

/// Annealing hyperparameters shared by the KL term and the weight-decay-norm
/// regularization weight. Passed into the forward call alongside the global
/// step so the schedule stays host-side.
#[derive(Debug, Clone)]
pub struct LossSchedule {
    pub num_total_iter: usize,
    /// Fraction of training spent ramping the KL coefficient to 1.
    pub kl_anneal_portion: f64,
    /// Fraction of training during which the KL coefficient stays at its floor.
    pub kl_const_portion: f64,
    /// Floor for the KL coefficient.
    pub kl_const_coeff: f64,
    pub weight_decay_norm: f64,
    pub weight_decay_norm_init: f64,
    /// Log-linearly interpolate the regularization weight between `_init` and
    /// the final value, driven by the KL coefficient.
    pub weight_decay_norm_anneal: bool,
    /// Run the tower activations in F16. Parameters stay in the builder's
    /// dtype; kernels are cast to the activation dtype per call, and batch
    /// norms and the output head still compute in F32.
    pub fp16: bool,
}

impl Default for LossSchedule {
    fn default() -> Self {
        Self {
            num_total_iter: 100_000,
            kl_anneal_portion: 0.3,
            kl_const_portion: 1e-4,
            kl_const_coeff: 1e-4,
            weight_decay_norm: 1e-2,
            weight_decay_norm_init: 1e-2,
            weight_decay_norm_anneal: false,
            fp16: false,
        }
    }
}

impl LossSchedule {
    /// Annealed KL coefficient at the given step, in `[kl_const_coeff, 1]`.
    pub fn kl_coeff(&self, global_step: usize) -> f64 {
        let total = self.kl_anneal_portion * self.num_total_iter as f64;
        let constant = self.kl_const_portion * self.num_total_iter as f64;
        ((global_step as f64 - constant) / total)
            .min(1.0)
            .max(self.kl_const_coeff)
    }

    /// Weight applied to the spectral and batch-norm penalties.
    pub fn weight_decay_coeff(&self, kl_coeff: f64) -> Result<f64> {
        if !self.weight_decay_norm_anneal {
            return Ok(self.weight_decay_norm);
        }
        if self.weight_decay_norm <= 0. || self.weight_decay_norm_init <= 0. {
            candle_core::bail!(
                "weight-decay-norm annealing needs positive endpoints, got init {} and final {}",
                self.weight_decay_norm_init,
                self.weight_decay_norm
            );
        }
        let log_coeff = (1. - kl_coeff) * self.weight_decay_norm_init.ln()
            + kl_coeff * self.weight_decay_norm.ln();
        Ok(log_coeff.exp())
    }
}

/// Per-group balancing coefficients in decode order (coarsest group first).
///
/// Groups at finer scales cover a larger spatial extent, so their coefficient
/// grows with the square of the scale factor and is divided by the group
/// count at that scale; the result is normalized by its minimum.
pub fn kl_balancer_coeff(groups_per_scale: &[usize], device: &Device) -> Result<Tensor> {
    let num_scales = groups_per_scale.len();
    let mut coeff = Vec::new();
    for i in 0..num_scales {
        let groups = groups_per_scale[num_scales - i - 1];
        let value = (4f32).powi(i as i32) / groups as f32;
        coeff.extend(std::iter::repeat(value).take(groups));
    }
    let min = coeff.iter().copied().fold(f32::INFINITY, f32::min);
    let coeff: Vec<f32> = coeff.into_iter().map(|c| c / min).collect();
    let len = coeff.len();
    Tensor::from_vec(coeff, len, device)
}

/// Rescales per-group KL terms so no group dominates while the KL coefficient
/// is still annealing.
///
/// `kl_all` holds one `(batch,)` tensor per group in decode order. Returns the
/// per-sample KL already multiplied by `kl_coeff`, the per-group coefficients
/// used, and the per-group mean KL for reporting.
pub fn kl_balancer(
    kl_all: &[Tensor],
    kl_coeff: f64,
    balance: bool,
    alpha: Option<&Tensor>,
) -> Result<(Tensor, Tensor, Tensor)> {
    let stacked = Tensor::stack(kl_all, 1)?;
    let (_batch, num_groups) = stacked.dims2()?;
    if balance && kl_coeff < 1.0 {
        let alpha = match alpha {
            Some(a) => a.unsqueeze(0)?,
            None => candle_core::bail!("balanced KL needs the per-group coefficients"),
        };
        let per_group = (stacked.abs()?.mean_keepdim(0)? + 0.01)?;
        let total = per_group.sum_all()?;
        let scaled = per_group.broadcast_div(&alpha)?.broadcast_mul(&total)?;
        let coeffs = scaled.broadcast_div(&scaled.mean_keepdim(1)?)?.detach();
        let kl = stacked.broadcast_mul(&coeffs)?.sum(1)?;
        let kl_vals = stacked.mean(0)?;
        Ok(((kl * kl_coeff)?, coeffs.squeeze(0)?, kl_vals))
    } else {
        let kl = stacked.sum(1)?;
        let kl_vals = stacked.mean(0)?;
        let coeffs = Tensor::ones(num_groups, DType::F32, stacked.device())?;
        Ok(((kl * kl_coeff)?, coeffs, kl_vals))
    }
}

/// Per-sample negative log-likelihood of a batch under the output mixture.
pub fn reconstruction_loss(dist: &DiscMixLogistic, x: &Tensor) -> Result<Tensor> {
    dist.log_prob(x)?.sum(1)?.neg()
}
