//! Latent and output distributions.

use candle_core::{DType, Device, Result, Tensor};

use crate::nn::ops::{log_sum_exp, softplus};

/// Floor applied to mixture log-scales before exponentiation.
const LOG_SCALE_FLOOR: f64 = -7.0;

const HALF_LOG_TWO_PI: f64 = 0.918_938_533_204_672_7;

/// Smoothly bounds a parameter map to `(-5, 5)`.
///
/// Gaussian parameters need a ceiling as well as a floor: with residual
/// posteriors the prior and posterior log-scales add, and an unbounded sum
/// blows up `exp` deep in the hierarchy.
fn soft_clamp(xs: &Tensor) -> Result<Tensor> {
    (xs / 5.)?.tanh()? * 5.
}

/// Diagonal Gaussian over a latent tensor, parameterized by mean and
/// log-standard-deviation maps of the same shape.
#[derive(Debug, Clone)]
pub struct Normal {
    mu: Tensor,
    log_sigma: Tensor,
    sigma: Tensor,
}

impl Normal {
    pub fn new(mu: Tensor, log_sigma: Tensor) -> Result<Self> {
        Self::with_temperature(mu, log_sigma, 1.0)
    }

    /// Temperature scales the standard deviation; used for generation only,
    /// training always samples at temperature 1.
    pub fn with_temperature(mu: Tensor, log_sigma: Tensor, temperature: f64) -> Result<Self> {
        let mu = soft_clamp(&mu)?;
        let log_sigma = soft_clamp(&log_sigma)?;
        let sigma = (log_sigma.exp()? * temperature)?;
        Ok(Self {
            mu,
            log_sigma,
            sigma,
        })
    }

    /// Unit Gaussian of the given shape, the top-of-hierarchy prior.
    pub fn standard<S: Into<candle_core::Shape>>(
        shape: S,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let mu = Tensor::zeros(shape.clone(), dtype, device)?;
        let log_sigma = Tensor::zeros(shape, dtype, device)?;
        Self::new(mu, log_sigma)
    }

    pub fn mu(&self) -> &Tensor {
        &self.mu
    }

    pub fn log_sigma(&self) -> &Tensor {
        &self.log_sigma
    }

    /// Reparameterized draw.
    pub fn sample(&self) -> Result<Tensor> {
        let eps = self.mu.randn_like(0., 1.)?;
        &self.mu + eps.broadcast_mul(&self.sigma)?
    }

    pub fn log_p(&self, z: &Tensor) -> Result<Tensor> {
        let normalized = z.sub(&self.mu)?.div(&self.sigma)?;
        ((normalized.sqr()? * -0.5)? - &self.log_sigma)? - HALF_LOG_TWO_PI
    }

    /// Closed-form KL(self || other), elementwise.
    pub fn kl(&self, other: &Normal) -> Result<Tensor> {
        let mean_ratio = self.mu.sub(&other.mu)?.div(&other.sigma)?;
        let sigma_ratio = self.sigma.div(&other.sigma)?;
        let quad = ((mean_ratio.sqr()? + sigma_ratio.sqr()?)? * 0.5)?;
        ((quad - 0.5)? - sigma_ratio.log()?)
    }
}

/// Mixture of discretized logistics over a quantized signal in `[-1, 1]`.
///
/// Parameters arrive as a `(batch, 3 * num_mix, time)` tensor holding mixture
/// logits, means and log-scales, in that channel order.
#[derive(Debug)]
pub struct DiscMixLogistic {
    logit_probs: Tensor,
    means: Tensor,
    log_scales: Tensor,
    num_bits: usize,
}

impl DiscMixLogistic {
    pub fn new(params: &Tensor, num_bits: usize) -> Result<Self> {
        let (_b, c, _t) = params.dims3()?;
        if c % 3 != 0 {
            candle_core::bail!("mixture parameter channels {c} not divisible by 3");
        }
        let num_mix = c / 3;
        // narrowed views are strided; `gather` in `sample` needs contiguous inputs
        let logit_probs = params.narrow(1, 0, num_mix)?.contiguous()?;
        let means = params.narrow(1, num_mix, num_mix)?.contiguous()?;
        let log_scales = params.narrow(1, 2 * num_mix, num_mix)?.maximum(LOG_SCALE_FLOOR)?;
        Ok(Self {
            logit_probs,
            means,
            log_scales,
            num_bits,
        })
    }

    fn log_mix_weights(&self) -> Result<Tensor> {
        candle_nn::ops::log_softmax(&self.logit_probs, 1)
    }

    /// Log-probability of a `(batch, 1, time)` signal under the discretized
    /// mixture, summed over nothing: the result keeps the `(batch, time)`
    /// shape after mixing out the component axis.
    pub fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let levels = (1usize << self.num_bits) as f64;
        // half-width of one quantization bin in [-1, 1]
        let half_bin = 1. / (levels - 1.);

        let centered = x.broadcast_sub(&self.means)?;
        let inv_stdv = self.log_scales.neg()?.exp()?;
        let plus_in = ((&centered + half_bin)?.mul(&inv_stdv))?;
        let min_in = ((&centered - half_bin)?.mul(&inv_stdv))?;

        let cdf_delta = candle_nn::ops::sigmoid(&plus_in)?.sub(&candle_nn::ops::sigmoid(&min_in)?)?;
        let log_cdf_plus = plus_in.sub(&softplus(&plus_in)?)?;
        let log_one_minus_cdf_min = softplus(&min_in)?.neg()?;

        // density fallback for bins whose cdf difference underflows
        let mid_in = centered.mul(&inv_stdv)?;
        let log_pdf_mid =
            ((mid_in.sub(&self.log_scales)? - (softplus(&mid_in)? * 2.)?)? - (levels / 2.).ln())?;
        let log_delta = cdf_delta.clamp(1e-10, f64::INFINITY)?.log()?;
        let delta_mask = cdf_delta.gt(1e-5)?;
        let log_prob_mid = delta_mask.where_cond(&log_delta, &log_pdf_mid)?;

        // the outermost bins integrate the full tail
        let upper = x.gt(0.999)?.broadcast_as(log_prob_mid.shape())?;
        let lower = x.lt(-0.999)?.broadcast_as(log_prob_mid.shape())?;
        let log_probs = lower.where_cond(
            &log_cdf_plus,
            &upper.where_cond(&log_one_minus_cdf_min, &log_prob_mid)?,
        )?;

        let weighted = log_probs.add(&self.log_mix_weights()?)?;
        log_sum_exp(&weighted, 1)
    }

    /// Draw a signal. Temperature scales the logistic noise; at zero the draw
    /// collapses to the mean of the most likely component, which makes the
    /// pass deterministic.
    pub fn sample(&self, temperature: f64) -> Result<Tensor> {
        let logits = if temperature > 0. {
            let u = self.logit_probs.rand_like(1e-5, 1. - 1e-5)?;
            self.logit_probs.add(&u.log()?.neg()?.log()?.neg()?)?
        } else {
            self.logit_probs.clone()
        };
        let sel = logits.argmax_keepdim(1)?;
        let means = self.means.gather(&sel, 1)?;
        if temperature <= 0. {
            return means.clamp(-1., 1.);
        }
        let log_scales = self.log_scales.gather(&sel, 1)?;
        let u = means.rand_like(1e-5, 1. - 1e-5)?;
        let logistic = u.log()?.sub(&u.affine(-1., 1.)?.log()?)?;
        let x = means.add(&log_scales.exp()?.mul(&logistic)?.affine(temperature, 0.)?)?;
        x.clamp(-1., 1.)
    }

    /// Mixture mean, `sum_k pi_k mu_k`, one channel per time step.
    pub fn mean(&self) -> Result<Tensor> {
        let weights = candle_nn::ops::softmax(&self.logit_probs, 1)?;
        self.means.mul(&weights)?.sum_keepdim(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn kl_of_identical_normals_is_zero() -> Result<()> {
        let device = Device::Cpu;
        let mu = Tensor::randn(0f32, 1f32, (2, 4, 8), &device)?;
        let log_sigma = Tensor::randn(0f32, 0.3f32, (2, 4, 8), &device)?;
        let p = Normal::new(mu.clone(), log_sigma.clone())?;
        let q = Normal::new(mu, log_sigma)?;
        let kl = q.kl(&p)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(kl < 1e-6, "kl = {kl}");
        Ok(())
    }

    #[test]
    fn kl_matches_log_density_difference_in_expectation() -> Result<()> {
        let device = Device::Cpu;
        let mu = Tensor::randn(0f32, 1f32, (1, 2, 4), &device)?;
        let log_sigma = Tensor::zeros((1, 2, 4), DType::F32, &device)?;
        let q = Normal::new(mu, log_sigma)?;
        let p = Normal::standard((1, 2, 4), DType::F32, &device)?;

        let analytic = q.kl(&p)?.sum_all()?.to_vec0::<f32>()?;
        let mut acc = 0f32;
        let draws = 2000;
        for _ in 0..draws {
            let z = q.sample()?;
            let diff = q.log_p(&z)?.sub(&p.log_p(&z)?)?.sum_all()?.to_vec0::<f32>()?;
            acc += diff;
        }
        let empirical = acc / draws as f32;
        assert!(
            (analytic - empirical).abs() < 0.25 * analytic.abs().max(1.),
            "analytic {analytic}, empirical {empirical}"
        );
        Ok(())
    }

    #[test]
    fn extreme_parameters_stay_bounded() -> Result<()> {
        // residual parameterization can hand the distribution huge raw
        // values; the soft clamp must keep mu and sigma finite and bounded
        let device = Device::Cpu;
        let mu = Tensor::full(1e3f32, (1, 2, 4), &device)?;
        let log_sigma = Tensor::full(1e3f32, (1, 2, 4), &device)?;
        let dist = Normal::new(mu, log_sigma)?;
        let mu_max = dist.mu().abs()?.max_all()?.to_vec0::<f32>()?;
        let ls_max = dist.log_sigma().abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(mu_max <= 5.0, "mu escaped the clamp: {mu_max}");
        assert!(ls_max <= 5.0, "log_sigma escaped the clamp: {ls_max}");
        let z = dist.sample()?;
        assert!(z.abs()?.max_all()?.to_vec0::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn log_prob_integrates_to_one_over_all_levels() -> Result<()> {
        // with 3 bits the 8 bin masses must sum to 1 for any parameters
        let device = Device::Cpu;
        let params = Tensor::randn(0f32, 1f32, (1, 6, 1), &device)?;
        let dist = DiscMixLogistic::new(&params, 3)?;
        let mut total = 0f64;
        for level in 0..8 {
            let x_val = 2. * level as f64 / 7. - 1.;
            let x = Tensor::full(x_val as f32, (1, 1, 1), &device)?;
            total += dist.log_prob(&x)?.to_vec2::<f32>()?[0][0].exp() as f64;
        }
        assert!((total - 1.).abs() < 1e-3, "total mass {total}");
        Ok(())
    }

    #[test]
    fn zero_temperature_sampling_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let params = Tensor::randn(0f32, 1f32, (2, 30, 16), &device)?;
        let dist = DiscMixLogistic::new(&params, 8)?;
        let a = dist.sample(0.)?;
        let b = dist.sample(0.)?;
        let diff = a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.);
        assert_eq!(a.dims(), &[2, 1, 16]);
        Ok(())
    }

    #[test]
    fn samples_stay_in_range() -> Result<()> {
        let device = Device::Cpu;
        let params = Tensor::randn(0f32, 3f32, (2, 30, 16), &device)?;
        let dist = DiscMixLogistic::new(&params, 8)?;
        let x = dist.sample(1.)?;
        let max = x.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max <= 1.0);
        Ok(())
    }
}
