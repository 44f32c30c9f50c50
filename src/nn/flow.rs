//! Autoregressive normalizing flows refining the posterior samples.

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::config::ArPrimitiveKind;
use crate::nn::ar_conv::{ArConv1d, ArConv1dConfig, ArIdentity, EluConv};
use crate::nn::ops::{log_sum_exp, softplus};
use crate::nn::regularizer::LayerRegistry;
use crate::nn::wn_conv::WeightNormConv1d;

/// Hidden-width expansion ratio of the inverted-residual block.
const EXPANSION: usize = 6;

/// Mixture size of the logistic-CDF transform.
const NUM_MIX: usize = 3;

/// Scales the final projection kernels so the flows start near the identity.
const PROJ_INIT_COEFF: f64 = 0.1;

/// Causal inverted-residual block computing hidden features from the latent,
/// with the conditioning features injected after the expansion convolution.
#[derive(Debug)]
struct ArInvertedResidual {
    expand: ArConv1d,
    cond: WeightNormConv1d,
    depthwise: ArConv1d,
    hidden_dim: usize,
}

impl ArInvertedResidual {
    fn new(
        num_z: usize,
        num_ftr: usize,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        let hidden_dim = num_z * EXPANSION;
        let expand = ArConv1d::new(
            num_z,
            hidden_dim,
            3,
            ArConv1dConfig {
                causal: true,
                ..Default::default()
            },
            vb.pp("expand"),
            registry,
        )?;
        let cond = WeightNormConv1d::new(num_ftr, hidden_dim, 1, 0, 1, true, vb.pp("cond"), registry)?;
        let depthwise = ArConv1d::new(
            hidden_dim,
            hidden_dim,
            5,
            ArConv1dConfig {
                causal: true,
                groups: hidden_dim,
                ..Default::default()
            },
            vb.pp("dw"),
            registry,
        )?;
        Ok(Self {
            expand,
            cond,
            depthwise,
            hidden_dim,
        })
    }

    fn forward(&self, z: &Tensor, ftr: &Tensor) -> Result<Tensor> {
        let h = (self.expand.forward(z)? + self.cond.forward(ftr)?)?;
        let h = self.depthwise.forward(&h.elu(1.0)?)?;
        h.elu(1.0)
    }
}

/// Projects hidden features to the per-latent-channel parameters of the
/// logistic-CDF transform.
#[derive(Debug)]
struct MixLogCdfParam {
    conv: EluConv,
    num_z: usize,
    num_mix: usize,
}

impl MixLogCdfParam {
    fn new(
        num_z: usize,
        num_mix: usize,
        num_ftr: usize,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        // one dummy channel pads the split to 3m + 3
        let num_out = num_z * (3 * num_mix + 3);
        let conv = EluConv::new(
            num_ftr,
            num_out,
            1,
            ArConv1dConfig {
                masked: true,
                init_coeff: PROJ_INIT_COEFF,
                ..Default::default()
            },
            vb.pp("proj"),
            registry,
        )?;
        Ok(Self {
            conv,
            num_z,
            num_mix,
        })
    }

    /// Returns `(logit_pi, mu, log_s, log_a, b)` with a leading
    /// `(batch, num_z, ·, time)` layout.
    fn forward(&self, ftr: &Tensor) -> Result<(Tensor, Tensor, Tensor, Tensor, Tensor)> {
        let out = self.conv.forward(ftr)?;
        let (batch, channels, time) = out.dims3()?;
        let per_z = channels / self.num_z;
        let out = out.reshape((batch, self.num_z, per_z, time))?;
        let m = self.num_mix;
        let logit_pi = out.narrow(2, 0, m)?;
        let mu = out.narrow(2, m, m)?;
        let log_s = out.narrow(2, 2 * m, m)?;
        let log_a = out.narrow(2, 3 * m, 1)?;
        let b = out.narrow(2, 3 * m + 1, 1)?;
        Ok((logit_pi, mu, log_s, log_a, b))
    }
}

/// Monotonic mixture-of-logistics CDF transform with its analytic
/// log-determinant.
///
/// `z` is `(batch, num_z, time)`; the mixture parameters carry an extra
/// component axis at dim 2. The scale is floored before exponentiation and
/// both the CDF and its complement go through log-sum-exp.
pub fn mix_log_cdf_flow(
    z: &Tensor,
    logit_pi: &Tensor,
    mu: &Tensor,
    log_s: &Tensor,
    log_a: &Tensor,
    b: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let log_s = log_s.maximum(-7.0)?;
    let log_pi = candle_nn::ops::log_softmax(logit_pi, 2)?;

    let z = z.unsqueeze(2)?;
    let u = z.broadcast_sub(mu)?.mul(&log_s.neg()?.exp()?)?.neg()?;
    let softplus_u = softplus(&u)?;
    let log_mix_cdf_k = log_pi.sub(&softplus_u)?;
    let log_one_minus_mix_cdf_k = log_mix_cdf_k.add(&u)?;
    let log_mix_cdf = log_sum_exp(&log_mix_cdf_k, 2)?;
    let log_one_minus_mix_cdf = log_sum_exp(&log_one_minus_mix_cdf_k, 2)?;

    let log_a = log_a.squeeze(2)?;
    let b = b.squeeze(2)?;
    let new_z = log_a
        .exp()?
        .mul(&log_mix_cdf.sub(&log_one_minus_mix_cdf)?)?
        .add(&b)?;

    let log_mix_pdf = log_sum_exp(
        &log_pi
            .add(&u)?
            .sub(&log_s)?
            .sub(&(softplus_u * 2.)?)?,
        2,
    )?;
    let log_det = log_a
        .sub(&log_mix_cdf)?
        .sub(&log_one_minus_mix_cdf)?
        .add(&log_mix_pdf)?;

    Ok((new_z, log_det))
}

/// Which invertible transform a flow cell applies to the latent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTransformKind {
    /// Pure location shift `z' = z - mu`, zero log-determinant.
    Affine,
    /// Logistic-mixture CDF transform with analytic log-determinant.
    MixLogCdf,
}

#[derive(Debug)]
enum FlowTransform {
    Affine(EluConv),
    MixLogCdf(MixLogCdfParam),
}

/// Single autoregressive flow step.
#[derive(Debug)]
pub struct FlowCell {
    skip: ArIdentity,
    conv: ArInvertedResidual,
    refine: Vec<EluConv>,
    transform: FlowTransform,
}

impl FlowCell {
    pub fn new(
        num_z: usize,
        num_ftr: usize,
        num_c: usize,
        arch: &[ArPrimitiveKind],
        kind: FlowTransformKind,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        if num_c % num_z != 0 {
            candle_core::bail!(
                "flow cell channels {num_c} must be a multiple of the latent width {num_z}"
            );
        }
        let skip = ArIdentity::new(false)?;
        let conv = ArInvertedResidual::new(num_z, num_ftr, vb.pp("res"), registry)?;
        let mut refine = Vec::with_capacity(arch.len());
        for (i, prim) in arch.iter().enumerate() {
            let kernel = match prim {
                ArPrimitiveKind::ArConv3x3 => 3,
            };
            refine.push(EluConv::new(
                conv.hidden_dim,
                conv.hidden_dim,
                kernel,
                ArConv1dConfig {
                    causal: true,
                    ..Default::default()
                },
                vb.pp(format!("refine{i}")),
                registry,
            )?);
        }
        let transform = match kind {
            FlowTransformKind::Affine => FlowTransform::Affine(EluConv::new(
                conv.hidden_dim,
                num_z,
                1,
                ArConv1dConfig {
                    causal: true,
                    init_coeff: PROJ_INIT_COEFF,
                    ..Default::default()
                },
                vb.pp("mu"),
                registry,
            )?),
            FlowTransformKind::MixLogCdf => FlowTransform::MixLogCdf(MixLogCdfParam::new(
                num_z,
                NUM_MIX,
                conv.hidden_dim,
                vb.pp("cdf"),
                registry,
            )?),
        };
        Ok(Self {
            skip,
            conv,
            refine,
            transform,
        })
    }

    /// Returns the transformed latent and the elementwise log-determinant.
    pub fn forward(&self, z: &Tensor, ftr: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut s = self.conv.forward(z, ftr)?;
        for layer in &self.refine {
            s = layer.forward(&s)?;
        }
        match &self.transform {
            FlowTransform::Affine(mu_conv) => {
                let mu = mu_conv.forward(&s)?;
                let new_z = self.skip.forward(z)?.sub(&mu)?;
                let log_det = new_z.zeros_like()?;
                Ok((new_z, log_det))
            }
            FlowTransform::MixLogCdf(param) => {
                let (logit_pi, mu, log_s, log_a, b) = param.forward(&s)?;
                mix_log_cdf_flow(&self.skip.forward(z)?, &logit_pi, &mu, &log_s, &log_a, &b)
            }
        }
    }
}

/// Two flow cells applied back to back on the same conditioning features.
#[derive(Debug)]
pub struct PairedFlowCell {
    cell1: FlowCell,
    cell2: FlowCell,
}

impl PairedFlowCell {
    pub fn new(
        num_z: usize,
        num_ftr: usize,
        num_c: usize,
        arch: &[ArPrimitiveKind],
        kind: FlowTransformKind,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        let cell1 = FlowCell::new(num_z, num_ftr, num_c, arch, kind, vb.pp("cell1"), registry)?;
        let cell2 = FlowCell::new(num_z, num_ftr, num_c, arch, kind, vb.pp("cell2"), registry)?;
        Ok(Self { cell1, cell2 })
    }

    pub fn forward(&self, z: &Tensor, ftr: &Tensor) -> Result<(Tensor, Tensor)> {
        let (z1, log_det1) = self.cell1.forward(z, ftr)?;
        let (z2, log_det2) = self.cell2.forward(&z1, ftr)?;
        Ok((z2, (log_det1 + log_det2)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn paired(kind: FlowTransformKind) -> Result<(PairedFlowCell, Device)> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut registry = LayerRegistry::default();
        let cell = PairedFlowCell::new(
            4,
            8,
            16,
            &[ArPrimitiveKind::ArConv3x3],
            kind,
            vb,
            &mut registry,
        )?;
        Ok((cell, device))
    }

    #[test]
    fn rejects_indivisible_channel_count() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut registry = LayerRegistry::default();
        let r = FlowCell::new(4, 8, 10, &[], FlowTransformKind::Affine, vb, &mut registry);
        assert!(r.is_err());
        Ok(())
    }

    #[test]
    fn paired_affine_composes_shifts_with_zero_log_det() -> Result<()> {
        let (cell, device) = paired(FlowTransformKind::Affine)?;
        let z = Tensor::randn(0f32, 1f32, (2, 4, 16), &device)?;
        let ftr = Tensor::randn(0f32, 1f32, (2, 8, 16), &device)?;

        let (z1, d1) = cell.cell1.forward(&z, &ftr)?;
        let (z2, d2) = cell.cell2.forward(&z1, &ftr)?;
        let (z_pair, d_pair) = cell.forward(&z, &ftr)?;

        let diff = z_pair.sub(&z2)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        assert_eq!(d1.abs()?.max_all()?.to_vec0::<f32>()?, 0.);
        assert_eq!(d2.abs()?.max_all()?.to_vec0::<f32>()?, 0.);
        assert_eq!(d_pair.abs()?.max_all()?.to_vec0::<f32>()?, 0.);
        Ok(())
    }

    #[test]
    fn mix_log_cdf_flow_inverts_by_bisection() -> Result<()> {
        // the transform is strictly monotone per element, so bisection on z
        // with the same parameters must recover the input
        let device = Device::Cpu;
        let z = Tensor::randn(0f32, 0.5f32, (1, 2, 4), &device)?;
        let logit_pi = Tensor::randn(0f32, 1f32, (1, 2, 3, 4), &device)?;
        let mu = Tensor::randn(0f32, 1f32, (1, 2, 3, 4), &device)?;
        let log_s = Tensor::randn(0f32, 0.3f32, (1, 2, 3, 4), &device)?;
        let log_a = Tensor::randn(0f32, 0.3f32, (1, 2, 1, 4), &device)?;
        let b = Tensor::randn(0f32, 0.3f32, (1, 2, 1, 4), &device)?;

        let (target, _) = mix_log_cdf_flow(&z, &logit_pi, &mu, &log_s, &log_a, &b)?;

        let mut lo = Tensor::full(-50f32, z.dims(), &device)?;
        let mut hi = Tensor::full(50f32, z.dims(), &device)?;
        for _ in 0..60 {
            let mid = ((&lo + &hi)? * 0.5)?;
            let (out, _) = mix_log_cdf_flow(&mid, &logit_pi, &mu, &log_s, &log_a, &b)?;
            let below = out.lt(&target)?;
            lo = below.where_cond(&mid, &lo)?;
            hi = below.where_cond(&hi, &mid)?;
        }
        let recovered = ((&lo + &hi)? * 0.5)?;
        let err = recovered.sub(&z)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(err < 1e-3, "round-trip error {err}");
        Ok(())
    }

    #[test]
    fn mix_log_cdf_log_det_matches_finite_difference() -> Result<()> {
        let device = Device::Cpu;
        let z = Tensor::full(0.3f32, (1, 1, 1), &device)?;
        let logit_pi = Tensor::randn(0f32, 1f32, (1, 1, 3, 1), &device)?;
        let mu = Tensor::randn(0f32, 1f32, (1, 1, 3, 1), &device)?;
        let log_s = Tensor::randn(0f32, 0.3f32, (1, 1, 3, 1), &device)?;
        let log_a = Tensor::zeros((1, 1, 1, 1), DType::F32, &device)?;
        let b = Tensor::zeros((1, 1, 1, 1), DType::F32, &device)?;

        let (y0, log_det) = mix_log_cdf_flow(&z, &logit_pi, &mu, &log_s, &log_a, &b)?;
        let eps = 1e-3;
        let (y1, _) = mix_log_cdf_flow(&(&z + eps as f64)?, &logit_pi, &mu, &log_s, &log_a, &b)?;
        let slope = (y1.to_vec3::<f32>()?[0][0][0] - y0.to_vec3::<f32>()?[0][0][0]) / eps;
        let analytic = log_det.to_vec3::<f32>()?[0][0][0].exp();
        assert!(
            (slope - analytic).abs() / analytic < 1e-2,
            "fd {slope}, analytic {analytic}"
        );
        Ok(())
    }

    #[test]
    fn paired_mix_log_cdf_adds_log_dets() -> Result<()> {
        let (cell, device) = paired(FlowTransformKind::MixLogCdf)?;
        let z = Tensor::randn(0f32, 1f32, (2, 4, 16), &device)?;
        let ftr = Tensor::randn(0f32, 1f32, (2, 8, 16), &device)?;

        let (z1, d1) = cell.cell1.forward(&z, &ftr)?;
        let (_z2, d2) = cell.cell2.forward(&z1, &ftr)?;
        let (_zp, dp) = cell.forward(&z, &ftr)?;
        let diff = dp.sub(&(d1 + d2)?)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }
}
