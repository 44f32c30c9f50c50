//! Primitive operators shared by the tower cells.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{batch_norm, linear, BatchNorm, BatchNormConfig, Linear, Module, ModuleT, VarBuilder};

use crate::config::PrimitiveKind;
use crate::nn::cell::Stride;
use crate::nn::regularizer::LayerRegistry;
use crate::nn::wn_conv::WeightNormConv1d;

/// Numerically stable `log(1 + exp(x))`.
pub fn softplus(xs: &Tensor) -> Result<Tensor> {
    let linear_part = xs.relu()?;
    let log_part = ((xs.abs()?.neg()?.exp()? + 1.0)?).log()?;
    linear_part + log_part
}

/// Stable log-sum-exp reduction over `dim` (the dimension is removed).
pub fn log_sum_exp(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let max = xs.max_keepdim(dim)?;
    let sum = xs.broadcast_sub(&max)?.exp()?.sum(dim)?;
    sum.log()? + max.squeeze(dim)?
}

fn tracked_batch_norm(
    channels: usize,
    vb: VarBuilder,
    registry: &mut LayerRegistry,
) -> Result<BatchNorm> {
    let bn = batch_norm(
        channels,
        BatchNormConfig {
            eps: 1e-5,
            momentum: 0.05,
            ..Default::default()
        },
        vb,
    )?;
    registry.register_bn(&bn);
    Ok(bn)
}

/// Batch norm and swish computed in F32 regardless of the stream dtype; the
/// reduced precision of F16 batch statistics is audible downstream.
fn bn_swish(bn: &BatchNorm, xs: &Tensor, train: bool) -> Result<Tensor> {
    let dtype = xs.dtype();
    let h = bn.forward_t(&xs.to_dtype(DType::F32)?, train)?.silu()?;
    h.to_dtype(dtype)
}

fn upsample2(xs: &Tensor) -> Result<Tensor> {
    let len = xs.dim(D::Minus1)?;
    xs.upsample_nearest1d(2 * len)
}

/// BN + Swish + 3-tap weight-normalized convolution; the workhorse of the
/// encoder-side cells.
#[derive(Debug)]
struct BnSwishConv {
    bn: BatchNorm,
    conv: WeightNormConv1d,
    upsample: bool,
}

impl BnSwishConv {
    fn new(
        c_in: usize,
        c_out: usize,
        stride: Stride,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        let bn = tracked_batch_norm(c_in, vb.pp("bn"), registry)?;
        let conv_stride = match stride {
            Stride::Down => 2,
            _ => 1,
        };
        let conv =
            WeightNormConv1d::new(c_in, c_out, 3, 1, conv_stride, true, vb.pp("conv"), registry)?;
        Ok(Self {
            bn,
            conv,
            upsample: stride == Stride::Up,
        })
    }
}

impl ModuleT for BnSwishConv {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = bn_swish(&self.bn, xs, train)?;
        if self.upsample {
            h = upsample2(&h)?;
        }
        self.conv.forward(&h)
    }
}

/// Mobile inverted residual: expand 1x1, depthwise k-tap, project 1x1, with
/// batch norms around each stage.
#[derive(Debug)]
struct InvertedResidual {
    bn0: BatchNorm,
    expand: WeightNormConv1d,
    bn1: BatchNorm,
    depthwise: WeightNormConv1d,
    bn2: BatchNorm,
    project: WeightNormConv1d,
    bn3: BatchNorm,
    upsample: bool,
}

impl InvertedResidual {
    fn new(
        c_in: usize,
        c_out: usize,
        expansion: usize,
        kernel_size: usize,
        stride: Stride,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        let hidden = c_in * expansion;
        let bn0 = tracked_batch_norm(c_in, vb.pp("bn0"), registry)?;
        let expand_stride = match stride {
            Stride::Down => 2,
            _ => 1,
        };
        let expand = WeightNormConv1d::new(
            c_in,
            hidden,
            1,
            0,
            expand_stride,
            false,
            vb.pp("expand"),
            registry,
        )?;
        let bn1 = tracked_batch_norm(hidden, vb.pp("bn1"), registry)?;
        let depthwise = WeightNormConv1d::grouped(
            hidden,
            hidden,
            kernel_size,
            (kernel_size - 1) / 2,
            1,
            hidden,
            false,
            vb.pp("dw"),
            registry,
        )?;
        let bn2 = tracked_batch_norm(hidden, vb.pp("bn2"), registry)?;
        let project =
            WeightNormConv1d::new(hidden, c_out, 1, 0, 1, false, vb.pp("project"), registry)?;
        let bn3 = tracked_batch_norm(c_out, vb.pp("bn3"), registry)?;
        Ok(Self {
            bn0,
            expand,
            bn1,
            depthwise,
            bn2,
            project,
            bn3,
            upsample: stride == Stride::Up,
        })
    }
}

impl ModuleT for InvertedResidual {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let dtype = xs.dtype();
        let mut h = self
            .bn0
            .forward_t(&xs.to_dtype(DType::F32)?, train)?
            .to_dtype(dtype)?;
        if self.upsample {
            h = upsample2(&h)?;
        }
        let h = self.expand.forward(&h)?;
        let h = bn_swish(&self.bn1, &h, train)?;
        let h = self.depthwise.forward(&h)?;
        let h = bn_swish(&self.bn2, &h, train)?;
        let h = self.project.forward(&h)?;
        self.bn3
            .forward_t(&h.to_dtype(DType::F32)?, train)?
            .to_dtype(dtype)
    }
}

/// One primitive from the architecture specification.
#[derive(Debug)]
pub enum Op {
    ResBnSwish(BnSwishConv2),
    MConv(InvertedResidual),
}

/// Two chained BN-Swish convolutions; the stride sits on the first.
#[derive(Debug)]
pub struct BnSwishConv2 {
    first: BnSwishConv,
    second: BnSwishConv,
}

impl Op {
    pub fn new(
        kind: PrimitiveKind,
        c_in: usize,
        c_out: usize,
        stride: Stride,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        match kind {
            PrimitiveKind::ResBnSwish => {
                let first = BnSwishConv::new(c_in, c_out, stride, vb.pp("conv0"), registry)?;
                let second =
                    BnSwishConv::new(c_out, c_out, Stride::Normal, vb.pp("conv1"), registry)?;
                Ok(Self::ResBnSwish(BnSwishConv2 { first, second }))
            }
            PrimitiveKind::MConvE6K5 => Ok(Self::MConv(InvertedResidual::new(
                c_in, c_out, 6, 5, stride, vb, registry,
            )?)),
            PrimitiveKind::MConvE3K5 => Ok(Self::MConv(InvertedResidual::new(
                c_in, c_out, 3, 5, stride, vb, registry,
            )?)),
        }
    }
}

impl ModuleT for Op {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::ResBnSwish(ops) => {
                let h = ops.first.forward_t(xs, train)?;
                ops.second.forward_t(&h, train)
            }
            Self::MConv(op) => op.forward_t(xs, train),
        }
    }
}

/// Channel-wise gate computed from the time-pooled feature.
#[derive(Debug)]
pub struct SqueezeExcite {
    reduce: Linear,
    expand: Linear,
}

impl SqueezeExcite {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = (channels / 16).max(4);
        let reduce = linear(channels, hidden, vb.pp("reduce"))?;
        let expand = linear(hidden, channels, vb.pp("expand"))?;
        Ok(Self { reduce, expand })
    }
}

impl Module for SqueezeExcite {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let pooled = xs.mean(D::Minus1)?.to_dtype(DType::F32)?;
        let gate = self.reduce.forward(&pooled)?.relu()?;
        let gate = candle_nn::ops::sigmoid(&self.expand.forward(&gate)?)?;
        xs.broadcast_mul(&gate.to_dtype(xs.dtype())?.unsqueeze(D::Minus1)?)
    }
}

/// Projection on the residual branch, sized to the cell's stride and channel
/// change.
#[derive(Debug)]
pub enum SkipConnection {
    Identity,
    /// 1x1 channel projection at stride 1.
    Conv(WeightNormConv1d),
    /// Stride-2 reduction: two half-width convolutions, the second over the
    /// input shifted by one step, concatenated on the channel axis.
    FactorizedReduce {
        half_a: WeightNormConv1d,
        half_b: WeightNormConv1d,
    },
    /// Nearest-neighbor upsample followed by a 1x1 projection.
    UpsampleConv(WeightNormConv1d),
}

impl SkipConnection {
    pub fn new(
        c_in: usize,
        c_out: usize,
        stride: Stride,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        match stride {
            Stride::Normal if c_in == c_out => Ok(Self::Identity),
            Stride::Normal => Ok(Self::Conv(WeightNormConv1d::new(
                c_in, c_out, 1, 0, 1, false, vb, registry,
            )?)),
            Stride::Down => {
                if c_out % 2 != 0 {
                    candle_core::bail!("factorized reduce needs an even channel count");
                }
                let half_a = WeightNormConv1d::new(
                    c_in,
                    c_out / 2,
                    1,
                    0,
                    2,
                    false,
                    vb.pp("half_a"),
                    registry,
                )?;
                let half_b = WeightNormConv1d::new(
                    c_in,
                    c_out / 2,
                    1,
                    0,
                    2,
                    false,
                    vb.pp("half_b"),
                    registry,
                )?;
                Ok(Self::FactorizedReduce { half_a, half_b })
            }
            Stride::Up => Ok(Self::UpsampleConv(WeightNormConv1d::new(
                c_in, c_out, 1, 0, 1, false, vb, registry,
            )?)),
        }
    }
}

impl Module for SkipConnection {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(xs.clone()),
            Self::Conv(conv) => conv.forward(xs),
            Self::FactorizedReduce { half_a, half_b } => {
                let len = xs.dim(D::Minus1)?;
                let shifted = xs
                    .narrow(D::Minus1, 1, len - 1)?
                    .pad_with_zeros(D::Minus1, 0, 1)?;
                let a = half_a.forward(xs)?;
                let b = half_b.forward(&shifted)?;
                Tensor::cat(&[a, b], 1)
            }
            Self::UpsampleConv(conv) => conv.forward(&upsample2(xs)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn softplus_matches_reference() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![-30f32, -1., 0., 1., 30.], 5, &device)?;
        let y = softplus(&x)?.to_vec1::<f32>()?;
        for (xi, yi) in [-30f64, -1., 0., 1., 30.].iter().zip(y) {
            let expected = if *xi > 20. { *xi } else { (xi.exp() + 1.).ln() };
            assert!((yi as f64 - expected).abs() < 1e-5, "softplus({xi}) = {yi}");
        }
        Ok(())
    }

    #[test]
    fn log_sum_exp_matches_naive() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![1f32, 2., 3., -1., 0., 1.], (2, 3), &device)?;
        let lse = log_sum_exp(&x, 1)?.to_vec1::<f32>()?;
        let naive0 = (1f64.exp() + 2f64.exp() + 3f64.exp()).ln();
        let naive1 = ((-1f64).exp() + 0f64.exp() + 1f64.exp()).ln();
        assert!((lse[0] as f64 - naive0).abs() < 1e-5);
        assert!((lse[1] as f64 - naive1).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn skip_connections_produce_expected_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut registry = LayerRegistry::default();
        let x = Tensor::randn(0f32, 1f32, (2, 8, 16), &device)?;

        let down = SkipConnection::new(8, 16, Stride::Down, vb.pp("down"), &mut registry)?;
        assert_eq!(down.forward(&x)?.dims(), &[2, 16, 8]);

        let up = SkipConnection::new(8, 4, Stride::Up, vb.pp("up"), &mut registry)?;
        assert_eq!(up.forward(&x)?.dims(), &[2, 4, 32]);

        let id = SkipConnection::new(8, 8, Stride::Normal, vb.pp("id"), &mut registry)?;
        assert_eq!(id.forward(&x)?.dims(), &[2, 8, 16]);
        Ok(())
    }
}
