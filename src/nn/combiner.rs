//! Feature combiners joining the two towers at each latent group.

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::nn::regularizer::LayerRegistry;
use crate::nn::wn_conv::WeightNormConv1d;

/// Injects a decoder feature into an encoder feature: the decoder side is
/// projected with a 1x1 convolution and added in.
#[derive(Debug)]
pub struct EncCombiner {
    conv: WeightNormConv1d,
}

impl EncCombiner {
    pub fn new(
        c_enc: usize,
        c_dec: usize,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        let conv = WeightNormConv1d::new(c_dec, c_enc, 1, 0, 1, true, vb.pp("conv"), registry)?;
        Ok(Self { conv })
    }

    pub fn forward(&self, x_enc: &Tensor, x_dec: &Tensor) -> Result<Tensor> {
        x_enc + self.conv.forward(x_dec)?
    }
}

/// Merges a decoder feature with a sampled latent by concatenating along the
/// channel axis and projecting back down with a 1x1 convolution.
#[derive(Debug)]
pub struct DecCombiner {
    conv: WeightNormConv1d,
}

impl DecCombiner {
    pub fn new(
        c_dec: usize,
        c_z: usize,
        c_out: usize,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        let conv =
            WeightNormConv1d::new(c_dec + c_z, c_out, 1, 0, 1, true, vb.pp("conv"), registry)?;
        Ok(Self { conv })
    }

    pub fn forward(&self, x_dec: &Tensor, z: &Tensor) -> Result<Tensor> {
        let joined = Tensor::cat(&[x_dec, z], 1)?;
        self.conv.forward(&joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn enc_combiner_preserves_encoder_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut registry = LayerRegistry::default();
        let combiner = EncCombiner::new(8, 12, vb, &mut registry)?;
        let x_enc = Tensor::randn(0f32, 1f32, (2, 8, 16), &device)?;
        let x_dec = Tensor::randn(0f32, 1f32, (2, 12, 16), &device)?;
        assert_eq!(combiner.forward(&x_enc, &x_dec)?.dims(), &[2, 8, 16]);
        Ok(())
    }

    #[test]
    fn dec_combiner_projects_concatenation() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut registry = LayerRegistry::default();
        let combiner = DecCombiner::new(12, 4, 12, vb, &mut registry)?;
        let x_dec = Tensor::randn(0f32, 1f32, (2, 12, 16), &device)?;
        let z = Tensor::randn(0f32, 1f32, (2, 4, 16), &device)?;
        assert_eq!(combiner.forward(&x_dec, &z)?.dims(), &[2, 12, 16]);
        Ok(())
    }
}
