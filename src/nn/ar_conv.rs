//! Autoregressive 1-D convolutions.
//!
//! Two mechanisms enforce the ordering constraint:
//! - *masked* convolutions zero every kernel tap after the center and gate the
//!   center tap with a channel-coupling mask, so output position `i` never
//!   sees input positions `> i` (nor `i` itself when `zero_diag` is set);
//! - *causal* convolutions pad on the left by `dilation * (kernel - 1)` so the
//!   output length matches the input with zero future leakage.

use candle_core::{Result, Tensor, D};
use candle_nn::init::DEFAULT_KAIMING_NORMAL;
use candle_nn::{Init, Module, VarBuilder};

use crate::nn::regularizer::LayerRegistry;
use crate::nn::wn_conv::NormalizedWeight;

/// Center-tap coupling between input and output channels.
///
/// Supports unequal channel counts as long as one divides the other: with
/// expansion, each input channel owns a contiguous block of output channels
/// and the block only sees strictly lower-indexed inputs (or `<=` without
/// `zero_diag`).
fn channel_mask(c_in: usize, groups: usize, c_out: usize, zero_diag: bool) -> Result<Vec<f32>> {
    if groups == c_in {
        // depthwise: the center tap is the diagonal itself
        let fill = if zero_diag { 0f32 } else { 1f32 };
        return Ok(vec![fill; c_out]);
    }
    if groups != 1 {
        candle_core::bail!("channel mask supports groups == 1 or depthwise, got {groups}");
    }
    if c_in % c_out != 0 && c_out % c_in != 0 {
        candle_core::bail!("channel counts must divide one another: {c_in} vs {c_out}");
    }
    let mut mask = vec![1f32; c_out * c_in];
    if c_out >= c_in {
        let ratio = c_out / c_in;
        for i in 0..c_in {
            for o in i * ratio..(i + 1) * ratio {
                for j in i + 1..c_in {
                    mask[o * c_in + j] = 0.;
                }
                if zero_diag {
                    mask[o * c_in + i] = 0.;
                }
            }
        }
    } else {
        let ratio = c_in / c_out;
        for o in 0..c_out {
            for j in (o + 1) * ratio..c_in {
                mask[o * c_in + j] = 0.;
            }
            if zero_diag {
                for j in o * ratio..(o + 1) * ratio {
                    mask[o * c_in + j] = 0.;
                }
            }
        }
    }
    Ok(mask)
}

/// Full kernel mask: taps after the center are zeroed, taps before it pass,
/// and the center tap carries the channel-coupling mask. `mirror` reverses
/// the mask along the tap axis for right-to-left context.
fn conv_mask(
    kernel_size: usize,
    c_in: usize,
    groups: usize,
    c_out: usize,
    zero_diag: bool,
    mirror: bool,
) -> Result<Vec<f32>> {
    let m = (kernel_size - 1) / 2;
    let cig = c_in / groups;
    let center = channel_mask(c_in, groups, c_out, zero_diag)?;
    let mut mask = vec![1f32; c_out * cig * kernel_size];
    for o in 0..c_out {
        for j in 0..cig {
            for k in 0..kernel_size {
                let idx = (o * cig + j) * kernel_size + k;
                if k > m {
                    mask[idx] = 0.;
                } else if k == m {
                    mask[idx] = center[o * cig + j];
                }
            }
        }
    }
    if mirror {
        for o in 0..c_out {
            for j in 0..cig {
                let base = (o * cig + j) * kernel_size;
                mask[base..base + kernel_size].reverse();
            }
        }
    }
    Ok(mask)
}

/// Options for [`ArConv1d`].
#[derive(Debug, Clone, Copy)]
pub struct ArConv1dConfig {
    pub dilation: usize,
    pub groups: usize,
    pub bias: bool,
    /// Left-pad by `dilation * (kernel - 1)` instead of symmetric padding.
    pub causal: bool,
    /// Apply the autoregressive kernel mask.
    pub masked: bool,
    /// Exclude the current position from the receptive field (masked only).
    pub zero_diag: bool,
    /// Reverse the mask along the tap axis (masked only).
    pub mirror: bool,
    /// Scales the realized kernel at initialization.
    pub init_coeff: f64,
}

impl Default for ArConv1dConfig {
    fn default() -> Self {
        Self {
            dilation: 1,
            groups: 1,
            bias: true,
            causal: false,
            masked: false,
            zero_diag: false,
            mirror: false,
            init_coeff: 1.0,
        }
    }
}

/// Weight-normalized convolution restricted to autoregressive context.
#[derive(Debug, Clone)]
pub struct ArConv1d {
    weight: NormalizedWeight,
    bias: Option<Tensor>,
    padding: usize,
    causal_pad: usize,
    dilation: usize,
    groups: usize,
}

impl ArConv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: ArConv1dConfig,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        if in_channels % config.groups != 0 {
            candle_core::bail!("groups {} must divide in_channels {in_channels}", config.groups);
        }
        let raw = vb.get_with_hints(
            (out_channels, in_channels / config.groups, kernel_size),
            "weight",
            DEFAULT_KAIMING_NORMAL,
        )?;
        let log_norm =
            vb.get_with_hints((out_channels, 1, 1), "log_weight_norm", Init::Const(0.))?;
        let mask = if config.masked {
            let data = conv_mask(
                kernel_size,
                in_channels,
                config.groups,
                out_channels,
                config.zero_diag,
                config.mirror,
            )?;
            Some(Tensor::from_vec(
                data,
                (out_channels, in_channels / config.groups, kernel_size),
                vb.device(),
            )?)
        } else {
            None
        };
        let weight = NormalizedWeight::new(raw, log_norm, mask, config.init_coeff)?;
        registry.register_conv(weight.clone());
        let bias = if config.bias {
            Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.))?)
        } else {
            None
        };
        let (padding, causal_pad) = if config.causal {
            (0, config.dilation * (kernel_size - 1))
        } else {
            (config.dilation * (kernel_size - 1) / 2, 0)
        };
        Ok(Self {
            weight,
            bias,
            padding,
            causal_pad,
            dilation: config.dilation,
            groups: config.groups,
        })
    }
}

impl Module for ArConv1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = if self.causal_pad > 0 {
            xs.pad_with_zeros(D::Minus1, self.causal_pad, 0)?
        } else {
            xs.clone()
        };
        let kernel = self.weight.realized()?.to_dtype(xs.dtype())?;
        let out = xs.conv1d(&kernel, self.padding, 1, self.dilation, self.groups)?;
        match &self.bias {
            Some(b) => {
                let b = b.to_dtype(out.dtype())?.reshape((1, (), 1))?;
                out.broadcast_add(&b)
            }
            None => Ok(out),
        }
    }
}

/// ELU followed by an autoregressive convolution.
#[derive(Debug, Clone)]
pub struct EluConv {
    conv: ArConv1d,
}

impl EluConv {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: ArConv1dConfig,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        let conv = ArConv1d::new(
            in_channels,
            out_channels,
            kernel_size,
            config,
            vb.pp("conv"),
            registry,
        )?;
        Ok(Self { conv })
    }
}

impl Module for EluConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(&xs.elu(1.0)?)
    }
}

/// Identity pass-through on the latent stream of a flow cell.
///
/// A zero-diagonal identity would be the zero map, so the request is
/// rejected at construction.
#[derive(Debug, Clone, Copy)]
pub struct ArIdentity;

impl ArIdentity {
    pub fn new(zero_diag: bool) -> Result<Self> {
        if zero_diag {
            candle_core::bail!("an identity skip with zero diagonal is the zero operation");
        }
        Ok(Self)
    }
}

impl Module for ArIdentity {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(xs.clone())
    }
}
