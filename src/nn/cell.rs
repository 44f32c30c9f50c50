//! The composable residual cell both towers are built from.

use candle_core::{Result, Tensor};
use candle_nn::{Module, ModuleT, VarBuilder};

use crate::config::PrimitiveKind;
use crate::nn::ops::{Op, SkipConnection, SqueezeExcite};
use crate::nn::regularizer::LayerRegistry;

/// Damping applied to the main branch; keeps deep residual stacks stable at
/// initialization.
const RESIDUAL_SCALE: f64 = 0.1;

/// Resolution change a cell performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stride {
    Normal,
    Down,
    Up,
}

/// Where in the towers a cell sits; determines its stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellRole {
    NormalPre,
    DownPre,
    NormalEnc,
    DownEnc,
    NormalDec,
    UpDec,
    NormalPost,
    UpPost,
}

impl CellRole {
    pub fn stride(&self) -> Stride {
        match self {
            Self::NormalPre | Self::NormalEnc | Self::NormalDec | Self::NormalPost => {
                Stride::Normal
            }
            Self::DownPre | Self::DownEnc => Stride::Down,
            Self::UpDec | Self::UpPost => Stride::Up,
        }
    }
}

/// Skip projection plus an ordered primitive chain, combined as
/// `skip(x) + 0.1 * chain(x)`, with optional squeeze-excite gating on the
/// chain output.
#[derive(Debug)]
pub struct Cell {
    skip: SkipConnection,
    ops: Vec<Op>,
    se: Option<SqueezeExcite>,
}

impl Cell {
    pub fn new(
        c_in: usize,
        c_out: usize,
        role: CellRole,
        arch: &[PrimitiveKind],
        use_se: bool,
        vb: VarBuilder,
        registry: &mut LayerRegistry,
    ) -> Result<Self> {
        if arch.is_empty() {
            candle_core::bail!("cell for role {role:?} has no primitives");
        }
        let stride = role.stride();
        let skip = SkipConnection::new(c_in, c_out, stride, vb.pp("skip"), registry)?;
        // the first primitive carries the stride and channel change
        let mut ops = Vec::with_capacity(arch.len());
        for (i, kind) in arch.iter().enumerate() {
            let (ci, s) = if i == 0 {
                (c_in, stride)
            } else {
                (c_out, Stride::Normal)
            };
            ops.push(Op::new(*kind, ci, c_out, s, vb.pp(format!("op{i}")), registry)?);
        }
        let se = if use_se {
            Some(SqueezeExcite::new(c_out, vb.pp("se"))?)
        } else {
            None
        };
        Ok(Self { skip, ops, se })
    }
}

impl ModuleT for Cell {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let skip = self.skip.forward(xs)?;
        let mut h = xs.clone();
        for op in &self.ops {
            h = op.forward_t(&h, train)?;
        }
        if let Some(se) = &self.se {
            h = se.forward(&h)?;
        }
        skip + h.affine(RESIDUAL_SCALE, 0.)?
    }
}
