//! Neural building blocks for the encoder/decoder towers.

pub mod ar_conv;
pub mod cell;
pub mod combiner;
pub mod distribution;
pub mod flow;
pub mod ops;
pub mod regularizer;
pub mod wn_conv;

pub use ar_conv::{ArConv1d, ArConv1dConfig, EluConv};
pub use cell::{Cell, CellRole, Stride};
pub use combiner::{DecCombiner, EncCombiner};
pub use distribution::{DiscMixLogistic, Normal};
pub use flow::{FlowCell, FlowTransformKind, PairedFlowCell};
pub use regularizer::{LayerRegistry, SpectralState};
pub use wn_conv::WeightNormConv1d;
