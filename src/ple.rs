//! PLE kernels: the operations the programmable post-processing block runs and
//! the constraints each one puts on tiling.

use enum_iterator::Sequence;
use num_rational::Ratio;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::common::{BlockConfig, DataType, TensorShape};
use crate::hardware::ALL_BLOCK_CONFIGS;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Sequence, Deserialize, Serialize)]
pub enum PleOperation {
    Passthrough,
    Addition,
    AdditionRescale,
    AvgPool3x3Stride1,
    MaxPool2x2Stride2,
    MaxPool3x3Stride2Even,
    MaxPool3x3Stride2Odd,
    MeanXy7x7,
    MeanXy8x8,
    Sigmoid,
    LeakyRelu,
    Interleave2x2,
    Downsample2x2,
    TransposeXy,
}

/// How a PLE kernel scales the H, W and C of its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ShapeMultiplier {
    pub h: Ratio<u32>,
    pub w: Ratio<u32>,
    pub c: Ratio<u32>,
}

/// Identifies a PLE kernel binary. Two PLE schedulers with the same id can
/// share one loaded kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct PleKernelId {
    pub operation: PleOperation,
    pub block_config: BlockConfig,
    pub signed: bool,
}

impl ShapeMultiplier {
    pub fn identity() -> Self {
        ShapeMultiplier {
            h: Ratio::from_integer(1),
            w: Ratio::from_integer(1),
            c: Ratio::from_integer(1),
        }
    }

    fn new(h: (u32, u32), w: (u32, u32), c: (u32, u32)) -> Self {
        ShapeMultiplier {
            h: Ratio::new(h.0, h.1),
            w: Ratio::new(w.0, w.1),
            c: Ratio::new(c.0, c.1),
        }
    }

    /// Applies the multiplier to a stripe or tensor shape, rounding up.
    pub fn apply(&self, shape: &TensorShape) -> TensorShape {
        let scale = |v: u32, m: Ratio<u32>| (Ratio::from_integer(v) * m).ceil().to_integer();
        [
            shape[0],
            scale(shape[1], self.h),
            scale(shape[2], self.w),
            scale(shape[3], self.c),
        ]
    }

    /// The inverse of [ShapeMultiplier::apply]: the input extent needed to
    /// produce `shape`.
    pub fn invert(&self, shape: &TensorShape) -> TensorShape {
        let scale = |v: u32, m: Ratio<u32>| (Ratio::from_integer(v) / m).ceil().to_integer();
        [
            shape[0],
            scale(shape[1], self.h),
            scale(shape[2], self.w),
            scale(shape[3], self.c),
        ]
    }
}

impl PleOperation {
    pub fn num_inputs(&self) -> usize {
        match self {
            PleOperation::Addition | PleOperation::AdditionRescale => 2,
            _ => 1,
        }
    }

    pub fn shape_multiplier(&self) -> ShapeMultiplier {
        match self {
            PleOperation::MaxPool2x2Stride2
            | PleOperation::MaxPool3x3Stride2Even
            | PleOperation::MaxPool3x3Stride2Odd
            | PleOperation::Downsample2x2 => ShapeMultiplier::new((1, 2), (1, 2), (1, 1)),
            PleOperation::Interleave2x2 => ShapeMultiplier::new((1, 2), (1, 2), (4, 1)),
            _ => ShapeMultiplier::identity(),
        }
    }

    /// Whether the kernel's window straddles stripe boundaries in width, which
    /// it cannot handle.
    pub fn forbids_width_split(&self) -> bool {
        matches!(
            self,
            PleOperation::MaxPool3x3Stride2Even | PleOperation::MaxPool3x3Stride2Odd
        )
    }

    /// Whether the kernel reduces over the whole of H and W, so that no split
    /// in either is possible.
    pub fn requires_full_tensor(&self) -> bool {
        matches!(
            self,
            PleOperation::MeanXy7x7 | PleOperation::MeanXy8x8 | PleOperation::AvgPool3x3Stride1
        )
    }

    pub fn is_block_config_allowed(&self, block_config: &BlockConfig) -> bool {
        let (w, h) = (block_config.width, block_config.height);
        match self {
            PleOperation::Addition
            | PleOperation::AdditionRescale
            | PleOperation::AvgPool3x3Stride1
            | PleOperation::Interleave2x2 => (w, h) == (16, 16),
            PleOperation::MaxPool2x2Stride2 => {
                matches!((w, h), (16, 16) | (8, 16) | (8, 32) | (8, 8))
            }
            PleOperation::MaxPool3x3Stride2Even | PleOperation::MaxPool3x3Stride2Odd => {
                matches!((w, h), (8, 16) | (8, 32) | (8, 8))
            }
            PleOperation::MeanXy7x7 | PleOperation::MeanXy8x8 => (w, h) == (8, 8),
            _ => ALL_BLOCK_CONFIGS.contains(block_config),
        }
    }

    pub fn filter_block_configs(&self, block_configs: &[BlockConfig]) -> Vec<BlockConfig> {
        block_configs
            .iter()
            .copied()
            .filter(|b| self.is_block_config_allowed(b))
            .collect()
    }
}

impl Display for PleOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PleOperation::Passthrough => "PASSTHROUGH",
            PleOperation::Addition => "ADDITION",
            PleOperation::AdditionRescale => "ADDITION_RESCALE",
            PleOperation::AvgPool3x3Stride1 => "AVGPOOL_3X3_1_1_UDMA",
            PleOperation::MaxPool2x2Stride2 => "MAXPOOL_2X2_2_2",
            PleOperation::MaxPool3x3Stride2Even => "MAXPOOL_3X3_2_2_EVEN",
            PleOperation::MaxPool3x3Stride2Odd => "MAXPOOL_3X3_2_2_ODD",
            PleOperation::MeanXy7x7 => "MEAN_XY_7X7",
            PleOperation::MeanXy8x8 => "MEAN_XY_8X8",
            PleOperation::Sigmoid => "SIGMOID",
            PleOperation::LeakyRelu => "LEAKY_RELU",
            PleOperation::Interleave2x2 => "INTERLEAVE_2X2_2_2",
            PleOperation::Downsample2x2 => "DOWNSAMPLE_2X2",
            PleOperation::TransposeXy => "TRANSPOSE_XY",
        };
        write!(f, "{name}")
    }
}

impl PleKernelId {
    pub fn new(operation: PleOperation, block_config: BlockConfig, data_type: DataType) -> Self {
        PleKernelId {
            operation,
            block_config,
            signed: data_type.is_signed(),
        }
    }
}

impl Display for PleKernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}X{}{}",
            self.operation,
            self.block_config.width,
            self.block_config.height,
            if self.signed { "_S" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enum_iterator::all;

    #[test]
    fn test_every_operation_allows_some_block_config() {
        for op in all::<PleOperation>() {
            assert!(
                !op.filter_block_configs(&ALL_BLOCK_CONFIGS).is_empty(),
                "{op} has no block config"
            );
        }
    }

    #[test]
    fn test_pooling_halves_spatial_dims() {
        let m = PleOperation::MaxPool2x2Stride2.shape_multiplier();
        assert_eq!(m.apply(&[1, 16, 15, 32]), [1, 8, 8, 32]);
        assert_eq!(m.invert(&[1, 8, 8, 32]), [1, 16, 16, 32]);
    }

    #[test]
    fn test_kernel_id_display() {
        let id = PleKernelId::new(
            PleOperation::Sigmoid,
            BlockConfig::new(16, 8),
            DataType::I8,
        );
        assert_eq!(id.to_string(), "SIGMOID_16X8_S");
    }
}
