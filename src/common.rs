use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub type DimSize = u32;

/// A 4-D tensor shape in NHWC order.
pub type TensorShape = [DimSize; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum DataType {
    U8,
    I8,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QuantizationInfo {
    pub zero_point: i32,
    pub scale: f32,
    /// Per-channel scales. When present, these supersede `scale`.
    pub per_channel_scales: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Stride {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Padding {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

/// The output block computed by one MCE/PLE pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct BlockConfig {
    pub width: u32,
    pub height: u32,
}

impl DataType {
    pub fn is_signed(&self) -> bool {
        matches!(self, DataType::I8)
    }

    pub fn bounds(&self) -> (i32, i32) {
        match self {
            DataType::U8 => (0, 255),
            DataType::I8 => (-128, 127),
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::U8 => write!(f, "u8"),
            DataType::I8 => write!(f, "i8"),
        }
    }
}

impl QuantizationInfo {
    pub fn new(zero_point: i32, scale: f32) -> Self {
        QuantizationInfo {
            zero_point,
            scale,
            per_channel_scales: None,
        }
    }
}

impl Default for QuantizationInfo {
    fn default() -> Self {
        QuantizationInfo::new(0, 1.0)
    }
}

impl Stride {
    pub const UNIT: Stride = Stride { x: 1, y: 1 };
}

impl BlockConfig {
    pub const fn new(width: u32, height: u32) -> Self {
        BlockConfig { width, height }
    }
}

impl Display for BlockConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

pub fn height(shape: &TensorShape) -> DimSize {
    shape[1]
}

pub fn width(shape: &TensorShape) -> DimSize {
    shape[2]
}

pub fn channels(shape: &TensorShape) -> DimSize {
    shape[3]
}

pub fn num_elements(shape: &TensorShape) -> u64 {
    shape.iter().map(|&d| u64::from(d)).product()
}
