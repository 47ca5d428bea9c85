//! The command stream: the agents the firmware runs and the dependencies
//! between them.
//!
//! Agents are identified by their position in the stream. A dependency names
//! another agent by its distance from the agent holding it and says how the
//! stripes of the two relate: `outer_ratio` is the ratio of their stripe
//! totals, `inner_ratio` how many stripes of the other agent gate how many of
//! this one within each outer group, and `boundary` whether edge stripes need
//! one extra stripe of the other agent.

use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::common::{BlockConfig, DataType, Padding, Stride};
use crate::graph::{BufferFormat, MceOperation};
use crate::lifetime::DramBufferId;
use crate::ple::PleKernelId;

pub mod dependency;
pub mod generator;

pub use generator::generate;

pub type AgentId = u32;

/// Read dependencies an agent can hold.
pub const MAX_READ_DEPENDENCIES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Sequence, Deserialize, Serialize)]
pub enum AgentKind {
    IfmStreamer,
    WgtStreamer,
    MceScheduler,
    PleLoader,
    PleScheduler,
    OfmStreamer,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DependencyRatio {
    pub other: u32,
    pub this: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Dependency {
    pub relative_agent_id: u8,
    pub outer_ratio: DependencyRatio,
    pub inner_ratio: DependencyRatio,
    pub boundary: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentDependencyInfo {
    pub num_stripes_total: u32,
    pub read: SmallVec<[Dependency; MAX_READ_DEPENDENCIES]>,
    pub write: Option<Dependency>,
    pub schedule: Option<Dependency>,
}

/// A region of SRAM cycled through stripe by stripe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Tile {
    /// Per-bank address of the first slot.
    pub base: u32,
    pub num_slots: u32,
    /// Per-bank bytes of one slot.
    pub slot_size: u32,
}

/// A stripe size or stripe count in H, W and C.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Hwc {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

/// Stripe sizes, counts and id strides of a scheduler that iterates output
/// H, W and C plus input depth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MceSizes {
    pub ofm_height: u32,
    pub ofm_width: u32,
    pub ofm_channels: u32,
    pub ifm_channels: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SupertensorCells {
    pub width: u32,
    pub channels: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum DramFormat {
    Nhwc,
    Nhwcb,
    FcafDeep,
    FcafWide,
}

/// What a feature-map streamer moves between a DRAM buffer and a tile.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FmsData {
    pub buffer_id: DramBufferId,
    /// Byte offset of this tensor within `buffer_id`.
    pub dram_offset: u32,
    pub data_type: DataType,
    pub format: DramFormat,
    pub tile: Tile,
    pub default_stripe_size: Hwc,
    pub edge_stripe_size: Hwc,
    pub supertensor_size_in_cells: SupertensorCells,
    pub num_stripes: Hwc,
    pub stripe_id_strides: Hwc,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct WgtSData {
    pub buffer_id: DramBufferId,
    /// Control-unit buffer holding the offset and size of each weight stripe.
    pub metadata_buffer_id: DramBufferId,
    pub tile: Tile,
    pub num_stripes: WgtStripes,
    pub stripe_id_strides: WgtStripes,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct WgtStripes {
    pub ofm_channels: u32,
    pub ifm_channels: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct FilterShape {
    pub height: u32,
    pub width: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ReluActivation {
    pub min: i32,
    pub max: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MceSData {
    pub ifm_tile: Tile,
    pub wgt_tile: Tile,
    pub block_size: BlockConfig,
    pub default_stripe_size: MceSizes,
    pub edge_stripe_size: MceSizes,
    pub num_stripes: MceSizes,
    pub stripe_id_strides: MceSizes,
    pub conv_stride: Stride,
    pub ifm_zero_point: i32,
    pub operation: MceOperation,
    pub filter_shape: FilterShape,
    pub padding: Padding,
    pub upscale_factor: u32,
    pub relu_activation: ReluActivation,
    pub ple_kernel_id: PleKernelId,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PleLData {
    pub ple_kernel_id: PleKernelId,
    /// Per-bank address the kernel is loaded to.
    pub sram_addr: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum PleInputMode {
    /// Inputs are tiles in SRAM written by a streamer or another PLE.
    Sram,
    /// Input arrives from the MCE with every OG active.
    MceAllOgs,
    /// Input arrives from the MCE with only some OGs producing data.
    MceOneOg,
}

/// Zero point and requantization of one PLE input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PleIfmInfo {
    pub zero_point: i32,
    pub multiplier: u16,
    pub shift: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PleSData {
    pub ofm_tile: Tile,
    pub ofm_zero_point: i32,
    pub default_stripe_size: Hwc,
    pub edge_stripe_size: Hwc,
    pub num_stripes: Hwc,
    pub stripe_id_strides: Hwc,
    pub input_mode: PleInputMode,
    pub ple_kernel_id: PleKernelId,
    pub ple_kernel_sram_addr: u32,
    pub ifm_tile0: Option<Tile>,
    pub ifm_info0: PleIfmInfo,
    pub ifm_tile1: Option<Tile>,
    pub ifm_info1: Option<PleIfmInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum AgentData {
    IfmStreamer(FmsData),
    WgtStreamer(WgtSData),
    MceScheduler(MceSData),
    PleLoader(PleLData),
    PleScheduler(PleSData),
    OfmStreamer(FmsData),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Agent {
    pub data: AgentData,
    pub info: AgentDependencyInfo,
}

/// The compiled program: agents in issue order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommandStream {
    pub agents: Vec<Agent>,
}

#[derive(Debug, Error)]
pub enum CommandStreamError {
    #[error("agent {consumer} depends on agent {producer}, {distance} agents back (at most {max} allowed)")]
    DependencyTooFar {
        consumer: AgentId,
        producer: AgentId,
        distance: u32,
        max: u32,
    },
    #[error("agent {agent} needs more than {max} read dependencies")]
    TooManyReadDependencies { agent: AgentId, max: usize },
    #[error("failed to encode the command stream: {0}")]
    Encoding(#[from] bincode::Error),
}

impl AgentKind {
    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::IfmStreamer => "IfmS",
            AgentKind::WgtStreamer => "WgtS",
            AgentKind::MceScheduler => "MceS",
            AgentKind::PleLoader => "PleL",
            AgentKind::PleScheduler => "PleS",
            AgentKind::OfmStreamer => "OfmS",
        }
    }

    pub fn is_streamer(&self) -> bool {
        matches!(
            self,
            AgentKind::IfmStreamer | AgentKind::WgtStreamer | AgentKind::OfmStreamer
        )
    }
}

impl DependencyRatio {
    pub const fn new(other: u32, this: u32) -> Self {
        DependencyRatio { other, this }
    }

    fn flipped(self) -> Self {
        DependencyRatio {
            other: self.this,
            this: self.other,
        }
    }
}

impl Dependency {
    /// The same relation seen from the other agent.
    pub fn flipped(&self) -> Self {
        Dependency {
            relative_agent_id: self.relative_agent_id,
            outer_ratio: self.outer_ratio.flipped(),
            inner_ratio: self.inner_ratio.flipped(),
            boundary: self.boundary,
        }
    }
}

impl From<BufferFormat> for DramFormat {
    fn from(format: BufferFormat) -> Self {
        match format {
            BufferFormat::Nhwc => DramFormat::Nhwc,
            BufferFormat::Nhwcb => DramFormat::Nhwcb,
            BufferFormat::FcafDeep => DramFormat::FcafDeep,
            BufferFormat::FcafWide => DramFormat::FcafWide,
            BufferFormat::Weight => panic!("weights are not a feature map format"),
        }
    }
}

impl Tile {
    /// The per-bank byte range the tile covers.
    pub fn range(&self) -> (u32, u32) {
        (self.base, self.base + self.num_slots * self.slot_size)
    }
}

impl Agent {
    pub fn kind(&self) -> AgentKind {
        match &self.data {
            AgentData::IfmStreamer(_) => AgentKind::IfmStreamer,
            AgentData::WgtStreamer(_) => AgentKind::WgtStreamer,
            AgentData::MceScheduler(_) => AgentKind::MceScheduler,
            AgentData::PleLoader(_) => AgentKind::PleLoader,
            AgentData::PleScheduler(_) => AgentKind::PleScheduler,
            AgentData::OfmStreamer(_) => AgentKind::OfmStreamer,
        }
    }
}

impl CommandStream {
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn count(&self, kind: AgentKind) -> usize {
        self.agents.iter().filter(|a| a.kind() == kind).count()
    }

    /// The binary form consumed by the firmware.
    pub fn serialize(&self) -> Result<Vec<u8>, CommandStreamError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CommandStreamError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flipping_swaps_both_ratios() {
        let dep = Dependency {
            relative_agent_id: 3,
            outer_ratio: DependencyRatio::new(1, 4),
            inner_ratio: DependencyRatio::new(2, 3),
            boundary: 1,
        };
        let flipped = dep.flipped();
        assert_eq!(flipped.outer_ratio, DependencyRatio::new(4, 1));
        assert_eq!(flipped.inner_ratio, DependencyRatio::new(3, 2));
        assert_eq!(flipped.flipped(), dep);
    }

    #[test]
    fn test_tile_range() {
        let tile = Tile {
            base: 128,
            num_slots: 3,
            slot_size: 64,
        };
        assert_eq!(tile.range(), (128, 320));
    }
}
