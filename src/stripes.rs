//! Enumeration of candidate stripe shapes.
//!
//! For a given block config and cascade position, [StripeGenerator] produces
//! every tiling its [StripeConfig] allows, each described by three related
//! shapes: what one MCE/PLE pass computes, what is resident in a tile, and how
//! many stripes a tile may hold.

use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use crate::common::{BlockConfig, Stride, TensorShape};
use crate::graph::MceOperation;
use crate::hardware::HardwareCapabilities;
use crate::plan::CascadeType;
use crate::ple::{PleOperation, ShapeMultiplier};
use crate::stripe_config::{MultiplierRange, Split, StripeConfig};
use crate::utils::{
    div_round_up, num_stripes, num_stripes_hwc, round_up_to_multiple, BRICK_GROUP_CHANNELS,
    BRICK_GROUP_HEIGHT, BRICK_GROUP_WIDTH,
};

/// An inclusive range of stripe counts a tile may be sized for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct NumStripes {
    pub min: u32,
    pub max: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryStripeInfo {
    pub range: NumStripes,
    pub shape: TensorShape,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryStripesInfo {
    pub input: MemoryStripeInfo,
    pub output: MemoryStripeInfo,
    pub weight: MemoryStripeInfo,
    pub ple_input: MemoryStripeInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MceStripesInfo {
    pub input: TensorShape,
    pub output: TensorShape,
    pub weight: TensorShape,
    pub block_config: BlockConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PleStripesInfo {
    pub input: TensorShape,
    pub output: TensorShape,
    pub block_config: BlockConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MceAndPleInfo {
    pub mce: MceStripesInfo,
    pub ple: PleStripesInfo,
    pub memory: MemoryStripesInfo,
}

/// An MCE whose output is handed to a PLE belonging to the next part.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MceOnlyInfo {
    pub mce: MceStripesInfo,
    pub memory: MemoryStripesInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PleOnlyInfo {
    pub ple: PleStripesInfo,
    pub memory: MemoryStripesInfo,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StripeInfos {
    pub mce_and_ple: BTreeSet<MceAndPleInfo>,
    pub mce_only: BTreeSet<MceOnlyInfo>,
    pub ple_only: BTreeSet<PleOnlyInfo>,
}

/// How one split strategy sizes the MCE's output and input stripes. A zero
/// component means "the whole extent".
#[derive(Clone, Copy, Debug)]
struct Candidate {
    mce_output_encoding: TensorShape,
    mce_input_channels: u32,
    full_memory_output: bool,
    no_split: bool,
}

/// Stripe enumeration for an MCE followed by a PLE.
///
/// Parts without a real MCE (fused PLE kernels) use an identity depthwise
/// convolution, so they are described the same way.
#[derive(Clone, Debug)]
pub struct StripeGenerator {
    pub mce_input: TensorShape,
    pub mce_output: TensorShape,
    pub ple_output: TensorShape,
    pub kernel_height: u32,
    pub kernel_width: u32,
    pub stride: Stride,
    pub upscale_factor: u32,
    pub operation: MceOperation,
    pub ple_operation: PleOperation,
    pub capabilities: HardwareCapabilities,
    pub config: StripeConfig,
}

impl NumStripes {
    pub const fn new(min: u32, max: u32) -> Self {
        NumStripes { min, max }
    }

    /// Limits the range to at most `limit` stripes, keeping it non-empty.
    pub fn clamp_max(self, limit: u32) -> Self {
        let max = self.max.min(limit);
        NumStripes {
            min: self.min.min(max),
            max,
        }
    }

    pub fn iter(&self) -> RangeInclusive<u32> {
        self.min..=self.max
    }
}

impl MemoryStripeInfo {
    fn new(range: NumStripes, shape: TensorShape) -> Self {
        MemoryStripeInfo { range, shape }
    }
}

impl StripeInfos {
    pub fn is_empty(&self) -> bool {
        self.mce_and_ple.is_empty() && self.mce_only.is_empty() && self.ple_only.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mce_and_ple.len() + self.mce_only.len() + self.ple_only.len()
    }
}

/// Derives a stripe from an encoding. Each zero component of `encoding` takes
/// the tensor's whole extent; every component is capped at the extent, then
/// rounded up to the brick group in H and W and to `channel_rounding` in C.
pub fn create_stripe(
    tensor: &TensorShape,
    encoding: &TensorShape,
    channel_rounding: u32,
) -> TensorShape {
    let pick = |d: usize| {
        if encoding[d] == 0 {
            tensor[d]
        } else {
            encoding[d].min(tensor[d])
        }
    };
    [
        tensor[0],
        round_up_to_multiple(pick(1), BRICK_GROUP_HEIGHT),
        round_up_to_multiple(pick(2), BRICK_GROUP_WIDTH),
        round_up_to_multiple(pick(3), channel_rounding),
    ]
}

/// The total number of stripes `stripe` divides `tensor` into.
pub fn total_stripes(tensor: &TensorShape, stripe: &TensorShape) -> u32 {
    num_stripes_hwc(tensor, stripe).iter().product()
}

/// Powers of two, starting at 1, within `range`, stopping at the first one at
/// which `base * m` covers `extent`.
fn multipliers(range: MultiplierRange, base: u32, extent: u32) -> Vec<u32> {
    let mut result = vec![];
    let mut m = 1u32;
    loop {
        if range.contains(m) {
            result.push(m);
        }
        if base.saturating_mul(m) >= extent || m > range.max / 2 {
            break;
        }
        m *= 2;
    }
    result
}

impl StripeGenerator {
    pub fn is_depthwise(&self) -> bool {
        self.operation == MceOperation::DepthwiseConvolution
    }

    pub fn shape_multiplier(&self) -> ShapeMultiplier {
        self.ple_operation.shape_multiplier()
    }

    /// Block configs this generator may use.
    pub fn block_configs(&self) -> Vec<BlockConfig> {
        let mut configs = self
            .ple_operation
            .filter_block_configs(&self.config.block_configs);
        if self.operation == MceOperation::FullyConnected {
            configs.retain(|b| *b == BlockConfig::new(8, 8));
        }
        configs
    }

    /// Enumerates stripes for a part at the start of a section or on its own.
    pub fn generate_stripes(&self, block_config: BlockConfig, cascade_type: CascadeType) -> StripeInfos {
        assert!(matches!(
            cascade_type,
            CascadeType::Beginning | CascadeType::Lonely
        ));
        let mut infos = StripeInfos::default();
        if !self.config.plan_types.allows(cascade_type) || !self.block_configs().contains(&block_config) {
            return infos;
        }

        let lonely = cascade_type == CascadeType::Lonely;
        let ogs = self.capabilities.number_of_ogs();
        let multiplier = self.shape_multiplier();
        // The MCE output that the PLE turns into one block.
        let unit = multiplier.invert(&[1, block_config.height, block_config.width, 0]);
        let base_h = round_up_to_multiple(unit[1], BRICK_GROUP_HEIGHT);
        let base_w = round_up_to_multiple(unit[2], BRICK_GROUP_WIDTH);
        let [_, out_h, out_w, out_c] = self.mce_output;
        let in_c = self.mce_input[3];
        let depthwise = self.is_depthwise();
        let splits = &self.config.splits;

        let candidate = |h: u32, w: u32, c: u32, input_channels: u32| Candidate {
            mce_output_encoding: [0, h, w, c],
            mce_input_channels: input_channels,
            full_memory_output: false,
            no_split: false,
        };
        let mut candidates = vec![];

        if splits.contains(Split::MceAndPleOutputHeight) {
            candidates.push(candidate(base_h, 0, 0, 0));
        }
        if splits.contains(Split::MceOutputHeightOnly) {
            candidates.push(Candidate {
                full_memory_output: true,
                ..candidate(base_h, 0, 0, 0)
            });
        }
        if splits.contains(Split::WidthOnly) {
            candidates.push(candidate(0, base_w, 0, 0));
        }
        if lonely {
            let hms = multipliers(self.config.block_height_multiplier, base_h, out_h);
            let wms = multipliers(self.config.block_width_multiplier, base_w, out_w);
            let oms = multipliers(self.config.ofm_depth_multiplier, ogs, out_c);
            let ims = multipliers(self.config.ifm_depth_multiplier, ogs, in_c);
            for &hm in &hms {
                for &wm in &wms {
                    let (h, w) = (base_h * hm, base_w * wm);
                    if splits.contains(Split::WidthHeight) {
                        candidates.push(candidate(h, w, 0, 0));
                    }
                    for &om in &oms {
                        if splits.contains(Split::WidthHeightOutputDepth) {
                            candidates.push(candidate(h, w, ogs * om, 0));
                        }
                        if splits.contains(Split::WidthHeightOutputDepthInputDepth) && !depthwise {
                            for &im in &ims {
                                candidates.push(candidate(h, w, ogs * om, ogs * im));
                            }
                        }
                    }
                }
            }
            if splits.contains(Split::OutputDepthInputDepth) && !depthwise {
                for &om in &oms {
                    for &im in &ims {
                        candidates.push(candidate(0, 0, ogs * om, ogs * im));
                    }
                }
            }
            if splits.contains(Split::MceAndPleOutputDepth) {
                for &om in &oms {
                    candidates.push(candidate(0, 0, ogs * om, 0));
                }
            }
        } else if splits.contains(Split::MceAndPleOutputDepth) {
            candidates.push(candidate(0, 0, ogs, 0));
        }
        if splits.contains(Split::MceOutputDepthOnly) && !depthwise {
            candidates.push(Candidate {
                full_memory_output: true,
                ..candidate(0, 0, ogs, 0)
            });
        }
        if splits.contains(Split::InputDepthOnly) && depthwise {
            candidates.push(Candidate {
                full_memory_output: true,
                ..candidate(0, 0, ogs, ogs)
            });
        }
        if splits.contains(Split::None) {
            candidates.push(Candidate {
                no_split: true,
                ..candidate(0, 0, 0, 0)
            });
        }

        for c in candidates {
            self.add_candidate(&c, block_config, cascade_type, &mut infos);
        }
        trace!(
            "{} stripe infos for {:?} at {}",
            infos.len(),
            self.ple_operation,
            block_config
        );
        infos
    }

    fn add_candidate(
        &self,
        candidate: &Candidate,
        block_config: BlockConfig,
        cascade_type: CascadeType,
        infos: &mut StripeInfos,
    ) {
        let depthwise = self.is_depthwise();
        let mce_output_stripe = create_stripe(
            &self.mce_output,
            &candidate.mce_output_encoding,
            BRICK_GROUP_CHANNELS,
        );
        let input_channels = if depthwise {
            candidate.mce_output_encoding[3]
        } else {
            candidate.mce_input_channels
        };
        let scale_to_input = |enc: u32, stripe: u32, stride: u32| {
            if enc == 0 {
                0
            } else {
                div_round_up(stripe * stride, self.upscale_factor)
            }
        };
        let mce_input_encoding = [
            0,
            scale_to_input(
                candidate.mce_output_encoding[1],
                mce_output_stripe[1],
                self.stride.y,
            ),
            scale_to_input(
                candidate.mce_output_encoding[2],
                mce_output_stripe[2],
                self.stride.x,
            ),
            input_channels,
        ];
        let mce_input_stripe =
            create_stripe(&self.mce_input, &mce_input_encoding, BRICK_GROUP_CHANNELS);
        let Some(ple_output_stripe) = self.ple_output_stripe(&mce_output_stripe) else {
            return;
        };
        let memory_output_stripe = if candidate.full_memory_output {
            create_stripe(&self.ple_output, &[0; 4], BRICK_GROUP_CHANNELS)
        } else {
            ple_output_stripe
        };
        if candidate.full_memory_output && memory_output_stripe == ple_output_stripe {
            // Identical to the plain variant.
            return;
        }

        let ranges = if candidate.no_split {
            None
        } else {
            Some(self.default_ranges(&mce_input_stripe, cascade_type))
        };
        let (input_range, output_range) = ranges.unwrap_or((NumStripes::new(1, 1), NumStripes::new(1, 1)));
        let output_range = if candidate.full_memory_output {
            NumStripes::new(1, 1)
        } else {
            output_range
        };
        self.add_stripe_infos(
            block_config,
            mce_input_stripe,
            mce_output_stripe,
            ple_output_stripe,
            memory_output_stripe,
            input_range,
            output_range,
            if candidate.no_split {
                NumStripes::new(1, 1)
            } else {
                NumStripes::new(1, 2)
            },
            infos,
        );
    }

    /// The PLE output for one MCE output stripe, or `None` if it would not be
    /// brick-aligned.
    fn ple_output_stripe(&self, mce_output_stripe: &TensorShape) -> Option<TensorShape> {
        let raw = self.shape_multiplier().apply(mce_output_stripe);
        let mut encoding = [0; 4];
        for d in 1..4 {
            if mce_output_stripe[d] < self.mce_output[d] {
                let granule = if d == 3 {
                    BRICK_GROUP_CHANNELS
                } else {
                    BRICK_GROUP_HEIGHT
                };
                if raw[d] % granule != 0 {
                    return None;
                }
                encoding[d] = raw[d];
            }
        }
        Some(create_stripe(&self.ple_output, &encoding, BRICK_GROUP_CHANNELS))
    }

    /// Input and output stripe-count ranges before clamping. Kernels taller or
    /// wider than one row need the neighbouring stripes resident, so a split
    /// input holds at least three; one more on top of that allows the next
    /// stripe to load while the current one is processed. Output tiles leaving
    /// the section are double buffered; those feeding another part in the
    /// section may need three to provide it with boundary rows.
    fn default_ranges(
        &self,
        mce_input_stripe: &TensorShape,
        cascade_type: CascadeType,
    ) -> (NumStripes, NumStripes) {
        let base = if self.needs_boundary(mce_input_stripe) {
            3
        } else {
            1
        };
        let input = NumStripes::new(base, base + 1);
        let output = if cascade_type.ends_section() {
            NumStripes::new(1, 2)
        } else {
            NumStripes::new(1, 3)
        };
        (input, output)
    }

    fn needs_boundary(&self, input_stripe: &TensorShape) -> bool {
        (self.kernel_height > 1 && input_stripe[1] < self.mce_input[1])
            || (self.kernel_width > 1 && input_stripe[2] < self.mce_input[2])
    }

    fn weight_stripe(&self, mce_input_stripe: &TensorShape, mce_output_stripe: &TensorShape) -> TensorShape {
        if self.is_depthwise() {
            [self.kernel_height, self.kernel_width, mce_input_stripe[3], 1]
        } else {
            [
                self.kernel_height,
                self.kernel_width,
                mce_input_stripe[3],
                mce_output_stripe[3],
            ]
        }
    }

    /// Clamps the ranges to the stripes that exist, applies the PLE kernel's
    /// restrictions, and records the resulting infos.
    #[allow(clippy::too_many_arguments)]
    fn add_stripe_infos(
        &self,
        block_config: BlockConfig,
        mce_input_stripe: TensorShape,
        mce_output_stripe: TensorShape,
        ple_output_stripe: TensorShape,
        memory_output_stripe: TensorShape,
        input_range: NumStripes,
        output_range: NumStripes,
        weight_range: NumStripes,
        infos: &mut StripeInfos,
    ) {
        if self.ple_operation.forbids_width_split() && mce_output_stripe[2] < self.mce_output[2] {
            return;
        }
        if self.ple_operation.requires_full_tensor()
            && (mce_output_stripe[1] < self.mce_output[1] || mce_output_stripe[2] < self.mce_output[2])
        {
            return;
        }

        let actual_input = total_stripes(&self.mce_input, &mce_input_stripe);
        let mut input_range = input_range.clamp_max(actual_input);
        if self.needs_boundary(&mce_input_stripe) {
            let required = 3.min(actual_input);
            input_range.min = input_range.min.max(required);
            input_range.max = input_range.max.max(input_range.min);
        }
        let output_range =
            output_range.clamp_max(total_stripes(&self.ple_output, &memory_output_stripe));

        let weight_stripe = self.weight_stripe(&mce_input_stripe, &mce_output_stripe);
        let full_weight_depth = if self.is_depthwise() {
            mce_input_stripe[3] >= self.mce_input[3]
        } else {
            mce_output_stripe[3] >= self.mce_output[3] && mce_input_stripe[3] >= self.mce_input[3]
        };
        let weight_range = if full_weight_depth {
            weight_range.clamp_max(1)
        } else {
            weight_range
        };

        let mce = MceStripesInfo {
            input: mce_input_stripe,
            output: mce_output_stripe,
            weight: weight_stripe,
            block_config,
        };
        let ple = PleStripesInfo {
            input: mce_output_stripe,
            output: ple_output_stripe,
            block_config,
        };
        let memory = MemoryStripesInfo {
            input: MemoryStripeInfo::new(input_range, mce_input_stripe),
            output: MemoryStripeInfo::new(output_range, memory_output_stripe),
            weight: MemoryStripeInfo::new(weight_range, weight_stripe),
            ple_input: MemoryStripeInfo::new(NumStripes::new(0, 0), mce_output_stripe),
        };
        infos.mce_and_ple.insert(MceAndPleInfo { mce, ple, memory });

        // The PLE of the next part consumes the MCE output directly.
        let ple_input_range = NumStripes::new(1, 2).clamp_max(total_stripes(&self.mce_output, &mce_output_stripe));
        infos.mce_only.insert(MceOnlyInfo {
            mce,
            memory: MemoryStripesInfo {
                output: MemoryStripeInfo::new(NumStripes::new(0, 0), mce_output_stripe),
                ple_input: MemoryStripeInfo::new(ple_input_range, mce_output_stripe),
                ..memory
            },
        });
    }

    /// Whether a buffer holding `num_stripes` stripes of `stripe` out of
    /// `tensor` gives this part's kernel the boundary rows it needs.
    pub fn is_input_buffer_valid(&self, tensor: &TensorShape, stripe: &TensorShape, num_stripes_in_tile: u32) -> bool {
        if self.kernel_width > 1 && stripe[2] < tensor[2] {
            return false;
        }
        if self.operation != MceOperation::DepthwiseConvolution && stripe[3] < tensor[3] {
            return false;
        }
        let required = self.kernel_height.min(3);
        let splits = num_stripes(tensor[1], stripe[1]);
        if required <= 1 {
            return num_stripes_in_tile == 1;
        }
        if splits <= required {
            num_stripes_in_tile == splits
        } else {
            num_stripes_in_tile >= required
        }
    }

    /// Enumerates stripes for a part in the middle or at the end of a
    /// section, whose input tile is already fixed by the previous part.
    pub fn generate_continuation(
        &self,
        input_stripe: &TensorShape,
        input_num_stripes: u32,
        block_config: BlockConfig,
        cascade_type: CascadeType,
    ) -> StripeInfos {
        assert!(matches!(cascade_type, CascadeType::Middle | CascadeType::End));
        let mut infos = StripeInfos::default();
        if !self.config.plan_types.allows(cascade_type)
            || !self.block_configs().contains(&block_config)
            || !self.is_input_buffer_valid(&self.mce_input, input_stripe, input_num_stripes)
        {
            return infos;
        }

        let full_height = input_stripe[1] >= self.mce_input[1];
        let full_width = input_stripe[2] >= self.mce_input[2];
        let full_tensor = full_height && full_width;
        let is_end = cascade_type == CascadeType::End;

        let scale_to_output = |full: bool, stripe: u32, stride: u32| -> Option<u32> {
            if full {
                return Some(0);
            }
            let scaled = stripe * self.upscale_factor;
            if scaled % stride != 0 || (scaled / stride) % BRICK_GROUP_HEIGHT != 0 {
                None
            } else {
                Some(scaled / stride)
            }
        };
        let (Some(out_h), Some(out_w)) = (
            scale_to_output(full_height, input_stripe[1], self.stride.y),
            scale_to_output(full_width, input_stripe[2], self.stride.x),
        ) else {
            return infos;
        };
        let out_c = if self.is_depthwise() {
            if input_stripe[3] < self.mce_input[3] {
                input_stripe[3]
            } else {
                0
            }
        } else if full_tensor && is_end {
            self.capabilities.number_of_ogs()
        } else {
            0
        };
        let mce_output_stripe = create_stripe(&self.mce_output, &[0, out_h, out_w, out_c], BRICK_GROUP_CHANNELS);
        let Some(ple_output_stripe) = self.ple_output_stripe(&mce_output_stripe) else {
            return infos;
        };
        let full_depth = ple_output_stripe[3] >= self.ple_output[3];
        let max_output = match (full_tensor, full_depth, is_end) {
            (false, _, true) => 2,
            (false, _, false) => 3,
            (true, true, _) => 1,
            (true, false, _) => 2,
        };
        self.add_stripe_infos(
            block_config,
            *input_stripe,
            mce_output_stripe,
            ple_output_stripe,
            ple_output_stripe,
            NumStripes::new(input_num_stripes, input_num_stripes),
            NumStripes::new(1, max_output),
            NumStripes::new(1, 2),
            &mut infos,
        );
        infos
    }
}

/// Enumerates stripes for a PLE kernel reading SRAM directly, with every
/// input sharing the output's tiling.
pub fn generate_ple_only_stripes(
    input: &TensorShape,
    output: &TensorShape,
    operation: PleOperation,
    block_config: BlockConfig,
    config: &StripeConfig,
    capabilities: &HardwareCapabilities,
) -> StripeInfos {
    let mut infos = StripeInfos::default();
    if !config.plan_types.lonely || !operation.is_block_config_allowed(&block_config) {
        return infos;
    }
    let multiplier = operation.shape_multiplier();
    let ogs = capabilities.number_of_ogs();
    let bh = round_up_to_multiple(block_config.height, BRICK_GROUP_HEIGHT);
    let bw = round_up_to_multiple(block_config.width, BRICK_GROUP_WIDTH);
    let splits = &config.splits;

    let mut encodings: Vec<(TensorShape, bool)> = vec![];
    if splits.contains(Split::MceAndPleOutputHeight) {
        encodings.push(([0, bh, 0, 0], false));
    }
    if splits.contains(Split::WidthOnly) {
        encodings.push(([0, 0, bw, 0], false));
    }
    if splits.contains(Split::WidthHeight) {
        for hm in multipliers(config.block_height_multiplier, bh, output[1]) {
            for wm in multipliers(config.block_width_multiplier, bw, output[2]) {
                encodings.push(([0, bh * hm, bw * wm, 0], false));
            }
        }
    }
    if splits.contains(Split::MceAndPleOutputDepth) {
        for om in multipliers(config.ofm_depth_multiplier, ogs, output[3]) {
            encodings.push(([0, 0, 0, ogs * om], false));
        }
    }
    if splits.contains(Split::None) {
        encodings.push(([0; 4], true));
    }

    for (encoding, no_split) in encodings {
        let output_stripe = create_stripe(output, &encoding, BRICK_GROUP_CHANNELS);
        if operation.requires_full_tensor() && (output_stripe[1] < output[1] || output_stripe[2] < output[2]) {
            continue;
        }
        if operation.forbids_width_split() && output_stripe[2] < output[2] {
            continue;
        }
        let mut input_encoding = multiplier.invert(&output_stripe);
        for d in 1..4 {
            if output_stripe[d] >= output[d] {
                input_encoding[d] = 0;
            }
        }
        let input_stripe = create_stripe(input, &input_encoding, BRICK_GROUP_CHANNELS);
        let range = if no_split {
            NumStripes::new(1, 1)
        } else {
            NumStripes::new(1, 2)
        };
        let ple = PleStripesInfo {
            input: input_stripe,
            output: output_stripe,
            block_config,
        };
        let memory = MemoryStripesInfo {
            input: MemoryStripeInfo::new(range.clamp_max(total_stripes(input, &input_stripe)), input_stripe),
            output: MemoryStripeInfo::new(range.clamp_max(total_stripes(output, &output_stripe)), output_stripe),
            weight: MemoryStripeInfo::new(NumStripes::new(0, 0), [0; 4]),
            ple_input: MemoryStripeInfo::new(NumStripes::new(0, 0), [0; 4]),
        };
        infos.ple_only.insert(PleOnlyInfo { ple, memory });
    }
    infos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::ALL_BLOCK_CONFIGS;
    use proptest::prelude::*;

    fn conv_generator(
        input: TensorShape,
        output: TensorShape,
        kernel: u32,
        stride: u32,
        operation: MceOperation,
    ) -> StripeGenerator {
        StripeGenerator {
            mce_input: input,
            mce_output: output,
            ple_output: output,
            kernel_height: kernel,
            kernel_width: kernel,
            stride: Stride { x: stride, y: stride },
            upscale_factor: 1,
            operation,
            ple_operation: PleOperation::Passthrough,
            capabilities: HardwareCapabilities::default(),
            config: StripeConfig::default(),
        }
    }

    fn all_shapes(infos: &StripeInfos) -> Vec<TensorShape> {
        let mut shapes = vec![];
        for i in &infos.mce_and_ple {
            shapes.extend([
                i.mce.input,
                i.mce.output,
                i.ple.output,
                i.memory.input.shape,
                i.memory.output.shape,
            ]);
        }
        shapes
    }

    #[test]
    fn test_depthwise_3x3_stride_2_beginning_keeps_boundary_stripes() {
        let generator = conv_generator(
            [1, 112, 112, 32],
            [1, 56, 56, 32],
            3,
            2,
            MceOperation::DepthwiseConvolution,
        );
        let infos = generator.generate_stripes(BlockConfig::new(16, 16), CascadeType::Beginning);
        assert!(!infos.mce_and_ple.is_empty());
        let mut saw_split = false;
        for info in &infos.mce_and_ple {
            if info.memory.input.shape[1] < generator.mce_input[1] {
                saw_split = true;
                assert!(info.memory.input.range.min >= 3, "{info:?}");
            }
        }
        assert!(saw_split);
    }

    #[test]
    fn test_no_split_has_single_stripes() {
        let generator = conv_generator([1, 16, 16, 16], [1, 16, 16, 16], 1, 1, MceOperation::Convolution);
        let infos = generator.generate_stripes(BlockConfig::new(16, 16), CascadeType::Lonely);
        let whole = infos
            .mce_and_ple
            .iter()
            .find(|i| i.memory.input.shape == [1, 16, 16, 16])
            .expect("a whole-tensor candidate");
        assert_eq!(whole.memory.input.range, NumStripes::new(1, 1));
        assert_eq!(whole.memory.output.range, NumStripes::new(1, 1));
        assert_eq!(whole.memory.weight.range, NumStripes::new(1, 1));
    }

    #[test]
    fn test_mean_xy_is_never_split_spatially() {
        let mut generator = conv_generator([1, 8, 8, 64], [1, 8, 8, 64], 1, 1, MceOperation::DepthwiseConvolution);
        generator.ple_operation = PleOperation::MeanXy8x8;
        generator.ple_output = [1, 1, 1, 64];
        let infos = generator.generate_stripes(BlockConfig::new(8, 8), CascadeType::Lonely);
        assert!(!infos.mce_and_ple.is_empty());
        for info in &infos.mce_and_ple {
            assert_eq!(info.mce.output[1], 8);
            assert_eq!(info.mce.output[2], 8);
        }
    }

    #[test]
    fn test_maxpool_3x3_is_never_split_in_width() {
        let mut generator = conv_generator([1, 64, 64, 16], [1, 64, 64, 16], 1, 1, MceOperation::DepthwiseConvolution);
        generator.ple_operation = PleOperation::MaxPool3x3Stride2Even;
        generator.ple_output = [1, 32, 32, 16];
        let infos = generator.generate_stripes(BlockConfig::new(8, 8), CascadeType::Lonely);
        assert!(!infos.mce_and_ple.is_empty());
        assert!(infos
            .mce_and_ple
            .iter()
            .all(|i| i.mce.output[2] >= generator.mce_output[2]));
    }

    #[test]
    fn test_continuation_requires_boundary_stripes_for_3x3() {
        let generator = conv_generator([1, 64, 64, 16], [1, 64, 64, 16], 3, 1, MceOperation::Convolution);
        let block = BlockConfig::new(16, 16);
        let stripe = [1, 16, 64, 16];
        assert!(generator
            .generate_continuation(&stripe, 2, block, CascadeType::Middle)
            .is_empty());
        let infos = generator.generate_continuation(&stripe, 3, block, CascadeType::Middle);
        assert_eq!(infos.mce_and_ple.len(), 1);
        let info = infos.mce_and_ple.first().unwrap();
        assert_eq!(info.mce.output, [1, 16, 64, 16]);
        assert_eq!(info.memory.output.range, NumStripes::new(1, 3));
    }

    #[test]
    fn test_continuation_rejects_partial_channels_for_convolution() {
        let generator = conv_generator([1, 16, 16, 64], [1, 16, 16, 64], 1, 1, MceOperation::Convolution);
        let infos = generator.generate_continuation(
            &[1, 16, 16, 16],
            1,
            BlockConfig::new(16, 16),
            CascadeType::End,
        );
        assert!(infos.is_empty());
    }

    #[test]
    fn test_ple_only_stripes_share_tiling() {
        let config = StripeConfig::default();
        let infos = generate_ple_only_stripes(
            &[1, 32, 32, 32],
            &[1, 32, 32, 32],
            PleOperation::Addition,
            BlockConfig::new(16, 16),
            &config,
            &HardwareCapabilities::default(),
        );
        assert!(!infos.ple_only.is_empty());
        for info in &infos.ple_only {
            assert_eq!(info.ple.input, info.ple.output);
        }
    }

    #[test]
    fn test_disabled_plan_type_yields_nothing() {
        let mut generator = conv_generator([1, 16, 16, 16], [1, 16, 16, 16], 1, 1, MceOperation::Convolution);
        generator.config.plan_types.lonely = false;
        assert!(generator
            .generate_stripes(BlockConfig::new(16, 16), CascadeType::Lonely)
            .is_empty());
    }

    proptest! {
        #[test]
        fn test_stripes_are_brick_aligned_and_bounded(
            h in 1u32..80,
            w in 1u32..80,
            c in 1u32..100,
            kernel in prop::sample::select(vec![1u32, 3]),
            block_idx in 0..ALL_BLOCK_CONFIGS.len(),
            lonely in any::<bool>(),
        ) {
            let generator = conv_generator([1, h, w, c], [1, h, w, c], kernel, 1, MceOperation::Convolution);
            let cascade_type = if lonely { CascadeType::Lonely } else { CascadeType::Beginning };
            let infos = generator.generate_stripes(ALL_BLOCK_CONFIGS[block_idx], cascade_type);
            for shape in all_shapes(&infos) {
                prop_assert_eq!(shape[1] % BRICK_GROUP_HEIGHT, 0);
                prop_assert_eq!(shape[2] % BRICK_GROUP_WIDTH, 0);
                prop_assert_eq!(shape[3] % BRICK_GROUP_CHANNELS, 0);
                prop_assert!(shape[1] <= round_up_to_multiple(h, BRICK_GROUP_HEIGHT));
                prop_assert!(shape[2] <= round_up_to_multiple(w, BRICK_GROUP_WIDTH));
                prop_assert!(shape[3] <= round_up_to_multiple(c, BRICK_GROUP_CHANNELS));
            }
            for info in &infos.mce_and_ple {
                for range in [info.memory.input.range, info.memory.output.range, info.memory.weight.range] {
                    prop_assert!(range.min <= range.max);
                }
                prop_assert!(info.memory.input.range.max <= total_stripes(&generator.mce_input, &info.memory.input.shape));
            }
        }

        #[test]
        fn test_create_stripe_is_idempotent(
            tensor in prop::array::uniform4(1u32..64),
            encoding in prop::array::uniform4(0u32..64),
        ) {
            let once = create_stripe(&tensor, &encoding, 16);
            let rounded = create_stripe(&tensor, &[0; 4], 16);
            prop_assert!((1..4).all(|d| once[d] <= rounded[d]));
            prop_assert_eq!(create_stripe(&tensor, &once, 16), once);
        }
    }
}
