//! Performance estimates for a chosen combination, agent by agent.
//!
//! Every op of the merged graph stands for the agent it would lower to. DMAs
//! are costed in DRAM bytes moved, reloads included; MCE ops in cycles and
//! multiply-accumulate operations; PLE ops in the patches they process. No
//! command stream is generated, so networks with estimate-only parts can be
//! costed too.

use serde::{Deserialize, Serialize};

use crate::combiner::MergedGraph;
use crate::command_stream::AgentKind;
use crate::common::{num_elements, TensorShape};
use crate::graph::{Buffer, BufferFormat, BufferId, Location, MceOp, MceOperation, Op, OpGraph, OpId};
use crate::hardware::HardwareCapabilities;
use crate::plan::PartId;
use crate::utils::{div_round_up, num_stripes, num_stripes_hwc, round_up_to_multiple};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MceStats {
    pub cycles: u64,
    pub operations: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentEstimate {
    pub kind: AgentKind,
    /// `None` for DMAs inserted between sections.
    pub part: Option<PartId>,
    pub section: usize,
    pub dram_bytes: u64,
    /// Extra passes over the same DRAM data.
    pub reloads: u32,
    pub mce: MceStats,
    pub ple_patches: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PerformanceEstimate {
    pub agents: Vec<AgentEstimate>,
}

impl PerformanceEstimate {
    pub fn dram_bytes(&self) -> u64 {
        self.agents.iter().map(|a| a.dram_bytes).sum()
    }

    pub fn mce_cycles(&self) -> u64 {
        self.agents.iter().map(|a| a.mce.cycles).sum()
    }

    pub fn mce_operations(&self) -> u64 {
        self.agents.iter().map(|a| a.mce.operations).sum()
    }

    pub fn ple_patches(&self) -> u64 {
        self.agents.iter().map(|a| a.ple_patches).sum()
    }
}

impl AgentEstimate {
    fn new(kind: AgentKind) -> Self {
        AgentEstimate {
            kind,
            part: None,
            section: 0,
            dram_bytes: 0,
            reloads: 0,
            mce: MceStats::default(),
            ple_patches: 0,
        }
    }
}

/// Estimates every agent `merged` would lower to, in dependency order.
pub fn estimate_performance(merged: &MergedGraph, caps: &HardwareCapabilities) -> PerformanceEstimate {
    let graph = &merged.graph;
    let agents = graph
        .topological_ops()
        .into_iter()
        .filter_map(|op| {
            let mut estimate = estimate_op(graph, op, caps)?;
            estimate.part = merged.op_parts[op.0 as usize];
            estimate.section = merged.op_sections[op.0 as usize];
            Some(estimate)
        })
        .collect();
    PerformanceEstimate { agents }
}

fn estimate_op(graph: &OpGraph, op: OpId, caps: &HardwareCapabilities) -> Option<AgentEstimate> {
    match graph.op(op) {
        Op::Dma { format } => {
            let input = graph.inputs(op)[0];
            let output = graph.output(op);
            match (graph.buffer(input).location, format) {
                (Location::Dram, BufferFormat::Weight) => Some(weight_estimate(graph, input, output)),
                (Location::Dram, _) => Some(ifm_estimate(graph, output, caps)),
                (Location::Sram, _) => Some(ofm_estimate(graph.buffer(output), caps)),
                (Location::PleInputSram, _) => None,
            }
        }
        Op::Mce(mce) => {
            let input = graph.buffer(graph.inputs(op)[0]);
            let output = graph.buffer(graph.output(op));
            let mut estimate = AgentEstimate::new(AgentKind::MceScheduler);
            estimate.mce = mce_stats(mce, input, output, caps);
            Some(estimate)
        }
        Op::Ple(_) => {
            let inputs: Vec<TensorShape> = graph
                .inputs(op)
                .iter()
                .map(|b| graph.buffer(*b).tensor_shape)
                .collect();
            let mut estimate = AgentEstimate::new(AgentKind::PleScheduler);
            estimate.ple_patches = ple_patches(&inputs, caps);
            Some(estimate)
        }
        Op::Concat { .. } | Op::EstimateOnly { .. } => None,
    }
}

/// The MCE reading `sram`, with its weights and output buffers.
fn consuming_mce(graph: &OpGraph, sram: BufferId) -> Option<(&MceOp, &Buffer, &Buffer)> {
    graph.consumers(sram).iter().find_map(|&(op, index)| match graph.op(op) {
        Op::Mce(mce) if index == 0 => Some((
            mce,
            graph.buffer(graph.inputs(op)[1]),
            graph.buffer(graph.output(op)),
        )),
        _ => None,
    })
}

/// `size` plus a border on both sides of every interior stripe boundary.
fn effective_size(size: u32, stripe: u32, border: u32) -> u32 {
    size + 2 * border * ((size - 1) / stripe)
}

fn ifm_estimate(graph: &OpGraph, sram_id: BufferId, caps: &HardwareCapabilities) -> AgentEstimate {
    let sram = graph.buffer(sram_id);
    let shape = sram.tensor_shape;
    let stripe = sram.stripe_shape;
    let [stripes_h, stripes_w, stripes_c] = num_stripes_hwc(&shape, &stripe);
    let (streaming_h, streaming_w, streaming_c) = (stripes_h > 1, stripes_w > 1, stripes_c > 1);

    let (need_h, need_w, reloads) = match consuming_mce(graph, sram_id) {
        Some((mce, weights, output)) => {
            let kernel = weights.tensor_shape;
            let depthwise = mce.operation == MceOperation::DepthwiseConvolution;
            let reloads = if streaming_c {
                // Depthwise weights are HWIM with M = 1, so this is zero for them.
                div_round_up(kernel[3], caps.number_of_ogs()) - 1
            } else if (streaming_h || streaming_w) && !depthwise {
                num_stripes(output.tensor_shape[3], output.stripe_shape[3]) - 1
            } else {
                0
            };
            (kernel[0] > 1, kernel[1] > 1, reloads)
        }
        None => (false, false, 0),
    };

    let border_w = if need_w && streaming_c { stripe[2] } else { 0 };
    let border_h = if need_h && (streaming_c || (streaming_h && streaming_w)) {
        caps.boundary_stripe_height
    } else {
        0
    };
    let bytes = u64::from(shape[0])
        * u64::from(effective_size(shape[1], stripe[1], border_h))
        * u64::from(effective_size(shape[2], stripe[2], border_w))
        * u64::from(shape[3]);

    let mut estimate = AgentEstimate::new(AgentKind::IfmStreamer);
    estimate.reloads = reloads;
    estimate.dram_bytes = u64::from(reloads + 1) * bytes;
    estimate
}

fn ofm_estimate(dram: &Buffer, caps: &HardwareCapabilities) -> AgentEstimate {
    let mut shape = dram.tensor_shape;
    if dram.format != BufferFormat::Nhwc {
        shape[1] = round_up_to_multiple(shape[1], caps.brick_group_shape[1]);
        shape[2] = round_up_to_multiple(shape[2], caps.brick_group_shape[2]);
    }
    let mut estimate = AgentEstimate::new(AgentKind::OfmStreamer);
    estimate.dram_bytes = num_elements(&shape);
    estimate
}

/// Weights are streamed again for every input plane stripe when the input
/// is split in height and depth and the weights tile cannot hold them all.
fn weight_estimate(graph: &OpGraph, dram_id: BufferId, sram_id: BufferId) -> AgentEstimate {
    let dram = graph.buffer(dram_id);
    let sram = graph.buffer(sram_id);
    let total = dram
        .encoded_weights
        .as_ref()
        .map_or(dram.size_in_bytes, |w| w.data.len() as u32);
    let ifm = graph.consumers(sram_id).iter().find_map(|&(op, _)| match graph.op(op) {
        Op::Mce(_) => Some(graph.buffer(graph.inputs(op)[0])),
        _ => None,
    });
    let reloads = match ifm {
        Some(ifm) => {
            let [h, w, c] = num_stripes_hwc(&ifm.tensor_shape, &ifm.stripe_shape);
            if h > 1 && w == 1 && c > 1 && sram.size_in_bytes < total {
                h * w - 1
            } else {
                0
            }
        }
        None => 0,
    };
    let mut estimate = AgentEstimate::new(AgentKind::WgtStreamer);
    estimate.reloads = reloads;
    estimate.dram_bytes = u64::from(reloads + 1) * u64::from(total);
    estimate
}

/// Cycles are counted per stripe, with the output rounded up to half
/// patches, then multiplied by the number of stripes the MCE runs.
/// Operations are counted over whole tensors.
pub fn mce_stats(mce: &MceOp, input: &Buffer, output: &Buffer, caps: &HardwareCapabilities) -> MceStats {
    let kernel_elements = u64::from(mce.weights_stripe[0] * mce.weights_stripe[1]);
    let ifm_consumed = caps.number_of_igs();
    let ofm_produced = caps.number_of_ogs();
    let half_patch_h = caps.patch_shape[1];
    let half_patch_w = div_round_up(caps.patch_shape[2], 2);
    let interleave = mce.stride.x * mce.stride.y;
    let depthwise = mce.operation == MceOperation::DepthwiseConvolution;

    let stripe_ifms = div_round_up(mce.input_stripe[3], interleave);
    let (ifms, ofms) = if depthwise {
        (ifm_consumed, stripe_ifms)
    } else {
        (stripe_ifms, mce.output_stripe[3])
    };
    let out_elements = u64::from(round_up_to_multiple(mce.output_stripe[2], half_patch_w))
        * u64::from(round_up_to_multiple(mce.output_stripe[1], half_patch_h));
    let cycles_per_ofm = u64::from(round_up_to_multiple(ifms, ifm_consumed)) * out_elements * kernel_elements
        / u64::from(ifm_consumed * caps.mac_units_per_engine);
    let stripe_cycles = cycles_per_ofm * u64::from(div_round_up(ofms, ofm_produced));

    let mut stripes: u64 = num_stripes_hwc(&output.tensor_shape, &output.stripe_shape)
        .iter()
        .map(|&n| u64::from(n))
        .product();
    if !depthwise {
        stripes *= u64::from(num_stripes(input.tensor_shape[3], input.stripe_shape[3]));
    }

    let tensor_ifms = u64::from(div_round_up(input.tensor_shape[3], interleave));
    let (ifms, ofms) = if depthwise {
        (1, tensor_ifms)
    } else {
        (tensor_ifms, u64::from(output.tensor_shape[3]))
    };
    let input_elements = u64::from(input.tensor_shape[1] * input.tensor_shape[2]);
    MceStats {
        cycles: stripe_cycles * stripes,
        operations: ifms * input_elements * 2 * kernel_elements * ofms,
    }
}

/// Patches the PLE processes, taking the largest extent of its inputs.
fn ple_patches(inputs: &[TensorShape], caps: &HardwareCapabilities) -> u64 {
    let lanes = caps.num_engines * caps.num_ple_lanes;
    let max = |f: &dyn Fn(&TensorShape) -> u32| inputs.iter().map(f).max().unwrap_or(0);
    let h = max(&|s| div_round_up(s[1], caps.patch_shape[1]));
    let w = max(&|s| div_round_up(s[2], caps.patch_shape[2]));
    let c = max(&|s| div_round_up(s[3], lanes));
    u64::from(h) * u64::from(w) * u64::from(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BlockConfig, DataType, Padding, QuantizationInfo, Stride};
    use crate::graph::TraversalOrder;
    use crate::hardware::HardwareVariant;

    fn sram(shape: TensorShape, stripe: TensorShape) -> Buffer {
        Buffer::new(
            Location::Sram,
            BufferFormat::Nhwcb,
            shape,
            stripe,
            DataType::U8,
            QuantizationInfo::default(),
        )
    }

    fn conv(input_stripe: TensorShape, output_stripe: TensorShape, kernel: u32) -> MceOp {
        MceOp {
            operation: MceOperation::Convolution,
            block_config: BlockConfig::new(16, 16),
            input_stripe,
            output_stripe,
            weights_stripe: [kernel, kernel, input_stripe[3], output_stripe[3]],
            order: TraversalOrder::Xyz,
            stride: Stride::UNIT,
            padding: Padding::default(),
            upscale_factor: 1,
            lower_bound: 0,
            upper_bound: 255,
        }
    }

    #[test]
    fn test_single_stripe_conv_cycles() {
        let caps = HardwareCapabilities::default();
        let shape = [1, 16, 16, 16];
        let stats = mce_stats(&conv(shape, shape, 1), &sram(shape, shape), &sram(shape, shape), &caps);
        // 256 output elements over 16 IGs with 8 MACs each.
        assert_eq!(stats.cycles, 32);
        assert_eq!(stats.operations, 16 * 256 * 2 * 16);
    }

    #[test]
    fn test_smaller_stripes_cost_more_cycles_for_the_same_work() {
        let caps = HardwareCapabilities::default();
        let shape = [1, 20, 20, 16];
        let whole = mce_stats(&conv(shape, shape, 3), &sram(shape, shape), &sram(shape, shape), &caps);
        let stripe = [1, 8, 20, 16];
        let split = mce_stats(
            &conv(stripe, stripe, 3),
            &sram(shape, stripe),
            &sram(shape, stripe),
            &caps,
        );
        assert_eq!(whole.operations, split.operations);
        assert!(split.cycles > whole.cycles);
    }

    #[test]
    fn test_fewer_engines_take_longer() {
        let shape = [1, 16, 16, 64];
        let op = conv(shape, shape, 1);
        let big = mce_stats(&op, &sram(shape, shape), &sram(shape, shape), &HardwareCapabilities::default());
        let small = mce_stats(
            &op,
            &sram(shape, shape),
            &sram(shape, shape),
            &HardwareCapabilities::new(HardwareVariant::Tops1),
        );
        assert_eq!(big.operations, small.operations);
        assert_eq!(small.cycles, 4 * big.cycles);
    }

    #[test]
    fn test_ple_patches_follow_largest_input() {
        let caps = HardwareCapabilities::default();
        // 16 engines with 2 lanes each cover 32 channels per patch.
        assert_eq!(ple_patches(&[[1, 8, 8, 32]], &caps), 2 * 2);
        assert_eq!(ple_patches(&[[1, 8, 8, 32], [1, 8, 12, 64]], &caps), 2 * 3 * 2);
    }

    #[test]
    fn test_effective_size_adds_borders_between_stripes() {
        assert_eq!(effective_size(32, 8, 0), 32);
        assert_eq!(effective_size(32, 8, 8), 32 + 2 * 8 * 3);
        assert_eq!(effective_size(8, 8, 8), 8);
    }
}
