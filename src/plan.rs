use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::common::BlockConfig;
use crate::graph::{BufferId, Location, Op, OpGraph, OpId};
use crate::hardware::HardwareCapabilities;
use crate::ple::PleKernelId;
use crate::utils::{num_stripes_hwc, total_size_bytes_nhwcb};

pub type PartId = usize;

/// Where in a cascade a plan is meant to sit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Sequence, Deserialize, Serialize)]
pub enum CascadeType {
    Beginning,
    Middle,
    End,
    Lonely,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct PartInputSlot {
    pub part_id: PartId,
    pub index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct PartOutputSlot {
    pub part_id: PartId,
    pub index: usize,
}

/// One candidate implementation of a part: a subgraph plus the buffers its
/// input and output slots map onto.
#[derive(Clone, Debug)]
pub struct Plan {
    pub graph: OpGraph,
    pub input_mappings: BTreeMap<BufferId, PartInputSlot>,
    pub output_mappings: BTreeMap<BufferId, PartOutputSlot>,
}

impl CascadeType {
    pub fn name(&self) -> &'static str {
        match self {
            CascadeType::Beginning => "Beginning",
            CascadeType::Middle => "Middle",
            CascadeType::End => "End",
            CascadeType::Lonely => "Lonely",
        }
    }

    /// Whether the part's output leaves the cascade (and so is double
    /// buffered toward DRAM).
    pub fn ends_section(&self) -> bool {
        matches!(self, CascadeType::End | CascadeType::Lonely)
    }
}

impl Plan {
    pub fn new(
        graph: OpGraph,
        input_mappings: BTreeMap<BufferId, PartInputSlot>,
        output_mappings: BTreeMap<BufferId, PartOutputSlot>,
    ) -> Self {
        Plan {
            graph,
            input_mappings,
            output_mappings,
        }
    }

    pub fn input_buffer(&self, index: usize) -> Option<BufferId> {
        self.input_mappings
            .iter()
            .find(|(_, slot)| slot.index == index)
            .map(|(b, _)| *b)
    }

    pub fn output_buffer(&self, index: usize) -> Option<BufferId> {
        self.output_mappings
            .iter()
            .find(|(_, slot)| slot.index == index)
            .map(|(b, _)| *b)
    }

    /// The block config of the plan's compute, if it has any.
    pub fn block_config(&self) -> Option<BlockConfig> {
        self.graph
            .op_ids()
            .find_map(|o| self.graph.op(o).block_config())
    }

    pub fn ple_kernels(&self) -> impl Iterator<Item = (OpId, PleKernelId)> + '_ {
        self.graph
            .op_ids()
            .filter_map(|o| self.graph.op(o).ple_kernel_id().map(|k| (o, k)))
    }

    pub fn estimate_only_reason(&self) -> Option<&str> {
        self.graph.op_ids().find_map(|o| match self.graph.op(o) {
            Op::EstimateOnly { reason } => Some(reason.as_str()),
            _ => None,
        })
    }

    /// SRAM buffers which this plan itself must allocate, i.e. all of them
    /// except those mapped to an input slot when `skip_inputs` is set.
    pub fn sram_buffers(&self, skip_inputs: bool) -> Vec<BufferId> {
        self.graph
            .buffer_ids()
            .filter(|b| self.graph.buffer(*b).location == Location::Sram)
            .filter(|b| !(skip_inputs && self.input_mappings.contains_key(b)))
            .collect()
    }

    /// Per-bank SRAM bytes the plan occupies, counting one kernel per
    /// distinct PLE kernel.
    pub fn sram_bank_bytes(&self, caps: &HardwareCapabilities, skip_inputs: bool) -> u32 {
        let buffers: u32 = self
            .sram_buffers(skip_inputs)
            .into_iter()
            .map(|b| caps.bank_bytes(self.graph.buffer(b).size_in_bytes))
            .sum();
        let mut kernels: Vec<PleKernelId> = self.ple_kernels().map(|(_, k)| k).collect();
        kernels.sort();
        kernels.dedup();
        buffers + kernels.len() as u32 * caps.ple_kernel_sram_size
    }

    /// Bytes moved to or from DRAM by the plan's own DMAs.
    pub fn dram_traffic(&self) -> u64 {
        self.graph
            .op_ids()
            .filter(|o| matches!(self.graph.op(*o), Op::Dma { .. }))
            .map(|o| {
                let input = self.graph.buffer(self.graph.inputs(o)[0]);
                let output = self.graph.buffer(self.graph.output(o));
                let dram = if input.location == Location::Dram {
                    input
                } else {
                    output
                };
                u64::from(dram.size_in_bytes)
            })
            .sum()
    }

    /// Total stripes computed by the plan's MCE and PLE ops. Fewer, larger
    /// stripes mean less per-stripe overhead.
    pub fn compute_stripes(&self) -> u64 {
        self.graph
            .op_ids()
            .filter(|o| matches!(self.graph.op(*o), Op::Mce(_) | Op::Ple(_)))
            .map(|o| {
                let out = self.graph.buffer(self.graph.output(o));
                num_stripes_hwc(&out.tensor_shape, &out.stripe_shape)
                    .iter()
                    .map(|&n| u64::from(n))
                    .product::<u64>()
            })
            .sum()
    }

    /// DRAM bytes a DMA into or out of `buffer` would move.
    pub fn boundary_traffic(&self, buffer: BufferId) -> u64 {
        let buffer = self.graph.buffer(buffer);
        match buffer.location {
            Location::Sram => u64::from(total_size_bytes_nhwcb(&buffer.tensor_shape)),
            _ => 0,
        }
    }
}
