use enum_dispatch::enum_dispatch;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

use crate::common::{BlockConfig, DataType, QuantizationInfo, TensorShape};
use crate::graph::{Buffer, BufferFormat, BufferId, Location};
use crate::hardware::HardwareCapabilities;
use crate::part::{
    io::{ConstantPart, InputPart, OutputPart},
    mce::McePart,
    ple::{FusedPlePart, StandalonePlePart},
    structural::{ConcatPart, EstimateOnlyPart, ReshapePart},
};
use crate::plan::{CascadeType, PartId, PartInputSlot, PartOutputSlot, Plan};
use crate::stripe_config::{PlanPriority, StripeConfig, StripeConfigFile};
use crate::utils::total_size_bytes_nhwcb;
use crate::weights::WeightEncoder;

pub mod io;
pub mod mce;
pub mod ple;
pub mod structural;

/// Everything plan generation reads besides the part itself.
pub struct PlanContext<'a> {
    pub capabilities: &'a HardwareCapabilities,
    pub stripe_configs: Option<&'a StripeConfigFile>,
    pub priority: PlanPriority,
    pub weight_encoder: &'a WeightEncoder,
}

#[enum_dispatch]
pub trait PartT {
    fn id(&self) -> PartId;

    fn debug_name(&self) -> &str;

    fn num_inputs(&self) -> usize;

    fn num_outputs(&self) -> usize;

    /// Whether the part may sit anywhere but alone in a section.
    fn can_cascade(&self) -> bool {
        false
    }

    /// Returns every plan for the part at `cascade_type`.
    ///
    /// For Middle and End plans, `prev_buffer` is the SRAM (or PLE input)
    /// buffer the preceding part in the section produces, and `block_config`
    /// that part's block config. The returned plans reuse `prev_buffer`'s
    /// shape and stripe count for input 0.
    fn get_plans(
        &self,
        ctx: &PlanContext,
        cascade_type: CascadeType,
        block_config: Option<BlockConfig>,
        prev_buffer: Option<&Buffer>,
    ) -> Vec<Plan>;
}

#[derive(Clone, Debug)]
#[enum_dispatch(PartT)]
pub enum Part {
    Input(InputPart),
    Output(OutputPart),
    Constant(ConstantPart),
    Mce(McePart),
    FusedPle(FusedPlePart),
    StandalonePle(StandalonePlePart),
    Concat(ConcatPart),
    Reshape(ReshapePart),
    EstimateOnly(EstimateOnlyPart),
}

/// The network to compile: parts plus the producer of every input slot.
#[derive(Clone, Debug, Default)]
pub struct GraphOfParts {
    parts: Vec<Part>,
    connections: BTreeMap<PartInputSlot, PartOutputSlot>,
}

impl PlanContext<'_> {
    pub fn stripe_config(&self, part_name: &str) -> StripeConfig {
        let base = match self.stripe_configs {
            Some(file) => file.config_for(part_name),
            None => StripeConfig::default(),
        };
        base.for_priority(self.priority)
    }
}

impl GraphOfParts {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id the next added part must carry.
    pub fn next_part_id(&self) -> PartId {
        self.parts.len()
    }

    pub fn add_part(&mut self, part: impl Into<Part>) -> PartId {
        let part = part.into();
        assert_eq!(
            part.id(),
            self.parts.len(),
            "parts must be added in id order"
        );
        self.parts.push(part);
        self.parts.len() - 1
    }

    /// Feeds output `from` into input `to`. Each input has one producer.
    pub fn connect(&mut self, from: PartOutputSlot, to: PartInputSlot) {
        assert!(from.index < self.parts[from.part_id].num_outputs());
        assert!(to.index < self.parts[to.part_id].num_inputs());
        let previous = self.connections.insert(to, from);
        assert!(previous.is_none(), "input {to:?} connected twice");
    }

    pub fn part(&self, id: PartId) -> &Part {
        &self.parts[id]
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn producer(&self, slot: PartInputSlot) -> Option<PartOutputSlot> {
        self.connections.get(&slot).copied()
    }

    pub fn consumers(&self, slot: PartOutputSlot) -> Vec<PartInputSlot> {
        self.connections
            .iter()
            .filter(|(_, from)| **from == slot)
            .map(|(to, _)| *to)
            .collect()
    }

    /// Input slots with no producer.
    pub fn unconnected_inputs(&self) -> Vec<PartInputSlot> {
        self.parts
            .iter()
            .flat_map(|p| {
                (0..p.num_inputs()).map(move |index| PartInputSlot {
                    part_id: p.id(),
                    index,
                })
            })
            .filter(|slot| !self.connections.contains_key(slot))
            .collect()
    }

    /// Part ids in dataflow order, ties broken by id.
    pub fn topological_order(&self) -> Vec<PartId> {
        let mut remaining = vec![0usize; self.parts.len()];
        for to in self.connections.keys() {
            remaining[to.part_id] += 1;
        }
        let mut ready: BTreeSet<PartId> = (0..self.parts.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.parts.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for (to, from) in &self.connections {
                if from.part_id == id {
                    remaining[to.part_id] -= 1;
                    if remaining[to.part_id] == 0 {
                        ready.insert(to.part_id);
                    }
                }
            }
        }
        assert_eq!(order.len(), self.parts.len(), "graph of parts has a cycle");
        debug!("Part order: {order:?}");
        order
    }
}

/// An SRAM tile holding `num_stripes` NHWCB stripes of `tensor_shape`.
pub(crate) fn sram_tile(
    tensor_shape: TensorShape,
    stripe_shape: TensorShape,
    num_stripes: u32,
    data_type: DataType,
    quantization: QuantizationInfo,
) -> Buffer {
    let mut buffer = Buffer::new(
        Location::Sram,
        BufferFormat::Nhwcb,
        tensor_shape,
        stripe_shape,
        data_type,
        quantization,
    );
    buffer.num_stripes = num_stripes;
    buffer.size_in_bytes = total_size_bytes_nhwcb(&stripe_shape) * num_stripes;
    buffer
}

/// A plan whose inputs and outputs map to the given buffers, in slot order.
pub(crate) fn plan_with_slots(
    graph: crate::graph::OpGraph,
    part_id: PartId,
    inputs: &[BufferId],
    outputs: &[BufferId],
) -> Plan {
    let input_mappings = inputs
        .iter()
        .enumerate()
        .map(|(index, b)| (*b, PartInputSlot { part_id, index }))
        .collect();
    let output_mappings = outputs
        .iter()
        .enumerate()
        .map(|(index, b)| (*b, PartOutputSlot { part_id, index }))
        .collect();
    Plan::new(graph, input_mappings, output_mappings)
}

/// Drops plans whose SRAM footprint does not fit one bank.
pub(crate) fn retain_fitting(plans: &mut Vec<Plan>, caps: &HardwareCapabilities, continuing: bool) {
    let before = plans.len();
    plans.retain(|p| p.sram_bank_bytes(caps, continuing) <= caps.sram_bank_size());
    if plans.len() != before {
        debug!("Dropped {} plans exceeding SRAM", before - plans.len());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::graph::MceOperation;
    use crate::weights::ConvData;

    pub(crate) fn identity_conv(id: PartId, shape: TensorShape) -> McePart {
        let c = shape[3];
        let weights = (0..c * c)
            .map(|i| if i % (c + 1) == 0 { 2 } else { 0 })
            .collect();
        McePart::new(
            id,
            format!("conv{id}"),
            shape,
            shape,
            QuantizationInfo::default(),
            QuantizationInfo::default(),
            DataType::U8,
            ConvData::new(
                [1, 1, c, c],
                weights,
                QuantizationInfo::new(0, 0.5),
                vec![0; c as usize],
            ),
            MceOperation::Convolution,
        )
    }

    pub(crate) fn io_chain(graph: &mut GraphOfParts, shape: TensorShape) -> (PartId, PartId) {
        let input = graph.add_part(InputPart::new(
            graph.next_part_id(),
            "input",
            shape,
            DataType::U8,
            QuantizationInfo::default(),
            0,
        ));
        let conv = graph.add_part(identity_conv(graph.next_part_id(), shape));
        let output = graph.add_part(OutputPart::new(
            graph.next_part_id(),
            "output",
            shape,
            DataType::U8,
            QuantizationInfo::default(),
            0,
        ));
        graph.connect(
            PartOutputSlot { part_id: input, index: 0 },
            PartInputSlot { part_id: conv, index: 0 },
        );
        graph.connect(
            PartOutputSlot { part_id: conv, index: 0 },
            PartInputSlot { part_id: output, index: 0 },
        );
        (input, output)
    }

    #[test]
    fn test_topological_order_and_connectivity() {
        let mut graph = GraphOfParts::new();
        let (input, output) = io_chain(&mut graph, [1, 16, 16, 16]);
        assert_eq!(graph.topological_order(), vec![input, 1, output]);
        assert!(graph.unconnected_inputs().is_empty());
        assert_eq!(
            graph.consumers(PartOutputSlot { part_id: input, index: 0 }),
            vec![PartInputSlot { part_id: 1, index: 0 }]
        );
    }

    #[test]
    #[should_panic]
    fn test_double_connection_panics() {
        let mut graph = GraphOfParts::new();
        let (input, _) = io_chain(&mut graph, [1, 16, 16, 16]);
        graph.connect(
            PartOutputSlot { part_id: input, index: 0 },
            PartInputSlot { part_id: 1, index: 0 },
        );
    }
}
