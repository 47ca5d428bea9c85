//! The dataflow IR shared by plans, combinations and the command-stream
//! compiler.
//!
//! An [OpGraph] owns its [Buffer]s and [Op]s in two arenas; everything else
//! refers to them by [BufferId] and [OpId]. Merging two buffers (as happens
//! when a plan's output is the next plan's input) leaves a forwarding entry
//! behind, so that ids handed out before the merge keep resolving.

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::common::{BlockConfig, DataType, Padding, QuantizationInfo, Stride, TensorShape};
use crate::ple::{PleKernelId, PleOperation};
use crate::weights::EncodedWeights;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct BufferId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct OpId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Location {
    Dram,
    Sram,
    /// The MCE-to-PLE hand-off memory. Not addressable and not counted
    /// against the SRAM budget.
    PleInputSram,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum BufferFormat {
    Nhwc,
    Nhwcb,
    Weight,
    FcafDeep,
    FcafWide,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum BufferType {
    Input,
    Output,
    Intermediate,
    Constant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum TraversalOrder {
    Xyz,
    Zxy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum MceOperation {
    Convolution,
    DepthwiseConvolution,
    FullyConnected,
}

#[derive(Clone, Debug)]
pub struct Buffer {
    pub location: Location,
    pub format: BufferFormat,
    pub order: TraversalOrder,
    /// Only meaningful for DRAM buffers.
    pub buffer_type: Option<BufferType>,
    pub tensor_shape: TensorShape,
    pub stripe_shape: TensorShape,
    pub data_type: DataType,
    pub quantization: QuantizationInfo,
    pub num_stripes: u32,
    pub size_in_bytes: u32,
    /// Per-bank SRAM address, assigned when a combination is chosen.
    pub offset: Option<u32>,
    pub encoded_weights: Option<Arc<EncodedWeights>>,
    pub constant_data: Option<Arc<Vec<u8>>>,
    /// Index of the network input or output this buffer binds to.
    pub source_index: Option<u32>,
    pub debug_tag: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MceOp {
    pub operation: MceOperation,
    pub block_config: BlockConfig,
    pub input_stripe: TensorShape,
    pub output_stripe: TensorShape,
    pub weights_stripe: TensorShape,
    pub order: TraversalOrder,
    pub stride: Stride,
    pub padding: Padding,
    pub upscale_factor: u32,
    pub lower_bound: i32,
    pub upper_bound: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PleOp {
    pub operation: PleOperation,
    pub block_config: BlockConfig,
    pub input_stripes: SmallVec<[TensorShape; 2]>,
    pub output_stripe: TensorShape,
    pub data_type: DataType,
    /// Per-bank SRAM address of the kernel, assigned with the buffers.
    pub kernel_offset: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Dma { format: BufferFormat },
    Mce(MceOp),
    Ple(PleOp),
    Concat { axis: usize },
    EstimateOnly { reason: String },
}

#[derive(Clone, Debug)]
struct BufferNode {
    buffer: Buffer,
    producer: Option<OpId>,
    consumers: Vec<(OpId, usize)>,
    merged_into: Option<BufferId>,
}

#[derive(Clone, Debug)]
struct OpNode {
    op: Op,
    inputs: SmallVec<[BufferId; 2]>,
    output: Option<BufferId>,
}

#[derive(Clone, Debug, Default)]
pub struct OpGraph {
    buffers: Vec<BufferNode>,
    ops: Vec<OpNode>,
}

impl Buffer {
    pub fn new(
        location: Location,
        format: BufferFormat,
        tensor_shape: TensorShape,
        stripe_shape: TensorShape,
        data_type: DataType,
        quantization: QuantizationInfo,
    ) -> Self {
        Buffer {
            location,
            format,
            order: TraversalOrder::Xyz,
            buffer_type: None,
            tensor_shape,
            stripe_shape,
            data_type,
            quantization,
            num_stripes: 0,
            size_in_bytes: 0,
            offset: None,
            encoded_weights: None,
            constant_data: None,
            source_index: None,
            debug_tag: String::new(),
        }
    }

    pub fn dram(
        buffer_type: BufferType,
        format: BufferFormat,
        tensor_shape: TensorShape,
        data_type: DataType,
        quantization: QuantizationInfo,
    ) -> Self {
        let mut buffer = Buffer::new(
            Location::Dram,
            format,
            tensor_shape,
            tensor_shape,
            data_type,
            quantization,
        );
        buffer.buffer_type = Some(buffer_type);
        buffer.size_in_bytes = match format {
            BufferFormat::Nhwcb => crate::utils::total_size_bytes_nhwcb(&tensor_shape),
            _ => crate::utils::total_size_bytes(&tensor_shape),
        };
        buffer
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.debug_tag = tag.into();
        self
    }

    /// Which of H, W and C are split into more than one stripe.
    pub fn split_dims(&self) -> [bool; 3] {
        [1, 2, 3].map(|d| self.stripe_shape[d] < self.tensor_shape[d])
    }
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Dma { .. } => "Dma",
            Op::Mce(_) => "Mce",
            Op::Ple(_) => "Ple",
            Op::Concat { .. } => "Concat",
            Op::EstimateOnly { .. } => "EstimateOnly",
        }
    }

    pub fn block_config(&self) -> Option<BlockConfig> {
        match self {
            Op::Mce(mce) => Some(mce.block_config),
            Op::Ple(ple) => Some(ple.block_config),
            _ => None,
        }
    }

    pub fn ple_kernel_id(&self) -> Option<PleKernelId> {
        match self {
            Op::Ple(ple) => Some(PleKernelId::new(
                ple.operation,
                ple.block_config,
                ple.data_type,
            )),
            _ => None,
        }
    }
}

impl OpGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_buffer(&mut self, buffer: Buffer) -> BufferId {
        let id = BufferId(self.buffers.len() as u32);
        self.buffers.push(BufferNode {
            buffer,
            producer: None,
            consumers: vec![],
            merged_into: None,
        });
        id
    }

    pub fn add_op(&mut self, op: Op) -> OpId {
        let id = OpId(self.ops.len() as u32);
        self.ops.push(OpNode {
            op,
            inputs: smallvec![],
            output: None,
        });
        id
    }

    /// Appends `buffer` as the next input of `op`.
    pub fn add_consumer(&mut self, buffer: BufferId, op: OpId) {
        let buffer = self.resolve(buffer);
        let slot = self.ops[op.0 as usize].inputs.len();
        self.ops[op.0 as usize].inputs.push(buffer);
        self.buffers[buffer.0 as usize].consumers.push((op, slot));
    }

    pub fn set_producer(&mut self, buffer: BufferId, op: OpId) {
        let buffer = self.resolve(buffer);
        let node = &mut self.buffers[buffer.0 as usize];
        assert!(
            node.producer.is_none(),
            "buffer {buffer:?} already has a producer"
        );
        node.producer = Some(op);
        assert!(self.ops[op.0 as usize].output.is_none());
        self.ops[op.0 as usize].output = Some(buffer);
    }

    /// Follows merges until reaching a live buffer.
    pub fn resolve(&self, mut id: BufferId) -> BufferId {
        while let Some(next) = self.buffers[id.0 as usize].merged_into {
            id = next;
        }
        id
    }

    pub fn buffer(&self, id: BufferId) -> &Buffer {
        &self.buffers[self.resolve(id).0 as usize].buffer
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> &mut Buffer {
        let id = self.resolve(id);
        &mut self.buffers[id.0 as usize].buffer
    }

    pub fn op(&self, id: OpId) -> &Op {
        &self.ops[id.0 as usize].op
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Op {
        &mut self.ops[id.0 as usize].op
    }

    pub fn producer(&self, buffer: BufferId) -> Option<OpId> {
        self.buffers[self.resolve(buffer).0 as usize].producer
    }

    pub fn consumers(&self, buffer: BufferId) -> &[(OpId, usize)] {
        &self.buffers[self.resolve(buffer).0 as usize].consumers
    }

    pub fn inputs(&self, op: OpId) -> &[BufferId] {
        &self.ops[op.0 as usize].inputs
    }

    /// The output buffer of `op`. Every op in a finished graph has one.
    pub fn output(&self, op: OpId) -> BufferId {
        match self.ops[op.0 as usize].output {
            Some(b) => b,
            None => panic!("op {op:?} ({}) has no output buffer", self.op(op).name()),
        }
    }

    /// Ids of all live (not merged-away) buffers, in ascending order.
    pub fn buffer_ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(_, n)| n.merged_into.is_none())
            .map(|(i, _)| BufferId(i as u32))
    }

    pub fn op_ids(&self) -> impl Iterator<Item = OpId> {
        (0..self.ops.len() as u32).map(OpId)
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Copies every buffer and op of `other` into this graph. Returns the
    /// offsets to add to `other`'s buffer and op ids to obtain ids in `self`.
    pub fn append(&mut self, other: &OpGraph) -> (u32, u32) {
        let buffer_base = self.buffers.len() as u32;
        let op_base = self.ops.len() as u32;
        let shift_buffer = |b: BufferId| BufferId(b.0 + buffer_base);
        let shift_op = |o: OpId| OpId(o.0 + op_base);
        for node in &other.buffers {
            self.buffers.push(BufferNode {
                buffer: node.buffer.clone(),
                producer: node.producer.map(shift_op),
                consumers: node
                    .consumers
                    .iter()
                    .map(|&(o, slot)| (shift_op(o), slot))
                    .collect(),
                merged_into: node.merged_into.map(shift_buffer),
            });
        }
        for node in &other.ops {
            self.ops.push(OpNode {
                op: node.op.clone(),
                inputs: node.inputs.iter().copied().map(shift_buffer).collect(),
                output: node.output.map(shift_buffer),
            });
        }
        (buffer_base, op_base)
    }

    /// Replaces `removed` with `kept` everywhere. `removed` must not have a
    /// producer unless `kept` has none.
    pub fn merge_buffers(&mut self, kept: BufferId, removed: BufferId) {
        let kept = self.resolve(kept);
        let removed = self.resolve(removed);
        if kept == removed {
            return;
        }
        let removed_node = std::mem::take(&mut self.buffers[removed.0 as usize].consumers);
        let removed_producer = self.buffers[removed.0 as usize].producer.take();
        for &(op, slot) in &removed_node {
            self.ops[op.0 as usize].inputs[slot] = kept;
        }
        self.buffers[kept.0 as usize].consumers.extend(removed_node);
        if let Some(producer) = removed_producer {
            assert!(
                self.buffers[kept.0 as usize].producer.is_none(),
                "cannot merge two produced buffers"
            );
            self.buffers[kept.0 as usize].producer = Some(producer);
            self.ops[producer.0 as usize].output = Some(kept);
        }
        self.buffers[removed.0 as usize].merged_into = Some(kept);
    }

    /// Ops in dependency order. Ties are broken by op id, so the result is
    /// deterministic.
    pub fn topological_ops(&self) -> Vec<OpId> {
        let mut remaining_inputs: Vec<usize> = self
            .ops
            .iter()
            .map(|n| {
                n.inputs
                    .iter()
                    .filter(|b| self.producer(**b).is_some())
                    .count()
            })
            .collect();
        let mut ready: BTreeSet<OpId> = self
            .op_ids()
            .filter(|o| remaining_inputs[o.0 as usize] == 0)
            .collect();
        let mut result = Vec::with_capacity(self.ops.len());
        while let Some(op) = ready.pop_first() {
            result.push(op);
            if let Some(out) = self.ops[op.0 as usize].output {
                for &(consumer, _) in self.consumers(out) {
                    let r = &mut remaining_inputs[consumer.0 as usize];
                    *r -= 1;
                    if *r == 0 {
                        ready.insert(consumer);
                    }
                }
            }
        }
        assert_eq!(result.len(), self.ops.len(), "op graph contains a cycle");
        result
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sram(shape: TensorShape) -> Buffer {
        Buffer::new(
            Location::Sram,
            BufferFormat::Nhwcb,
            shape,
            shape,
            DataType::U8,
            QuantizationInfo::default(),
        )
    }

    fn dma_chain(graph: &mut OpGraph) -> (BufferId, OpId, BufferId) {
        let a = graph.add_buffer(sram([1, 8, 8, 16]));
        let b = graph.add_buffer(sram([1, 8, 8, 16]));
        let op = graph.add_op(Op::Dma {
            format: BufferFormat::Nhwcb,
        });
        graph.add_consumer(a, op);
        graph.set_producer(b, op);
        (a, op, b)
    }

    #[test]
    fn test_merge_redirects_consumers() {
        let mut graph = OpGraph::new();
        let (_, first, out) = dma_chain(&mut graph);
        let (input, second, _) = dma_chain(&mut graph);
        graph.merge_buffers(out, input);

        assert_eq!(graph.resolve(input), out);
        assert_eq!(graph.inputs(second), &[out]);
        assert_eq!(graph.producer(input), Some(first));
        assert_eq!(graph.buffer_ids().count(), 3);
        assert_eq!(graph.topological_ops(), vec![first, second]);
    }

    #[test]
    fn test_append_shifts_ids() {
        let mut a = OpGraph::new();
        dma_chain(&mut a);
        let mut b = OpGraph::new();
        let (input, op, output) = dma_chain(&mut b);
        let (buffer_base, op_base) = a.append(&b);
        let op = OpId(op.0 + op_base);
        assert_eq!(a.inputs(op), &[BufferId(input.0 + buffer_base)]);
        assert_eq!(a.output(op), BufferId(output.0 + buffer_base));
    }

    #[test]
    fn test_topological_order_follows_dependencies_not_ids() {
        let mut graph = OpGraph::new();
        let a = graph.add_buffer(sram([1, 8, 8, 16]));
        let b = graph.add_buffer(sram([1, 8, 8, 16]));
        let c = graph.add_buffer(sram([1, 8, 8, 16]));
        let consumer = graph.add_op(Op::Dma {
            format: BufferFormat::Nhwcb,
        });
        let producer = graph.add_op(Op::Dma {
            format: BufferFormat::Nhwcb,
        });
        graph.add_consumer(b, consumer);
        graph.set_producer(c, consumer);
        graph.add_consumer(a, producer);
        graph.set_producer(b, producer);
        assert_eq!(graph.topological_ops(), vec![producer, consumer]);
    }
}
