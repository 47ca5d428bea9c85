//! Parts that do no compute of their own: concatenation, reshape, and
//! operations the hardware cannot run at all.

use crate::common::{num_elements, BlockConfig, DataType, QuantizationInfo, TensorShape};
use crate::graph::{Buffer, BufferFormat, BufferType, Op, OpGraph};
use crate::part::{plan_with_slots, PartT, PlanContext};
use crate::plan::{CascadeType, PartId, Plan};
use crate::utils::{BRICK_GROUP_CHANNELS, BRICK_GROUP_HEIGHT, BRICK_GROUP_WIDTH};

/// Concatenation along one axis. Each input is written straight into its
/// place in the output, so the part has no agents of its own.
#[derive(Clone, Debug)]
pub struct ConcatPart {
    id: PartId,
    debug_name: String,
    input_shapes: Vec<TensorShape>,
    axis: usize,
    output_shape: TensorShape,
    data_type: DataType,
    quantization: QuantizationInfo,
}

#[derive(Clone, Debug)]
pub struct ReshapePart {
    id: PartId,
    debug_name: String,
    output_shape: TensorShape,
    data_type: DataType,
    quantization: QuantizationInfo,
}

/// An operation that is only costed, never compiled.
#[derive(Clone, Debug)]
pub struct EstimateOnlyPart {
    id: PartId,
    debug_name: String,
    input_shapes: Vec<TensorShape>,
    output_shapes: Vec<TensorShape>,
    data_type: DataType,
    reason: String,
}

impl ConcatPart {
    pub fn new(
        id: PartId,
        debug_name: impl Into<String>,
        input_shapes: Vec<TensorShape>,
        axis: usize,
        data_type: DataType,
        quantization: QuantizationInfo,
    ) -> Self {
        assert!((1..4).contains(&axis), "cannot concatenate along batch");
        assert!(!input_shapes.is_empty());
        let mut output_shape = input_shapes[0];
        for shape in &input_shapes[1..] {
            for d in (0..4).filter(|&d| d != axis) {
                assert_eq!(shape[d], output_shape[d], "mismatched concat input");
            }
            output_shape[axis] += shape[axis];
        }
        ConcatPart {
            id,
            debug_name: debug_name.into(),
            input_shapes,
            axis,
            output_shape,
            data_type,
            quantization,
        }
    }

    pub fn output_shape(&self) -> TensorShape {
        self.output_shape
    }

    /// Whether every input starts on a brick-group boundary, allowing the
    /// output to be stored as NHWCB.
    pub fn is_brick_aligned(&self) -> bool {
        let granule = match self.axis {
            1 => BRICK_GROUP_HEIGHT,
            2 => BRICK_GROUP_WIDTH,
            _ => BRICK_GROUP_CHANNELS,
        };
        let mut offset = 0;
        for shape in &self.input_shapes {
            if offset % granule != 0 {
                return false;
            }
            offset += shape[self.axis];
        }
        true
    }
}

impl ReshapePart {
    pub fn new(
        id: PartId,
        debug_name: impl Into<String>,
        input_shape: TensorShape,
        output_shape: TensorShape,
        data_type: DataType,
        quantization: QuantizationInfo,
    ) -> Self {
        assert_eq!(num_elements(&input_shape), num_elements(&output_shape));
        ReshapePart {
            id,
            debug_name: debug_name.into(),
            output_shape,
            data_type,
            quantization,
        }
    }
}

impl EstimateOnlyPart {
    pub fn new(
        id: PartId,
        debug_name: impl Into<String>,
        input_shapes: Vec<TensorShape>,
        output_shapes: Vec<TensorShape>,
        data_type: DataType,
        reason: impl Into<String>,
    ) -> Self {
        EstimateOnlyPart {
            id,
            debug_name: debug_name.into(),
            input_shapes,
            output_shapes,
            data_type,
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl PartT for ConcatPart {
    fn id(&self) -> PartId {
        self.id
    }

    fn debug_name(&self) -> &str {
        &self.debug_name
    }

    fn num_inputs(&self) -> usize {
        self.input_shapes.len()
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn get_plans(
        &self,
        _ctx: &PlanContext,
        cascade_type: CascadeType,
        _block_config: Option<BlockConfig>,
        _prev_buffer: Option<&Buffer>,
    ) -> Vec<Plan> {
        if cascade_type != CascadeType::Lonely {
            return vec![];
        }
        let format = if self.is_brick_aligned() {
            BufferFormat::Nhwcb
        } else {
            BufferFormat::Nhwc
        };
        let dram = |shape: TensorShape, tag: String| {
            Buffer::dram(
                BufferType::Intermediate,
                format,
                shape,
                self.data_type,
                self.quantization.clone(),
            )
            .with_tag(tag)
        };
        let mut graph = OpGraph::new();
        let inputs: Vec<_> = self
            .input_shapes
            .iter()
            .enumerate()
            .map(|(i, s)| graph.add_buffer(dram(*s, format!("{} input {i}", self.debug_name))))
            .collect();
        let concat = graph.add_op(Op::Concat { axis: self.axis });
        for &input in &inputs {
            graph.add_consumer(input, concat);
        }
        let output = graph.add_buffer(dram(self.output_shape, format!("{} output", self.debug_name)));
        graph.set_producer(output, concat);
        vec![plan_with_slots(graph, self.id, &inputs, &[output])]
    }
}

impl PartT for ReshapePart {
    fn id(&self) -> PartId {
        self.id
    }

    fn debug_name(&self) -> &str {
        &self.debug_name
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn get_plans(
        &self,
        _ctx: &PlanContext,
        cascade_type: CascadeType,
        _block_config: Option<BlockConfig>,
        _prev_buffer: Option<&Buffer>,
    ) -> Vec<Plan> {
        if cascade_type != CascadeType::Lonely {
            return vec![];
        }
        // NHWC bytes are the same under any reshape, so one buffer serves as
        // both the input and the output.
        let mut graph = OpGraph::new();
        let buffer = graph.add_buffer(
            Buffer::dram(
                BufferType::Intermediate,
                BufferFormat::Nhwc,
                self.output_shape,
                self.data_type,
                self.quantization.clone(),
            )
            .with_tag(format!("{} reshape", self.debug_name)),
        );
        vec![plan_with_slots(graph, self.id, &[buffer], &[buffer])]
    }
}

impl PartT for EstimateOnlyPart {
    fn id(&self) -> PartId {
        self.id
    }

    fn debug_name(&self) -> &str {
        &self.debug_name
    }

    fn num_inputs(&self) -> usize {
        self.input_shapes.len()
    }

    fn num_outputs(&self) -> usize {
        self.output_shapes.len()
    }

    fn get_plans(
        &self,
        _ctx: &PlanContext,
        cascade_type: CascadeType,
        _block_config: Option<BlockConfig>,
        _prev_buffer: Option<&Buffer>,
    ) -> Vec<Plan> {
        if cascade_type != CascadeType::Lonely {
            return vec![];
        }
        let dram = |shape: TensorShape| {
            Buffer::dram(
                BufferType::Intermediate,
                BufferFormat::Nhwcb,
                shape,
                self.data_type,
                QuantizationInfo::default(),
            )
        };
        let mut graph = OpGraph::new();
        let inputs: Vec<_> = self
            .input_shapes
            .iter()
            .map(|s| graph.add_buffer(dram(*s)))
            .collect();
        let outputs: Vec<_> = self
            .output_shapes
            .iter()
            .map(|s| {
                let op = graph.add_op(Op::EstimateOnly {
                    reason: self.reason.clone(),
                });
                for &input in &inputs {
                    graph.add_consumer(input, op);
                }
                let output = graph.add_buffer(dram(*s));
                graph.set_producer(output, op);
                output
            })
            .collect();
        vec![plan_with_slots(graph, self.id, &inputs, &outputs)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_alignment_picks_format() {
        let q = QuantizationInfo::default();
        let aligned = ConcatPart::new(0, "cat", vec![[1, 8, 8, 16], [1, 8, 8, 32]], 3, DataType::U8, q.clone());
        assert!(aligned.is_brick_aligned());
        assert_eq!(aligned.output_shape(), [1, 8, 8, 48]);
        let unaligned = ConcatPart::new(0, "cat", vec![[1, 8, 8, 3], [1, 8, 8, 16]], 3, DataType::U8, q);
        assert!(!unaligned.is_brick_aligned());
    }

    #[test]
    #[should_panic]
    fn test_reshape_must_preserve_elements() {
        ReshapePart::new(0, "r", [1, 4, 4, 4], [1, 8, 8, 1], DataType::U8, QuantizationInfo::default());
    }
}
