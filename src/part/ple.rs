use itertools::iproduct;
use log::debug;
use smallvec::SmallVec;

use crate::common::{BlockConfig, DataType, QuantizationInfo, TensorShape};
use crate::graph::{Buffer, Location, MceOperation, Op, OpGraph, PleOp};
use crate::part::mce::McePart;
use crate::part::{plan_with_slots, retain_fitting, sram_tile, PartT, PlanContext};
use crate::plan::{CascadeType, PartId, Plan};
use crate::ple::PleOperation;
use crate::stripes::{create_stripe, generate_ple_only_stripes, total_stripes};
use crate::utils::{BRICK_GROUP_CHANNELS, BRICK_GROUP_HEIGHT};
use crate::weights::ConvData;

/// A PLE kernel fed by the MCE.
///
/// On its own, or at the start of a section, the part runs an identity
/// depthwise convolution to get its input into the PLE. Behind an MCE-only
/// plan it consumes that MCE's output directly.
#[derive(Clone, Debug)]
pub struct FusedPlePart {
    mce: McePart,
    input_shape: TensorShape,
    output_shape: TensorShape,
}

/// A PLE kernel reading its inputs from SRAM, such as elementwise addition.
#[derive(Clone, Debug)]
pub struct StandalonePlePart {
    id: PartId,
    debug_name: String,
    input_shapes: Vec<TensorShape>,
    output_shape: TensorShape,
    input_quantizations: Vec<QuantizationInfo>,
    output_quantization: QuantizationInfo,
    data_type: DataType,
    operation: PleOperation,
}

impl FusedPlePart {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: PartId,
        debug_name: impl Into<String>,
        input_shape: TensorShape,
        output_shape: TensorShape,
        input_quantization: QuantizationInfo,
        output_quantization: QuantizationInfo,
        data_type: DataType,
        operation: PleOperation,
    ) -> Self {
        assert_eq!(operation.num_inputs(), 1);
        let mce = McePart::new(
            id,
            debug_name,
            input_shape,
            input_shape,
            input_quantization,
            output_quantization,
            data_type,
            ConvData::identity_depthwise(input_shape[3]),
            MceOperation::DepthwiseConvolution,
        )
        .with_ple_operation(operation, output_shape);
        FusedPlePart {
            mce,
            input_shape,
            output_shape,
        }
    }

    pub fn operation(&self) -> PleOperation {
        self.mce.ple_operation()
    }

    /// Plans running only the PLE kernel on an MCE output already in PLE
    /// input SRAM.
    fn fuse_only_plans(
        &self,
        ctx: &PlanContext,
        cascade_type: CascadeType,
        block_config: Option<BlockConfig>,
        prev: &Buffer,
    ) -> Vec<Plan> {
        let operation = self.operation();
        let config = ctx.stripe_config(self.debug_name());
        let Some(block_config) = block_config else {
            return vec![];
        };
        if !config.plan_types.allows(cascade_type)
            || !operation.is_block_config_allowed(&block_config)
            || prev.tensor_shape != self.input_shape
        {
            return vec![];
        }

        let scaled = operation.shape_multiplier().apply(&prev.stripe_shape);
        let mut encoding = [0; 4];
        for d in 1..4 {
            if prev.stripe_shape[d] < self.input_shape[d] {
                let granule = if d == 3 {
                    BRICK_GROUP_CHANNELS
                } else {
                    BRICK_GROUP_HEIGHT
                };
                if scaled[d] % granule != 0 {
                    return vec![];
                }
                encoding[d] = scaled[d];
            }
        }
        let split_h = encoding[1] != 0;
        let split_w = encoding[2] != 0;
        if (operation.requires_full_tensor() && (split_h || split_w))
            || (operation.forbids_width_split() && split_w)
        {
            return vec![];
        }
        let output_stripe = create_stripe(&self.output_shape, &encoding, BRICK_GROUP_CHANNELS);
        let actual = total_stripes(&self.output_shape, &output_stripe);
        let max = match (actual, cascade_type) {
            (1, _) => 1,
            (_, CascadeType::End) => 2,
            _ => 3,
        }
        .min(actual);

        let mut plans: Vec<Plan> = (1..=max)
            .map(|n_out| {
                let mut graph = OpGraph::new();
                let input = graph.add_buffer(prev.clone());
                let ple = graph.add_op(Op::Ple(PleOp {
                    operation,
                    block_config,
                    input_stripes: SmallVec::from_elem(prev.stripe_shape, 1),
                    output_stripe,
                    data_type: self.mce.data_type(),
                    kernel_offset: None,
                }));
                graph.add_consumer(input, ple);
                let output = graph.add_buffer(
                    sram_tile(
                        self.output_shape,
                        output_stripe,
                        n_out,
                        self.mce.data_type(),
                        self.mce.output_quantization().clone(),
                    )
                    .with_tag(format!("{} output", self.debug_name())),
                );
                graph.set_producer(output, ple);
                plan_with_slots(graph, self.id(), &[input], &[output])
            })
            .collect();
        retain_fitting(&mut plans, ctx.capabilities, true);
        plans
    }
}

impl PartT for FusedPlePart {
    fn id(&self) -> PartId {
        self.mce.id()
    }

    fn debug_name(&self) -> &str {
        self.mce.debug_name()
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn can_cascade(&self) -> bool {
        true
    }

    fn get_plans(
        &self,
        ctx: &PlanContext,
        cascade_type: CascadeType,
        block_config: Option<BlockConfig>,
        prev_buffer: Option<&Buffer>,
    ) -> Vec<Plan> {
        match prev_buffer {
            Some(prev) if prev.location == Location::PleInputSram => {
                self.fuse_only_plans(ctx, cascade_type, block_config, prev)
            }
            _ => self
                .mce
                .mce_plans(ctx, cascade_type, block_config, prev_buffer, false),
        }
    }
}

impl StandalonePlePart {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: PartId,
        debug_name: impl Into<String>,
        input_shapes: Vec<TensorShape>,
        output_shape: TensorShape,
        input_quantizations: Vec<QuantizationInfo>,
        output_quantization: QuantizationInfo,
        data_type: DataType,
        operation: PleOperation,
    ) -> Self {
        assert_eq!(input_shapes.len(), operation.num_inputs());
        assert_eq!(input_shapes.len(), input_quantizations.len());
        StandalonePlePart {
            id,
            debug_name: debug_name.into(),
            input_shapes,
            output_shape,
            input_quantizations,
            output_quantization,
            data_type,
            operation,
        }
    }

    /// Elementwise addition of two same-shaped tensors. The rescaling kernel
    /// is only needed when the three quantizations differ.
    pub fn addition(
        id: PartId,
        debug_name: impl Into<String>,
        shape: TensorShape,
        input_quantizations: [QuantizationInfo; 2],
        output_quantization: QuantizationInfo,
        data_type: DataType,
    ) -> Self {
        let operation = if input_quantizations
            .iter()
            .all(|q| *q == output_quantization)
        {
            PleOperation::Addition
        } else {
            PleOperation::AdditionRescale
        };
        StandalonePlePart::new(
            id,
            debug_name,
            vec![shape; 2],
            shape,
            input_quantizations.to_vec(),
            output_quantization,
            data_type,
            operation,
        )
    }

    pub fn operation(&self) -> PleOperation {
        self.operation
    }
}

impl PartT for StandalonePlePart {
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
        ctx: &PlanContext,
        cascade_type: CascadeType,
        _block_config: Option<BlockConfig>,
        _prev_buffer: Option<&Buffer>,
    ) -> Vec<Plan> {
        if cascade_type != CascadeType::Lonely {
            return vec![];
        }
        let config = ctx.stripe_config(&self.debug_name);
        let mut plans = vec![];
        for block_config in self.operation.filter_block_configs(&config.block_configs) {
            let infos = generate_ple_only_stripes(
                &self.input_shapes[0],
                &self.output_shape,
                self.operation,
                block_config,
                &config,
                ctx.capabilities,
            );
            for info in &infos.ple_only {
                for (n_in, n_out) in iproduct!(
                    info.memory.input.range.iter(),
                    info.memory.output.range.iter()
                ) {
                    let mut graph = OpGraph::new();
                    let inputs: Vec<_> = self
                        .input_shapes
                        .iter()
                        .zip(&self.input_quantizations)
                        .enumerate()
                        .map(|(i, (shape, q))| {
                            graph.add_buffer(
                                sram_tile(*shape, info.memory.input.shape, n_in, self.data_type, q.clone())
                                    .with_tag(format!("{} input {i}", self.debug_name)),
                            )
                        })
                        .collect();
                    let ple = graph.add_op(Op::Ple(PleOp {
                        operation: self.operation,
                        block_config,
                        input_stripes: SmallVec::from_elem(info.ple.input, inputs.len()),
                        output_stripe: info.ple.output,
                        data_type: self.data_type,
                        kernel_offset: None,
                    }));
                    for &input in &inputs {
                        graph.add_consumer(input, ple);
                    }
                    let output = graph.add_buffer(
                        sram_tile(
                            self.output_shape,
                            info.memory.output.shape,
                            n_out,
                            self.data_type,
                            self.output_quantization.clone(),
                        )
                        .with_tag(format!("{} output", self.debug_name)),
                    );
                    graph.set_producer(output, ple);
                    plans.push(plan_with_slots(graph, self.id, &inputs, &[output]));
                }
            }
        }
        retain_fitting(&mut plans, ctx.capabilities, false);
        debug!("{}: {} plans", self.debug_name, plans.len());
        plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::HardwareCapabilities;
    use crate::stripe_config::PlanPriority;
    use crate::weights::WeightEncoder;

    fn ctx_for<'a>(caps: &'a HardwareCapabilities, encoder: &'a WeightEncoder) -> PlanContext<'a> {
        PlanContext {
            capabilities: caps,
            stripe_configs: None,
            priority: PlanPriority::High,
            weight_encoder: encoder,
        }
    }

    #[test]
    fn test_addition_picks_kernel_by_quantization() {
        let q = QuantizationInfo::new(0, 0.5);
        let same = StandalonePlePart::addition(0, "add", [1, 8, 8, 16], [q.clone(), q.clone()], q.clone(), DataType::U8);
        assert_eq!(same.operation(), PleOperation::Addition);
        let differing = StandalonePlePart::addition(
            0,
            "add",
            [1, 8, 8, 16],
            [q.clone(), QuantizationInfo::new(0, 0.25)],
            q,
            DataType::U8,
        );
        assert_eq!(differing.operation(), PleOperation::AdditionRescale);
    }

    #[test]
    fn test_standalone_plans_are_lonely_only() {
        let caps = HardwareCapabilities::default();
        let encoder = WeightEncoder::new();
        let ctx = ctx_for(&caps, &encoder);
        let q = QuantizationInfo::default();
        let part = StandalonePlePart::addition(0, "add", [1, 16, 16, 16], [q.clone(), q.clone()], q, DataType::U8);
        assert!(part.get_plans(&ctx, CascadeType::Beginning, None, None).is_empty());
        let plans = part.get_plans(&ctx, CascadeType::Lonely, None, None);
        assert!(!plans.is_empty());
        for plan in &plans {
            assert_eq!(plan.input_mappings.len(), 2);
            assert_eq!(plan.block_config(), Some(BlockConfig::new(16, 16)));
        }
    }

    #[test]
    fn test_fused_ple_after_mce_only_uses_its_block_config() {
        let caps = HardwareCapabilities::default();
        let encoder = WeightEncoder::new();
        let ctx = ctx_for(&caps, &encoder);
        let q = QuantizationInfo::default();
        let part = FusedPlePart::new(
            1,
            "pool",
            [1, 16, 16, 16],
            [1, 8, 8, 16],
            q.clone(),
            q.clone(),
            DataType::U8,
            PleOperation::MaxPool2x2Stride2,
        );
        let mut prev = Buffer::new(
            Location::PleInputSram,
            crate::graph::BufferFormat::Nhwcb,
            [1, 16, 16, 16],
            [1, 16, 16, 16],
            DataType::U8,
            q,
        );
        prev.num_stripes = 1;
        let block = BlockConfig::new(16, 16);
        let plans = part.get_plans(&ctx, CascadeType::End, Some(block), Some(&prev));
        assert_eq!(plans.len(), 1);
        let plan = &plans[0];
        assert_eq!(plan.block_config(), Some(block));
        let out = plan.graph.buffer(plan.output_buffer(0).unwrap());
        assert_eq!(out.stripe_shape, [1, 8, 8, 16]);
        // 32x8 is not a pooling block config.
        assert!(part
            .get_plans(&ctx, CascadeType::End, Some(BlockConfig::new(32, 8)), Some(&prev))
            .is_empty());
    }

    #[test]
    fn test_fused_ple_alone_runs_identity_depthwise() {
        let caps = HardwareCapabilities::default();
        let encoder = WeightEncoder::new();
        let ctx = ctx_for(&caps, &encoder);
        let q = QuantizationInfo::default();
        let part = FusedPlePart::new(0, "sigmoid", [1, 16, 16, 32], [1, 16, 16, 32], q.clone(), q, DataType::I8, PleOperation::Sigmoid);
        let plans = part.get_plans(&ctx, CascadeType::Lonely, None, None);
        assert!(!plans.is_empty());
        assert!(plans.iter().all(|p| p
            .graph
            .op_ids()
            .any(|o| matches!(p.graph.op(o), Op::Mce(m) if m.operation == MceOperation::DepthwiseConvolution))));
    }
}
