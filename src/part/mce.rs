use itertools::iproduct;
use log::debug;
use smallvec::smallvec;
use std::sync::Arc;

use crate::common::{BlockConfig, DataType, Padding, QuantizationInfo, Stride, TensorShape};
use crate::graph::{
    Buffer, BufferFormat, BufferType, Location, MceOp, MceOperation, Op, OpGraph, PleOp,
    TraversalOrder,
};
use crate::part::{plan_with_slots, retain_fitting, sram_tile, PartT, PlanContext};
use crate::plan::{CascadeType, PartId, Plan};
use crate::ple::PleOperation;
use crate::stripe_config::StripeConfig;
use crate::stripes::{MceStripesInfo, MemoryStripesInfo, PleStripesInfo, StripeGenerator, StripeInfos};
use crate::weights::{ConvData, EncodedWeights};

/// A convolution, depthwise convolution or fully connected layer, followed by
/// a PLE kernel (normally a passthrough applying the activation clamp).
#[derive(Clone, Debug)]
pub struct McePart {
    id: PartId,
    debug_name: String,
    input_shape: TensorShape,
    output_shape: TensorShape,
    input_quantization: QuantizationInfo,
    output_quantization: QuantizationInfo,
    data_type: DataType,
    conv: ConvData,
    operation: MceOperation,
    stride: Stride,
    padding: Padding,
    upscale_factor: u32,
    lower_bound: i32,
    upper_bound: i32,
    ple_operation: PleOperation,
    ple_output_shape: TensorShape,
}

impl McePart {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: PartId,
        debug_name: impl Into<String>,
        input_shape: TensorShape,
        output_shape: TensorShape,
        input_quantization: QuantizationInfo,
        output_quantization: QuantizationInfo,
        data_type: DataType,
        conv: ConvData,
        operation: MceOperation,
    ) -> Self {
        let (lower_bound, upper_bound) = data_type.bounds();
        McePart {
            id,
            debug_name: debug_name.into(),
            input_shape,
            output_shape,
            input_quantization,
            output_quantization,
            data_type,
            conv,
            operation,
            stride: Stride::UNIT,
            padding: Padding::default(),
            upscale_factor: 1,
            lower_bound,
            upper_bound,
            ple_operation: PleOperation::Passthrough,
            ple_output_shape: output_shape,
        }
    }

    pub fn with_stride(mut self, stride: Stride) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_upscale_factor(mut self, upscale_factor: u32) -> Self {
        assert!(upscale_factor >= 1);
        self.upscale_factor = upscale_factor;
        self
    }

    /// Clamps the output to `[lower, upper]` (a fused ReLU, for instance).
    pub fn with_bounds(mut self, lower: i32, upper: i32) -> Self {
        self.lower_bound = lower;
        self.upper_bound = upper;
        self
    }

    /// Replaces the trailing passthrough with `operation`, producing
    /// `ple_output_shape`.
    pub(crate) fn with_ple_operation(mut self, operation: PleOperation, ple_output_shape: TensorShape) -> Self {
        self.ple_operation = operation;
        self.ple_output_shape = ple_output_shape;
        self
    }

    pub fn input_shape(&self) -> TensorShape {
        self.input_shape
    }

    pub fn output_shape(&self) -> TensorShape {
        self.ple_output_shape
    }

    pub fn operation(&self) -> MceOperation {
        self.operation
    }

    pub(crate) fn ple_operation(&self) -> PleOperation {
        self.ple_operation
    }

    pub(crate) fn data_type(&self) -> DataType {
        self.data_type
    }

    pub(crate) fn output_quantization(&self) -> &QuantizationInfo {
        &self.output_quantization
    }

    pub(crate) fn generator(&self, ctx: &PlanContext, config: StripeConfig) -> StripeGenerator {
        StripeGenerator {
            mce_input: self.input_shape,
            mce_output: self.output_shape,
            ple_output: self.ple_output_shape,
            kernel_height: self.conv.kernel_height(),
            kernel_width: self.conv.kernel_width(),
            stride: self.stride,
            upscale_factor: self.upscale_factor,
            operation: self.operation,
            ple_operation: self.ple_operation,
            capabilities: ctx.capabilities.clone(),
            config,
        }
    }

    /// Plans for every block config the part may use, or the one the
    /// preceding part in the section uses when it is allowed here.
    pub(crate) fn mce_plans(
        &self,
        ctx: &PlanContext,
        cascade_type: CascadeType,
        block_config: Option<BlockConfig>,
        prev_buffer: Option<&Buffer>,
        with_mce_only: bool,
    ) -> Vec<Plan> {
        let generator = self.generator(ctx, ctx.stripe_config(&self.debug_name));
        let allowed = generator.block_configs();
        let mut plans = vec![];
        match (cascade_type, prev_buffer) {
            (CascadeType::Lonely | CascadeType::Beginning, _) => {
                for block_config in allowed {
                    let infos = generator.generate_stripes(block_config, cascade_type);
                    plans.extend(self.plans_from_infos(ctx, &infos, None, with_mce_only));
                }
            }
            (CascadeType::Middle | CascadeType::End, Some(prev)) => {
                if prev.location != Location::Sram || prev.tensor_shape != self.input_shape {
                    return vec![];
                }
                let block_configs = match block_config {
                    Some(b) if allowed.contains(&b) => vec![b],
                    _ => allowed,
                };
                for block_config in block_configs {
                    let infos = generator.generate_continuation(
                        &prev.stripe_shape,
                        prev.num_stripes,
                        block_config,
                        cascade_type,
                    );
                    plans.extend(self.plans_from_infos(ctx, &infos, Some(prev), with_mce_only));
                }
            }
            (CascadeType::Middle | CascadeType::End, None) => {}
        }
        retain_fitting(&mut plans, ctx.capabilities, prev_buffer.is_some());
        debug!(
            "{}: {} {} plans",
            self.debug_name,
            plans.len(),
            cascade_type.name()
        );
        plans
    }

    fn plans_from_infos(
        &self,
        ctx: &PlanContext,
        infos: &StripeInfos,
        prev_buffer: Option<&Buffer>,
        with_mce_only: bool,
    ) -> Vec<Plan> {
        let mut plans = vec![];
        for info in &infos.mce_and_ple {
            let weights = self.encode_weights(ctx, &info.mce);
            for (n_in, n_w, n_out) in iproduct!(
                info.memory.input.range.iter(),
                info.memory.weight.range.iter(),
                info.memory.output.range.iter()
            ) {
                plans.push(self.build_plan(
                    &info.mce,
                    Some(&info.ple),
                    &info.memory,
                    [n_in, n_w, n_out],
                    prev_buffer,
                    &weights,
                ));
            }
        }
        if with_mce_only {
            for info in &infos.mce_only {
                let weights = self.encode_weights(ctx, &info.mce);
                for (n_in, n_w, n_out) in iproduct!(
                    info.memory.input.range.iter(),
                    info.memory.weight.range.iter(),
                    info.memory.ple_input.range.iter()
                ) {
                    plans.push(self.build_plan(
                        &info.mce,
                        None,
                        &info.memory,
                        [n_in, n_w, n_out],
                        prev_buffer,
                        &weights,
                    ));
                }
            }
        }
        plans
    }

    fn encode_weights(&self, ctx: &PlanContext, mce: &MceStripesInfo) -> Arc<EncodedWeights> {
        let stripe_depth = match self.operation {
            MceOperation::DepthwiseConvolution => mce.weight[2],
            _ => mce.weight[3],
        };
        ctx.weight_encoder.encode(
            &self.conv,
            self.operation,
            &self.input_quantization,
            &self.output_quantization,
            stripe_depth,
            mce.weight[2],
        )
    }

    /// Builds one plan. Without `ple` the MCE output in PLE input SRAM is the
    /// plan's output, holding `counts[2]` stripes.
    fn build_plan(
        &self,
        mce: &MceStripesInfo,
        ple: Option<&PleStripesInfo>,
        memory: &MemoryStripesInfo,
        [n_in, n_w, n_out]: [u32; 3],
        prev_buffer: Option<&Buffer>,
        weights: &Arc<EncodedWeights>,
    ) -> Plan {
        let mut graph = OpGraph::new();
        let input = match prev_buffer {
            Some(prev) => graph.add_buffer(prev.clone()),
            None => graph.add_buffer(
                sram_tile(
                    self.input_shape,
                    memory.input.shape,
                    n_in,
                    self.data_type,
                    self.input_quantization.clone(),
                )
                .with_tag(format!("{} input", self.debug_name)),
            ),
        };

        let mut dram_weights = Buffer::dram(
            BufferType::Constant,
            BufferFormat::Weight,
            self.conv.weights_shape,
            DataType::U8,
            self.conv.weights_quantization.clone(),
        )
        .with_tag(format!("{} weights", self.debug_name));
        dram_weights.size_in_bytes = weights.data.len() as u32;
        dram_weights.encoded_weights = Some(Arc::clone(weights));
        let dram_weights = graph.add_buffer(dram_weights);

        let mut sram_weights = Buffer::new(
            Location::Sram,
            BufferFormat::Weight,
            self.conv.weights_shape,
            memory.weight.shape,
            DataType::U8,
            self.conv.weights_quantization.clone(),
        )
        .with_tag(format!("{} weight tile", self.debug_name));
        sram_weights.num_stripes = n_w;
        sram_weights.size_in_bytes = weights.max_size * n_w;
        sram_weights.encoded_weights = Some(Arc::clone(weights));
        let sram_weights = graph.add_buffer(sram_weights);

        let dma = graph.add_op(Op::Dma {
            format: BufferFormat::Weight,
        });
        graph.add_consumer(dram_weights, dma);
        graph.set_producer(sram_weights, dma);

        let mce_op = graph.add_op(Op::Mce(MceOp {
            operation: self.operation,
            block_config: mce.block_config,
            input_stripe: mce.input,
            output_stripe: mce.output,
            weights_stripe: mce.weight,
            order: TraversalOrder::Xyz,
            stride: self.stride,
            padding: self.padding,
            upscale_factor: self.upscale_factor,
            lower_bound: self.lower_bound,
            upper_bound: self.upper_bound,
        }));
        graph.add_consumer(input, mce_op);
        graph.add_consumer(sram_weights, mce_op);

        let mut ple_input = Buffer::new(
            Location::PleInputSram,
            BufferFormat::Nhwcb,
            self.output_shape,
            mce.output,
            self.data_type,
            self.output_quantization.clone(),
        )
        .with_tag(format!("{} mce output", self.debug_name));
        let Some(ple) = ple else {
            ple_input.num_stripes = n_out;
            let ple_input = graph.add_buffer(ple_input);
            graph.set_producer(ple_input, mce_op);
            return plan_with_slots(graph, self.id, &[input], &[ple_input]);
        };
        let ple_input = graph.add_buffer(ple_input);
        graph.set_producer(ple_input, mce_op);

        let ple_op = graph.add_op(Op::Ple(PleOp {
            operation: self.ple_operation,
            block_config: ple.block_config,
            input_stripes: smallvec![ple.input],
            output_stripe: ple.output,
            data_type: self.data_type,
            kernel_offset: None,
        }));
        graph.add_consumer(ple_input, ple_op);
        let output = graph.add_buffer(
            sram_tile(
                self.ple_output_shape,
                memory.output.shape,
                n_out,
                self.data_type,
                self.output_quantization.clone(),
            )
            .with_tag(format!("{} output", self.debug_name)),
        );
        graph.set_producer(output, ple_op);
        plan_with_slots(graph, self.id, &[input], &[output])
    }
}

impl PartT for McePart {
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
        // Only a passthrough may be replaced by the next part's PLE kernel.
        let with_mce_only = matches!(cascade_type, CascadeType::Beginning | CascadeType::Middle)
            && self.ple_operation == PleOperation::Passthrough;
        self.mce_plans(ctx, cascade_type, block_config, prev_buffer, with_mce_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BufferId;
    use crate::hardware::HardwareCapabilities;
    use crate::part::tests::identity_conv;
    use crate::stripe_config::PlanPriority;
    use crate::weights::WeightEncoder;

    fn with_ctx<R>(caps: &HardwareCapabilities, f: impl FnOnce(&PlanContext) -> R) -> R {
        let encoder = WeightEncoder::new();
        let ctx = PlanContext {
            capabilities: caps,
            stripe_configs: None,
            priority: PlanPriority::High,
            weight_encoder: &encoder,
        };
        f(&ctx)
    }

    #[test]
    fn test_lonely_plans_have_weights_and_fit() {
        let caps = HardwareCapabilities::default();
        let part = identity_conv(0, [1, 16, 16, 16]);
        let plans = with_ctx(&caps, |ctx| part.get_plans(ctx, CascadeType::Lonely, None, None));
        assert!(!plans.is_empty());
        for plan in &plans {
            assert!(plan.sram_bank_bytes(&caps, false) <= caps.sram_bank_size());
            let input = plan.input_buffer(0).unwrap();
            let output = plan.output_buffer(0).unwrap();
            assert_eq!(plan.graph.buffer(input).location, Location::Sram);
            assert_eq!(plan.graph.buffer(output).location, Location::Sram);
            assert!(plan
                .graph
                .buffer_ids()
                .any(|b: BufferId| plan.graph.buffer(b).encoded_weights.is_some()));
        }
    }

    #[test]
    fn test_beginning_includes_mce_only_plans() {
        let caps = HardwareCapabilities::default();
        let part = identity_conv(0, [1, 32, 32, 16]);
        let plans = with_ctx(&caps, |ctx| part.get_plans(ctx, CascadeType::Beginning, None, None));
        assert!(plans.iter().any(|p| {
            let out = p.output_buffer(0).unwrap();
            p.graph.buffer(out).location == Location::PleInputSram
        }));
    }

    #[test]
    fn test_upscale_and_bounds_reach_the_mce() {
        let caps = HardwareCapabilities::default();
        let part = McePart::new(
            0,
            "upscale",
            [1, 16, 16, 16],
            [1, 32, 32, 16],
            QuantizationInfo::default(),
            QuantizationInfo::default(),
            DataType::U8,
            ConvData::new(
                [1, 1, 16, 16],
                vec![1; 256],
                QuantizationInfo::new(0, 0.5),
                vec![0; 16],
            ),
            MceOperation::Convolution,
        )
        .with_upscale_factor(2)
        .with_bounds(0, 100);
        let plans = with_ctx(&caps, |ctx| part.get_plans(ctx, CascadeType::Lonely, None, None));
        assert!(!plans.is_empty());
        for plan in &plans {
            let mce = plan
                .graph
                .op_ids()
                .find_map(|o| match plan.graph.op(o) {
                    Op::Mce(mce) => Some(mce.clone()),
                    _ => None,
                })
                .unwrap();
            assert_eq!(mce.upscale_factor, 2);
            assert_eq!((mce.lower_bound, mce.upper_bound), (0, 100));
            assert!(mce.input_stripe[1] * 2 >= mce.output_stripe[1]);
        }
    }

    #[test]
    fn test_oversized_part_has_no_plans() {
        // A single PLE kernel already fills each bank.
        let caps = HardwareCapabilities::default().with_total_sram_size(16 * 1024);
        let part = identity_conv(0, [1, 64, 64, 64]);
        let plans = with_ctx(&caps, |ctx| part.get_plans(ctx, CascadeType::Lonely, None, None));
        assert!(plans.is_empty());
    }

    #[test]
    fn test_continuation_reuses_previous_buffer() {
        let caps = HardwareCapabilities::default();
        let part = identity_conv(1, [1, 32, 32, 16]);
        let prev = sram_tile(
            [1, 32, 32, 16],
            [1, 8, 32, 16],
            1,
            DataType::U8,
            QuantizationInfo::default(),
        );
        let plans = with_ctx(&caps, |ctx| {
            part.get_plans(ctx, CascadeType::End, Some(BlockConfig::new(16, 16)), Some(&prev))
        });
        assert!(!plans.is_empty());
        for plan in &plans {
            let input = plan.graph.buffer(plan.input_buffer(0).unwrap());
            assert_eq!(input.stripe_shape, prev.stripe_shape);
            assert_eq!(input.num_stripes, 1);
        }
    }
}
