//! Parts that only bind DRAM buffers: network inputs, outputs and constants.

use std::sync::Arc;

use crate::common::{BlockConfig, DataType, QuantizationInfo, TensorShape};
use crate::graph::{Buffer, BufferFormat, BufferType, OpGraph};
use crate::part::{plan_with_slots, PartT, PlanContext};
use crate::plan::{CascadeType, PartId, Plan};

#[derive(Clone, Debug)]
pub struct InputPart {
    id: PartId,
    debug_name: String,
    shape: TensorShape,
    data_type: DataType,
    quantization: QuantizationInfo,
    source_index: u32,
}

#[derive(Clone, Debug)]
pub struct OutputPart {
    id: PartId,
    debug_name: String,
    shape: TensorShape,
    data_type: DataType,
    quantization: QuantizationInfo,
    source_index: u32,
}

#[derive(Clone, Debug)]
pub struct ConstantPart {
    id: PartId,
    debug_name: String,
    shape: TensorShape,
    data_type: DataType,
    quantization: QuantizationInfo,
    data: Arc<Vec<u8>>,
}

impl InputPart {
    pub fn new(
        id: PartId,
        debug_name: impl Into<String>,
        shape: TensorShape,
        data_type: DataType,
        quantization: QuantizationInfo,
        source_index: u32,
    ) -> Self {
        InputPart {
            id,
            debug_name: debug_name.into(),
            shape,
            data_type,
            quantization,
            source_index,
        }
    }
}

impl OutputPart {
    pub fn new(
        id: PartId,
        debug_name: impl Into<String>,
        shape: TensorShape,
        data_type: DataType,
        quantization: QuantizationInfo,
        source_index: u32,
    ) -> Self {
        OutputPart {
            id,
            debug_name: debug_name.into(),
            shape,
            data_type,
            quantization,
            source_index,
        }
    }
}

impl ConstantPart {
    pub fn new(
        id: PartId,
        debug_name: impl Into<String>,
        shape: TensorShape,
        data_type: DataType,
        quantization: QuantizationInfo,
        data: Vec<u8>,
    ) -> Self {
        assert_eq!(data.len() as u64, crate::common::num_elements(&shape));
        ConstantPart {
            id,
            debug_name: debug_name.into(),
            shape,
            data_type,
            quantization,
            data: Arc::new(data),
        }
    }
}

impl PartT for InputPart {
    fn id(&self) -> PartId {
        self.id
    }

    fn debug_name(&self) -> &str {
        &self.debug_name
    }

    fn num_inputs(&self) -> usize {
        0
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
        let mut graph = OpGraph::new();
        let mut buffer = Buffer::dram(
            BufferType::Input,
            BufferFormat::Nhwc,
            self.shape,
            self.data_type,
            self.quantization.clone(),
        )
        .with_tag(format!("{} input", self.debug_name));
        buffer.source_index = Some(self.source_index);
        let buffer = graph.add_buffer(buffer);
        vec![plan_with_slots(graph, self.id, &[], &[buffer])]
    }
}

impl PartT for OutputPart {
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
        0
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
        let mut graph = OpGraph::new();
        let mut buffer = Buffer::dram(
            BufferType::Output,
            BufferFormat::Nhwc,
            self.shape,
            self.data_type,
            self.quantization.clone(),
        )
        .with_tag(format!("{} output", self.debug_name));
        buffer.source_index = Some(self.source_index);
        let buffer = graph.add_buffer(buffer);
        vec![plan_with_slots(graph, self.id, &[buffer], &[])]
    }
}

impl PartT for ConstantPart {
    fn id(&self) -> PartId {
        self.id
    }

    fn debug_name(&self) -> &str {
        &self.debug_name
    }

    fn num_inputs(&self) -> usize {
        0
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
        let mut graph = OpGraph::new();
        let mut buffer = Buffer::dram(
            BufferType::Constant,
            BufferFormat::Nhwc,
            self.shape,
            self.data_type,
            self.quantization.clone(),
        )
        .with_tag(format!("{} constant", self.debug_name));
        buffer.constant_data = Some(Arc::clone(&self.data));
        let buffer = graph.add_buffer(buffer);
        vec![plan_with_slots(graph, self.id, &[], &[buffer])]
    }
}
