//! Lowering a merged op graph to agents.
//!
//! Ops are visited in dependency order, section by section, keeping each
//! glue DMA next to the op it feeds or drains. Each op becomes zero or more
//! agents; a second pass then fills in the dependencies between them.

use log::{debug, info};
use smallvec::{smallvec, SmallVec};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::combiner::MergedGraph;
use crate::command_stream::dependency::{
    kernel_load, ratio_dependency, rule_for, weight_dependency, whole_producer, with_halo,
    RatioInfo, Rule, StripeCounts,
};
use crate::command_stream::{
    Agent, AgentData, AgentDependencyInfo, AgentId, AgentKind, CommandStream, CommandStreamError,
    DramFormat, FilterShape, FmsData, Hwc, MceSData, MceSizes, PleIfmInfo, PleInputMode,
    PleLData, PleSData, ReluActivation, SupertensorCells, Tile, WgtSData, WgtStripes,
    MAX_READ_DEPENDENCIES,
};
use crate::common::TensorShape;
use crate::graph::{
    Buffer, BufferFormat, BufferId, BufferType, Location, MceOperation, Op, OpGraph, OpId,
};
use crate::hardware::HardwareCapabilities;
use crate::lifetime::{BufferManager, DramBufferId, DramBufferKind};
use crate::ple::PleKernelId;
use crate::utils::{
    calculate_rescale_multiplier_and_shift, div_round_up, num_stripes, num_stripes_hwc,
    round_up_to_multiple, total_size_bytes_nhwcb, BRICK_GROUP_CHANNELS, BRICK_GROUP_HEIGHT,
    BRICK_GROUP_WIDTH,
};

/// Where a DRAM buffer of the merged graph lives.
#[derive(Clone, Copy, Debug)]
struct DramRef {
    /// The buffer's own id, or an alias for a concatenation input.
    id: DramBufferId,
    /// Position of the buffer's first element within `supertensor`.
    origin: TensorShape,
    supertensor: TensorShape,
    format: BufferFormat,
}

/// What the dependency pass needs to know about an agent.
#[derive(Clone, Debug)]
struct AgentRecord {
    op: OpId,
    section: usize,
    /// Stripes as seen by agents consuming this one.
    output: StripeCounts,
    /// Stripes as seen by agents this one consumes.
    input: StripeCounts,
    halo: bool,
    ifm_depth_stripes: u32,
    ofm_plane_stripes: u32,
    /// Per-bank SRAM ranges written.
    writes: SmallVec<[(u32, u32); 1]>,
    /// Per-bank SRAM ranges read or written.
    uses: SmallVec<[(u32, u32); 4]>,
    /// DRAM buffer streamed, and whether it is written.
    dram: Option<(DramBufferId, bool)>,
}

struct Generator<'a> {
    merged: &'a MergedGraph,
    caps: &'a HardwareCapabilities,
    buffers: &'a mut BufferManager,
    dram: HashMap<BufferId, DramRef>,
    weight_metadata: HashMap<BufferId, DramBufferId>,
    agents: Vec<Agent>,
    records: Vec<AgentRecord>,
    op_agents: HashMap<OpId, AgentId>,
    /// Loader agent per section and kernel.
    loaders: HashMap<(usize, PleKernelId), AgentId>,
    ple_loader_of: HashMap<OpId, AgentId>,
}

/// Lowers `merged` to a command stream, registering every DRAM buffer it
/// touches with `buffers` and recording their lifetimes.
pub fn generate(
    merged: &MergedGraph,
    caps: &HardwareCapabilities,
    buffers: &mut BufferManager,
) -> Result<CommandStream, CommandStreamError> {
    let mut generator = Generator {
        merged,
        caps,
        buffers,
        dram: HashMap::new(),
        weight_metadata: HashMap::new(),
        agents: vec![],
        records: vec![],
        op_agents: HashMap::new(),
        loaders: HashMap::new(),
        ple_loader_of: HashMap::new(),
    };
    generator.register_dram_buffers();
    for op in agent_order(merged) {
        generator.visit(op);
    }
    generator.add_data_dependencies()?;
    generator.add_overlap_dependencies()?;
    generator.mark_lifetimes();
    info!("Generated {} agents", generator.agents.len());
    Ok(CommandStream {
        agents: generator.agents,
    })
}

/// Ops in issue order: dependency order, then section, then the op a glue
/// DMA serves, then id.
fn agent_order(merged: &MergedGraph) -> Vec<OpId> {
    let graph = &merged.graph;
    let anchor = |op: OpId| -> u32 {
        if merged.op_parts[op.0 as usize].is_some() {
            return op.0;
        }
        let input = graph.buffer(graph.inputs(op)[0]);
        if input.location == Location::Dram {
            graph
                .consumers(graph.output(op))
                .iter()
                .map(|(c, _)| c.0)
                .min()
                .unwrap_or(op.0)
        } else {
            graph.producer(graph.inputs(op)[0]).map_or(op.0, |p| p.0)
        }
    };
    let key = |op: OpId| (merged.op_sections[op.0 as usize], anchor(op), op);

    let mut waiting: Vec<usize> = graph
        .op_ids()
        .map(|o| {
            graph
                .inputs(o)
                .iter()
                .filter(|b| graph.producer(**b).is_some())
                .count()
        })
        .collect();
    let mut ready: BTreeSet<(usize, u32, OpId)> = graph
        .op_ids()
        .filter(|o| waiting[o.0 as usize] == 0)
        .map(key)
        .collect();
    let mut order = Vec::with_capacity(graph.num_ops());
    while let Some((_, _, op)) = ready.pop_first() {
        order.push(op);
        for &(consumer, _) in graph.consumers(graph.output(op)) {
            let w = &mut waiting[consumer.0 as usize];
            *w -= 1;
            if *w == 0 {
                ready.insert(key(consumer));
            }
        }
    }
    assert_eq!(order.len(), graph.num_ops(), "merged graph contains a cycle");
    order
}

/// Byte offset of the element at `origin` in a tensor of shape `supertensor`.
fn offset_in_supertensor(origin: &TensorShape, supertensor: &TensorShape, format: BufferFormat) -> u32 {
    let [_, h0, w0, c0] = *origin;
    match format {
        BufferFormat::Nhwc => (h0 * supertensor[2] + w0) * supertensor[3] + c0,
        _ => {
            let width_groups = div_round_up(supertensor[2], BRICK_GROUP_WIDTH);
            let channel_groups = div_round_up(supertensor[3], BRICK_GROUP_CHANNELS);
            let brick_group_bytes = BRICK_GROUP_HEIGHT * BRICK_GROUP_WIDTH * BRICK_GROUP_CHANNELS;
            ((h0 / BRICK_GROUP_HEIGHT) * width_groups * channel_groups
                + (w0 / BRICK_GROUP_WIDTH) * channel_groups
                + c0 / BRICK_GROUP_CHANNELS)
                * brick_group_bytes
        }
    }
}

fn hwc(shape: &TensorShape) -> Hwc {
    Hwc {
        height: shape[1],
        width: shape[2],
        channels: shape[3],
    }
}

fn counts_hwc(tensor: &TensorShape, stripe: &TensorShape) -> Hwc {
    let [height, width, channels] = num_stripes_hwc(tensor, stripe);
    Hwc {
        height,
        width,
        channels,
    }
}

/// Size of the last stripe in each dimension.
fn edge_stripe(tensor: &TensorShape, stripe: &TensorShape) -> TensorShape {
    let mut edge = *tensor;
    for d in 1..4 {
        let n = num_stripes(tensor[d], stripe[d]).max(1);
        edge[d] = tensor[d] - (n - 1) * stripe[d].min(tensor[d]);
    }
    edge
}

fn rounded_to_brick_group(shape: &TensorShape) -> Hwc {
    Hwc {
        height: round_up_to_multiple(shape[1], BRICK_GROUP_HEIGHT),
        width: round_up_to_multiple(shape[2], BRICK_GROUP_WIDTH),
        channels: round_up_to_multiple(shape[3], BRICK_GROUP_CHANNELS),
    }
}

fn product(h: &Hwc) -> u32 {
    h.height * h.width * h.channels
}

fn overlaps(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

impl<'a> Generator<'a> {
    fn graph(&self) -> &'a OpGraph {
        &self.merged.graph
    }

    fn buffer(&self, id: BufferId) -> &'a Buffer {
        self.merged.graph.buffer(id)
    }

    fn section(&self, op: OpId) -> usize {
        self.merged.op_sections[op.0 as usize]
    }

    /// Gives every DRAM buffer an id, then makes each concatenation input an
    /// alias into its output, outermost concatenation first.
    fn register_dram_buffers(&mut self) {
        let graph = self.graph();
        let concat_inputs: BTreeSet<BufferId> = graph
            .op_ids()
            .filter(|o| matches!(graph.op(*o), Op::Concat { .. }))
            .flat_map(|o| graph.inputs(o).iter().map(|b| graph.resolve(*b)))
            .collect();
        for id in graph.buffer_ids() {
            let buffer = graph.buffer(id);
            if buffer.location != Location::Dram || concat_inputs.contains(&id) {
                continue;
            }
            let dram_id = match buffer.buffer_type {
                Some(BufferType::Constant) => {
                    if let Some(weights) = &buffer.encoded_weights {
                        let metadata = self.buffers.add_dram_constant(
                            DramBufferKind::ConstantControlUnit,
                            Arc::new(weights.metadata_bytes()),
                        );
                        self.weight_metadata.insert(id, metadata);
                        self.buffers
                            .add_dram_constant(DramBufferKind::ConstantDma, Arc::new(weights.data.clone()))
                    } else {
                        let data = buffer
                            .constant_data
                            .clone()
                            .unwrap_or_else(|| panic!("constant {id} has no data"));
                        self.buffers.add_dram_constant(DramBufferKind::ConstantDma, data)
                    }
                }
                Some(BufferType::Input) => self
                    .buffers
                    .add_dram_input(buffer.size_in_bytes, buffer.source_index.unwrap_or_default()),
                Some(BufferType::Output) => {
                    let id = self
                        .buffers
                        .add_dram(DramBufferKind::Intermediate, buffer.size_in_bytes);
                    self.buffers
                        .change_to_output(id, buffer.source_index.unwrap_or_default());
                    id
                }
                Some(BufferType::Intermediate) | None => self
                    .buffers
                    .add_dram(DramBufferKind::Intermediate, buffer.size_in_bytes),
            };
            self.dram.insert(
                id,
                DramRef {
                    id: dram_id,
                    origin: [0; 4],
                    supertensor: buffer.tensor_shape,
                    format: buffer.format,
                },
            );
        }

        let concats: Vec<OpId> = graph
            .topological_ops()
            .into_iter()
            .rev()
            .filter(|o| matches!(graph.op(*o), Op::Concat { .. }))
            .collect();
        for op in concats {
            let Op::Concat { axis } = *graph.op(op) else {
                unreachable!()
            };
            let output = self.dram[&graph.resolve(graph.output(op))];
            let mut origin = output.origin;
            for &input in graph.inputs(op) {
                let buffer = graph.buffer(input);
                let offset = offset_in_supertensor(&origin, &output.supertensor, output.format);
                // Origins are absolute within the outermost supertensor.
                let (target, _) = self.buffers.resolve(output.id);
                let alias = self.buffers.add_alias(target, offset, buffer.size_in_bytes);
                self.dram.insert(
                    graph.resolve(input),
                    DramRef {
                        id: alias,
                        origin,
                        ..output
                    },
                );
                origin[axis] += buffer.tensor_shape[axis];
            }
        }
        debug!("Registered {} DRAM buffers", self.dram.len());
    }

    fn dram_ref(&self, buffer: BufferId) -> DramRef {
        match self.dram.get(&self.merged.graph.resolve(buffer)) {
            Some(r) => *r,
            None => panic!("DRAM buffer {buffer} was never registered"),
        }
    }

    fn tile(&self, id: BufferId) -> Tile {
        let buffer = self.buffer(id);
        let Some(base) = buffer.offset else {
            panic!("SRAM buffer {id} ({}) has no offset", buffer.debug_tag);
        };
        let slot_size = match buffer.format {
            BufferFormat::Weight => div_round_up(
                buffer.size_in_bytes,
                self.caps.num_srams * buffer.num_stripes.max(1),
            ),
            _ => self.caps.bank_bytes(total_size_bytes_nhwcb(&buffer.stripe_shape)),
        };
        Tile {
            base,
            num_slots: buffer.num_stripes,
            slot_size,
        }
    }

    fn kernel_range(&self, offset: u32) -> (u32, u32) {
        (offset, offset + self.caps.ple_kernel_sram_size)
    }

    fn push(&mut self, data: AgentData, record: AgentRecord) -> AgentId {
        let id = self.agents.len() as AgentId;
        self.agents.push(Agent {
            data,
            info: AgentDependencyInfo {
                num_stripes_total: record.output.total,
                ..Default::default()
            },
        });
        self.records.push(record);
        id
    }

    fn visit(&mut self, op: OpId) {
        let graph = self.graph();
        let agent = match graph.op(op) {
            Op::Dma { format } => {
                let input = graph.inputs(op)[0];
                let output = graph.output(op);
                match (self.buffer(input).location, format) {
                    (Location::Dram, BufferFormat::Weight) => Some(self.weight_streamer(op, input, output)),
                    (Location::Dram, _) => Some(self.ifm_streamer(op, input, output)),
                    (Location::Sram, _) => Some(self.ofm_streamer(op, input, output)),
                    (Location::PleInputSram, _) => panic!("cannot DMA out of PLE input SRAM"),
                }
            }
            Op::Mce(_) => Some(self.mce_scheduler(op)),
            Op::Ple(_) => Some(self.ple_scheduler(op)),
            Op::Concat { .. } => None,
            Op::EstimateOnly { reason } => {
                panic!("estimate-only op {op} reached the command stream: {reason}")
            }
        };
        if let Some(agent) = agent {
            self.op_agents.insert(op, agent);
        }
    }

    /// The streamer-side description of the feature map moved between
    /// `dram` and the tile `sram`.
    fn fms_data(&self, dram: BufferId, sram: BufferId) -> FmsData {
        let dram_ref = self.dram_ref(dram);
        let (buffer_id, dram_offset) = self.buffers.resolve(dram_ref.id);
        let sram_buffer = self.buffer(sram);
        let tensor = sram_buffer.tensor_shape;
        let stripe = sram_buffer.stripe_shape;
        let counts = counts_hwc(&tensor, &stripe);
        FmsData {
            buffer_id,
            dram_offset,
            data_type: sram_buffer.data_type,
            format: DramFormat::from(dram_ref.format),
            tile: self.tile(sram),
            default_stripe_size: hwc(&stripe),
            edge_stripe_size: rounded_to_brick_group(&edge_stripe(&tensor, &stripe)),
            supertensor_size_in_cells: SupertensorCells {
                width: div_round_up(dram_ref.supertensor[2], BRICK_GROUP_WIDTH),
                channels: div_round_up(dram_ref.supertensor[3], BRICK_GROUP_CHANNELS),
            },
            num_stripes: counts,
            stripe_id_strides: Hwc {
                height: counts.width * counts.channels,
                width: counts.channels,
                channels: 1,
            },
        }
    }

    fn ifm_streamer(&mut self, op: OpId, dram: BufferId, sram: BufferId) -> AgentId {
        let data = self.fms_data(dram, sram);
        let graph = self.graph();
        let sram_buffer = self.buffer(sram);
        let holds_whole_tensor = sram_buffer.num_stripes >= product(&data.num_stripes);
        // Without the whole input resident, the MCE reloads it for each
        // output depth stripe.
        let num_loads = graph
            .consumers(sram)
            .iter()
            .find_map(|(c, _)| match graph.op(*c) {
                Op::Mce(mce) if mce.operation != MceOperation::DepthwiseConvolution => {
                    let out = self.buffer(graph.output(*c));
                    Some(num_stripes(out.tensor_shape[3], mce.output_stripe[3]))
                }
                _ => None,
            })
            .filter(|_| !holds_whole_tensor)
            .unwrap_or(1);
        let counts = [
            data.num_stripes.height,
            data.num_stripes.width,
            data.num_stripes.channels,
        ];
        let total = product(&data.num_stripes) * num_loads;
        let tile = data.tile.range();
        let record = AgentRecord {
            op,
            section: self.section(op),
            output: StripeCounts::new(counts, total),
            input: StripeCounts::new(counts, total),
            halo: false,
            ifm_depth_stripes: 1,
            ofm_plane_stripes: 1,
            writes: smallvec![tile],
            uses: smallvec![tile],
            dram: Some((self.dram_ref(dram).id, false)),
        };
        self.push(AgentData::IfmStreamer(data), record)
    }

    fn ofm_streamer(&mut self, op: OpId, sram: BufferId, dram: BufferId) -> AgentId {
        let data = self.fms_data(dram, sram);
        let counts = [
            data.num_stripes.height,
            data.num_stripes.width,
            data.num_stripes.channels,
        ];
        let total = product(&data.num_stripes);
        let tile = data.tile.range();
        let record = AgentRecord {
            op,
            section: self.section(op),
            output: StripeCounts::new(counts, total),
            input: StripeCounts::new(counts, total),
            halo: false,
            ifm_depth_stripes: 1,
            ofm_plane_stripes: 1,
            writes: smallvec![],
            uses: smallvec![tile],
            dram: Some((self.dram_ref(dram).id, true)),
        };
        self.push(AgentData::OfmStreamer(data), record)
    }

    fn weight_streamer(&mut self, op: OpId, dram: BufferId, sram: BufferId) -> AgentId {
        let graph = self.graph();
        let weights = self.buffer(sram);
        let depthwise = graph.consumers(sram).iter().any(|(c, _)| {
            matches!(graph.op(*c), Op::Mce(m) if m.operation == MceOperation::DepthwiseConvolution)
        });
        let (ofm_channels, ifm_channels) = if depthwise {
            (num_stripes(weights.tensor_shape[2], weights.stripe_shape[2]), 1)
        } else {
            (
                num_stripes(weights.tensor_shape[3], weights.stripe_shape[3]),
                num_stripes(weights.tensor_shape[2], weights.stripe_shape[2]),
            )
        };
        let ofm_planes = graph
            .consumers(sram)
            .iter()
            .find_map(|(c, _)| match graph.op(*c) {
                Op::Mce(mce) => {
                    let out = self.buffer(graph.output(*c));
                    Some(
                        num_stripes(out.tensor_shape[1], mce.output_stripe[1])
                            * num_stripes(out.tensor_shape[2], mce.output_stripe[2]),
                    )
                }
                _ => None,
            })
            .unwrap_or(1);
        let holds_all = weights.num_stripes >= ofm_channels * ifm_channels;
        let num_loads = if ifm_channels > 1 && !holds_all {
            ofm_planes
        } else {
            1
        };
        let total = ofm_channels * ifm_channels * num_loads;
        let tile = self.tile(sram);
        let dram_ref = self.dram_ref(dram);
        let metadata_buffer_id = match self.weight_metadata.get(&graph.resolve(dram)) {
            Some(id) => *id,
            None => panic!("weights {dram} have no metadata"),
        };
        let data = WgtSData {
            buffer_id: dram_ref.id,
            metadata_buffer_id,
            tile,
            num_stripes: WgtStripes {
                ofm_channels,
                ifm_channels,
            },
            stripe_id_strides: WgtStripes {
                ofm_channels: ifm_channels,
                ifm_channels: 1,
            },
        };
        let record = AgentRecord {
            op,
            section: self.section(op),
            output: StripeCounts::flat(total),
            input: StripeCounts::flat(total),
            halo: false,
            ifm_depth_stripes: 1,
            ofm_plane_stripes: 1,
            writes: smallvec![tile.range()],
            uses: smallvec![tile.range()],
            dram: Some((dram_ref.id, false)),
        };
        self.push(AgentData::WgtStreamer(data), record)
    }

    /// The loader for the kernel of `ple_op`, emitting it unless the kernel is
    /// already loaded in this section.
    fn ensure_loader(&mut self, ple_op: OpId) -> AgentId {
        let graph = self.graph();
        let Op::Ple(ple) = graph.op(ple_op) else {
            panic!("op {ple_op} is not a PLE op");
        };
        let kernel = PleKernelId::new(ple.operation, ple.block_config, ple.data_type);
        let Some(sram_addr) = ple.kernel_offset else {
            panic!("PLE op {ple_op} has no kernel offset");
        };
        let section = self.section(ple_op);
        let loader = match self.loaders.get(&(section, kernel)) {
            Some(id) => *id,
            None => {
                let range = self.kernel_range(sram_addr);
                let record = AgentRecord {
                    op: ple_op,
                    section,
                    output: StripeCounts::flat(1),
                    input: StripeCounts::flat(1),
                    halo: false,
                    ifm_depth_stripes: 1,
                    ofm_plane_stripes: 1,
                    writes: smallvec![range],
                    uses: smallvec![range],
                    dram: None,
                };
                let id = self.push(
                    AgentData::PleLoader(PleLData {
                        ple_kernel_id: kernel,
                        sram_addr,
                    }),
                    record,
                );
                self.loaders.insert((section, kernel), id);
                id
            }
        };
        self.ple_loader_of.insert(ple_op, loader);
        loader
    }

    fn mce_scheduler(&mut self, op: OpId) -> AgentId {
        let graph = self.graph();
        let Op::Mce(mce) = graph.op(op) else {
            unreachable!()
        };
        let inputs = graph.inputs(op);
        assert_eq!(inputs.len(), 2, "MCE op {op} needs an input and weights");
        let (ifm, weights) = (inputs[0], inputs[1]);
        let out = graph.output(op);
        let Some(ple_op) = graph
            .consumers(out)
            .iter()
            .map(|(c, _)| *c)
            .find(|c| matches!(graph.op(*c), Op::Ple(_)))
        else {
            panic!("MCE op {op} does not feed a PLE");
        };
        self.ensure_loader(ple_op);
        let Some(ple_kernel_id) = graph.op(ple_op).ple_kernel_id() else {
            unreachable!()
        };

        let ifm_buffer = self.buffer(ifm);
        let out_tensor = self.buffer(out).tensor_shape;
        let ofm = counts_hwc(&out_tensor, &mce.output_stripe);
        let depthwise = mce.operation == MceOperation::DepthwiseConvolution;
        let ifm_depth = if depthwise {
            1
        } else {
            num_stripes(ifm_buffer.tensor_shape[3], mce.input_stripe[3])
        };
        let sizes = |s: &TensorShape, ifm_c: u32| MceSizes {
            ofm_height: s[1],
            ofm_width: s[2],
            ofm_channels: s[3],
            ifm_channels: ifm_c,
        };
        let ofm_edge = edge_stripe(&out_tensor, &mce.output_stripe);
        let ifm_edge = edge_stripe(&ifm_buffer.tensor_shape, &mce.input_stripe);
        let num_stripes = MceSizes {
            ofm_height: ofm.height,
            ofm_width: ofm.width,
            ofm_channels: ofm.channels,
            ifm_channels: ifm_depth,
        };
        let weights_shape = self.buffer(weights).tensor_shape;
        let split = ifm_buffer.split_dims();
        let halo = (weights_shape[0] > 1 && split[0]) || (weights_shape[1] > 1 && split[1]);
        let ifm_tile = self.tile(ifm);
        let wgt_tile = self.tile(weights);
        let data = MceSData {
            ifm_tile,
            wgt_tile,
            block_size: mce.block_config,
            default_stripe_size: sizes(&mce.output_stripe, mce.input_stripe[3]),
            edge_stripe_size: sizes(&ofm_edge, ifm_edge[3]),
            num_stripes,
            stripe_id_strides: MceSizes {
                ofm_height: ifm_depth * ofm.width,
                ofm_width: ifm_depth,
                ofm_channels: ifm_depth * ofm.width * ofm.height,
                ifm_channels: 1,
            },
            conv_stride: mce.stride,
            ifm_zero_point: ifm_buffer.quantization.zero_point,
            operation: mce.operation,
            filter_shape: FilterShape {
                height: weights_shape[0],
                width: weights_shape[1],
            },
            padding: mce.padding,
            upscale_factor: mce.upscale_factor,
            relu_activation: ReluActivation {
                min: mce.lower_bound,
                max: mce.upper_bound,
            },
            ple_kernel_id,
        };
        let total = product(&ofm) * ifm_depth;
        let record = AgentRecord {
            op,
            section: self.section(op),
            output: StripeCounts::new([ofm.height, ofm.width, ofm.channels], total),
            input: StripeCounts::new([ofm.height, ofm.width, ifm_depth], total),
            halo,
            ifm_depth_stripes: ifm_depth,
            ofm_plane_stripes: ofm.height * ofm.width,
            writes: smallvec![],
            uses: smallvec![ifm_tile.range(), wgt_tile.range()],
            dram: None,
        };
        self.push(AgentData::MceScheduler(data), record)
    }

    fn ple_ifm_info(&self, input: &Buffer, output: &Buffer) -> PleIfmInfo {
        let (multiplier, shift) = calculate_rescale_multiplier_and_shift(
            f64::from(input.quantization.scale) / f64::from(output.quantization.scale),
        );
        PleIfmInfo {
            zero_point: input.quantization.zero_point,
            multiplier,
            shift,
        }
    }

    fn ple_scheduler(&mut self, op: OpId) -> AgentId {
        let graph = self.graph();
        let Op::Ple(ple) = graph.op(op) else {
            unreachable!()
        };
        let inputs = graph.inputs(op);
        assert_eq!(
            inputs.len(),
            ple.operation.num_inputs(),
            "PLE op {op} ({}) has the wrong number of inputs",
            ple.operation
        );
        let from_mce = self.buffer(inputs[0]).location == Location::PleInputSram;
        if !from_mce {
            self.ensure_loader(op);
        }
        let Some(ple_kernel_sram_addr) = ple.kernel_offset else {
            panic!("PLE op {op} has no kernel offset");
        };
        let out = graph.output(op);
        let out_buffer = self.buffer(out);
        let counts = counts_hwc(&out_buffer.tensor_shape, &ple.output_stripe);
        let input_mode = if !from_mce {
            PleInputMode::Sram
        } else if ple.input_stripes[0][3] < self.caps.number_of_ogs() {
            PleInputMode::MceOneOg
        } else {
            PleInputMode::MceAllOgs
        };
        let sram_tile = |b: BufferId| (self.buffer(b).location == Location::Sram).then(|| self.tile(b));
        let ofm_tile = self.tile(out);
        let ifm_tile0 = sram_tile(inputs[0]);
        let ifm_tile1 = inputs.get(1).and_then(|b| sram_tile(*b));
        let data = PleSData {
            ofm_tile,
            ofm_zero_point: out_buffer.quantization.zero_point,
            default_stripe_size: hwc(&ple.output_stripe),
            edge_stripe_size: hwc(&edge_stripe(&out_buffer.tensor_shape, &ple.output_stripe)),
            num_stripes: counts,
            stripe_id_strides: Hwc {
                height: counts.width,
                width: 1,
                channels: counts.width * counts.height,
            },
            input_mode,
            ple_kernel_id: PleKernelId::new(ple.operation, ple.block_config, ple.data_type),
            ple_kernel_sram_addr,
            ifm_tile0,
            ifm_info0: self.ple_ifm_info(self.buffer(inputs[0]), out_buffer),
            ifm_tile1,
            ifm_info1: inputs
                .get(1)
                .map(|b| self.ple_ifm_info(self.buffer(*b), out_buffer)),
        };
        let axes = [counts.height, counts.width, counts.channels];
        let total = product(&counts);
        let mut uses: SmallVec<[(u32, u32); 4]> = smallvec![ofm_tile.range()];
        uses.extend(ifm_tile0.iter().chain(&ifm_tile1).map(Tile::range));
        uses.push(self.kernel_range(ple_kernel_sram_addr));
        let record = AgentRecord {
            op,
            section: self.section(op),
            output: StripeCounts::new(axes, total),
            input: StripeCounts::new(axes, total),
            halo: false,
            ifm_depth_stripes: 1,
            ofm_plane_stripes: 1,
            writes: smallvec![ofm_tile.range()],
            uses,
            dram: None,
        };
        self.push(AgentData::PleScheduler(data), record)
    }

    /// Agents that write `buffer`, looking through concatenations.
    fn producer_agents(&self, buffer: BufferId) -> SmallVec<[AgentId; 2]> {
        let graph = self.graph();
        let Some(producer) = graph.producer(buffer) else {
            return smallvec![];
        };
        match graph.op(producer) {
            Op::Concat { .. } => graph
                .inputs(producer)
                .iter()
                .flat_map(|b| self.producer_agents(*b))
                .collect(),
            _ => match self.op_agents.get(&producer) {
                Some(a) => smallvec![*a],
                None => panic!("op {producer} has no agent"),
            },
        }
    }

    /// The agent a reader of `buffer` waits on, and whether it waits for
    /// the whole of it. Concatenated buffers are written by several
    /// OfmStreamers, which finish in issue order, so waiting for the last one
    /// covers them all.
    fn input_producer(&self, buffer: BufferId) -> Option<(AgentId, bool)> {
        let producers = self.producer_agents(buffer);
        let last = producers.iter().max().copied()?;
        Some((last, producers.len() > 1))
    }

    fn relative_id(&self, producer: AgentId, consumer: AgentId) -> Result<u8, CommandStreamError> {
        let distance = consumer - producer;
        let max = self.caps.max_relative_agent_id;
        match u8::try_from(distance) {
            Ok(d) if distance <= max => Ok(d),
            _ => Err(CommandStreamError::DependencyTooFar {
                consumer,
                producer,
                distance,
                max,
            }),
        }
    }

    fn add_read(&mut self, consumer: AgentId, producer: AgentId, info: &RatioInfo) -> Result<(), CommandStreamError> {
        let dep = info.with_id(self.relative_id(producer, consumer)?);
        let read = &mut self.agents[consumer as usize].info.read;
        if read.len() >= MAX_READ_DEPENDENCIES {
            return Err(CommandStreamError::TooManyReadDependencies {
                agent: consumer,
                max: MAX_READ_DEPENDENCIES,
            });
        }
        read.push(dep);
        Ok(())
    }

    fn ratio_info(&self, producer: AgentId, consumer: AgentId, rule: Rule) -> RatioInfo {
        let p = &self.records[producer as usize];
        let c = &self.records[consumer as usize];
        match rule {
            Rule::Axes => ratio_dependency(&p.output, &c.input),
            Rule::MceInput => with_halo(ratio_dependency(&p.output, &c.input), c.halo),
            Rule::Weights => {
                weight_dependency(
                    p.output.total,
                    c.input.total,
                    c.ifm_depth_stripes,
                    c.ofm_plane_stripes,
                )
                .0
            }
            Rule::MceToPle => {
                let mut info = ratio_dependency(&p.output, &c.input);
                info.inner.other *= p.ifm_depth_stripes;
                info
            }
            Rule::WholeProducer => whole_producer(p.output.total, c.input.total),
            Rule::KernelLoad => kernel_load(c.input.total),
        }
    }

    /// Read, write and schedule dependencies along every data edge.
    fn add_data_dependencies(&mut self) -> Result<(), CommandStreamError> {
        let graph = self.graph();
        for consumer in 0..self.agents.len() as AgentId {
            let kind = self.agents[consumer as usize].kind();
            let op = self.records[consumer as usize].op;
            // (producer, location of the data, whether to wait for all of it)
            let mut edges: SmallVec<[(AgentId, Location, bool); 4]> = smallvec![];
            let inputs: &[BufferId] = match kind {
                AgentKind::PleLoader => &[],
                AgentKind::OfmStreamer | AgentKind::IfmStreamer | AgentKind::WgtStreamer => &graph.inputs(op)[..1],
                AgentKind::MceScheduler | AgentKind::PleScheduler => graph.inputs(op),
            };
            if kind == AgentKind::PleScheduler {
                if let Some(loader) = self.ple_loader_of.get(&op) {
                    edges.push((*loader, Location::Sram, false));
                }
            }
            for &input in inputs {
                let location = self.buffer(input).location;
                if let Some((producer, whole)) = self.input_producer(input) {
                    edges.push((producer, location, whole));
                }
            }
            for (producer, location, whole) in edges {
                let producer_kind = self.agents[producer as usize].kind();
                let rule = match rule_for(producer_kind, kind) {
                    Some(_) if whole => Rule::WholeProducer,
                    Some(rule) => rule,
                    None => panic!(
                        "no dependency rule from {} to {}",
                        producer_kind.name(),
                        kind.name()
                    ),
                };
                let info = self.ratio_info(producer, consumer, rule);
                self.add_read(consumer, producer, &info)?;
                let reverse = info.with_id(self.relative_id(producer, consumer)?).flipped();
                let producer_info = &mut self.agents[producer as usize].info;
                producer_info.schedule.get_or_insert(reverse);
                let single_stripe_mce = producer_kind == AgentKind::PleScheduler
                    && kind == AgentKind::MceScheduler
                    && self.records[consumer as usize].input.total == 1;
                if location == Location::Sram && rule != Rule::KernelLoad && !single_stripe_mce {
                    producer_info.write = Some(reverse);
                }
            }
        }
        Ok(())
    }

    /// Makes each agent that writes SRAM wait for the last agent of an
    /// earlier section that used the same bytes.
    fn add_overlap_dependencies(&mut self) -> Result<(), CommandStreamError> {
        for consumer in 0..self.records.len() {
            let record = &self.records[consumer];
            if record.writes.is_empty() {
                continue;
            }
            let earlier = (0..consumer).rev().find(|&a| {
                let other = &self.records[a];
                other.section < record.section
                    && other
                        .uses
                        .iter()
                        .any(|u| record.writes.iter().any(|w| overlaps(*u, *w)))
            });
            let Some(earlier) = earlier else {
                continue;
            };
            let (consumer, earlier) = (consumer as AgentId, earlier as AgentId);
            let relative = self.relative_id(earlier, consumer)?;
            let already = self.agents[consumer as usize]
                .info
                .read
                .iter()
                .any(|d| d.relative_agent_id == relative);
            if !already {
                let info = whole_producer(
                    self.records[earlier as usize].output.total,
                    self.records[consumer as usize].input.total,
                );
                self.add_read(consumer, earlier, &info)?;
            }
        }
        Ok(())
    }

    /// Records when each DRAM buffer is first and last touched.
    fn mark_lifetimes(&mut self) {
        let metadata_of: HashMap<DramBufferId, DramBufferId> = self
            .weight_metadata
            .iter()
            .map(|(b, m)| (self.dram[b].id, *m))
            .collect();
        let mut spans: BTreeMap<DramBufferId, (u32, u32)> = BTreeMap::new();
        let mut read: BTreeSet<DramBufferId> = BTreeSet::new();
        for (agent, record) in self.records.iter().enumerate() {
            let Some((id, writes)) = record.dram else {
                continue;
            };
            let agent = agent as u32;
            for id in std::iter::once(id).chain(metadata_of.get(&id).copied()) {
                let span = spans.entry(id).or_insert((agent, agent));
                span.0 = span.0.min(agent);
                span.1 = span.1.max(agent);
            }
            if !writes {
                read.insert(self.buffers.resolve(id).0);
            }
        }
        for (id, (first, last)) in spans {
            self.buffers.mark_buffer_used_at_time(id, first, last + 1);
            let target = self.buffers.buffer(id);
            assert!(
                target.kind != DramBufferKind::Intermediate || read.contains(&target.id),
                "DRAM buffer {} is written but never read",
                target.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_stream::PleLData;
    use crate::common::{BlockConfig, DataType};
    use crate::ple::PleOperation;

    fn empty_merged() -> MergedGraph {
        MergedGraph {
            graph: OpGraph::new(),
            op_sections: vec![],
            op_parts: vec![],
        }
    }

    /// A generator holding `count` kernel loaders, for exercising the
    /// dependency bookkeeping on its own.
    fn with_loaders<'a>(
        merged: &'a MergedGraph,
        caps: &'a HardwareCapabilities,
        buffers: &'a mut BufferManager,
        count: u32,
    ) -> Generator<'a> {
        let mut generator = Generator {
            merged,
            caps,
            buffers,
            dram: HashMap::new(),
            weight_metadata: HashMap::new(),
            agents: vec![],
            records: vec![],
            op_agents: HashMap::new(),
            loaders: HashMap::new(),
            ple_loader_of: HashMap::new(),
        };
        let counts = StripeCounts::new([1, 1, 1], 1);
        for _ in 0..count {
            generator.push(
                AgentData::PleLoader(PleLData {
                    ple_kernel_id: PleKernelId::new(
                        PleOperation::Passthrough,
                        BlockConfig::new(16, 16),
                        DataType::U8,
                    ),
                    sram_addr: 0,
                }),
                AgentRecord {
                    op: OpId(0),
                    section: 0,
                    output: counts,
                    input: counts,
                    halo: false,
                    ifm_depth_stripes: 1,
                    ofm_plane_stripes: 1,
                    writes: smallvec![],
                    uses: smallvec![],
                    dram: None,
                },
            );
        }
        generator
    }

    #[test]
    fn test_dependency_distance_is_bounded() {
        let merged = empty_merged();
        let caps = HardwareCapabilities::default();
        let mut buffers = BufferManager::new();
        let mut generator = with_loaders(&merged, &caps, &mut buffers, 300);
        let info = whole_producer(1, 1);
        generator.add_read(256, 1, &info).unwrap();
        assert_eq!(generator.agents[256].info.read[0].relative_agent_id, 255);
        match generator.add_read(257, 1, &info) {
            Err(CommandStreamError::DependencyTooFar {
                consumer: 257,
                producer: 1,
                distance: 256,
                max: 255,
            }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(generator.agents[257].info.read.is_empty());
    }

    #[test]
    fn test_read_dependencies_are_bounded() {
        let merged = empty_merged();
        let caps = HardwareCapabilities::default();
        let mut buffers = BufferManager::new();
        let consumer = MAX_READ_DEPENDENCIES as AgentId + 1;
        let mut generator = with_loaders(&merged, &caps, &mut buffers, consumer + 1);
        let info = whole_producer(1, 1);
        for producer in 0..MAX_READ_DEPENDENCIES as AgentId {
            generator.add_read(consumer, producer, &info).unwrap();
        }
        assert_eq!(generator.agents[consumer as usize].info.read.len(), MAX_READ_DEPENDENCIES);
        assert!(matches!(
            generator.add_read(consumer, MAX_READ_DEPENDENCIES as AgentId, &info),
            Err(CommandStreamError::TooManyReadDependencies { agent, max })
                if agent == consumer && max == MAX_READ_DEPENDENCIES
        ));
    }

    #[test]
    fn test_nhwcb_supertensor_offsets() {
        let st = [1, 16, 24, 48];
        let f = BufferFormat::Nhwcb;
        assert_eq!(offset_in_supertensor(&[0, 0, 0, 0], &st, f), 0);
        assert_eq!(offset_in_supertensor(&[0, 0, 0, 16], &st, f), 1024);
        assert_eq!(offset_in_supertensor(&[0, 0, 8, 0], &st, f), 3 * 1024);
        assert_eq!(offset_in_supertensor(&[0, 8, 0, 0], &st, f), 9 * 1024);
    }

    #[test]
    fn test_nhwc_supertensor_offsets() {
        let st = [1, 4, 5, 6];
        assert_eq!(offset_in_supertensor(&[0, 0, 0, 3], &st, BufferFormat::Nhwc), 3);
        assert_eq!(offset_in_supertensor(&[0, 2, 1, 0], &st, BufferFormat::Nhwc), 66);
    }

    #[test]
    fn test_edge_stripes() {
        assert_eq!(edge_stripe(&[1, 20, 16, 40], &[1, 8, 16, 16]), [1, 4, 16, 8]);
        assert_eq!(edge_stripe(&[1, 5, 5, 3], &[1, 8, 8, 16]), [1, 5, 5, 3]);
        assert_eq!(
            rounded_to_brick_group(&[1, 4, 16, 8]),
            Hwc {
                height: 8,
                width: 16,
                channels: 16
            }
        );
    }
}
