//! Choosing one plan per part.
//!
//! Parts are grouped into chains along which data may stay in SRAM. Each
//! chain is cut into sections by dynamic programming over the chain: the
//! best way to cover parts `i..` is the cheapest section starting at `i`
//! followed by the best way to cover what remains. A section of one part uses
//! a Lonely plan; longer sections are found by a depth-first search over
//! Beginning, Middle and End plans, each continuing the SRAM buffer of the one
//! before it.

use log::{debug, info};
use smallvec::{smallvec, SmallVec};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::common::{num_elements, BlockConfig, TensorShape};
use crate::compiler::CompileError;
use crate::graph::{Buffer, BufferFormat, BufferId, Location, MceOperation, Op, OpId, TraversalOrder};
use crate::hardware::CompilationOptions;
use crate::part::{GraphOfParts, PartT, PlanContext};
use crate::plan::{CascadeType, PartId, PartInputSlot, PartOutputSlot, Plan};
use crate::ple::PleKernelId;
use crate::sram::{AllocationPreference, SramAllocator};

pub mod combination;

pub use combination::{Combination, Elem, Glue, MergedGraph, PlanCost};

/// The properties of a buffer plans are generated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct BufferKey {
    location: Location,
    format: BufferFormat,
    order: TraversalOrder,
    tensor_shape: TensorShape,
    stripe_shape: TensorShape,
    num_stripes: u32,
    size_in_bytes: u32,
}

type PlanKey = (PartId, CascadeType, Option<BlockConfig>, Option<BufferKey>);

/// A partial section as far as its completions can tell: the part reached,
/// what it hands on, and the SRAM left for the rest.
type PrefixKey = (
    usize,
    BufferKey,
    Option<BlockConfig>,
    SramAllocator,
    SmallVec<[(PleKernelId, u32); 4]>,
);

/// SRAM state threaded through a section. Copied, never shared, so that
/// abandoning a branch of the search abandons its allocations too.
#[derive(Clone, Debug)]
struct SectionState {
    allocator: SramAllocator,
    kernels: SmallVec<[(PleKernelId, u32); 4]>,
    cost: PlanCost,
}

#[derive(Clone, Debug)]
struct PathStep {
    part_id: PartId,
    cascade_type: CascadeType,
    plans: Arc<Vec<Plan>>,
    index: usize,
    buffer_offsets: SmallVec<[(BufferId, u32); 4]>,
    kernel_offsets: SmallVec<[(OpId, u32); 2]>,
}

#[derive(Clone, Debug)]
struct SectionCandidate {
    cost: PlanCost,
    steps: Vec<PathStep>,
}

/// Search bookkeeping for sections starting at one chain index.
struct SectionSearch<'c> {
    chain: &'c [PartId],
    end: usize,
    best: BTreeMap<usize, SectionCandidate>,
    /// Cheapest cost seen for each prefix.
    seen: HashMap<PrefixKey, PlanCost>,
}

pub struct Combiner<'a> {
    graph: &'a GraphOfParts,
    ctx: &'a PlanContext<'a>,
    options: &'a CompilationOptions,
    plan_cache: HashMap<PlanKey, Arc<Vec<Plan>>>,
}

impl From<&Buffer> for BufferKey {
    fn from(b: &Buffer) -> Self {
        BufferKey {
            location: b.location,
            format: b.format,
            order: b.order,
            tensor_shape: b.tensor_shape,
            stripe_shape: b.stripe_shape,
            num_stripes: b.num_stripes,
            size_in_bytes: b.size_in_bytes,
        }
    }
}

impl PathStep {
    fn plan(&self) -> &Plan {
        &self.plans[self.index]
    }

    /// The plan with its SRAM offsets filled in.
    fn into_placed(self) -> (PartId, CascadeType, Plan) {
        let mut plan = self.plans[self.index].clone();
        for (buffer, offset) in self.buffer_offsets {
            plan.graph.buffer_mut(buffer).offset = Some(offset);
        }
        for (op, offset) in self.kernel_offsets {
            if let Op::Ple(ple) = plan.graph.op_mut(op) {
                ple.kernel_offset = Some(offset);
            }
        }
        (self.part_id, self.cascade_type, plan)
    }
}

impl SectionState {
    fn new(capacity: u32) -> Self {
        SectionState {
            allocator: SramAllocator::new(capacity),
            kernels: smallvec![],
            cost: PlanCost::default(),
        }
    }
}

impl SectionSearch<'_> {
    fn record(&mut self, idx: usize, cost: PlanCost, path: &[PathStep]) {
        let better = match self.best.get(&idx) {
            Some(existing) => cost < existing.cost,
            None => true,
        };
        if better {
            self.best.insert(
                idx,
                SectionCandidate {
                    cost,
                    steps: path.to_vec(),
                },
            );
        }
    }

    /// Whether a path reaching `idx` with `key` in `state` is worth
    /// extending. A prefix is dropped only for one that costs no more and
    /// leaves SRAM exactly as it finds it, so every completion of the dropped
    /// prefix is also a completion of the kept one.
    fn should_extend(&mut self, idx: usize, key: BufferKey, block: Option<BlockConfig>, state: &SectionState) -> bool {
        let prefix = (idx, key, block, state.allocator.clone(), state.kernels.clone());
        match self.seen.get(&prefix) {
            Some(seen) if *seen <= state.cost => false,
            _ => {
                self.seen.insert(prefix, state.cost);
                true
            }
        }
    }
}

/// Whether `consumer` can read the buffer `producer` writes without glue.
pub fn is_directly_cascadable(
    producer: &Plan,
    output: BufferId,
    consumer: &Plan,
    input: BufferId,
) -> bool {
    let a = producer.graph.buffer(output);
    let b = consumer.graph.buffer(input);
    let same_shape = a.tensor_shape == b.tensor_shape
        || (a.format == BufferFormat::Nhwc
            && b.format == BufferFormat::Nhwc
            && num_elements(&a.tensor_shape) == num_elements(&b.tensor_shape));
    if !same_shape
        || a.location != b.location
        || a.format != b.format
        || a.stripe_shape != b.stripe_shape
        || a.order != b.order
        || a.size_in_bytes != b.size_in_bytes
        || a.num_stripes != b.num_stripes
        || a.split_dims() != b.split_dims()
    {
        return false;
    }
    if a.location == Location::PleInputSram && producer.block_config() != consumer.block_config() {
        return false;
    }
    let needs_all_channels = consumer.graph.consumers(input).iter().any(|(op, _)| {
        matches!(
            consumer.graph.op(*op),
            Op::Mce(m) if matches!(m.operation, MceOperation::Convolution | MceOperation::FullyConnected)
        )
    });
    !(a.location == Location::Sram && needs_all_channels && a.stripe_shape[3] < a.tensor_shape[3])
}

/// The cost a plan adds at `cascade_type`: its own weight traffic, the DMAs
/// across the section's boundary, and its stripes.
fn step_cost(plan: &Plan, cascade_type: CascadeType) -> PlanCost {
    let mut dram_bytes = plan.dram_traffic();
    if matches!(cascade_type, CascadeType::Beginning | CascadeType::Lonely) {
        dram_bytes += plan
            .input_mappings
            .keys()
            .map(|b| plan.boundary_traffic(*b))
            .sum::<u64>();
    }
    if cascade_type.ends_section() {
        dram_bytes += plan
            .output_mappings
            .keys()
            .map(|b| plan.boundary_traffic(*b))
            .sum::<u64>();
    }
    PlanCost::new(dram_bytes, plan.compute_stripes())
}

impl<'a> Combiner<'a> {
    pub fn new(graph: &'a GraphOfParts, ctx: &'a PlanContext<'a>, options: &'a CompilationOptions) -> Self {
        Combiner {
            graph,
            ctx,
            options,
            plan_cache: HashMap::new(),
        }
    }

    /// Finds the cheapest combination, or the first part no section covers.
    pub fn find_best_combination(&mut self) -> Result<Combination, CompileError> {
        let chains = self.chains();
        info!(
            "Combining {} parts in {} chains",
            self.graph.len(),
            chains.len()
        );
        let mut sections = vec![];
        let mut total = PlanCost::default();
        for chain in &chains {
            let (cost, chain_sections) = self.solve_chain(chain)?;
            total = total + cost;
            sections.extend(chain_sections);
        }
        info!(
            "Chose {} sections, {} DRAM bytes, {} stripes",
            sections.len(),
            total.dram_bytes,
            total.stripes
        );
        let sections = sections
            .into_iter()
            .map(|steps: Vec<PathStep>| steps.into_iter().map(PathStep::into_placed).collect())
            .collect();
        Ok(Combination::new(self.graph, sections, total, self.options))
    }

    /// The part a section could continue into from `part_id`, if any.
    fn cascade_successor(&self, part_id: PartId) -> Option<PartId> {
        let part = self.graph.part(part_id);
        if !part.can_cascade() || part.num_outputs() != 1 {
            return None;
        }
        let consumers = self.graph.consumers(PartOutputSlot { part_id, index: 0 });
        let [PartInputSlot {
            part_id: next,
            index: 0,
        }] = consumers[..]
        else {
            return None;
        };
        let next_part = self.graph.part(next);
        (next_part.can_cascade() && next_part.num_inputs() == 1).then_some(next)
    }

    /// Maximal chains of cascadable links, ordered by their first part.
    fn chains(&self) -> Vec<Vec<PartId>> {
        let order = self.graph.topological_order();
        let successors: BTreeMap<PartId, PartId> = order
            .iter()
            .filter_map(|&p| self.cascade_successor(p).map(|n| (p, n)))
            .collect();
        let has_predecessor: BTreeSet<PartId> = successors.values().copied().collect();
        order
            .iter()
            .filter(|p| !has_predecessor.contains(p))
            .map(|&head| {
                let mut chain = vec![head];
                let mut current = head;
                while let Some(&next) = successors.get(&current) {
                    chain.push(next);
                    current = next;
                }
                chain
            })
            .collect()
    }

    fn plans(
        &mut self,
        part_id: PartId,
        cascade_type: CascadeType,
        block_config: Option<BlockConfig>,
        prev_buffer: Option<&Buffer>,
    ) -> Arc<Vec<Plan>> {
        let key = (part_id, cascade_type, block_config, prev_buffer.map(BufferKey::from));
        if let Some(plans) = self.plan_cache.get(&key) {
            return Arc::clone(plans);
        }
        let plans = Arc::new(self.graph.part(part_id).get_plans(
            self.ctx,
            cascade_type,
            block_config,
            prev_buffer,
        ));
        self.plan_cache.insert(key, Arc::clone(&plans));
        plans
    }

    /// Best way to cover `chain`, as its cost and sections.
    fn solve_chain(&mut self, chain: &[PartId]) -> Result<(PlanCost, Vec<Vec<PathStep>>), CompileError> {
        let n = chain.len();
        let mut best: Vec<Option<(PlanCost, Vec<Vec<PathStep>>)>> = vec![None; n + 1];
        best[n] = Some((PlanCost::default(), vec![]));
        for i in (0..n).rev() {
            let mut candidates = self.cascaded_sections(chain, i);
            if let Some(lonely) = self.lonely_section(chain[i]) {
                candidates.insert(i, lonely);
            }
            for (j, section) in candidates {
                let Some((rest_cost, rest)) = &best[j + 1] else {
                    continue;
                };
                let cost = section.cost + *rest_cost;
                if best[i].as_ref().map_or(true, |(c, _)| cost < *c) {
                    let mut sections = vec![section.steps];
                    sections.extend(rest.iter().cloned());
                    best[i] = Some((cost, sections));
                }
            }
        }
        if let Some(found) = best[0].take() {
            return Ok(found);
        }
        let culprit = chain[(0..n).rev().find(|&i| best[i].is_none()).unwrap_or(0)];
        let part = self.graph.part(culprit);
        Err(CompileError::NoCombination {
            part: culprit,
            name: part.debug_name().to_string(),
            reason: self.infeasibility_reason(culprit),
        })
    }

    fn infeasibility_reason(&mut self, part_id: PartId) -> String {
        if self.plans(part_id, CascadeType::Lonely, None, None).is_empty() {
            "tensor too large for configuration: no plan fits in SRAM".to_string()
        } else {
            "no plan fits in SRAM together with its neighbours".to_string()
        }
    }

    /// The cheapest Lonely plan of `part_id` that can be placed in SRAM.
    fn lonely_section(&mut self, part_id: PartId) -> Option<SectionCandidate> {
        let plans = self.plans(part_id, CascadeType::Lonely, None, None);
        let capacity = self.ctx.capabilities.sram_bank_size();
        let mut best: Option<SectionCandidate> = None;
        for index in 0..plans.len() {
            let state = SectionState::new(capacity);
            let Some((state, step)) =
                self.place(part_id, CascadeType::Lonely, &plans, index, false, state)
            else {
                continue;
            };
            if best.as_ref().map_or(true, |b| state.cost < b.cost) {
                best = Some(SectionCandidate {
                    cost: state.cost,
                    steps: vec![step],
                });
            }
        }
        best
    }

    /// Cheapest multi-part sections starting at `chain[start]`, keyed by the
    /// index of their last part.
    fn cascaded_sections(&mut self, chain: &[PartId], start: usize) -> BTreeMap<usize, SectionCandidate> {
        if start + 1 >= chain.len() {
            return BTreeMap::new();
        }
        let max_len = self.options.max_section_length.unwrap_or(usize::MAX).max(1);
        let mut search = SectionSearch {
            chain,
            end: chain.len().min(start.saturating_add(max_len)),
            best: BTreeMap::new(),
            seen: HashMap::new(),
        };
        let state = SectionState::new(self.ctx.capabilities.sram_bank_size());
        self.explore(&mut search, start, state, &mut vec![]);
        debug!(
            "Sections from {}: ends at {:?}",
            chain[start],
            search.best.keys().map(|&j| chain[j]).collect::<Vec<_>>()
        );
        search.best
    }

    fn explore(&mut self, search: &mut SectionSearch, idx: usize, state: SectionState, path: &mut Vec<PathStep>) {
        if idx >= search.end {
            return;
        }
        let part_id = search.chain[idx];
        let prev = path.last().map(|step| {
            let plan = step.plan();
            let out = plan
                .output_buffer(0)
                .unwrap_or_else(|| panic!("part {} plan has no output", step.part_id));
            (Arc::clone(&step.plans), step.index, out, plan.graph.buffer(out).clone(), plan.block_config())
        });
        let cascade_types: SmallVec<[CascadeType; 2]> = match prev {
            None => smallvec![CascadeType::Beginning],
            Some(_) if idx + 1 < search.end => smallvec![CascadeType::End, CascadeType::Middle],
            Some(_) => smallvec![CascadeType::End],
        };

        for cascade_type in cascade_types {
            let (block_config, prev_buffer) = match &prev {
                Some((_, _, _, buffer, block)) => (*block, Some(buffer)),
                None => (None, None),
            };
            let plans = self.plans(part_id, cascade_type, block_config, prev_buffer);
            for index in 0..plans.len() {
                let plan = &plans[index];
                if let Some((prev_plans, prev_index, out, _, _)) = &prev {
                    let Some(input) = plan.input_buffer(0) else {
                        continue;
                    };
                    if !is_directly_cascadable(&prev_plans[*prev_index], *out, plan, input) {
                        continue;
                    }
                }
                let Some((next, step)) =
                    self.place(part_id, cascade_type, &plans, index, prev.is_some(), state.clone())
                else {
                    continue;
                };
                let out_key = plan
                    .output_buffer(0)
                    .map(|b| BufferKey::from(plan.graph.buffer(b)));
                let block = plan.block_config();
                path.push(step);
                match cascade_type {
                    CascadeType::End => search.record(idx, next.cost, path),
                    _ => {
                        if let Some(key) = out_key {
                            if search.should_extend(idx, key, block, &next) {
                                self.explore(search, idx + 1, next, path);
                            }
                        }
                    }
                }
                path.pop();
            }
        }
    }

    /// Allocates the SRAM `plans[index]` needs on top of `state`. Inputs
    /// continuing the previous plan's output are already placed.
    fn place(
        &self,
        part_id: PartId,
        cascade_type: CascadeType,
        plans: &Arc<Vec<Plan>>,
        index: usize,
        continuing: bool,
        mut state: SectionState,
    ) -> Option<(SectionState, PathStep)> {
        let caps = self.ctx.capabilities;
        let plan = &plans[index];
        let mut buffer_offsets = smallvec![];
        for buffer in plan.sram_buffers(continuing) {
            let size = caps.bank_bytes(plan.graph.buffer(buffer).size_in_bytes);
            let (allocator, offset) = state.allocator.allocate(size, AllocationPreference::Start)?;
            state.allocator = allocator;
            buffer_offsets.push((buffer, offset));
        }
        let mut kernel_offsets = smallvec![];
        for (op, kernel) in plan.ple_kernels() {
            let offset = match state.kernels.iter().find(|(k, _)| *k == kernel) {
                Some((_, offset)) => *offset,
                None => {
                    let (allocator, offset) = state
                        .allocator
                        .allocate(caps.ple_kernel_sram_size, AllocationPreference::End)?;
                    state.allocator = allocator;
                    state.kernels.push((kernel, offset));
                    offset
                }
            };
            kernel_offsets.push((op, offset));
        }
        state.cost = state.cost + step_cost(plan, cascade_type);
        Some((
            state,
            PathStep {
                part_id,
                cascade_type,
                plans: Arc::clone(plans),
                index,
                buffer_offsets,
                kernel_offsets,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DataType, QuantizationInfo};
    use crate::hardware::HardwareCapabilities;
    use crate::part::io::{InputPart, OutputPart};
    use crate::part::tests::{identity_conv, io_chain};
    use crate::ple::PleOperation;
    use crate::stripe_config::PlanPriority;
    use crate::weights::WeightEncoder;

    fn combine(graph: &GraphOfParts, caps: &HardwareCapabilities) -> Result<Combination, CompileError> {
        let encoder = WeightEncoder::new();
        let ctx = PlanContext {
            capabilities: caps,
            stripe_configs: None,
            priority: PlanPriority::High,
            weight_encoder: &encoder,
        };
        let options = CompilationOptions::default();
        Combiner::new(graph, &ctx, &options).find_best_combination()
    }

    fn conv_chain(len: usize, shape: TensorShape) -> GraphOfParts {
        let mut graph = GraphOfParts::new();
        let input = graph.add_part(InputPart::new(0, "in", shape, DataType::U8, QuantizationInfo::default(), 0));
        let mut prev = input;
        for _ in 0..len {
            let id = graph.add_part(identity_conv(graph.next_part_id(), shape));
            graph.connect(
                PartOutputSlot { part_id: prev, index: 0 },
                PartInputSlot { part_id: id, index: 0 },
            );
            prev = id;
        }
        let out = graph.add_part(OutputPart::new(graph.next_part_id(), "out", shape, DataType::U8, QuantizationInfo::default(), 0));
        graph.connect(
            PartOutputSlot { part_id: prev, index: 0 },
            PartInputSlot { part_id: out, index: 0 },
        );
        graph
    }

    #[test]
    fn test_single_conv_is_lonely() {
        let mut graph = GraphOfParts::new();
        io_chain(&mut graph, [1, 16, 16, 16]);
        let combination = combine(&graph, &HardwareCapabilities::default()).unwrap();
        assert_eq!(combination.elems.len(), 3);
        assert_eq!(combination.elems[&1].cascade_type, CascadeType::Lonely);
        assert_eq!(combination.num_sections, 3);
    }

    #[test]
    fn test_conv_chain_cascades() {
        let graph = conv_chain(3, [1, 32, 32, 16]);
        let combination = combine(&graph, &HardwareCapabilities::default()).unwrap();
        // Cascading saves every intermediate round trip through DRAM.
        assert_eq!(combination.elems[&1].cascade_type, CascadeType::Beginning);
        assert_eq!(combination.elems[&2].cascade_type, CascadeType::Middle);
        assert_eq!(combination.elems[&3].cascade_type, CascadeType::End);
        assert_eq!(combination.elems[&1].glues[&0], Glue::InSection);
        assert!(matches!(combination.elems[&3].glues[&0], Glue::ThroughDram { .. }));
    }

    #[test]
    fn test_section_length_limit() {
        let graph = conv_chain(3, [1, 32, 32, 16]);
        let encoder = WeightEncoder::new();
        let caps = HardwareCapabilities::default();
        let ctx = PlanContext {
            capabilities: &caps,
            stripe_configs: None,
            priority: PlanPriority::High,
            weight_encoder: &encoder,
        };
        let options = CompilationOptions {
            max_section_length: Some(1),
            ..Default::default()
        };
        let combination = Combiner::new(&graph, &ctx, &options).find_best_combination().unwrap();
        assert!(combination
            .elems
            .values()
            .all(|e| e.cascade_type == CascadeType::Lonely));
    }

    #[test]
    fn test_sram_offsets_never_overlap_within_a_section() {
        let graph = conv_chain(3, [1, 32, 32, 16]);
        let caps = HardwareCapabilities::default();
        let combination = combine(&graph, &caps).unwrap();
        let merged = combination.merged_op_graph(&graph);
        for section in 0..combination.num_sections {
            let mut regions: Vec<(u32, u32)> = merged
                .graph
                .buffer_ids()
                .filter(|b| merged.graph.buffer(*b).location == Location::Sram)
                .filter(|b| {
                    merged
                        .graph
                        .producer(*b)
                        .map_or(false, |op| merged.op_sections[op.0 as usize] == section)
                })
                .map(|b| {
                    let buffer = merged.graph.buffer(b);
                    let offset = buffer.offset.expect("placed");
                    (offset, offset + caps.bank_bytes(buffer.size_in_bytes))
                })
                .collect();
            regions.sort();
            for pair in regions.windows(2) {
                assert!(pair[0].1 <= pair[1].0, "{pair:?}");
            }
        }
    }

    #[test]
    fn test_cheaper_prefix_with_fuller_sram_does_not_prune() {
        let chain = [1, 2, 3];
        let mut search = SectionSearch {
            chain: &chain,
            end: 3,
            best: BTreeMap::new(),
            seen: HashMap::new(),
        };
        let shape = [1, 32, 32, 16];
        let key = BufferKey {
            location: Location::Sram,
            format: BufferFormat::Nhwcb,
            order: TraversalOrder::Xyz,
            tensor_shape: shape,
            stripe_shape: [1, 8, 32, 16],
            num_stripes: 2,
            size_in_bytes: 8 * 32 * 16 * 2,
        };
        let block = Some(BlockConfig::new(16, 16));

        // Cheap, but leaves too little room for a 3KB tile.
        let mut cheap = SectionState::new(4096);
        let (allocator, _) = cheap.allocator.allocate(2048, AllocationPreference::Start).unwrap();
        cheap.allocator = allocator;
        cheap.cost = PlanCost::new(100, 4);
        let mut roomy = SectionState::new(4096);
        roomy.cost = PlanCost::new(200, 4);
        assert!(cheap.allocator.allocate(3072, AllocationPreference::Start).is_none());
        assert!(roomy.allocator.allocate(3072, AllocationPreference::Start).is_some());

        assert!(search.should_extend(1, key, block, &cheap));
        assert!(search.should_extend(1, key, block, &roomy));

        let mut pricier = roomy.clone();
        pricier.cost = PlanCost::new(300, 4);
        assert!(!search.should_extend(1, key, block, &pricier));

        let mut with_kernel = pricier.clone();
        let (allocator, offset) = with_kernel.allocator.allocate(512, AllocationPreference::End).unwrap();
        with_kernel.allocator = allocator;
        with_kernel.kernels.push((
            PleKernelId::new(PleOperation::Passthrough, BlockConfig::new(16, 16), DataType::U8),
            offset,
        ));
        assert!(search.should_extend(1, key, block, &with_kernel));
    }

    #[test]
    fn test_oversized_part_reports_reason() {
        let mut graph = GraphOfParts::new();
        io_chain(&mut graph, [1, 64, 64, 64]);
        let caps = HardwareCapabilities::default().with_total_sram_size(16 * 1024);
        match combine(&graph, &caps) {
            Err(CompileError::NoCombination { part, reason, .. }) => {
                assert_eq!(part, 1);
                assert!(reason.contains("too large"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cascadable_requires_matching_stripes() {
        let caps = HardwareCapabilities::default();
        let encoder = WeightEncoder::new();
        let ctx = PlanContext {
            capabilities: &caps,
            stripe_configs: None,
            priority: PlanPriority::High,
            weight_encoder: &encoder,
        };
        let a = identity_conv(0, [1, 32, 32, 16]);
        let b = identity_conv(1, [1, 32, 32, 16]);
        let producers = a.get_plans(&ctx, CascadeType::Beginning, None, None);
        let producer = producers
            .iter()
            .find(|p| {
                let out = p.graph.buffer(p.output_buffer(0).unwrap());
                out.location == Location::Sram && out.stripe_shape[1] < 32
            })
            .unwrap();
        let out = producer.output_buffer(0).unwrap();
        let prev = producer.graph.buffer(out).clone();
        let consumers = b.get_plans(&ctx, CascadeType::End, producer.block_config(), Some(&prev));
        assert!(!consumers.is_empty());
        for consumer in &consumers {
            assert!(is_directly_cascadable(producer, out, consumer, consumer.input_buffer(0).unwrap()));
        }
        let lonely = b.get_plans(&ctx, CascadeType::Lonely, None, None);
        assert!(lonely
            .iter()
            .filter(|p| p.graph.buffer(p.input_buffer(0).unwrap()).stripe_shape != prev.stripe_shape)
            .all(|p| !is_directly_cascadable(producer, out, p, p.input_buffer(0).unwrap())));
    }
}
