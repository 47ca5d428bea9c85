use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Add;

use crate::graph::{Buffer, BufferFormat, BufferId, BufferType, Location, Op, OpGraph, OpId};
use crate::hardware::CompilationOptions;
use crate::part::{GraphOfParts, PartT};
use crate::plan::{CascadeType, PartId, PartOutputSlot, Plan};
use crate::utils::{
    is_compatible_with_cell, total_size_bytes_nhwcb, FCAF_DEEP_CELL, FCAF_WIDE_CELL,
};

/// What a combination is scored by: DRAM bytes moved, then the number of
/// stripes computed. Lower is better.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct PlanCost {
    pub dram_bytes: u64,
    pub stripes: u64,
}

/// How one output slot reaches its consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Glue {
    /// The consumer is the next part in the same section and reads the
    /// producer's buffer as is.
    InSection,
    /// The producer's buffer is in DRAM: DRAM consumers share it, SRAM
    /// consumers each get a DMA.
    FromDram,
    /// The producer's buffer is in SRAM: one DMA writes it to DRAM (to the
    /// first DRAM consumer's buffer if there is one, otherwise to a new buffer
    /// in `format`), then each SRAM consumer gets a DMA back in.
    ThroughDram { format: BufferFormat },
}

#[derive(Clone, Debug)]
pub struct Elem {
    pub plan: Plan,
    pub cascade_type: CascadeType,
    pub section: usize,
    pub glues: BTreeMap<usize, Glue>,
}

/// One plan per part, plus the glue joining them.
#[derive(Clone, Debug)]
pub struct Combination {
    pub elems: BTreeMap<PartId, Elem>,
    pub num_sections: usize,
    pub cost: PlanCost,
}

/// The stitched graph of a combination.
#[derive(Clone, Debug)]
pub struct MergedGraph {
    pub graph: OpGraph,
    /// Section index of each op, indexed by op id.
    pub op_sections: Vec<usize>,
    /// Part owning each op, or `None` for glue.
    pub op_parts: Vec<Option<PartId>>,
}

impl PlanCost {
    pub const fn new(dram_bytes: u64, stripes: u64) -> Self {
        PlanCost {
            dram_bytes,
            stripes,
        }
    }
}

impl Add for PlanCost {
    type Output = PlanCost;

    fn add(self, rhs: Self) -> Self::Output {
        PlanCost {
            dram_bytes: self.dram_bytes + rhs.dram_bytes,
            stripes: self.stripes + rhs.stripes,
        }
    }
}

impl Combination {
    /// Builds a combination from sections of `(part, cascade type, plan)`,
    /// deciding the glue for every output slot.
    pub fn new(
        graph: &GraphOfParts,
        sections: Vec<Vec<(PartId, CascadeType, Plan)>>,
        cost: PlanCost,
        options: &CompilationOptions,
    ) -> Self {
        let num_sections = sections.len();
        let mut elems = BTreeMap::new();
        for (section, parts) in sections.into_iter().enumerate() {
            for (part_id, cascade_type, plan) in parts {
                elems.insert(
                    part_id,
                    Elem {
                        plan,
                        cascade_type,
                        section,
                        glues: BTreeMap::new(),
                    },
                );
            }
        }
        assert_eq!(elems.len(), graph.len(), "combination misses a part");

        let mut glues = vec![];
        for (&part_id, elem) in &elems {
            for index in 0..graph.part(part_id).num_outputs() {
                let slot = PartOutputSlot { part_id, index };
                let consumers = graph.consumers(slot);
                let Some(out) = elem.plan.output_buffer(index) else {
                    panic!("plan for part {part_id} has no output {index}");
                };
                let out = elem.plan.graph.buffer(out);
                let in_section = consumers.len() == 1
                    && elems[&consumers[0].part_id].section == elem.section;
                let glue = if in_section {
                    Glue::InSection
                } else if out.location == Location::Dram {
                    Glue::FromDram
                } else {
                    let consumer_buffers: Vec<&Buffer> = consumers
                        .iter()
                        .map(|c| {
                            let plan = &elems[&c.part_id].plan;
                            plan.graph.buffer(consumer_input(plan, c.index))
                        })
                        .collect();
                    Glue::ThroughDram {
                        format: dram_format(out, &consumer_buffers, options),
                    }
                };
                glues.push((part_id, index, glue));
            }
        }
        for (part_id, index, glue) in glues {
            if let Some(elem) = elems.get_mut(&part_id) {
                elem.glues.insert(index, glue);
            }
        }
        Combination {
            elems,
            num_sections,
            cost,
        }
    }

    /// Stitches every plan into one graph, inserting glue.
    pub fn merged_op_graph(&self, graph: &GraphOfParts) -> MergedGraph {
        let mut merged = MergedGraph {
            graph: OpGraph::new(),
            op_sections: vec![],
            op_parts: vec![],
        };
        let mut buffer_bases = BTreeMap::new();
        for (&part_id, elem) in &self.elems {
            let (buffer_base, _) = merged.graph.append(&elem.plan.graph);
            buffer_bases.insert(part_id, buffer_base);
            let num_ops = elem.plan.graph.num_ops();
            merged.op_sections.extend(std::iter::repeat(elem.section).take(num_ops));
            merged.op_parts.extend(std::iter::repeat(Some(part_id)).take(num_ops));
        }
        let shifted = |part_id: PartId, b: BufferId| BufferId(b.0 + buffer_bases[&part_id]);

        for (&part_id, elem) in &self.elems {
            for (&index, &glue) in &elem.glues {
                let slot = PartOutputSlot { part_id, index };
                let Some(out) = elem.plan.output_buffer(index) else {
                    continue;
                };
                let out = shifted(part_id, out);
                let consumers: Vec<(PartId, BufferId)> = graph
                    .consumers(slot)
                    .into_iter()
                    .map(|c| {
                        let plan = &self.elems[&c.part_id].plan;
                        (c.part_id, shifted(c.part_id, consumer_input(plan, c.index)))
                    })
                    .collect();
                match glue {
                    Glue::InSection => {
                        for (_, input) in consumers {
                            merged.graph.merge_buffers(out, input);
                        }
                    }
                    Glue::FromDram => {
                        for (consumer, input) in consumers {
                            if merged.graph.buffer(input).location == Location::Dram {
                                merge_dram(&mut merged.graph, out, input);
                            } else {
                                let section = self.elems[&consumer].section;
                                merged.add_dma(out, input, section);
                            }
                        }
                    }
                    Glue::ThroughDram { format } => {
                        let shared = consumers
                            .iter()
                            .map(|(_, b)| *b)
                            .find(|b| merged.graph.buffer(*b).location == Location::Dram);
                        let shared = match shared {
                            Some(b) => b,
                            None => {
                                let producer = merged.graph.buffer(out);
                                let mut buffer = Buffer::dram(
                                    BufferType::Intermediate,
                                    format,
                                    producer.tensor_shape,
                                    producer.data_type,
                                    producer.quantization.clone(),
                                )
                                .with_tag(format!("{} dram", producer.debug_tag));
                                buffer.size_in_bytes = total_size_bytes_nhwcb(&producer.tensor_shape);
                                merged.graph.add_buffer(buffer)
                            }
                        };
                        merged.add_dma(out, shared, elem.section);
                        for (consumer, input) in consumers {
                            if input == shared {
                                continue;
                            }
                            if merged.graph.buffer(input).location == Location::Dram {
                                merge_dram(&mut merged.graph, shared, input);
                            } else {
                                let section = self.elems[&consumer].section;
                                merged.add_dma(shared, input, section);
                            }
                        }
                    }
                }
            }
        }
        debug!(
            "Merged graph has {} ops in {} sections",
            merged.graph.num_ops(),
            self.num_sections
        );
        merged
    }
}

impl MergedGraph {
    fn add_dma(&mut self, from: BufferId, to: BufferId, section: usize) -> OpId {
        let dram = if self.graph.buffer(from).location == Location::Dram {
            from
        } else {
            to
        };
        let format = self.graph.buffer(dram).format;
        let dma = self.graph.add_op(Op::Dma { format });
        self.graph.add_consumer(from, dma);
        self.graph.set_producer(to, dma);
        self.op_sections.push(section);
        self.op_parts.push(None);
        dma
    }
}

fn consumer_input(plan: &Plan, index: usize) -> BufferId {
    match plan.input_buffer(index) {
        Some(b) => b,
        None => panic!("plan has no input {index}"),
    }
}

/// Merges two DRAM buffers, keeping the network-facing role of either.
fn merge_dram(graph: &mut OpGraph, kept: BufferId, removed: BufferId) {
    let removed_buffer = graph.buffer(removed).clone();
    graph.merge_buffers(kept, removed);
    let kept = graph.buffer_mut(kept);
    if matches!(
        removed_buffer.buffer_type,
        Some(BufferType::Output | BufferType::Input)
    ) {
        kept.buffer_type = removed_buffer.buffer_type;
        kept.source_index = removed_buffer.source_index;
    }
}

/// The format of a DRAM buffer between sections.
fn dram_format(producer: &Buffer, consumers: &[&Buffer], options: &CompilationOptions) -> BufferFormat {
    if options.enable_fcaf {
        let srams = std::iter::once(producer)
            .chain(consumers.iter().copied())
            .filter(|b| b.location == Location::Sram);
        let srams: Vec<&Buffer> = srams.collect();
        for (cell, format) in [
            (FCAF_DEEP_CELL, BufferFormat::FcafDeep),
            (FCAF_WIDE_CELL, BufferFormat::FcafWide),
        ] {
            if srams
                .iter()
                .all(|b| is_compatible_with_cell(&b.stripe_shape, &b.tensor_shape, &cell))
            {
                return format;
            }
        }
    }
    BufferFormat::Nhwcb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DataType, QuantizationInfo};

    fn sram(stripe: [u32; 4]) -> Buffer {
        let mut b = Buffer::new(
            Location::Sram,
            BufferFormat::Nhwcb,
            [1, 32, 32, 64],
            stripe,
            DataType::U8,
            QuantizationInfo::default(),
        );
        b.num_stripes = 1;
        b
    }

    #[test]
    fn test_fcaf_needs_option_and_compatible_stripes() {
        let deep = sram([1, 8, 32, 64]);
        let narrow = sram([1, 8, 32, 16]);
        let on = CompilationOptions {
            enable_fcaf: true,
            ..Default::default()
        };
        assert_eq!(dram_format(&deep, &[], &CompilationOptions::default()), BufferFormat::Nhwcb);
        assert_eq!(dram_format(&deep, &[], &on), BufferFormat::FcafDeep);
        assert_eq!(dram_format(&deep, &[&narrow], &on), BufferFormat::FcafWide);
        assert_eq!(dram_format(&sram([1, 4, 32, 16]), &[], &on), BufferFormat::Nhwcb);
    }

    #[test]
    fn test_costs_order_by_dram_then_stripes() {
        assert!(PlanCost::new(1, 100) < PlanCost::new(2, 0));
        assert!(PlanCost::new(1, 1) < PlanCost::new(1, 2));
        assert_eq!(PlanCost::new(1, 2) + PlanCost::new(3, 4), PlanCost::new(4, 6));
    }
}
