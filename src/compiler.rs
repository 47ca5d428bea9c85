//! The top-level driver: from a graph of parts to a command stream plus the
//! table of DRAM buffers it addresses.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::combiner::{Combination, Combiner, PlanCost};
use crate::command_stream::{self, CommandStream, CommandStreamError};
use crate::estimation::{estimate_performance, PerformanceEstimate};
use crate::hardware::{CompilationOptions, HardwareCapabilities};
use crate::lifetime::{BufferManager, BufferTableEntry};
use crate::part::{GraphOfParts, Part, PartT, PlanContext};
use crate::plan::{PartId, PartInputSlot, PartOutputSlot};
use crate::stripe_config::{PlanPriority, StripeConfigFile};
use crate::weights::WeightEncoder;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("input {index} of part {part} ({name}) is not connected")]
    UnconnectedInput {
        part: PartId,
        name: String,
        index: usize,
    },
    #[error("output {index} of part {part} ({name}) has no consumer")]
    DanglingOutput {
        part: PartId,
        name: String,
        index: usize,
    },
    #[error("concatenation {part} ({name}) cannot take network input or constant part {producer} directly")]
    UnsupportedConcatInput {
        part: PartId,
        name: String,
        producer: PartId,
    },
    #[error("no valid combination for part {part} ({name}): {reason}")]
    NoCombination {
        part: PartId,
        name: String,
        reason: String,
    },
    #[error("part {part} ({name}) can only be estimated: {reason}")]
    EstimateOnly {
        part: PartId,
        name: String,
        reason: String,
    },
    #[error(transparent)]
    CommandStream(#[from] CommandStreamError),
}

/// Everything the runtime needs to execute a compiled network.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompiledNetwork {
    pub command_stream: CommandStream,
    /// The bincode encoding of `command_stream`, stored as DRAM buffer 0.
    pub command_stream_bytes: Vec<u8>,
    pub buffer_table: Vec<BufferTableEntry>,
    pub constant_size: u32,
    pub intermediate_size: u32,
    pub cost: PlanCost,
    pub num_sections: usize,
}

/// The outcome of searching without generating a command stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Estimate {
    pub cost: PlanCost,
    pub num_sections: usize,
    /// Parts that could only be costed, with the reason.
    pub estimate_only: Vec<(PartId, String)>,
    pub performance: PerformanceEstimate,
}

/// Rejects graphs the pipeline cannot lower at all.
fn validate(graph: &GraphOfParts) -> Result<(), CompileError> {
    if let Some(slot) = graph.unconnected_inputs().first() {
        return Err(CompileError::UnconnectedInput {
            part: slot.part_id,
            name: graph.part(slot.part_id).debug_name().to_string(),
            index: slot.index,
        });
    }
    for part in graph.parts() {
        for index in 0..part.num_outputs() {
            let slot = PartOutputSlot {
                part_id: part.id(),
                index,
            };
            if !matches!(part, Part::Output(_)) && graph.consumers(slot).is_empty() {
                return Err(CompileError::DanglingOutput {
                    part: part.id(),
                    name: part.debug_name().to_string(),
                    index,
                });
            }
        }
        if let Part::Concat(_) = part {
            for index in 0..part.num_inputs() {
                let slot = PartInputSlot {
                    part_id: part.id(),
                    index,
                };
                let Some(producer) = graph.producer(slot) else {
                    continue;
                };
                if matches!(
                    graph.part(producer.part_id),
                    Part::Input(_) | Part::Constant(_)
                ) {
                    return Err(CompileError::UnsupportedConcatInput {
                        part: part.id(),
                        name: part.debug_name().to_string(),
                        producer: producer.part_id,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Searches at high priority, falling back to the low-priority strategies
/// when some part has no valid plan.
fn best_combination(
    graph: &GraphOfParts,
    caps: &HardwareCapabilities,
    options: &CompilationOptions,
    stripe_configs: Option<&StripeConfigFile>,
) -> Result<Combination, CompileError> {
    let encoder = WeightEncoder::new();
    let search = |priority| {
        let ctx = PlanContext {
            capabilities: caps,
            stripe_configs,
            priority,
            weight_encoder: &encoder,
        };
        Combiner::new(graph, &ctx, options).find_best_combination()
    };
    match search(PlanPriority::High) {
        Err(CompileError::NoCombination { name, reason, .. }) => {
            warn!("No combination at high priority ({name}: {reason}), retrying at low priority");
            search(PlanPriority::Low)
        }
        result => result,
    }
}

fn estimate_only_parts(combination: &Combination) -> Vec<(PartId, String)> {
    combination
        .elems
        .iter()
        .filter_map(|(id, e)| e.plan.estimate_only_reason().map(|r| (*id, r.to_string())))
        .collect()
}

/// Compiles `graph` for `caps`.
pub fn compile(
    graph: &GraphOfParts,
    caps: &HardwareCapabilities,
    options: &CompilationOptions,
    stripe_configs: Option<&StripeConfigFile>,
) -> Result<CompiledNetwork, CompileError> {
    validate(graph)?;
    let combination = best_combination(graph, caps, options, stripe_configs)?;
    if let Some((part, reason)) = estimate_only_parts(&combination).into_iter().next() {
        return Err(CompileError::EstimateOnly {
            part,
            name: graph.part(part).debug_name().to_string(),
            reason,
        });
    }

    let merged = combination.merged_op_graph(graph);
    let mut buffers = BufferManager::new();
    let command_stream = command_stream::generate(&merged, caps, &mut buffers)?;
    let command_stream_bytes = command_stream.serialize()?;
    buffers.set_command_stream(command_stream_bytes.clone());
    let (constant_size, intermediate_size) = buffers.allocate();
    info!(
        "Compiled {} parts into {} sections and {} agents ({} bytes of constants, {} bytes of intermediates)",
        graph.len(),
        combination.num_sections,
        command_stream.len(),
        constant_size,
        intermediate_size
    );
    Ok(CompiledNetwork {
        command_stream,
        command_stream_bytes,
        buffer_table: buffers.buffer_table(),
        constant_size,
        intermediate_size,
        cost: combination.cost,
        num_sections: combination.num_sections,
    })
}

/// Runs the search only. Unlike [compile], estimate-only parts are reported
/// rather than rejected.
pub fn estimate(
    graph: &GraphOfParts,
    caps: &HardwareCapabilities,
    options: &CompilationOptions,
    stripe_configs: Option<&StripeConfigFile>,
) -> Result<Estimate, CompileError> {
    validate(graph)?;
    let combination = best_combination(graph, caps, options, stripe_configs)?;
    let performance = estimate_performance(&combination.merged_op_graph(graph), caps);
    info!(
        "Estimated {} agents: {} DRAM bytes, {} MCE cycles",
        performance.agents.len(),
        performance.dram_bytes(),
        performance.mce_cycles()
    );
    Ok(Estimate {
        cost: combination.cost,
        num_sections: combination.num_sections,
        estimate_only: estimate_only_parts(&combination),
        performance,
    })
}
