use crate::command_stream::{Agent, AgentData, CommandStream, Dependency, Tile};
use crate::estimation::PerformanceEstimate;
use crate::lifetime::BufferTableEntry;

use prettytable::{self, format, row, Table};

fn plain_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}

fn dependency_str(dep: &Dependency) -> String {
    format!(
        "-{} {}:{}/{}:{}{}",
        dep.relative_agent_id,
        dep.outer_ratio.other,
        dep.outer_ratio.this,
        dep.inner_ratio.other,
        dep.inner_ratio.this,
        if dep.boundary != 0 { " +b" } else { "" }
    )
}

fn tile_str(tile: &Tile) -> String {
    format!("{:#x}x{}x{:#x}", tile.base, tile.num_slots, tile.slot_size)
}

fn detail(agent: &Agent) -> String {
    match &agent.data {
        AgentData::IfmStreamer(fms) | AgentData::OfmStreamer(fms) => format!(
            "dram {}+{:#x} {:?} tile {}",
            fms.buffer_id,
            fms.dram_offset,
            fms.format,
            tile_str(&fms.tile)
        ),
        AgentData::WgtStreamer(wgt) => format!(
            "dram {} (metadata {}) tile {}",
            wgt.buffer_id,
            wgt.metadata_buffer_id,
            tile_str(&wgt.tile)
        ),
        AgentData::MceScheduler(mce) => format!(
            "{:?} {}x{} block {}",
            mce.operation, mce.filter_shape.height, mce.filter_shape.width, mce.block_size
        ),
        AgentData::PleLoader(ple) => format!("{} at {:#x}", ple.ple_kernel_id, ple.sram_addr),
        AgentData::PleScheduler(ple) => format!(
            "{} {:?} out {}",
            ple.ple_kernel_id,
            ple.input_mode,
            tile_str(&ple.ofm_tile)
        ),
    }
}

/// Prints one row per agent with its stripe count and dependencies.
pub fn pprint_agents(stream: &CommandStream) {
    let mut table = Table::new();
    table.set_titles(row!["#", "Agent", "Stripes", "Read", "Write", "Schedule", "Detail"]);
    for (i, agent) in stream.agents.iter().enumerate() {
        let reads = agent
            .info
            .read
            .iter()
            .map(dependency_str)
            .collect::<Vec<_>>()
            .join(", ");
        let optional = |d: &Option<Dependency>| d.as_ref().map(dependency_str).unwrap_or_default();
        table.add_row(row![
            r->i,
            agent.kind().name(),
            r->agent.info.num_stripes_total,
            reads,
            optional(&agent.info.write),
            optional(&agent.info.schedule),
            detail(agent)
        ]);
    }
    table.set_format(plain_format());
    table.printstd();
}

/// Prints the DRAM buffer table.
pub fn pprint_buffers(buffers: &[BufferTableEntry]) {
    let mut table = Table::new();
    table.set_titles(row!["Id", "Kind", "Offset", "Size", "Lifetime", "Source"]);
    for entry in buffers {
        let lifetime = entry
            .lifetime
            .map(|(start, end)| format!("[{start}, {end})"))
            .unwrap_or_default();
        let source = entry.source_id.map(|s| s.to_string()).unwrap_or_default();
        table.add_row(row![
            r->entry.id,
            format!("{:?}", entry.kind),
            r->format!("{:#x}", entry.offset),
            r->entry.size,
            lifetime,
            source
        ]);
    }
    table.set_format(plain_format());
    table.printstd();
}

/// Prints the estimated work of each agent.
pub fn pprint_estimate(estimate: &PerformanceEstimate) {
    let mut table = Table::new();
    table.set_titles(row!["Agent", "Part", "Section", "DRAM bytes", "Reloads", "MCE cycles", "MCE ops", "PLE patches"]);
    for agent in &estimate.agents {
        let part = agent.part.map(|p| p.to_string()).unwrap_or_default();
        table.add_row(row![
            agent.kind.name(),
            r->part,
            r->agent.section,
            r->agent.dram_bytes,
            r->agent.reloads,
            r->agent.mce.cycles,
            r->agent.mce.operations,
            r->agent.ple_patches
        ]);
    }
    table.set_format(plain_format());
    table.printstd();
}
