use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path;

use npu_cascade::common::{DataType, Padding, QuantizationInfo, Stride, TensorShape};
use npu_cascade::compiler::{compile, estimate};
use npu_cascade::graph::MceOperation;
use npu_cascade::hardware::{CompilationOptions, HardwareCapabilities, HardwareVariant};
use npu_cascade::part::io::{InputPart, OutputPart};
use npu_cascade::part::mce::McePart;
use npu_cascade::part::ple::{FusedPlePart, StandalonePlePart};
use npu_cascade::part::GraphOfParts;
use npu_cascade::plan::{PartId, PartInputSlot, PartOutputSlot};
use npu_cascade::ple::PleOperation;
use npu_cascade::pprint::{pprint_agents, pprint_buffers, pprint_estimate};
use npu_cascade::stripe_config::StripeConfigFile;
use npu_cascade::weights::ConvData;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hardware configuration to compile for
    #[arg(long, value_enum, default_value_t = HardwareVariant::Tops8)]
    variant: HardwareVariant,

    /// Stripe config file. Defaults to $NPU_CASCADE_STRIPE_CONFIG.
    #[arg(long)]
    stripe_config: Option<path::PathBuf>,

    /// Write the encoded command stream here
    #[arg(long, short)]
    output: Option<path::PathBuf>,

    /// Limit on the number of parts cascaded into one section
    #[arg(long)]
    max_section_length: Option<usize>,

    /// Allow compressed formats for intermediate DRAM buffers
    #[arg(long)]
    fcaf: bool,

    /// Only search for a combination and report its cost
    #[arg(long)]
    estimate: bool,

    #[command(subcommand)]
    network: Network,
}

#[derive(clap::Subcommand)]
enum Network {
    #[command(about = "Compile a single convolution")]
    Conv {
        #[arg(long, default_value = "16")]
        channels: u32,
        #[arg(long, default_value = "16")]
        filters: u32,
        #[arg(long, default_value = "3")]
        kernel: u32,
        #[arg(long, default_value = "1")]
        stride: u32,
        #[arg(long)]
        depthwise: bool,
        #[arg(long, default_value = "1")]
        upscale: u32,
        /// Clamp the output to [0, RELU_MAX]
        #[arg(long)]
        relu_max: Option<i32>,
        size: u32,
    },
    #[command(about = "Compile a chain of 1x1 convolutions")]
    Chain {
        #[arg(long, default_value = "16")]
        channels: u32,
        #[arg(long, default_value = "3")]
        length: usize,
        size: u32,
    },
    #[command(about = "Compile an elementwise addition of two inputs")]
    Add {
        #[arg(long, default_value = "16")]
        channels: u32,
        #[arg(long, default_value = "1.0")]
        lhs_scale: f32,
        #[arg(long, default_value = "1.0")]
        rhs_scale: f32,
        size: u32,
    },
    #[command(about = "Compile a 2x2 stride 2 max pooling")]
    Pool {
        #[arg(long, default_value = "16")]
        channels: u32,
        size: u32,
    },
}

fn connect(graph: &mut GraphOfParts, from: PartId, to: PartId, index: usize) {
    graph.connect(
        PartOutputSlot {
            part_id: from,
            index: 0,
        },
        PartInputSlot { part_id: to, index },
    );
}

fn add_input(graph: &mut GraphOfParts, shape: TensorShape, scale: f32, index: u32) -> PartId {
    graph.add_part(InputPart::new(
        graph.next_part_id(),
        format!("input{index}"),
        shape,
        DataType::U8,
        QuantizationInfo::new(0, scale),
        index,
    ))
}

fn add_output(graph: &mut GraphOfParts, shape: TensorShape, from: PartId) {
    let id = graph.add_part(OutputPart::new(
        graph.next_part_id(),
        "output",
        shape,
        DataType::U8,
        QuantizationInfo::default(),
        0,
    ));
    connect(graph, from, id, 0);
}

/// Small deterministic weights, so repeated runs compile identically.
fn demo_weights(shape: TensorShape) -> ConvData {
    let len = shape.iter().product::<u32>();
    let out_channels = if shape[3] == 1 { shape[2] } else { shape[3] };
    ConvData::new(
        shape,
        (0..len).map(|i| (i % 7) as u8 + 1).collect(),
        QuantizationInfo::new(0, 0.5),
        vec![0; out_channels as usize],
    )
}

fn build_network(network: &Network) -> GraphOfParts {
    let mut graph = GraphOfParts::new();
    match *network {
        Network::Conv {
            channels,
            filters,
            kernel,
            stride,
            depthwise,
            upscale,
            relu_max,
            size,
        } => {
            let input_shape = [1, size, size, channels];
            let pad = (kernel - 1) / 2;
            let out_size = (size * upscale + 2 * pad - kernel) / stride + 1;
            let (operation, weights_shape, out_channels) = if depthwise {
                (MceOperation::DepthwiseConvolution, [kernel, kernel, channels, 1], channels)
            } else {
                (MceOperation::Convolution, [kernel, kernel, channels, filters], filters)
            };
            let output_shape = [1, out_size, out_size, out_channels];
            let input = add_input(&mut graph, input_shape, 1.0, 0);
            let mut part = McePart::new(
                graph.next_part_id(),
                "conv",
                input_shape,
                output_shape,
                QuantizationInfo::default(),
                QuantizationInfo::default(),
                DataType::U8,
                demo_weights(weights_shape),
                operation,
            )
            .with_stride(Stride {
                x: stride,
                y: stride,
            })
            .with_padding(Padding {
                top: pad,
                bottom: pad,
                left: pad,
                right: pad,
            })
            .with_upscale_factor(upscale);
            if let Some(max) = relu_max {
                part = part.with_bounds(0, max);
            }
            let conv = graph.add_part(part);
            connect(&mut graph, input, conv, 0);
            add_output(&mut graph, output_shape, conv);
        }
        Network::Chain {
            channels,
            length,
            size,
        } => {
            let shape = [1, size, size, channels];
            let mut prev = add_input(&mut graph, shape, 1.0, 0);
            for i in 0..length {
                let conv = graph.add_part(McePart::new(
                    graph.next_part_id(),
                    format!("conv{i}"),
                    shape,
                    shape,
                    QuantizationInfo::default(),
                    QuantizationInfo::default(),
                    DataType::U8,
                    demo_weights([1, 1, channels, channels]),
                    MceOperation::Convolution,
                ));
                connect(&mut graph, prev, conv, 0);
                prev = conv;
            }
            add_output(&mut graph, shape, prev);
        }
        Network::Add {
            channels,
            lhs_scale,
            rhs_scale,
            size,
        } => {
            let shape = [1, size, size, channels];
            let lhs = add_input(&mut graph, shape, lhs_scale, 0);
            let rhs = add_input(&mut graph, shape, rhs_scale, 1);
            let add = graph.add_part(StandalonePlePart::addition(
                graph.next_part_id(),
                "add",
                shape,
                [
                    QuantizationInfo::new(0, lhs_scale),
                    QuantizationInfo::new(0, rhs_scale),
                ],
                QuantizationInfo::default(),
                DataType::U8,
            ));
            connect(&mut graph, lhs, add, 0);
            connect(&mut graph, rhs, add, 1);
            add_output(&mut graph, shape, add);
        }
        Network::Pool { channels, size } => {
            let input_shape = [1, size, size, channels];
            let output_shape = [1, size / 2, size / 2, channels];
            let input = add_input(&mut graph, input_shape, 1.0, 0);
            let pool = graph.add_part(FusedPlePart::new(
                graph.next_part_id(),
                "pool",
                input_shape,
                output_shape,
                QuantizationInfo::default(),
                QuantizationInfo::default(),
                DataType::U8,
                PleOperation::MaxPool2x2Stride2,
            ));
            connect(&mut graph, input, pool, 0);
            add_output(&mut graph, output_shape, pool);
        }
    }
    graph
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let stripe_configs = match &args.stripe_config {
        Some(path) => Some(StripeConfigFile::load(path)?),
        None => StripeConfigFile::from_env()?,
    };
    let caps = HardwareCapabilities::new(args.variant);
    let options = CompilationOptions {
        enable_fcaf: args.fcaf,
        max_section_length: args.max_section_length,
    };
    let graph = build_network(&args.network);

    let start_time = std::time::Instant::now();
    if args.estimate {
        let estimate = estimate(&graph, &caps, &options, stripe_configs.as_ref())?;
        info!("estimate took {:?}", start_time.elapsed());
        pprint_estimate(&estimate.performance);
        println!(
            "\n{} sections, {} DRAM bytes moved, {} MCE cycles, {} MCE operations, {} PLE patches",
            estimate.num_sections,
            estimate.performance.dram_bytes(),
            estimate.performance.mce_cycles(),
            estimate.performance.mce_operations(),
            estimate.performance.ple_patches()
        );
        for (part, reason) in &estimate.estimate_only {
            println!("part {part} is estimate-only: {reason}");
        }
        return Ok(());
    }

    let compiled = compile(&graph, &caps, &options, stripe_configs.as_ref())?;
    info!("compile took {:?}", start_time.elapsed());
    pprint_agents(&compiled.command_stream);
    println!();
    pprint_buffers(&compiled.buffer_table);
    println!(
        "\n{} sections, {} DRAM bytes, {} stripes",
        compiled.num_sections, compiled.cost.dram_bytes, compiled.cost.stripes
    );
    if let Some(path) = &args.output {
        std::fs::write(path, &compiled.command_stream_bytes)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(
            "Wrote {} bytes of command stream to {}",
            compiled.command_stream_bytes.len(),
            path.display()
        );
    }
    Ok(())
}
