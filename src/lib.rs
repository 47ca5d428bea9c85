pub mod combiner;
pub mod command_stream;
pub mod common;
pub mod compiler;
pub mod estimation;
pub mod graph;
pub mod hardware;
pub mod lifetime;
pub mod part;
pub mod plan;
pub mod ple;
pub mod pprint;
mod sram;
pub mod stripe_config;
pub mod stripes;
pub mod utils;
pub mod weights;

pub use compiler::{compile, estimate, CompileError, CompiledNetwork};
