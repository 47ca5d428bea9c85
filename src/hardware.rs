use serde::{Deserialize, Serialize};

use crate::common::{BlockConfig, TensorShape};
use crate::utils::{BRICK_GROUP_CHANNELS, BRICK_GROUP_HEIGHT, BRICK_GROUP_WIDTH};

/// Hardware configurations the compiler can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum)]
pub enum HardwareVariant {
    /// 8 TOPS, 2 PLE lanes, 1 MiB SRAM.
    Tops8,
    /// 4 TOPS, 4 PLE lanes, 1 MiB SRAM.
    Tops4,
    /// 1 TOPS, 2 PLE lanes, 512 KiB SRAM.
    Tops1,
}

/// A static description of the NPU.
///
/// All sizes are in bytes. SRAM is banked: a tile striped across the banks
/// consumes `size / num_srams` bytes of each bank.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct HardwareCapabilities {
    pub total_sram_size: u32,
    pub num_srams: u32,
    pub num_engines: u32,
    pub ogs_per_engine: u32,
    pub igs_per_engine: u32,
    pub num_ple_lanes: u32,
    pub brick_group_shape: TensorShape,
    /// The unit of output the MCE and PLE compute at a time.
    pub patch_shape: TensorShape,
    pub mac_units_per_engine: u32,
    /// Height of the halo streamed above and below an input stripe.
    pub boundary_stripe_height: u32,
    /// Per-bank SRAM taken by one loaded PLE kernel.
    pub ple_kernel_sram_size: u32,
    /// Largest relative agent id a dependency can encode.
    pub max_relative_agent_id: u32,
}

impl HardwareCapabilities {
    pub fn new(variant: HardwareVariant) -> Self {
        let (total_sram_size, num_engines, num_ple_lanes) = match variant {
            HardwareVariant::Tops8 => (1024 * 1024, 16, 2),
            HardwareVariant::Tops4 => (1024 * 1024, 8, 4),
            HardwareVariant::Tops1 => (512 * 1024, 8, 2),
        };
        HardwareCapabilities {
            total_sram_size,
            num_srams: 16,
            num_engines,
            ogs_per_engine: 1,
            igs_per_engine: 1,
            num_ple_lanes,
            brick_group_shape: [1, BRICK_GROUP_HEIGHT, BRICK_GROUP_WIDTH, BRICK_GROUP_CHANNELS],
            patch_shape: [1, 4, 4, 1],
            mac_units_per_engine: 8,
            boundary_stripe_height: BRICK_GROUP_HEIGHT,
            ple_kernel_sram_size: 1024,
            max_relative_agent_id: u8::MAX.into(),
        }
    }

    /// Returns a copy with a different SRAM size. Used mostly to provoke
    /// capacity failures in tests.
    pub fn with_total_sram_size(mut self, total_sram_size: u32) -> Self {
        self.total_sram_size = total_sram_size;
        self
    }

    pub fn number_of_ogs(&self) -> u32 {
        self.num_engines * self.ogs_per_engine
    }

    pub fn number_of_igs(&self) -> u32 {
        self.num_engines * self.igs_per_engine
    }

    /// Per-bank bytes available to tiles and PLE kernels.
    pub fn sram_bank_size(&self) -> u32 {
        self.total_sram_size / self.num_srams
    }

    /// Per-bank bytes taken by a buffer of `size_in_bytes` striped over every bank.
    pub fn bank_bytes(&self, size_in_bytes: u32) -> u32 {
        crate::utils::div_round_up(size_in_bytes, self.num_srams)
    }
}

impl Default for HardwareCapabilities {
    fn default() -> Self {
        HardwareCapabilities::new(HardwareVariant::Tops8)
    }
}

/// All block configurations the MCE and PLE understand.
pub const ALL_BLOCK_CONFIGS: [BlockConfig; 6] = [
    BlockConfig::new(16, 16),
    BlockConfig::new(16, 8),
    BlockConfig::new(8, 16),
    BlockConfig::new(8, 8),
    BlockConfig::new(32, 8),
    BlockConfig::new(8, 32),
];

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompilationOptions {
    /// Allow FCAF formats for DRAM buffers inserted between sections.
    pub enable_fcaf: bool,
    /// Stop growing cascades past this many parts. `None` is unbounded.
    pub max_section_length: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variants_fit_a_ple_kernel_per_bank() {
        for variant in [
            HardwareVariant::Tops8,
            HardwareVariant::Tops4,
            HardwareVariant::Tops1,
        ] {
            let caps = HardwareCapabilities::new(variant);
            assert!(caps.sram_bank_size() > caps.ple_kernel_sram_size);
            assert!(caps.number_of_ogs() >= caps.num_srams / 2);
        }
    }

    #[test]
    fn test_bank_bytes_rounds_up() {
        let caps = HardwareCapabilities::default();
        assert_eq!(caps.bank_bytes(1024), 64);
        assert_eq!(caps.bank_bytes(1025), 65);
    }
}
