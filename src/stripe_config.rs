//! Restrictions on which stripe strategies the stripe generator may use.
//!
//! A [StripeConfig] is usually the default (everything enabled), but it can be
//! narrowed per part from a small text file:
//!
//! ```text
//! # Applies to all parts.
//! *:
//! DisableAllSplits
//! Splits.MceAndPleOutputHeight=True
//!
//! conv_*:
//! BlockConfig(16,16)=False
//! BlockWidthMultiplier.Max=2
//! PlanTypes.Beginning=False
//! ```
//!
//! Sections are applied in order to every part whose debug name matches the
//! section's glob pattern.

use enum_iterator::{all, Sequence};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::common::BlockConfig;
use crate::hardware::ALL_BLOCK_CONFIGS;
use crate::plan::CascadeType;
use crate::utils::glob_match;

pub const STRIPE_CONFIG_ENV_VAR: &str = "NPU_CASCADE_STRIPE_CONFIG";

/// The strategies the stripe generator uses to divide a part's tensors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Sequence, Deserialize, Serialize)]
pub enum Split {
    MceAndPleOutputHeight,
    MceOutputHeightOnly,
    WidthOnly,
    WidthHeight,
    WidthHeightOutputDepth,
    WidthHeightOutputDepthInputDepth,
    OutputDepthInputDepth,
    MceAndPleOutputDepth,
    MceOutputDepthOnly,
    InputDepthOnly,
    None,
}

/// A set of [Split]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Splits(u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MultiplierRange {
    pub min: u32,
    pub max: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PlanTypes {
    pub beginning: bool,
    pub middle: bool,
    pub end: bool,
    pub lonely: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct StripeConfig {
    pub splits: Splits,
    pub block_configs: Vec<BlockConfig>,
    pub block_width_multiplier: MultiplierRange,
    pub block_height_multiplier: MultiplierRange,
    pub ifm_depth_multiplier: MultiplierRange,
    pub ofm_depth_multiplier: MultiplierRange,
    pub plan_types: PlanTypes,
}

/// Search tiers. Plans are first generated at [PlanPriority::High]; parts
/// without any plan are retried at [PlanPriority::Low], which additionally
/// permits the strategies that reload input data across input-depth stripes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Sequence, Deserialize, Serialize)]
pub enum PlanPriority {
    High,
    Low,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Sequence)]
enum MultiplierKind {
    BlockWidth,
    BlockHeight,
    IfmDepth,
    OfmDepth,
}

#[derive(Clone, Debug, PartialEq)]
enum Directive {
    DisableAll,
    DisableAllSplits,
    DisableAllBlockConfigs,
    Split(Split, bool),
    BlockConfig(BlockConfig, bool),
    MultiplierMin(MultiplierKind, u32),
    MultiplierMax(MultiplierKind, u32),
    PlanType(CascadeType, bool),
}

/// A parsed stripe configuration file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StripeConfigFile {
    sections: Vec<(String, Vec<Directive>)>,
}

#[derive(Error, Debug)]
pub enum StripeConfigError {
    #[error("Could not read stripe config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },
}

impl Split {
    pub fn name(&self) -> &'static str {
        match self {
            Split::MceAndPleOutputHeight => "MceAndPleOutputHeight",
            Split::MceOutputHeightOnly => "MceOutputHeightOnly",
            Split::WidthOnly => "WidthOnly",
            Split::WidthHeight => "WidthHeight",
            Split::WidthHeightOutputDepth => "WidthHeightOutputDepth",
            Split::WidthHeightOutputDepthInputDepth => "WidthHeightOutputDepthInputDepth",
            Split::OutputDepthInputDepth => "OutputDepthInputDepth",
            Split::MceAndPleOutputDepth => "MceAndPleOutputDepth",
            Split::MceOutputDepthOnly => "MceOutputDepthOnly",
            Split::InputDepthOnly => "InputDepthOnly",
            Split::None => "None",
        }
    }

    /// Whether this strategy divides the input depth, forcing partial sums to
    /// be accumulated across input stripes.
    pub fn splits_input_depth(&self) -> bool {
        matches!(
            self,
            Split::WidthHeightOutputDepthInputDepth | Split::OutputDepthInputDepth
        )
    }

    fn bit(&self) -> u16 {
        1 << (*self as u16)
    }
}

impl Splits {
    pub fn all() -> Self {
        all::<Split>().collect()
    }

    pub fn empty() -> Self {
        Splits(0)
    }

    pub fn contains(&self, split: Split) -> bool {
        self.0 & split.bit() != 0
    }

    pub fn set(&mut self, split: Split, enabled: bool) {
        if enabled {
            self.0 |= split.bit();
        } else {
            self.0 &= !split.bit();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Split> + '_ {
        all::<Split>().filter(|s| self.contains(*s))
    }
}

impl FromIterator<Split> for Splits {
    fn from_iter<T: IntoIterator<Item = Split>>(iter: T) -> Self {
        let mut splits = Splits::empty();
        for s in iter {
            splits.set(s, true);
        }
        splits
    }
}

impl MultiplierRange {
    pub const UNBOUNDED: MultiplierRange = MultiplierRange {
        min: 1,
        max: u32::MAX,
    };

    pub fn contains(&self, v: u32) -> bool {
        self.min <= v && v <= self.max
    }
}

impl PlanTypes {
    pub fn allows(&self, cascade_type: CascadeType) -> bool {
        match cascade_type {
            CascadeType::Beginning => self.beginning,
            CascadeType::Middle => self.middle,
            CascadeType::End => self.end,
            CascadeType::Lonely => self.lonely,
        }
    }

    fn set(&mut self, cascade_type: CascadeType, enabled: bool) {
        match cascade_type {
            CascadeType::Beginning => self.beginning = enabled,
            CascadeType::Middle => self.middle = enabled,
            CascadeType::End => self.end = enabled,
            CascadeType::Lonely => self.lonely = enabled,
        }
    }
}

impl Default for StripeConfig {
    fn default() -> Self {
        StripeConfig {
            splits: Splits::all(),
            block_configs: ALL_BLOCK_CONFIGS.to_vec(),
            block_width_multiplier: MultiplierRange::UNBOUNDED,
            block_height_multiplier: MultiplierRange::UNBOUNDED,
            ifm_depth_multiplier: MultiplierRange::UNBOUNDED,
            ofm_depth_multiplier: MultiplierRange::UNBOUNDED,
            plan_types: PlanTypes {
                beginning: true,
                middle: true,
                end: true,
                lonely: true,
            },
        }
    }
}

impl StripeConfig {
    /// Narrows this config to what is permitted at `priority`.
    pub fn for_priority(&self, priority: PlanPriority) -> StripeConfig {
        let mut result = self.clone();
        if priority == PlanPriority::High {
            for split in all::<Split>().filter(Split::splits_input_depth) {
                result.splits.set(split, false);
            }
        }
        result
    }

    pub fn disable_all_splits(&mut self) {
        self.splits = Splits::empty();
    }

    /// Keeps only the block configs for which `keep` returns true.
    fn multiplier_mut(&mut self, kind: MultiplierKind) -> &mut MultiplierRange {
        match kind {
            MultiplierKind::BlockWidth => &mut self.block_width_multiplier,
            MultiplierKind::BlockHeight => &mut self.block_height_multiplier,
            MultiplierKind::IfmDepth => &mut self.ifm_depth_multiplier,
            MultiplierKind::OfmDepth => &mut self.ofm_depth_multiplier,
        }
    }

    fn apply(&mut self, directive: &Directive) {
        match directive {
            Directive::DisableAll => {
                self.disable_all_splits();
                self.block_configs.clear();
                self.plan_types = PlanTypes {
                    beginning: false,
                    middle: false,
                    end: false,
                    lonely: false,
                };
            }
            Directive::DisableAllSplits => self.disable_all_splits(),
            Directive::DisableAllBlockConfigs => self.block_configs.clear(),
            Directive::Split(split, enabled) => self.splits.set(*split, *enabled),
            Directive::BlockConfig(block_config, enabled) => {
                self.block_configs.retain(|b| b != block_config);
                if *enabled {
                    self.block_configs.push(*block_config);
                }
            }
            Directive::MultiplierMin(kind, v) => self.multiplier_mut(*kind).min = *v,
            Directive::MultiplierMax(kind, v) => self.multiplier_mut(*kind).max = *v,
            Directive::PlanType(cascade_type, enabled) => {
                self.plan_types.set(*cascade_type, *enabled)
            }
        }
    }
}

impl MultiplierKind {
    fn key(&self) -> &'static str {
        match self {
            MultiplierKind::BlockWidth => "BlockWidthMultiplier",
            MultiplierKind::BlockHeight => "BlockHeightMultiplier",
            MultiplierKind::IfmDepth => "IfmDepthMultiplier",
            MultiplierKind::OfmDepth => "OfmDepthMultiplier",
        }
    }
}

impl StripeConfigFile {
    /// Loads the file named by the `NPU_CASCADE_STRIPE_CONFIG` environment
    /// variable, if set.
    pub fn from_env() -> Result<Option<Self>, StripeConfigError> {
        match std::env::var_os(STRIPE_CONFIG_ENV_VAR) {
            Some(path) => StripeConfigFile::load(Path::new(&path)).map(Some),
            None => Ok(None),
        }
    }

    pub fn load(path: &Path) -> Result<Self, StripeConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| StripeConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        contents.parse()
    }

    /// Returns the config for a part named `part_name`.
    pub fn config_for(&self, part_name: &str) -> StripeConfig {
        let mut config = StripeConfig::default();
        for (pattern, directives) in &self.sections {
            if glob_match(pattern, part_name) {
                debug!("Applying stripe config section {pattern} to {part_name}");
                for directive in directives {
                    config.apply(directive);
                }
            }
        }
        config
    }
}

impl std::str::FromStr for StripeConfigFile {
    type Err = StripeConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut sections: Vec<(String, Vec<Directive>)> = Vec::new();
        for (idx, raw_line) in s.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some(pattern) = line.strip_suffix(':') {
                sections.push((pattern.trim().to_string(), vec![]));
                continue;
            }
            let directive = parse_directive(line).map_err(|message| StripeConfigError::Syntax {
                line: line_no,
                message,
            })?;
            match sections.last_mut() {
                Some((_, directives)) => directives.push(directive),
                None => {
                    return Err(StripeConfigError::Syntax {
                        line: line_no,
                        message: "setting outside of any section".to_string(),
                    })
                }
            }
        }
        Ok(StripeConfigFile { sections })
    }
}

fn parse_directive(line: &str) -> Result<Directive, String> {
    match line {
        "DisableAll" => return Ok(Directive::DisableAll),
        "DisableAllSplits" => return Ok(Directive::DisableAllSplits),
        "DisableAllBlockConfigs" => return Ok(Directive::DisableAllBlockConfigs),
        _ => {}
    }
    let (key, value) = line
        .split_once('=')
        .map(|(k, v)| (k.trim(), v.trim()))
        .ok_or_else(|| format!("expected Key=Value, found {line:?}"))?;

    if let Some(name) = key.strip_prefix("Splits.") {
        let split = all::<Split>()
            .find(|s| s.name() == name)
            .ok_or_else(|| format!("unknown split {name:?}"))?;
        return Ok(Directive::Split(split, parse_bool(value)?));
    }
    if let Some(name) = key.strip_prefix("PlanTypes.") {
        let cascade_type = all::<CascadeType>()
            .find(|c| c.name() == name)
            .ok_or_else(|| format!("unknown plan type {name:?}"))?;
        return Ok(Directive::PlanType(cascade_type, parse_bool(value)?));
    }
    if let Some(dims) = key
        .strip_prefix("BlockConfig(")
        .and_then(|r| r.strip_suffix(')'))
    {
        let (w, h) = dims
            .split_once(',')
            .ok_or_else(|| format!("malformed block config {key:?}"))?;
        let block_config = BlockConfig::new(parse_uint(w.trim())?, parse_uint(h.trim())?);
        if !ALL_BLOCK_CONFIGS.contains(&block_config) {
            return Err(format!("unsupported block config {block_config}"));
        }
        return Ok(Directive::BlockConfig(block_config, parse_bool(value)?));
    }
    for kind in all::<MultiplierKind>() {
        if let Some(bound) = key.strip_prefix(kind.key()) {
            return match bound {
                ".Min" => Ok(Directive::MultiplierMin(kind, parse_uint(value)?)),
                ".Max" => Ok(Directive::MultiplierMax(kind, parse_uint(value)?)),
                _ => Err(format!("unknown multiplier bound {bound:?}")),
            };
        }
    }
    Err(format!("unknown key {key:?}"))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "True" | "true" | "1" => Ok(true),
        "False" | "false" | "0" => Ok(false),
        _ => Err(format!("expected True or False, found {value:?}")),
    }
}

fn parse_uint(value: &str) -> Result<u32, String> {
    value
        .parse()
        .map_err(|_| format!("expected an unsigned integer, found {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = "
        # Comment
        *:
        DisableAllSplits
        Splits.MceAndPleOutputHeight=True
        Splits.None=True

        conv_*:
        BlockConfig(16,16)=False
        BlockWidthMultiplier.Max=2
        PlanTypes.Beginning=False
    ";

    #[test]
    fn test_sections_apply_by_pattern() {
        let file: StripeConfigFile = EXAMPLE.parse().unwrap();

        let pool = file.config_for("pool_1");
        assert_eq!(
            pool.splits.iter().collect::<Vec<_>>(),
            vec![Split::MceAndPleOutputHeight, Split::None]
        );
        assert_eq!(pool.block_configs.len(), ALL_BLOCK_CONFIGS.len());
        assert!(pool.plan_types.beginning);

        let conv = file.config_for("conv_3");
        assert!(!conv.block_configs.contains(&BlockConfig::new(16, 16)));
        assert_eq!(conv.block_width_multiplier.max, 2);
        assert!(!conv.plan_types.allows(CascadeType::Beginning));
        assert!(conv.plan_types.allows(CascadeType::Lonely));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = "*:\nSplits.Diagonal=True\n"
            .parse::<StripeConfigFile>()
            .unwrap_err();
        assert!(matches!(err, StripeConfigError::Syntax { line: 2, .. }));
    }

    #[test]
    fn test_setting_outside_section_is_rejected() {
        assert!("DisableAll\n".parse::<StripeConfigFile>().is_err());
    }

    #[test]
    fn test_high_priority_excludes_input_depth_splits() {
        let high = StripeConfig::default().for_priority(PlanPriority::High);
        assert!(!high.splits.contains(Split::OutputDepthInputDepth));
        assert!(high.splits.contains(Split::WidthHeight));
        let low = StripeConfig::default().for_priority(PlanPriority::Low);
        assert_eq!(low, StripeConfig::default());
    }

    #[test]
    fn test_load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"*:\nDisableAllBlockConfigs\nBlockConfig(8,8)=True\n")
            .unwrap();
        let parsed = StripeConfigFile::load(file.path()).unwrap();
        assert_eq!(
            parsed.config_for("x").block_configs,
            vec![BlockConfig::new(8, 8)]
        );
    }
}
