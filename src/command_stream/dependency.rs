//! Stripe ratios between agents.
//!
//! Which formula relates two agents depends only on their kinds, and is
//! looked up in [RULES].

use log::debug;

use crate::command_stream::{AgentKind, Dependency, DependencyRatio};
use crate::utils::{div_round_up, gcd};

/// How the stripes of a producer and a consumer correspond.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rule {
    /// Per-axis ceiling ratios over the stripe counts both agents share.
    Axes,
    /// [Rule::Axes] against the consumer's input-side counts, with halo rows
    /// and columns forcing the boundary flag.
    MceInput,
    /// Weight stripes against MCE stripes, over totals.
    Weights,
    /// MCE output blocks into the PLE, accumulated over input depth.
    MceToPle,
    /// Through DRAM: the consumer waits for all of the producer.
    WholeProducer,
    /// A kernel load gates every stripe of its scheduler.
    KernelLoad,
}

pub const RULES: [(AgentKind, AgentKind, Rule); 10] = [
    (AgentKind::IfmStreamer, AgentKind::MceScheduler, Rule::MceInput),
    (AgentKind::IfmStreamer, AgentKind::PleScheduler, Rule::Axes),
    (AgentKind::WgtStreamer, AgentKind::MceScheduler, Rule::Weights),
    (AgentKind::MceScheduler, AgentKind::PleScheduler, Rule::MceToPle),
    (AgentKind::PleLoader, AgentKind::PleScheduler, Rule::KernelLoad),
    (AgentKind::PleScheduler, AgentKind::MceScheduler, Rule::MceInput),
    (AgentKind::PleScheduler, AgentKind::PleScheduler, Rule::Axes),
    (AgentKind::PleScheduler, AgentKind::OfmStreamer, Rule::Axes),
    (AgentKind::OfmStreamer, AgentKind::IfmStreamer, Rule::WholeProducer),
    (AgentKind::OfmStreamer, AgentKind::WgtStreamer, Rule::WholeProducer),
];

pub fn rule_for(producer: AgentKind, consumer: AgentKind) -> Option<Rule> {
    RULES
        .iter()
        .find(|(p, c, _)| *p == producer && *c == consumer)
        .map(|(_, _, rule)| *rule)
}

/// The stripe structure of one side of a dependency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StripeCounts {
    /// Stripes in H, W and C as seen by the other agent.
    pub axes: [u32; 3],
    pub total: u32,
}

/// Ratios and boundary for a consumer that depends on a producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatioInfo {
    pub outer: DependencyRatio,
    pub inner: DependencyRatio,
    pub boundary: bool,
}

impl StripeCounts {
    pub fn new(axes: [u32; 3], total: u32) -> Self {
        StripeCounts { axes, total }
    }

    /// Counts whose only axis is the total.
    pub fn flat(total: u32) -> Self {
        StripeCounts {
            axes: [1, 1, total],
            total,
        }
    }
}

impl RatioInfo {
    pub fn with_id(&self, relative_agent_id: u8) -> Dependency {
        Dependency {
            relative_agent_id,
            outer_ratio: self.outer,
            inner_ratio: self.inner,
            boundary: u8::from(self.boundary),
        }
    }
}

fn outer_ratio(producer_total: u32, consumer_total: u32) -> DependencyRatio {
    let g = gcd(producer_total, consumer_total).max(1);
    DependencyRatio::new(producer_total / g, consumer_total / g)
}

/// The general rule. For each axis with producer count `p` and consumer count
/// `c`, the consumer advances `ceil(c / p)` stripes per producer stripe, a
/// producer finer than the consumer contributes `ceil(p / c)` stripes per
/// consumer stripe, and any axis where `p` does not divide `c` leaves edge
/// stripes needing the next producer stripe.
pub fn ratio_dependency(producer: &StripeCounts, consumer: &StripeCounts) -> RatioInfo {
    let mut inner = DependencyRatio::new(1, 1);
    let mut boundary = false;
    for (&p, &c) in producer.axes.iter().zip(&consumer.axes) {
        let (p, c) = (p.max(1), c.max(1));
        inner.this *= div_round_up(c, p);
        if p > c {
            inner.other *= div_round_up(p, c);
        }
        boundary |= c % p != 0;
    }
    RatioInfo {
        outer: outer_ratio(producer.total, consumer.total),
        inner,
        boundary,
    }
}

/// Whole-producer rule: nothing of the consumer starts until every producer
/// stripe is done.
pub fn whole_producer(producer_total: u32, consumer_total: u32) -> RatioInfo {
    RatioInfo {
        outer: DependencyRatio::new(producer_total, consumer_total),
        inner: DependencyRatio::new(producer_total, consumer_total),
        boundary: false,
    }
}

pub fn kernel_load(consumer_total: u32) -> RatioInfo {
    RatioInfo {
        outer: DependencyRatio::new(1, consumer_total),
        inner: DependencyRatio::new(1, consumer_total),
        boundary: false,
    }
}

/// Weight stripes gating MCE stripes, by the totals of each. Also evaluates
/// the channel-count rule (one weight stripe per output plane of a single
/// input-depth stripe, otherwise one per MCE stripe) and logs where the two
/// disagree.
pub fn weight_dependency(
    weight_total: u32,
    mce_total: u32,
    mce_ifm_channel_stripes: u32,
    mce_ofm_plane_stripes: u32,
) -> (RatioInfo, bool) {
    let info = ratio_dependency(&StripeCounts::flat(weight_total), &StripeCounts::flat(mce_total));
    let by_channels = if mce_ifm_channel_stripes == 1 {
        DependencyRatio::new(1, mce_ofm_plane_stripes)
    } else {
        DependencyRatio::new(1, 1)
    };
    let agree = by_channels == info.inner;
    if !agree {
        debug!(
            "Weight dependency rules disagree: {}:{} by totals, {}:{} by channel count \
             ({} weight stripes, {} MCE stripes, {} input depth stripes)",
            info.inner.other,
            info.inner.this,
            by_channels.other,
            by_channels.this,
            weight_total,
            mce_total,
            mce_ifm_channel_stripes
        );
    }
    (info, agree)
}

/// Sets the boundary flag of an MCE input dependency when the kernel reads
/// past a split stripe edge.
pub fn with_halo(mut info: RatioInfo, needs_halo: bool) -> RatioInfo {
    info.boundary |= needs_halo;
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use enum_iterator::all;
    use proptest::prelude::*;

    #[test]
    fn test_rules_are_unique() {
        for (i, (p, c, _)) in RULES.iter().enumerate() {
            assert!(RULES[i + 1..].iter().all(|(p2, c2, _)| (p, c) != (p2, c2)));
        }
    }

    #[test]
    fn test_only_streamers_cross_dram() {
        for producer in all::<AgentKind>() {
            for consumer in all::<AgentKind>() {
                if rule_for(producer, consumer) == Some(Rule::WholeProducer) {
                    assert!(producer.is_streamer() && consumer.is_streamer());
                }
            }
        }
        assert_eq!(rule_for(AgentKind::MceScheduler, AgentKind::OfmStreamer), None);
    }

    #[test]
    fn test_matching_stripes_are_one_to_one() {
        let counts = StripeCounts::new([4, 1, 2], 8);
        let info = ratio_dependency(&counts, &counts);
        assert_eq!(info.outer, DependencyRatio::new(1, 1));
        assert_eq!(info.inner, DependencyRatio::new(1, 1));
        assert!(!info.boundary);
    }

    #[test]
    fn test_finer_producer() {
        let info = ratio_dependency(
            &StripeCounts::new([4, 1, 1], 4),
            &StripeCounts::new([2, 1, 1], 2),
        );
        assert_eq!(info.outer, DependencyRatio::new(2, 1));
        assert_eq!(info.inner, DependencyRatio::new(2, 1));
        assert!(info.boundary);
    }

    #[test]
    fn test_weight_rules_agree_for_single_depth_stripe() {
        // 2 output channel stripes, 2x2 output planes.
        let (info, agree) = weight_dependency(2, 8, 1, 4);
        assert_eq!(info.inner, DependencyRatio::new(1, 4));
        assert!(agree);
    }

    #[test]
    fn test_weight_rules_disagree_when_weights_stay_resident() {
        // 2 input depth stripes x 2 output channel stripes of weights held
        // for all 2x2 output planes: 16 MCE stripes.
        let (info, agree) = weight_dependency(4, 16, 2, 4);
        assert_eq!(info.inner, DependencyRatio::new(1, 4));
        assert!(!agree);
        // Reloaded per plane, the totals line up again.
        let (info, agree) = weight_dependency(16, 16, 2, 4);
        assert_eq!(info.inner, DependencyRatio::new(1, 1));
        assert!(agree);
    }

    #[test]
    fn test_halo_sets_boundary() {
        let counts = StripeCounts::new([4, 1, 1], 4);
        assert!(!ratio_dependency(&counts, &counts).boundary);
        assert!(with_halo(ratio_dependency(&counts, &counts), true).boundary);
    }

    proptest! {
        #[test]
        fn test_single_axis_boundary_and_inner(p in 1u32..64, c in 1u32..64) {
            let info = ratio_dependency(
                &StripeCounts::new([p, 1, 1], p),
                &StripeCounts::new([c, 1, 1], c),
            );
            prop_assert_eq!(info.boundary, c % p != 0);
            prop_assert_eq!(info.inner.this, div_round_up(c, p));
            let g = gcd(p, c);
            prop_assert_eq!(info.outer, DependencyRatio::new(p / g, c / g));
        }

        #[test]
        fn test_inner_multiplies_across_axes(
            p in prop::array::uniform3(1u32..16),
            c in prop::array::uniform3(1u32..16),
        ) {
            let total = |a: [u32; 3]| a.iter().product::<u32>();
            let info = ratio_dependency(
                &StripeCounts::new(p, total(p)),
                &StripeCounts::new(c, total(c)),
            );
            let expected: u32 = p.iter().zip(&c).map(|(&p, &c)| div_round_up(c, p)).product();
            prop_assert_eq!(info.inner.this, expected);
            prop_assert_eq!(info.boundary, p.iter().zip(&c).any(|(&p, &c)| c % p != 0));
        }
    }
}
