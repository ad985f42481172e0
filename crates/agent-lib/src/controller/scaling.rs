//! Scaling policy
//!
//! Pure function of an observed context so it can be tested without a
//! running fleet.

use serde::{Deserialize, Serialize};

/// What the controller should do this round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScalingDecision {
    None,
    /// Launch this many new glideins
    ScaleUp { count: u32 },
    /// Drain these idle workers
    ScaleDown { workers: Vec<String> },
}

impl ScalingDecision {
    pub fn name(&self) -> &'static str {
        match self {
            ScalingDecision::None => "none",
            ScalingDecision::ScaleUp { .. } => "scale_up",
            ScalingDecision::ScaleDown { .. } => "scale_down",
        }
    }

    /// Glideins launched or drained
    pub fn count(&self) -> usize {
        match self {
            ScalingDecision::None => 0,
            ScalingDecision::ScaleUp { count } => *count as usize,
            ScalingDecision::ScaleDown { workers } => workers.len(),
        }
    }
}

/// Observed state of one partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingContext {
    /// Idle jobs in the queue
    pub demand: u32,
    /// Launched glideins not yet advertised
    pub pending: u32,
    /// Live advertised records
    pub advertised: u32,
    /// Launched glideins that have not terminated
    pub live: u32,
    /// Idle workers accepting work, longest idle first
    pub idle_workers: Vec<String>,
    pub slots_per_glidein: u32,
    pub max_glideins: u32,
    /// Idle glideins kept beyond demand before draining
    pub hysteresis: u32,
}

impl ScalingContext {
    /// Counts can disagree while launches and expiries are in flight; take
    /// the larger one so the cap is never exceeded.
    pub fn total_glideins(&self) -> u32 {
        self.live.max(self.pending + self.advertised)
    }

    /// Jobs the current idle and pending glideins can absorb
    pub fn supply(&self) -> u32 {
        (self.pending + self.idle_workers.len() as u32) * self.slots()
    }

    fn slots(&self) -> u32 {
        self.slots_per_glidein.max(1)
    }
}

pub fn evaluate(context: &ScalingContext) -> ScalingDecision {
    let slots = context.slots();
    let supply = context.supply();

    if context.demand > supply {
        let needed = (context.demand - supply).div_ceil(slots);
        let headroom = context
            .max_glideins
            .saturating_sub(context.total_glideins());
        let count = needed.min(headroom);
        return if count == 0 {
            ScalingDecision::None
        } else {
            ScalingDecision::ScaleUp { count }
        };
    }

    let wanted_idle = context.demand.div_ceil(slots) as usize;
    let excess = context.idle_workers.len().saturating_sub(wanted_idle);
    let margin = context.hysteresis as usize;
    if excess > margin {
        let workers = context.idle_workers[..excess - margin].to_vec();
        return ScalingDecision::ScaleDown { workers };
    }
    ScalingDecision::None
}
