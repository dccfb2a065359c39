//! Resolves per-state confidences for one frame into a single raw state.
//!
//! Rules, in order:
//! 1. states below `threshold` are discarded; nothing left means `Unknown`;
//! 2. `RunCommand` above threshold always wins, even against a higher score;
//! 3. a lone surviving state wins;
//! 4. otherwise the top state wins only if it leads the runner-up by at least
//!    `min_gap`, else the frame is ambiguous and reported as `Unknown`.
//!
//! The arbiter is stateless: identical inputs always produce identical output.

use super::types::{AgentState, MatchResult, ScoreMap};

/// Absorbs float noise when a gap sits exactly on `min_gap` (0.9 - 0.8 < 0.1).
const GAP_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArbiterConfig {
    pub threshold: f64,
    pub min_gap: f64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            min_gap: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arbitration {
    pub state: AgentState,
    pub winner: Option<MatchResult>,
    pub ambiguous: bool,
}

impl Arbitration {
    fn unknown(ambiguous: bool) -> Self {
        Self {
            state: AgentState::Unknown,
            winner: None,
            ambiguous,
        }
    }

    fn decided(winner: &MatchResult) -> Self {
        Self {
            state: winner.state,
            winner: Some(winner.clone()),
            ambiguous: false,
        }
    }
}

pub fn arbitrate(scores: &ScoreMap, config: &ArbiterConfig) -> Arbitration {
    let mut valid: Vec<&MatchResult> = scores
        .values()
        .filter(|m| m.state != AgentState::Unknown && m.confidence >= config.threshold)
        .collect();

    if valid.is_empty() {
        return Arbitration::unknown(false);
    }

    if let Some(run_command) = valid.iter().find(|m| m.state == AgentState::RunCommand) {
        return Arbitration::decided(run_command);
    }

    if valid.len() == 1 {
        return Arbitration::decided(valid[0]);
    }

    valid.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.state.cmp(&b.state))
    });

    let gap = valid[0].confidence - valid[1].confidence;
    if gap + GAP_TOLERANCE >= config.min_gap {
        Arbitration::decided(valid[0])
    } else {
        Arbitration::unknown(true)
    }
}
