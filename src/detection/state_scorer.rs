use super::references::{ReferenceImage, ReferenceSet};
use super::scorer::{FrameScorer, PreparedFrame};
use super::types::{AgentState, MatchResult, ScoreMap};

/// Best match among a state's references. Ties keep the first-loaded
/// reference; a state with no references scores zero with no rectangle.
pub fn score_state(
    scorer: &FrameScorer,
    frame: &PreparedFrame,
    state: AgentState,
    references: &[ReferenceImage],
) -> MatchResult {
    let mut best = MatchResult::empty(state);

    for reference in references {
        let score = scorer.score(frame, reference);
        if score.confidence > best.confidence {
            best = MatchResult {
                state,
                confidence: score.confidence,
                rect: score.rect,
                reference_id: Some(reference.id().to_string()),
            };
        }
    }

    best
}

/// Scores every enabled state independently against one frame.
pub fn score_all(scorer: &FrameScorer, frame: &PreparedFrame, set: &ReferenceSet) -> ScoreMap {
    set.enabled_states()
        .map(|state| {
            (
                state,
                score_state(scorer, frame, state, set.references(state)),
            )
        })
        .collect()
}
