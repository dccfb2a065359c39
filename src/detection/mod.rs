//! Frame classification: reference images, template scoring, arbitration and
//! the temporal stability filter.

pub mod arbiter;
pub mod detector;
pub mod references;
pub mod scorer;
pub mod stability;
pub mod state_scorer;
pub mod types;

pub use arbiter::{arbitrate, ArbiterConfig, Arbitration};
pub use detector::{FallbackDetector, StateDetector, TemplateDetector, TextDetector, TextRecognizer};
pub use references::{ReferenceError, ReferenceImage, ReferenceSet};
pub use scorer::FrameScorer;
pub use stability::{DetectionHistoryEntry, StabilityFilter};
pub use types::{AgentState, Detection, DetectionMethod, Frame, MatchRect, MatchResult, ScoreMap};
