use std::sync::Arc;

use anyhow::Result;
use log::warn;

use super::arbiter::{arbitrate, ArbiterConfig};
use super::references::ReferenceSet;
use super::scorer::FrameScorer;
use super::state_scorer::score_all;
use super::types::{AgentState, Detection, DetectionMethod, Frame};

const ENABLE_LOGS: bool = true;

use crate::log_debug;

/// Anything that can turn one frame into a raw classification.
pub trait StateDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, frame: &Frame) -> Result<Detection>;
}

/// Source of on-screen text for a frame (an OCR engine, usually external).
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, frame: &Frame) -> Result<String>;
}

pub struct TemplateDetector {
    references: Arc<ReferenceSet>,
    scorer: FrameScorer,
    arbiter: ArbiterConfig,
}

impl TemplateDetector {
    pub fn new(references: Arc<ReferenceSet>, scorer: FrameScorer, arbiter: ArbiterConfig) -> Self {
        Self {
            references,
            scorer,
            arbiter,
        }
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }
}

impl StateDetector for TemplateDetector {
    fn name(&self) -> &'static str {
        "template"
    }

    fn detect(&self, frame: &Frame) -> Result<Detection> {
        let prepared = self.scorer.prepare(frame);
        let scores = score_all(&self.scorer, &prepared, &self.references);
        let arbitration = arbitrate(&scores, &self.arbiter);

        // without a winner the display still gets the closest score
        let (confidence, rect) = match &arbitration.winner {
            Some(winner) => (Some(winner.confidence), winner.rect),
            None => (
                scores
                    .values()
                    .map(|m| m.confidence)
                    .max_by(f64::total_cmp),
                None,
            ),
        };

        log_debug!(
            "template scores: {}",
            scores
                .values()
                .map(|m| format!("{}={:.3}", m.state, m.confidence))
                .collect::<Vec<_>>()
                .join(" ")
        );

        Ok(Detection {
            state: arbitration.state,
            confidence,
            rect,
            method: DetectionMethod::Template,
            scores,
            ambiguous: arbitration.ambiguous,
        })
    }
}

/// Keyword rule over recognised text: any idle keyword means `Idle`,
/// anything else means `Active`. Recogniser errors yield `Unknown`.
pub struct TextDetector<R> {
    recognizer: R,
    idle_keywords: Vec<String>,
}

impl<R: TextRecognizer> TextDetector<R> {
    pub fn new(recognizer: R, idle_keywords: &[String]) -> Self {
        Self {
            recognizer,
            idle_keywords: idle_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    fn classify(&self, text: &str) -> AgentState {
        let text = text.to_lowercase();
        if self.idle_keywords.iter().any(|k| text.contains(k.as_str())) {
            AgentState::Idle
        } else {
            AgentState::Active
        }
    }
}

impl<R: TextRecognizer> StateDetector for TextDetector<R> {
    fn name(&self) -> &'static str {
        "text"
    }

    fn detect(&self, frame: &Frame) -> Result<Detection> {
        let mut detection = Detection::unknown(DetectionMethod::Text);
        match self.recognizer.recognize(frame) {
            Ok(text) => detection.state = self.classify(&text),
            Err(err) => warn!("text recognition failed: {err:#}"),
        }
        Ok(detection)
    }
}

/// Template detection first; the secondary detector is only asked when the
/// primary saw nothing above threshold. An ambiguous primary frame stays
/// `Unknown`, and the secondary may only answer `Idle` or `Active`.
pub struct FallbackDetector {
    primary: Box<dyn StateDetector>,
    fallback: Option<Box<dyn StateDetector>>,
}

impl FallbackDetector {
    pub fn new(primary: Box<dyn StateDetector>, fallback: Option<Box<dyn StateDetector>>) -> Self {
        Self { primary, fallback }
    }
}

impl StateDetector for FallbackDetector {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    fn detect(&self, frame: &Frame) -> Result<Detection> {
        let primary = self.primary.detect(frame)?;
        let Some(fallback) = &self.fallback else {
            return Ok(primary);
        };
        if primary.state != AgentState::Unknown || primary.ambiguous {
            return Ok(primary);
        }

        match fallback.detect(frame) {
            Ok(secondary) if matches!(secondary.state, AgentState::Idle | AgentState::Active) => {
                Ok(Detection {
                    state: secondary.state,
                    confidence: None,
                    rect: None,
                    method: secondary.method,
                    scores: primary.scores,
                    ambiguous: false,
                })
            }
            Ok(_) => Ok(primary),
            Err(err) => {
                warn!("{} detector failed, keeping primary result: {err:#}", fallback.name());
                Ok(primary)
            }
        }
    }
}
