use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

/// Operating state of the monitored agent.
///
/// `Unknown` is both the initial state and the "no confident decision" answer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Active,
    RunCommand,
    #[default]
    Unknown,
}

impl AgentState {
    /// States that can be backed by reference images.
    pub const DETECTABLE: [AgentState; 3] =
        [AgentState::Idle, AgentState::Active, AgentState::RunCommand];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Active => "active",
            AgentState::RunCommand => "run_command",
            AgentState::Unknown => "unknown",
        }
    }

    /// Idle and RunCommand both mean the user is being waited on.
    pub fn is_alerting(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::RunCommand)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentState {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "idle" => Ok(AgentState::Idle),
            "active" | "generating" => Ok(AgentState::Active),
            "run_command" => Ok(AgentState::RunCommand),
            "unknown" => Ok(AgentState::Unknown),
            other => Err(anyhow!("unknown agent state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Best match of one state's references against one frame.
///
/// Confidences of different states are computed independently; resolving
/// overlap between them is the arbiter's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub state: AgentState,
    pub confidence: f64,
    pub rect: Option<MatchRect>,
    pub reference_id: Option<String>,
}

impl MatchResult {
    pub fn empty(state: AgentState) -> Self {
        Self {
            state,
            confidence: 0.0,
            rect: None,
            reference_id: None,
        }
    }
}

pub type ScoreMap = BTreeMap<AgentState, MatchResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Template,
    Text,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Template => "template",
            DetectionMethod::Text => "text",
        }
    }
}

/// Raw, single-frame classification produced by a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub state: AgentState,
    pub confidence: Option<f64>,
    pub rect: Option<MatchRect>,
    pub method: DetectionMethod,
    pub scores: ScoreMap,
    /// More than one state passed the threshold but none won by the gap.
    pub ambiguous: bool,
}

impl Detection {
    pub fn unknown(method: DetectionMethod) -> Self {
        Self {
            state: AgentState::Unknown,
            confidence: None,
            rect: None,
            method,
            scores: ScoreMap::new(),
            ambiguous: false,
        }
    }
}

/// One captured screen image in 8-bit luma. Cloning shares the pixel buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: Arc<GrayImage>,
    captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(pixels: GrayImage, captured_at: DateTime<Utc>) -> Self {
        Self {
            pixels: Arc::new(pixels),
            captured_at,
        }
    }

    pub fn from_dynamic(image: &DynamicImage, captured_at: DateTime<Utc>) -> Self {
        Self::new(image.to_luma8(), captured_at)
    }

    pub fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}
