//! Per-state reference images, loaded once from a directory-per-state layout.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::GrayImage;
use log::{info, warn};

use super::scorer::TemplatePyramid;
use super::types::AgentState;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("no usable reference images for required state '{state}' (looked in {dir})")]
    MissingRequired { state: AgentState, dir: String },
    #[error("reference directory configured for unsupported state '{0}'")]
    UnsupportedState(String),
}

#[derive(Debug, Clone)]
pub struct ReferenceImage {
    id: String,
    state: AgentState,
    pixels: GrayImage,
    pyramid: TemplatePyramid,
}

impl ReferenceImage {
    pub fn new(
        id: impl Into<String>,
        state: AgentState,
        pixels: GrayImage,
        pyramid_levels: usize,
    ) -> Self {
        let pyramid = TemplatePyramid::build(&pixels, pyramid_levels.max(1));
        Self {
            id: id.into(),
            state,
            pixels,
            pyramid,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    pub fn pyramid(&self) -> &TemplatePyramid {
        &self.pyramid
    }
}

/// Immutable for the lifetime of a run; shared between cycles without locking.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    by_state: BTreeMap<AgentState, Vec<ReferenceImage>>,
}

impl ReferenceSet {
    /// Loads every image under each configured state directory, in file-name
    /// order. Unreadable files are skipped with a warning; a required state
    /// (idle, active) left without references is a startup error.
    pub fn load(dirs: &BTreeMap<String, PathBuf>, pyramid_levels: usize) -> Result<Self> {
        let mut by_state: BTreeMap<AgentState, Vec<ReferenceImage>> = BTreeMap::new();

        for (name, dir) in dirs {
            let state = match name.parse::<AgentState>() {
                Ok(AgentState::Unknown) | Err(_) => {
                    return Err(ReferenceError::UnsupportedState(name.clone()).into())
                }
                Ok(state) => state,
            };
            let images = load_directory(state, dir, pyramid_levels)?;
            by_state.entry(state).or_default().extend(images);
        }

        for state in [AgentState::Idle, AgentState::Active] {
            if by_state.get(&state).map_or(true, Vec::is_empty) {
                let dir = dirs
                    .iter()
                    .find(|(name, _)| name.parse::<AgentState>().ok() == Some(state))
                    .map(|(_, dir)| dir.display().to_string())
                    .unwrap_or_else(|| "<not configured>".into());
                return Err(ReferenceError::MissingRequired { state, dir }.into());
            }
        }

        if by_state
            .get(&AgentState::RunCommand)
            .map_or(true, Vec::is_empty)
        {
            warn!("No run_command references loaded; state disabled for this run");
        }

        let set = Self { by_state };
        info!(
            "Loaded {} reference images across {} states",
            set.len(),
            set.enabled_states().count()
        );
        Ok(set)
    }

    pub fn from_images(images: impl IntoIterator<Item = ReferenceImage>) -> Self {
        let mut by_state: BTreeMap<AgentState, Vec<ReferenceImage>> = BTreeMap::new();
        for image in images {
            by_state.entry(image.state).or_default().push(image);
        }
        Self { by_state }
    }

    pub fn references(&self, state: AgentState) -> &[ReferenceImage] {
        self.by_state
            .get(&state)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// States with at least one reference, in state order.
    pub fn enabled_states(&self) -> impl Iterator<Item = AgentState> + '_ {
        self.by_state
            .iter()
            .filter(|(_, images)| !images.is_empty())
            .map(|(state, _)| *state)
    }

    pub fn len(&self) -> usize {
        self.by_state.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load_directory(
    state: AgentState,
    dir: &Path,
    pyramid_levels: usize,
) -> Result<Vec<ReferenceImage>> {
    if !dir.is_dir() {
        warn!(
            "Reference directory for {} does not exist: {}",
            state,
            dir.display()
        );
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to list reference directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_image_file(path))
        .collect();
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        match image::open(&path) {
            Ok(decoded) => {
                let pixels = decoded.to_luma8();
                if pixels.width() == 0 || pixels.height() == 0 {
                    warn!("Skipping empty reference image {}", path.display());
                    continue;
                }
                info!(
                    "Loaded {} reference {} ({}x{})",
                    state,
                    id,
                    pixels.width(),
                    pixels.height()
                );
                images.push(ReferenceImage::new(id, state, pixels, pyramid_levels));
            }
            Err(err) => warn!("Skipping unreadable reference {}: {err}", path.display()),
        }
    }

    Ok(images)
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}
