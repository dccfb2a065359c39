//! Zero-mean normalised cross-correlation between a frame and a reference.
//!
//! Window statistics come from integral images so each candidate position
//! costs one pass over the template. An optional image pyramid runs the
//! exhaustive search at the coarsest level and refines the best position on
//! the way back to full resolution.

use image::{
    imageops::{self, FilterType},
    GrayImage,
};

use super::references::ReferenceImage;
use super::types::{Frame, MatchRect};

/// Levels whose shorter side would drop below this are not built.
const MIN_PYRAMID_SIDE: u32 = 4;
/// Search radius (in pixels of the finer level) around an upsampled match.
const REFINE_RADIUS: i64 = 2;
/// Per-pixel variance below which a patch counts as uniform.
const FLAT_VARIANCE_PER_PIXEL: f64 = 1e-3;
const FLAT_MEAN_TOLERANCE: f64 = 1.0;

/// Mean-centred reference pixels, ready for correlation.
#[derive(Debug, Clone)]
pub struct Template {
    width: u32,
    height: u32,
    centered: Vec<f64>,
    mean: f64,
    energy: f64,
}

impl Template {
    pub fn from_gray(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let raw = image.as_raw();
        let count = raw.len().max(1) as f64;
        let mean = raw.iter().map(|&p| f64::from(p)).sum::<f64>() / count;
        let centered: Vec<f64> = raw.iter().map(|&p| f64::from(p) - mean).collect();
        let energy = centered.iter().map(|v| v * v).sum();

        Self {
            width,
            height,
            centered,
            mean,
            energy,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn pixel_count(&self) -> f64 {
        f64::from(self.width) * f64::from(self.height)
    }
}

/// Level 0 is full resolution; each further level halves both sides.
#[derive(Debug, Clone)]
pub struct TemplatePyramid {
    levels: Vec<Template>,
}

impl TemplatePyramid {
    pub fn build(image: &GrayImage, max_levels: usize) -> Self {
        let mut levels = vec![Template::from_gray(image)];
        let mut current = image.clone();

        while levels.len() < max_levels {
            let (width, height) = (current.width() / 2, current.height() / 2);
            if width < MIN_PYRAMID_SIDE || height < MIN_PYRAMID_SIDE {
                break;
            }
            current = imageops::resize(&current, width, height, FilterType::Triangle);
            levels.push(Template::from_gray(&current));
        }

        Self { levels }
    }

    pub fn base(&self) -> &Template {
        &self.levels[0]
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }
}

/// Pixels of one pyramid level plus summed-area tables of value and value².
struct Plane {
    width: u32,
    height: u32,
    data: Vec<f32>,
    sum: Vec<f64>,
    sq_sum: Vec<f64>,
}

impl Plane {
    fn from_gray(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let (w, h) = (width as usize, height as usize);
        let stride = w + 1;
        let data: Vec<f32> = image.as_raw().iter().map(|&p| f32::from(p)).collect();
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sq_sum = vec![0.0; stride * (h + 1)];

        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let value = f64::from(data[y * w + x]);
                row_sum += value;
                row_sq += value * value;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq_sum[(y + 1) * stride + x + 1] = sq_sum[y * stride + x + 1] + row_sq;
            }
        }

        Self {
            width,
            height,
            data,
            sum,
            sq_sum,
        }
    }

    fn fits(&self, template: &Template) -> bool {
        template.width > 0
            && template.height > 0
            && template.width <= self.width
            && template.height <= self.height
    }

    fn window(&self, x: u32, y: u32, width: u32, height: u32) -> (f64, f64) {
        let stride = self.width as usize + 1;
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = ((x + width) as usize, (y + height) as usize);
        let area = |table: &[f64]| {
            table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
                + table[y0 * stride + x0]
        };
        (area(&self.sum), area(&self.sq_sum))
    }

    fn correlate(&self, template: &Template, x: u32, y: u32) -> f64 {
        let n = template.pixel_count();
        let (sum, sq_sum) = self.window(x, y, template.width, template.height);
        let window_energy = (sq_sum - sum * sum / n).max(0.0);
        let flat_limit = FLAT_VARIANCE_PER_PIXEL * n;
        let template_flat = template.energy <= flat_limit;
        let window_flat = window_energy <= flat_limit;

        if template_flat || window_flat {
            // Correlation is undefined on uniform patches: equal levels match.
            let same_level = (sum / n - template.mean).abs() <= FLAT_MEAN_TOLERANCE;
            return if template_flat && window_flat && same_level {
                1.0
            } else {
                0.0
            };
        }

        let w = template.width as usize;
        let mut cross = 0.0;
        for ty in 0..template.height as usize {
            let start = (y as usize + ty) * self.width as usize + x as usize;
            let pixels = &self.data[start..start + w];
            let weights = &template.centered[ty * w..(ty + 1) * w];
            cross += weights
                .iter()
                .zip(pixels)
                .map(|(t, p)| t * f64::from(*p))
                .sum::<f64>();
        }

        (cross / (template.energy * window_energy).sqrt()).clamp(0.0, 1.0)
    }

    /// Raster-order search; the first position wins ties.
    fn search(&self, template: &Template, xs: (u32, u32), ys: (u32, u32)) -> (u32, u32, f64) {
        let mut best = (xs.0, ys.0, f64::NEG_INFINITY);
        for y in ys.0..=ys.1 {
            for x in xs.0..=xs.1 {
                let score = self.correlate(template, x, y);
                if score > best.2 {
                    best = (x, y, score);
                }
            }
        }
        best
    }

    fn max_origin(&self, template: &Template) -> (u32, u32) {
        (self.width - template.width, self.height - template.height)
    }
}

/// A frame converted once per cycle and reused for every reference.
pub struct PreparedFrame {
    levels: Vec<Plane>,
}

impl PreparedFrame {
    pub fn width(&self) -> u32 {
        self.levels[0].width
    }

    pub fn height(&self) -> u32 {
        self.levels[0].height
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameScore {
    pub confidence: f64,
    pub rect: Option<MatchRect>,
}

impl FrameScore {
    pub fn none() -> Self {
        Self {
            confidence: 0.0,
            rect: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameScorer {
    pyramid_levels: usize,
}

impl FrameScorer {
    /// `pyramid_levels == 1` searches every position at full resolution.
    pub fn new(pyramid_levels: usize) -> Self {
        Self {
            pyramid_levels: pyramid_levels.max(1),
        }
    }

    pub fn pyramid_levels(&self) -> usize {
        self.pyramid_levels
    }

    pub fn prepare(&self, frame: &Frame) -> PreparedFrame {
        let mut levels = vec![Plane::from_gray(frame.pixels())];
        let mut current: Option<GrayImage> = None;

        while levels.len() < self.pyramid_levels {
            let source = current.as_ref().unwrap_or(frame.pixels());
            let (width, height) = (source.width() / 2, source.height() / 2);
            if width < MIN_PYRAMID_SIDE || height < MIN_PYRAMID_SIDE {
                break;
            }
            let resized = imageops::resize(source, width, height, FilterType::Triangle);
            levels.push(Plane::from_gray(&resized));
            current = Some(resized);
        }

        PreparedFrame { levels }
    }

    /// Best-match confidence in `[0, 1]` and the top-left rectangle achieving it.
    pub fn score(&self, frame: &PreparedFrame, reference: &ReferenceImage) -> FrameScore {
        let pyramid = reference.pyramid();
        let base = pyramid.base();
        if !frame.levels[0].fits(base) {
            return FrameScore::none();
        }

        let mut level = self
            .pyramid_levels
            .min(frame.levels.len())
            .min(pyramid.depth())
            - 1;
        while level > 0 && !frame.levels[level].fits(&pyramid.levels[level]) {
            level -= 1;
        }

        let plane = &frame.levels[level];
        let template = &pyramid.levels[level];
        let (max_x, max_y) = plane.max_origin(template);
        let (mut x, mut y, mut confidence) = plane.search(template, (0, max_x), (0, max_y));

        while level > 0 {
            level -= 1;
            let plane = &frame.levels[level];
            let template = &pyramid.levels[level];
            let (max_x, max_y) = plane.max_origin(template);
            let xs = refine_range(x, max_x);
            let ys = refine_range(y, max_y);
            (x, y, confidence) = plane.search(template, xs, ys);
        }

        if confidence <= 0.0 {
            return FrameScore::none();
        }

        FrameScore {
            confidence,
            rect: Some(MatchRect {
                x,
                y,
                width: base.width,
                height: base.height,
            }),
        }
    }
}

fn refine_range(coarse: u32, max: u32) -> (u32, u32) {
    let center = i64::from(coarse) * 2;
    let lo = (center - REFINE_RADIUS).clamp(0, i64::from(max));
    let hi = (center + REFINE_RADIUS).clamp(0, i64::from(max));
    (lo as u32, hi as u32)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detection::types::AgentState;
    use chrono::Utc;
    use image::Luma;

    /// Deterministic hash noise so correlation has structure everywhere.
    pub(crate) fn noise_image(width: u32, height: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let mut h = x
                .wrapping_mul(374_761_393)
                .wrapping_add(y.wrapping_mul(668_265_263))
                .wrapping_add(seed.wrapping_mul(2_246_822_519));
            h = (h ^ (h >> 13)).wrapping_mul(1_274_126_177);
            h ^= h >> 16;
            Luma([(h >> 24) as u8])
        })
    }

    pub(crate) fn crop(image: &GrayImage, x: u32, y: u32, width: u32, height: u32) -> GrayImage {
        imageops::crop_imm(image, x, y, width, height).to_image()
    }

    fn reference(image: GrayImage, levels: usize) -> ReferenceImage {
        ReferenceImage::new("ref.png", AgentState::Idle, image, levels)
    }

    #[test]
    fn exact_patch_scores_one_at_its_position() {
        let screen = noise_image(96, 64, 7);
        let patch = crop(&screen, 40, 22, 16, 12);
        let scorer = FrameScorer::new(1);
        let frame = scorer.prepare(&Frame::new(screen, Utc::now()));

        let score = scorer.score(&frame, &reference(patch, 1));

        assert!((score.confidence - 1.0).abs() < 1e-9);
        assert_eq!(
            score.rect,
            Some(MatchRect {
                x: 40,
                y: 22,
                width: 16,
                height: 12
            })
        );
    }

    #[test]
    fn brightness_shift_does_not_change_the_score() {
        let screen = noise_image(64, 48, 3);
        let patch = crop(&screen, 10, 10, 12, 12);
        let halved = GrayImage::from_fn(64, 48, |x, y| {
            Luma([(screen.get_pixel(x, y).0[0] / 2).saturating_add(40)])
        });
        let scorer = FrameScorer::new(1);
        let frame = scorer.prepare(&Frame::new(halved, Utc::now()));

        let score = scorer.score(&frame, &reference(patch, 1));

        assert!(score.confidence > 0.99);
        assert_eq!(score.rect.map(|r| (r.x, r.y)), Some((10, 10)));
    }

    #[test]
    fn reference_larger_than_frame_scores_zero() {
        let scorer = FrameScorer::new(1);
        let frame = scorer.prepare(&Frame::new(noise_image(20, 20, 1), Utc::now()));

        let score = scorer.score(&frame, &reference(noise_image(30, 10, 2), 1));

        assert_eq!(score, FrameScore::none());
    }

    #[test]
    fn uniform_patches_match_only_at_the_same_level() {
        let mut screen = GrayImage::from_pixel(40, 40, Luma([200]));
        for x in 0..20 {
            for y in 0..40 {
                screen.put_pixel(x, y, Luma([10]));
            }
        }
        let scorer = FrameScorer::new(1);
        let frame = scorer.prepare(&Frame::new(screen, Utc::now()));

        let dark = scorer.score(&frame, &reference(GrayImage::from_pixel(8, 8, Luma([10])), 1));
        let grey = scorer.score(&frame, &reference(GrayImage::from_pixel(8, 8, Luma([120])), 1));

        assert_eq!(dark.confidence, 1.0);
        assert_eq!(dark.rect.map(|r| r.x), Some(0));
        assert_eq!(grey, FrameScore::none());
    }

    #[test]
    fn pyramid_search_finds_the_same_location_as_exhaustive() {
        // Smooth chirps survive downsampling and never repeat exactly.
        let screen = GrayImage::from_fn(160, 120, |x, y| {
            let (fx, fy) = (f64::from(x), f64::from(y));
            let v = 127.0
                + 55.0 * (fx * fx / 3000.0 + fy / 17.0).sin()
                + 45.0 * (fy * fy / 2500.0 - fx / 23.0).cos();
            Luma([v as u8])
        });
        let patch = crop(&screen, 84, 52, 32, 24);

        let exhaustive = FrameScorer::new(1);
        let coarse = FrameScorer::new(3);
        let frame_full = exhaustive.prepare(&Frame::new(screen.clone(), Utc::now()));
        let frame_pyr = coarse.prepare(&Frame::new(screen, Utc::now()));

        let a = exhaustive.score(&frame_full, &reference(patch.clone(), 1));
        let b = coarse.score(&frame_pyr, &reference(patch, 3));

        assert_eq!(a.rect, b.rect);
        assert!((b.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unrelated_reference_scores_below_exact_match() {
        let screen = noise_image(80, 60, 11);
        let scorer = FrameScorer::new(1);
        let frame = scorer.prepare(&Frame::new(screen, Utc::now()));

        let score = scorer.score(&frame, &reference(noise_image(16, 16, 999), 1));

        assert!(score.confidence < 0.8);
    }
}
