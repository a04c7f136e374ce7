//! Screen state: capture, perceptual hashing, template matching, stability.
//!
//! The actual pixel grab is a capability implemented by a platform
//! collaborator; everything above it (hashing, matching, the
//! page-settled heuristic) lives here and is platform-neutral.

use chrono::Utc;
use image::{imageops, GrayImage, RgbaImage};
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::abort::AbortSignal;
use crate::action::ScreenshotRef;
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Raw captured pixels.
pub type Frame = RgbaImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Region of the given size centered on a point, clamped to the origin.
    pub fn centered_on(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x: (x - width as i32 / 2).max(0),
            y: (y - height as i32 / 2).max(0),
            width,
            height,
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x
            && y >= self.y
            && x < self.x + self.width as i32
            && y < self.y + self.height as i32
    }
}

/// Capability implemented by the platform screen-grab collaborator.
pub trait ScreenCapture: Send + Sync {
    /// Grab the full screen, or a sub-region of it.
    ///
    /// Implementations return within a bounded time; a failed grab is a
    /// recoverable [`Error::Capture`], never a hang.
    fn grab(&self, region: Option<Region>) -> Result<Frame>;

    /// Current pointer location in screen coordinates.
    fn cursor_position(&self) -> Result<(i32, i32)>;
}

/// Outcome of matching a recorded context image against the live screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    /// Similarity in [0, 1].
    pub score: f64,
    /// Center of the best placement, present only when the score cleared
    /// the threshold.
    pub location: Option<(i32, i32)>,
}

/// Noise-tolerant fingerprint of a frame. Used for stability detection,
/// not exact-match verification.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenHash(ImageHash);

impl ScreenHash {
    /// Hamming distance in bits.
    pub fn distance(&self, other: &ScreenHash) -> u32 {
        self.0.dist(&other.0)
    }
}

/// Parameters of the consecutive-identical-hash settling heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilityOptions {
    pub poll_interval_ms: u64,
    /// Consecutive matching samples required before the screen counts as settled.
    pub stable_count: u32,
    /// Hash distance at or below which two samples count as identical.
    pub max_hash_distance: u32,
    pub timeout_ms: u64,
}

impl Default for StabilityOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            stable_count: 3,
            max_hash_distance: 4,
            timeout_ms: 30_000,
        }
    }
}

/// Screen-state service over a capture backend.
pub struct ScreenService<C> {
    capture: Arc<C>,
    clock: Arc<dyn Clock>,
    shot_dir: PathBuf,
}

impl<C: ScreenCapture> ScreenService<C> {
    pub fn new(capture: Arc<C>, clock: Arc<dyn Clock>, shot_dir: impl Into<PathBuf>) -> Result<Self> {
        let shot_dir = shot_dir.into();
        std::fs::create_dir_all(&shot_dir)?;
        Ok(Self {
            capture,
            clock,
            shot_dir,
        })
    }

    /// Shared handle to the underlying capture backend (cursor polling).
    pub fn capture_handle(&self) -> Arc<C> {
        self.capture.clone()
    }

    /// Grab pixels without writing an artifact.
    pub fn frame(&self, region: Option<Region>) -> Result<Frame> {
        self.capture.grab(region)
    }

    /// Capture the full screen to a PNG artifact.
    pub fn capture_full(&self) -> Result<ScreenshotRef> {
        let frame = self.capture.grab(None)?;
        self.save_frame(&frame, "screen")
    }

    /// Capture a region to a PNG artifact.
    pub fn capture_region(&self, region: Region) -> Result<ScreenshotRef> {
        let frame = self.capture.grab(Some(region))?;
        self.save_frame(&frame, "region")
    }

    fn save_frame(&self, frame: &Frame, prefix: &str) -> Result<ScreenshotRef> {
        let captured_at = Utc::now();
        let filename = format!("{}_{}.png", prefix, captured_at.format("%Y%m%d_%H%M%S_%f"));
        let path = self.shot_dir.join(filename);
        frame.save(&path)?;
        Ok(ScreenshotRef { path, captured_at })
    }

    /// Load a previously captured artifact back into pixels.
    pub fn load(&self, shot: &ScreenshotRef) -> Result<Frame> {
        Ok(image::open(&shot.path)?.to_rgba8())
    }

    pub fn perceptual_hash(&self, frame: &Frame) -> ScreenHash {
        ScreenHash(hasher().hash_image(frame))
    }

    /// Match `template` against a region of the live screen (full screen when
    /// `region` is `None`). The score is the best normalized cross-correlation
    /// over all placements; the location is the center of the best placement
    /// when it clears `threshold`.
    pub fn match_template(
        &self,
        template: &Frame,
        region: Option<Region>,
        threshold: f64,
    ) -> Result<MatchResult> {
        let frame = self.capture.grab(region)?;
        let (off_x, off_y) = region.map(|r| (r.x, r.y)).unwrap_or((0, 0));

        let tpl = imageops::grayscale(template);
        let hay = imageops::grayscale(&frame);
        let (score, best) = best_placement(&tpl, &hay);

        let location = if score >= threshold {
            best.map(|(bx, by)| {
                (
                    off_x + bx as i32 + tpl.width() as i32 / 2,
                    off_y + by as i32 + tpl.height() as i32 / 2,
                )
            })
        } else {
            None
        };
        Ok(MatchResult { score, location })
    }

    /// Poll the full-screen hash until `stable_count` consecutive samples are
    /// identical within tolerance. Visual stillness stands in for "page
    /// loaded" since no generic OS signal exists for it.
    ///
    /// Returns the elapsed time from the call until the screen was judged
    /// settled, the measured page-load duration.
    pub fn wait_for_stability(
        &self,
        opts: StabilityOptions,
        abort: &AbortSignal,
    ) -> Result<Duration> {
        let start = self.clock.now_ms();
        let mut prev: Option<ScreenHash> = None;
        // Matches counted against the previous sample; the first sample of a
        // streak is implicit, so `streak + 1` is the run length.
        let mut streak = 0u32;

        loop {
            if abort.is_raised() {
                return Err(Error::Aborted);
            }
            let elapsed = self.clock.now_ms() - start;
            if elapsed >= opts.timeout_ms {
                return Err(Error::StabilityTimeout {
                    timeout_ms: opts.timeout_ms,
                });
            }

            let hash = self.perceptual_hash(&self.capture.grab(None)?);
            match &prev {
                Some(p) if p.distance(&hash) <= opts.max_hash_distance => {
                    streak += 1;
                    if streak + 1 >= opts.stable_count {
                        let elapsed = self.clock.now_ms() - start;
                        tracing::debug!(elapsed_ms = elapsed, "screen settled");
                        return Ok(Duration::from_millis(elapsed));
                    }
                }
                _ => streak = 0,
            }
            prev = Some(hash);
            self.clock.sleep(Duration::from_millis(opts.poll_interval_ms));
        }
    }
}

fn hasher() -> Hasher {
    HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(16, 16)
        .to_hasher()
}

/// Best zero-mean normalized cross-correlation of `tpl` over `hay`.
fn best_placement(tpl: &GrayImage, hay: &GrayImage) -> (f64, Option<(u32, u32)>) {
    let (tw, th) = tpl.dimensions();
    let (hw, hh) = hay.dimensions();
    if tw == 0 || th == 0 || tw > hw || th > hh {
        return (0.0, None);
    }

    let n = (tw * th) as f64;
    let tpl_px: Vec<f64> = tpl.pixels().map(|p| p.0[0] as f64).collect();
    let tpl_mean = tpl_px.iter().sum::<f64>() / n;
    let tpl_var: f64 = tpl_px.iter().map(|v| (v - tpl_mean).powi(2)).sum();

    let mut best_score = f64::MIN;
    let mut best_pos = None;

    for oy in 0..=(hh - th) {
        for ox in 0..=(hw - tw) {
            let mut sum = 0.0;
            for y in 0..th {
                for x in 0..tw {
                    sum += hay.get_pixel(ox + x, oy + y).0[0] as f64;
                }
            }
            let win_mean = sum / n;

            let mut cross = 0.0;
            let mut win_var = 0.0;
            for y in 0..th {
                for x in 0..tw {
                    let w = hay.get_pixel(ox + x, oy + y).0[0] as f64 - win_mean;
                    let t = tpl_px[(y * tw + x) as usize] - tpl_mean;
                    cross += w * t;
                    win_var += w * w;
                }
            }

            let score = if tpl_var == 0.0 || win_var == 0.0 {
                // Flat patches: fall back to mean equality.
                if (tpl_mean - win_mean).abs() < 1.0 {
                    1.0
                } else {
                    0.0
                }
            } else {
                (cross / (tpl_var.sqrt() * win_var.sqrt())).max(0.0)
            };

            if score > best_score {
                best_score = score;
                best_pos = Some((ox, oy));
            }
        }
    }

    (best_score.max(0.0), best_pos)
}
