//! Playback state machine.
//!
//! Replays a recording one action at a time: timing reconstruction,
//! pre-action visual verification with retry, credential injection,
//! navigation stability detection, and a concurrent abort watcher.
//! Actions execute strictly in recorded order; only waits suspend, and
//! every wait is interruptible by the abort signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use encore_core::abort::AbortSignal;
use encore_core::action::{ActionKind, MouseButton, Recording, ScreenshotRef};
use encore_core::clock::Clock;
use encore_core::error::{Error, Result};
use encore_core::inject::InputInjector;
use encore_core::screen::{Frame, Region, ScreenCapture, ScreenService, StabilityOptions};
use encore_core::secret::{CredentialResolver, SecretStore};

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Aborted,
}

/// Outcome of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOutcome {
    Succeeded,
    /// Succeeded after this many extra verification attempts.
    Retried(u32),
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub index: usize,
    pub action: String,
    pub outcome: ActionOutcome,
    pub duration_ms: u64,
    /// Measured settling time when the action triggered stabilization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stabilize_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<ScreenshotRef>,
}

/// Ephemeral record of one execution, handed to reporting collaborators at
/// any terminal state. Never contains a secret value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackRun {
    pub recording_id: Uuid,
    pub recording_name: String,
    pub status: PlaybackStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results: Vec<ActionResult>,
    pub screenshots: Vec<ScreenshotRef>,
}

impl PlaybackRun {
    fn new(recording: &Recording) -> Self {
        Self {
            recording_id: recording.id,
            recording_name: recording.name.clone(),
            status: PlaybackStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            results: Vec::new(),
            screenshots: Vec::new(),
        }
    }

    pub fn completed_actions(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ActionOutcome::Succeeded | ActionOutcome::Retried(_)))
            .count()
    }

    pub fn failed_actions(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == ActionOutcome::Failed)
            .count()
    }

    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.completed_actions() as f64 / self.results.len() as f64 * 100.0
    }
}

/// Delay growth policy between verification attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Linear { step_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay after the given 1-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = match self {
            Backoff::Fixed { delay_ms } => *delay_ms,
            Backoff::Linear { step_ms } => step_ms.saturating_mul(attempt as u64),
            Backoff::Exponential { base_ms, max_ms } => base_ms
                .saturating_mul(1u64 << attempt.saturating_sub(1).min(32))
                .min(*max_ms),
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone)]
pub struct PlaybackOptions {
    /// Scales inter-action delays and Wait actions. 2.0 plays twice as fast.
    pub speed_multiplier: f64,
    /// Total verification attempts per click before the action fails.
    pub max_retries: u32,
    pub retry_backoff: Backoff,
    /// When false, skip match gating entirely and execute blind.
    pub verify_enabled: bool,
    pub match_threshold: f64,
    /// Margin added around the recorded point when probing for the target.
    pub match_margin: u32,
    /// Screen corner that aborts the run when the live cursor enters it.
    pub abort_region: Option<Region>,
    pub abort_poll_interval_ms: u64,
    pub stability: StabilityOptions,
    /// Cap on any single reconstructed wait.
    pub max_delay_ms: u64,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            speed_multiplier: 1.0,
            max_retries: 3,
            retry_backoff: Backoff::Fixed { delay_ms: 1_000 },
            verify_enabled: true,
            match_threshold: 0.85,
            match_margin: 24,
            abort_region: None,
            abort_poll_interval_ms: 100,
            stability: StabilityOptions::default(),
            max_delay_ms: 5_000,
        }
    }
}

/// Control handle usable from another thread while a run is in flight.
#[derive(Clone)]
pub struct PlaybackControl {
    abort: AbortSignal,
    paused: Arc<AtomicBool>,
}

impl PlaybackControl {
    pub fn abort(&self) {
        self.abort.raise();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

/// What executing one action produced besides success.
struct ExecOutcome {
    stabilize_ms: Option<u64>,
    screenshot: Option<ScreenshotRef>,
}

/// Replays recordings against the live screen.
pub struct PlaybackEngine<C, I, S> {
    screen: Arc<ScreenService<C>>,
    injector: I,
    resolver: CredentialResolver<S>,
    clock: Arc<dyn Clock>,
    abort: AbortSignal,
    paused: Arc<AtomicBool>,
}

impl<C, I, S> PlaybackEngine<C, I, S>
where
    C: ScreenCapture + 'static,
    I: InputInjector,
    S: SecretStore,
{
    pub fn new(
        screen: Arc<ScreenService<C>>,
        injector: I,
        store: S,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            screen,
            injector,
            resolver: CredentialResolver::new(store),
            clock,
            abort: AbortSignal::new(),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for aborting or pausing from outside the playback thread.
    pub fn control(&self) -> PlaybackControl {
        PlaybackControl {
            abort: self.abort.clone(),
            paused: self.paused.clone(),
        }
    }

    /// Execute the whole recording. Blocks until a terminal state.
    pub fn play(&mut self, recording: &Recording, options: &PlaybackOptions) -> PlaybackRun {
        let mut run = PlaybackRun::new(recording);
        self.abort.clear();
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!(
            recording = %recording.name,
            actions = recording.actions.len(),
            speed = options.speed_multiplier,
            "playback started"
        );

        let watcher = options
            .abort_region
            .map(|region| self.spawn_abort_watcher(region, options.abort_poll_interval_ms));

        let mut fatal: Option<String> = None;

        // Opening the starting URL counts as navigation: stabilization
        // swallows the dead time before the first action.
        let mut just_stabilized = false;
        if let Some(url) = &recording.url {
            match self.injector.open_url(url) {
                Ok(()) => {
                    self.stabilize(options);
                    just_stabilized = true;
                }
                Err(err) => fatal = Some(format!("failed to open starting url: {err}")),
            }
        }

        let mut prev_offset = 0u64;
        let mut next_index = 0usize;

        if fatal.is_none() {
            for (index, action) in recording.actions.iter().enumerate() {
                next_index = index;
                if self.abort.is_raised() {
                    break;
                }
                self.wait_while_paused();

                // Timing reconstruction, skipped when stabilization already
                // consumed the gap.
                if !just_stabilized {
                    let delta = action.offset_ms.saturating_sub(prev_offset);
                    let scaled = ((delta as f64 / options.speed_multiplier) as u64)
                        .min(options.max_delay_ms);
                    if !self
                        .abort
                        .sleep_unless_raised(&*self.clock, Duration::from_millis(scaled))
                    {
                        break;
                    }
                }
                prev_offset = action.offset_ms;

                let result = self.run_action(index, action, options);
                just_stabilized = result.stabilize_ms.is_some();
                if let Some(shot) = &result.screenshot {
                    run.screenshots.push(shot.clone());
                }
                let failed = result.outcome == ActionOutcome::Failed;
                if failed {
                    fatal = result.error.clone();
                }
                let skipped = result.outcome == ActionOutcome::Skipped;
                run.results.push(result);
                next_index = index + 1;
                if failed || skipped {
                    break;
                }
            }
        }

        // Anything not reached is reported as skipped.
        for index in next_index..recording.actions.len() {
            if run.results.iter().any(|r| r.index == index) {
                continue;
            }
            run.results.push(ActionResult {
                index,
                action: recording.actions[index].kind.label().to_string(),
                outcome: ActionOutcome::Skipped,
                duration_ms: 0,
                stabilize_ms: None,
                error: None,
                screenshot: None,
            });
        }

        run.status = if self.abort.is_raised() {
            PlaybackStatus::Aborted
        } else if fatal.is_some() {
            PlaybackStatus::Failed
        } else {
            PlaybackStatus::Completed
        };
        run.completed_at = Some(Utc::now());

        if let Some((stop, handle)) = watcher {
            stop.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }

        tracing::info!(
            recording = %recording.name,
            status = ?run.status,
            completed = run.completed_actions(),
            failed = run.failed_actions(),
            "playback finished"
        );
        run
    }

    fn spawn_abort_watcher(
        &self,
        region: Region,
        poll_ms: u64,
    ) -> (Arc<AtomicBool>, JoinHandle<()>) {
        let capture = self.screen.capture_handle();
        let abort = self.abort.clone();
        let clock = self.clock.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) && !abort.is_raised() {
                if let Ok((x, y)) = capture.cursor_position() {
                    if region.contains(x, y) {
                        tracing::warn!(x, y, "cursor entered abort region");
                        abort.raise();
                        break;
                    }
                }
                clock.sleep(Duration::from_millis(poll_ms));
            }
        });
        (stop, handle)
    }

    fn wait_while_paused(&self) {
        while self.paused.load(Ordering::SeqCst) && !self.abort.is_raised() {
            self.clock.sleep(Duration::from_millis(25));
        }
    }

    fn run_action(
        &mut self,
        index: usize,
        action: &encore_core::action::RecordedAction,
        options: &PlaybackOptions,
    ) -> ActionResult {
        let started = self.clock.now_ms();
        let label = action.kind.label().to_string();
        tracing::debug!(index, action = %label, "executing action");

        let mut result = ActionResult {
            index,
            action: label,
            outcome: ActionOutcome::Succeeded,
            duration_ms: 0,
            stabilize_ms: None,
            error: None,
            screenshot: None,
        };

        // Verification gates click-type actions only.
        let mut target = None;
        let mut attempts = 1u32;
        if options.verify_enabled && action.kind.is_click() {
            if let Some(shot) = &action.before_screenshot {
                match self.verify(&action.kind, shot, options) {
                    Ok((location, used)) => {
                        target = location;
                        attempts = used;
                    }
                    Err(Error::Aborted) => {
                        result.outcome = ActionOutcome::Skipped;
                        result.duration_ms = self.clock.now_ms() - started;
                        return result;
                    }
                    Err(err) => {
                        result.outcome = ActionOutcome::Failed;
                        result.error = Some(err.to_string());
                        result.screenshot = self.screen.capture_full().ok();
                        result.duration_ms = self.clock.now_ms() - started;
                        return result;
                    }
                }
            }
        }

        match self.execute(&action.kind, target, options) {
            Ok(outcome) => {
                result.stabilize_ms = outcome.stabilize_ms;
                result.screenshot = outcome.screenshot;
                result.outcome = if attempts > 1 {
                    ActionOutcome::Retried(attempts - 1)
                } else {
                    ActionOutcome::Succeeded
                };
            }
            Err(Error::Aborted) => {
                result.outcome = ActionOutcome::Skipped;
            }
            Err(err) => {
                tracing::warn!(index, error = %err, "action failed");
                result.outcome = ActionOutcome::Failed;
                result.error = Some(err.to_string());
                result.screenshot = self.screen.capture_full().ok();
            }
        }
        result.duration_ms = self.clock.now_ms() - started;
        result
    }

    /// Confirm the recorded click context is still on screen.
    ///
    /// Probes a region around the recorded point first, then the whole
    /// screen in case the target drifted. Capture trouble degrades to an
    /// unverified execution instead of failing the run.
    fn verify(
        &self,
        kind: &ActionKind,
        shot: &ScreenshotRef,
        options: &PlaybackOptions,
    ) -> Result<(Option<(i32, i32)>, u32)> {
        let template: Frame = match self.screen.load(shot) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(%err, "context image unreadable, executing unverified");
                return Ok((None, 1));
            }
        };
        let (x, y) = kind.click_point().unwrap_or((0, 0));
        let probe = Region::centered_on(
            x,
            y,
            template.width() + options.match_margin * 2,
            template.height() + options.match_margin * 2,
        );

        for attempt in 1..=options.max_retries.max(1) {
            if self.abort.is_raised() {
                return Err(Error::Aborted);
            }

            let local = match self.screen.match_template(&template, Some(probe), options.match_threshold) {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(%err, "verification capture failed, executing unverified");
                    return Ok((None, attempt));
                }
            };
            if local.location.is_some() {
                return Ok((local.location, attempt));
            }

            // Not where it was recorded; look for it anywhere on screen.
            match self.screen.match_template(&template, None, options.match_threshold) {
                Ok(full) if full.location.is_some() => {
                    tracing::info!(from = ?(x, y), to = ?full.location, "target moved, following");
                    return Ok((full.location, attempt));
                }
                Ok(full) => {
                    tracing::debug!(attempt, score = full.score, "verification below threshold");
                }
                Err(err) => {
                    tracing::warn!(%err, "verification capture failed, executing unverified");
                    return Ok((None, attempt));
                }
            }

            if attempt < options.max_retries {
                if !self.abort.sleep_unless_raised(
                    &*self.clock,
                    options.retry_backoff.delay(attempt),
                ) {
                    return Err(Error::Aborted);
                }
            }
        }

        Err(Error::VerificationFailed {
            attempts: options.max_retries.max(1),
            x,
            y,
        })
    }

    fn execute(
        &mut self,
        kind: &ActionKind,
        target: Option<(i32, i32)>,
        options: &PlaybackOptions,
    ) -> Result<ExecOutcome> {
        let mut outcome = ExecOutcome {
            stabilize_ms: None,
            screenshot: None,
        };

        match kind {
            ActionKind::MouseClick { button, x, y } => {
                let (x, y) = target.unwrap_or((*x, *y));
                self.injector.click(x, y, *button, 1)?;
            }
            ActionKind::MouseDoubleClick { x, y } => {
                let (x, y) = target.unwrap_or((*x, *y));
                self.injector.click(x, y, MouseButton::Left, 2)?;
            }
            ActionKind::MouseRightClick { x, y } => {
                let (x, y) = target.unwrap_or((*x, *y));
                self.injector.click(x, y, MouseButton::Right, 1)?;
            }
            ActionKind::Scroll { dx, dy, x, y } => {
                self.injector.scroll(*x, *y, *dx, *dy)?;
            }
            ActionKind::KeyPress { key } => {
                self.injector.press_key(key)?;
            }
            ActionKind::KeyType { text } => {
                self.injector.type_text(text)?;
            }
            ActionKind::CredentialInput {
                credential_name,
                field,
            } => {
                let mut secret = self.resolver.resolve(credential_name, *field)?;
                let delivered = self.injector.type_text(secret.reveal());
                // Cleared before any error can propagate.
                secret.clear();
                delivered?;
            }
            ActionKind::Screenshot { .. } => match self.screen.capture_full() {
                Ok(shot) => outcome.screenshot = Some(shot),
                Err(err) => {
                    tracing::warn!(%err, "playback screenshot failed, continuing");
                }
            },
            ActionKind::Wait { duration_ms } => {
                let scaled = (*duration_ms as f64 / options.speed_multiplier) as u64;
                if !self
                    .abort
                    .sleep_unless_raised(&*self.clock, Duration::from_millis(scaled))
                {
                    return Err(Error::Aborted);
                }
            }
            ActionKind::OpenUrl { url } => {
                self.injector.open_url(url)?;
            }
        }

        if kind.is_navigation() {
            outcome.stabilize_ms = self.stabilize(options);
        }
        Ok(outcome)
    }

    /// Wait for the screen to settle after navigation. A timeout is a
    /// warning, not a failure; abort ends the wait silently (the action
    /// itself already landed).
    fn stabilize(&self, options: &PlaybackOptions) -> Option<u64> {
        match self.screen.wait_for_stability(options.stability, &self.abort) {
            Ok(elapsed) => Some(elapsed.as_millis() as u64),
            Err(Error::StabilityTimeout { timeout_ms }) => {
                tracing::warn!(timeout_ms, "screen never settled after navigation");
                None
            }
            Err(Error::Aborted) => None,
            Err(err) => {
                tracing::warn!(%err, "stability sampling failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_core::action::{CredentialField, RecordedAction};
    use encore_core::clock::FakeClock;
    use encore_core::error::ResolveError;
    use encore_core::secret::Secret;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    // ------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------

    struct StaticCapture {
        frame: Frame,
        grabs: AtomicUsize,
    }

    impl StaticCapture {
        fn textured() -> Self {
            // Coordinate-hashed noise: no two windows correlate by accident.
            Self {
                frame: Frame::from_fn(64, 64, |x, y| {
                    let n = x
                        .wrapping_mul(374_761_393)
                        .wrapping_add(y.wrapping_mul(668_265_263));
                    let n = (n ^ (n >> 13)).wrapping_mul(1_274_126_177);
                    let v = ((n >> 16) & 0xff) as u8;
                    image::Rgba([v, v, v, 255])
                }),
                grabs: AtomicUsize::new(0),
            }
        }
    }

    impl ScreenCapture for StaticCapture {
        fn grab(&self, region: Option<Region>) -> Result<Frame> {
            self.grabs.fetch_add(1, Ordering::SeqCst);
            Ok(match region {
                Some(r) => image::imageops::crop_imm(
                    &self.frame,
                    r.x.max(0) as u32,
                    r.y.max(0) as u32,
                    r.width.min(self.frame.width()),
                    r.height.min(self.frame.height()),
                )
                .to_image(),
                None => self.frame.clone(),
            })
        }

        fn cursor_position(&self) -> Result<(i32, i32)> {
            Ok((500, 500))
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Injected {
        Click(i32, i32, MouseButton, u8),
        Text(String),
        Key(String),
        Scroll(i32, i32, i32, i32),
        Url(String),
    }

    #[derive(Clone, Default)]
    struct RecordingInjector {
        calls: Arc<Mutex<Vec<Injected>>>,
    }

    impl InputInjector for RecordingInjector {
        fn click(&mut self, x: i32, y: i32, button: MouseButton, clicks: u8) -> Result<()> {
            self.calls.lock().push(Injected::Click(x, y, button, clicks));
            Ok(())
        }

        fn type_text(&mut self, text: &str) -> Result<()> {
            self.calls.lock().push(Injected::Text(text.to_string()));
            Ok(())
        }

        fn press_key(&mut self, key: &str) -> Result<()> {
            self.calls.lock().push(Injected::Key(key.to_string()));
            Ok(())
        }

        fn scroll(&mut self, x: i32, y: i32, dx: i32, dy: i32) -> Result<()> {
            self.calls.lock().push(Injected::Scroll(x, y, dx, dy));
            Ok(())
        }

        fn open_url(&mut self, url: &str) -> Result<()> {
            self.calls.lock().push(Injected::Url(url.to_string()));
            Ok(())
        }
    }

    struct CountingStore {
        resolves: Arc<AtomicUsize>,
    }

    impl CountingStore {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let resolves = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    resolves: resolves.clone(),
                },
                resolves,
            )
        }
    }

    impl SecretStore for CountingStore {
        fn resolve(&self, name: &str, _field: CredentialField) -> std::result::Result<Secret, ResolveError> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            match name {
                "X" | "Portal" => Ok(Secret::new("S3cr3t!")),
                other => Err(ResolveError::NotFound(other.to_string())),
            }
        }
    }

    fn engine_parts(
        clock: Arc<dyn Clock>,
    ) -> (
        PlaybackEngine<StaticCapture, RecordingInjector, CountingStore>,
        Arc<Mutex<Vec<Injected>>>,
        Arc<StaticCapture>,
        Arc<AtomicUsize>,
    ) {
        let capture = Arc::new(StaticCapture::textured());
        let dir = tempfile::tempdir().unwrap();
        let screen =
            Arc::new(ScreenService::new(capture.clone(), clock.clone(), dir.keep()).unwrap());
        let injector = RecordingInjector::default();
        let calls = injector.calls.clone();
        let (store, resolves) = CountingStore::new();
        let engine = PlaybackEngine::new(screen, injector, store, clock);
        (engine, calls, capture, resolves)
    }

    fn blind_options() -> PlaybackOptions {
        PlaybackOptions {
            verify_enabled: false,
            speed_multiplier: 2.0,
            stability: StabilityOptions {
                poll_interval_ms: 50,
                stable_count: 3,
                max_hash_distance: 4,
                timeout_ms: 5_000,
            },
            ..PlaybackOptions::default()
        }
    }

    fn three_action_recording() -> Recording {
        let mut rec = Recording::new("scenario", None);
        rec.push(RecordedAction::new(
            0,
            ActionKind::MouseClick {
                button: MouseButton::Left,
                x: 10,
                y: 10,
            },
        ));
        rec.push(RecordedAction::new(
            400,
            ActionKind::CredentialInput {
                credential_name: "X".to_string(),
                field: CredentialField::Password,
            },
        ));
        rec.push(RecordedAction::new(
            800,
            ActionKind::OpenUrl {
                url: "http://a".to_string(),
            },
        ));
        rec
    }

    #[test]
    fn blind_playback_completes_with_one_resolver_call() {
        let clock = Arc::new(FakeClock::new());
        let (mut engine, calls, _capture, resolves) = engine_parts(clock);
        let recording = three_action_recording();

        let run = engine.play(&recording, &blind_options());

        assert_eq!(run.status, PlaybackStatus::Completed);
        assert_eq!(run.results.len(), 3);
        assert!(run
            .results
            .iter()
            .all(|r| r.outcome == ActionOutcome::Succeeded));
        assert_eq!(resolves.load(Ordering::SeqCst), 1);
        // The OpenUrl action measured its settling time.
        assert!(run.results[2].stabilize_ms.is_some());
        assert!(run.results[0].stabilize_ms.is_none());

        let calls = calls.lock();
        assert_eq!(calls[0], Injected::Click(10, 10, MouseButton::Left, 1));
        assert_eq!(calls[1], Injected::Text("S3cr3t!".to_string()));
        assert_eq!(calls[2], Injected::Url("http://a".to_string()));
    }

    #[test]
    fn speed_multiplier_halves_reconstructed_waits() {
        let clock = Arc::new(FakeClock::new());
        let fake = clock.clone();
        let (mut engine, _calls, _capture, _resolves) = engine_parts(clock);
        let mut rec = Recording::new("timing", None);
        rec.push(RecordedAction::new(
            0,
            ActionKind::KeyType { text: "a".into() },
        ));
        rec.push(RecordedAction::new(
            1_000,
            ActionKind::KeyType { text: "b".into() },
        ));

        let options = PlaybackOptions {
            verify_enabled: false,
            speed_multiplier: 2.0,
            ..PlaybackOptions::default()
        };
        let run = engine.play(&rec, &options);
        assert_eq!(run.status, PlaybackStatus::Completed);
        // 1000ms of recorded gap replayed in 500ms of (fake) time.
        assert_eq!(fake.now_ms(), 500);
    }

    #[test]
    fn missing_credential_fails_the_run_with_skips() {
        let clock = Arc::new(FakeClock::new());
        let (mut engine, calls, _capture, _resolves) = engine_parts(clock);
        let mut rec = Recording::new("missing", None);
        rec.push(RecordedAction::new(
            0,
            ActionKind::CredentialInput {
                credential_name: "Nowhere".to_string(),
                field: CredentialField::Password,
            },
        ));
        rec.push(RecordedAction::new(
            100,
            ActionKind::KeyType { text: "after".into() },
        ));

        let run = engine.play(&rec, &blind_options());
        assert_eq!(run.status, PlaybackStatus::Failed);
        assert_eq!(run.results[0].outcome, ActionOutcome::Failed);
        assert!(run.results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("not found"));
        assert_eq!(run.results[1].outcome, ActionOutcome::Skipped);
        // The failing lookup injected nothing.
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn verification_attempts_are_bounded() {
        let clock: Arc<FakeClock> = Arc::new(FakeClock::new());
        let fake = clock.clone();
        let capture = Arc::new(StaticCapture::textured());
        let dir = tempfile::tempdir().unwrap();
        let screen = Arc::new(
            ScreenService::new(capture.clone(), clock.clone(), dir.keep()).unwrap(),
        );

        // A context image that matches nowhere on the textured screen.
        let bogus = Frame::from_pixel(16, 16, image::Rgba([255, 255, 255, 255]));
        let shot_dir = tempfile::tempdir().unwrap();
        let shot_path = shot_dir.path().join("context.png");
        bogus.save(&shot_path).unwrap();

        let injector = RecordingInjector::default();
        let calls = injector.calls.clone();
        let (store, _resolves) = CountingStore::new();
        let mut engine = PlaybackEngine::new(screen, injector, store, clock);

        let mut rec = Recording::new("never-matches", None);
        let mut action = RecordedAction::new(
            0,
            ActionKind::MouseClick {
                button: MouseButton::Left,
                x: 30,
                y: 30,
            },
        );
        action.before_screenshot = Some(ScreenshotRef {
            path: shot_path,
            captured_at: Utc::now(),
        });
        rec.actions.push(action);

        let options = PlaybackOptions {
            max_retries: 3,
            retry_backoff: Backoff::Fixed { delay_ms: 100 },
            match_threshold: 0.99,
            ..PlaybackOptions::default()
        };
        let run = engine.play(&rec, &options);

        assert_eq!(run.status, PlaybackStatus::Failed);
        assert_eq!(run.results[0].outcome, ActionOutcome::Failed);
        assert!(run.results[0].error.as_deref().unwrap().contains("3 attempt"));
        // Exactly three verification attempts: probe + full-screen grab each,
        // plus the single evidence screenshot after exhaustion.
        assert_eq!(capture.grabs.load(Ordering::SeqCst), 7);
        // Two backoff waits between three attempts.
        assert_eq!(fake.now_ms(), 200);
        // The click itself never happened.
        assert!(calls.lock().is_empty());
        // Evidence of the failing screen is retained.
        assert!(run.results[0].screenshot.is_some());
    }

    /// Clock that raises an abort signal once fake time crosses a threshold,
    /// standing in for the user hitting the abort corner mid-wait.
    struct AbortingClock {
        inner: FakeClock,
        at_ms: u64,
        signal: Mutex<Option<AbortSignal>>,
    }

    impl AbortingClock {
        fn new(at_ms: u64) -> Self {
            Self {
                inner: FakeClock::new(),
                at_ms,
                signal: Mutex::new(None),
            }
        }

        fn wire(&self, signal: AbortSignal) {
            *self.signal.lock() = Some(signal);
        }
    }

    impl Clock for AbortingClock {
        fn now_ms(&self) -> u64 {
            self.inner.now_ms()
        }

        fn sleep(&self, duration: Duration) {
            self.inner.sleep(duration);
            if self.inner.now_ms() >= self.at_ms {
                if let Some(signal) = &*self.signal.lock() {
                    signal.raise();
                }
            }
        }
    }

    #[test]
    fn abort_during_inter_action_wait_skips_the_next_action() {
        let clock = Arc::new(AbortingClock::new(200));
        let capture = Arc::new(StaticCapture::textured());
        let dir = tempfile::tempdir().unwrap();
        let screen = Arc::new(
            ScreenService::new(capture, clock.clone() as Arc<dyn Clock>, dir.keep()).unwrap(),
        );
        let injector = RecordingInjector::default();
        let calls = injector.calls.clone();
        let (store, _resolves) = CountingStore::new();
        let mut engine = PlaybackEngine::new(screen, injector, store, clock.clone());
        clock.wire(engine.control().abort.clone());

        let mut rec = Recording::new("abort", None);
        rec.push(RecordedAction::new(
            0,
            ActionKind::KeyType { text: "a".into() },
        ));
        rec.push(RecordedAction::new(
            1_000,
            ActionKind::KeyType { text: "b".into() },
        ));

        // Abort fires 200ms into the 500ms reconstructed wait before "b".
        let run = engine.play(&rec, &blind_options());

        assert_eq!(run.status, PlaybackStatus::Aborted);
        assert_eq!(run.results.len(), 2);
        assert_eq!(run.results[0].outcome, ActionOutcome::Succeeded);
        assert_eq!(run.results[1].outcome, ActionOutcome::Skipped);
        assert_eq!(*calls.lock(), vec![Injected::Text("a".to_string())]);
    }

    #[test]
    fn abort_during_a_wait_action_skips_it_and_the_rest() {
        let clock = Arc::new(AbortingClock::new(200));
        let capture = Arc::new(StaticCapture::textured());
        let dir = tempfile::tempdir().unwrap();
        let screen = Arc::new(
            ScreenService::new(capture, clock.clone() as Arc<dyn Clock>, dir.keep()).unwrap(),
        );
        let injector = RecordingInjector::default();
        let calls = injector.calls.clone();
        let (store, _resolves) = CountingStore::new();
        let mut engine = PlaybackEngine::new(screen, injector, store, clock.clone());
        clock.wire(engine.control().abort.clone());

        let mut rec = Recording::new("wait-abort", None);
        rec.push(RecordedAction::new(
            0,
            ActionKind::Wait { duration_ms: 10_000 },
        ));
        rec.push(RecordedAction::new(
            10_000,
            ActionKind::KeyType { text: "late".into() },
        ));

        let run = engine.play(&rec, &blind_options());

        assert_eq!(run.status, PlaybackStatus::Aborted);
        assert_eq!(run.results[0].outcome, ActionOutcome::Skipped);
        assert_eq!(run.results[1].outcome, ActionOutcome::Skipped);
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn cursor_in_abort_region_stops_the_run() {
        // StaticCapture reports the cursor at (500, 500), inside the region,
        // so the watcher raises abort on its first poll. Real clock: the
        // watcher needs actual scheduling time while the run waits.
        let clock: Arc<dyn Clock> = Arc::new(encore_core::clock::SystemClock::new());
        let (mut engine, calls, _capture, _resolves) = engine_parts(clock);

        let mut rec = Recording::new("corner", None);
        rec.push(RecordedAction::new(
            0,
            ActionKind::KeyType { text: "a".into() },
        ));
        rec.push(RecordedAction::new(
            2_000,
            ActionKind::KeyType { text: "b".into() },
        ));

        let options = PlaybackOptions {
            verify_enabled: false,
            abort_region: Some(Region::new(480, 480, 40, 40)),
            abort_poll_interval_ms: 10,
            ..PlaybackOptions::default()
        };
        let run = engine.play(&rec, &options);

        assert_eq!(run.status, PlaybackStatus::Aborted);
        // "b" sits behind a 2s wait; the watcher fires long before it.
        assert!(calls.lock().len() <= 1);
        assert_eq!(
            run.results.last().map(|r| r.outcome),
            Some(ActionOutcome::Skipped)
        );
    }

    #[test]
    fn wait_actions_scale_with_speed() {
        let clock = Arc::new(FakeClock::new());
        let fake = clock.clone();
        let (mut engine, _calls, _capture, _resolves) = engine_parts(clock);

        let mut rec = Recording::new("waits", None);
        rec.push(RecordedAction::new(
            0,
            ActionKind::Wait { duration_ms: 1_000 },
        ));

        let options = PlaybackOptions {
            verify_enabled: false,
            speed_multiplier: 4.0,
            ..PlaybackOptions::default()
        };
        let run = engine.play(&rec, &options);
        assert_eq!(run.status, PlaybackStatus::Completed);
        assert_eq!(fake.now_ms(), 250);
    }

    #[test]
    fn screenshot_actions_collect_evidence() {
        let clock = Arc::new(FakeClock::new());
        let (mut engine, _calls, _capture, _resolves) = engine_parts(clock);

        let mut rec = Recording::new("shots", None);
        rec.push(RecordedAction::new(
            0,
            ActionKind::Screenshot {
                shot: ScreenshotRef {
                    path: std::path::PathBuf::from("recorded.png"),
                    captured_at: Utc::now(),
                },
            },
        ));

        let run = engine.play(&rec, &blind_options());
        assert_eq!(run.status, PlaybackStatus::Completed);
        assert_eq!(run.screenshots.len(), 1);
        assert!(run.screenshots[0].path.exists());
    }

    #[test]
    fn backoff_policies_grow_as_configured() {
        let fixed = Backoff::Fixed { delay_ms: 300 };
        assert_eq!(fixed.delay(1), Duration::from_millis(300));
        assert_eq!(fixed.delay(5), Duration::from_millis(300));

        let linear = Backoff::Linear { step_ms: 200 };
        assert_eq!(linear.delay(1), Duration::from_millis(200));
        assert_eq!(linear.delay(3), Duration::from_millis(600));

        let expo = Backoff::Exponential {
            base_ms: 100,
            max_ms: 1_000,
        };
        assert_eq!(expo.delay(1), Duration::from_millis(100));
        assert_eq!(expo.delay(2), Duration::from_millis(200));
        assert_eq!(expo.delay(3), Duration::from_millis(400));
        assert_eq!(expo.delay(10), Duration::from_millis(1_000));
    }

    #[test]
    fn verified_click_follows_the_matched_location() {
        // The context image is a crop of the live screen; verification must
        // land the click at the match center, not the recorded coordinates.
        let clock = Arc::new(FakeClock::new());
        let capture = Arc::new(StaticCapture::textured());
        let dir = tempfile::tempdir().unwrap();
        let screen = Arc::new(
            ScreenService::new(capture.clone(), clock.clone() as Arc<dyn Clock>, dir.keep())
                .unwrap(),
        );

        let template =
            image::imageops::crop_imm(&capture.frame, 20, 20, 12, 12).to_image();
        let shot_dir = tempfile::tempdir().unwrap();
        let shot_path = shot_dir.path().join("context.png");
        template.save(&shot_path).unwrap();

        let injector = RecordingInjector::default();
        let calls = injector.calls.clone();
        let (store, _resolves) = CountingStore::new();
        let mut engine = PlaybackEngine::new(screen, injector, store, clock);

        let mut rec = Recording::new("drift", None);
        let mut action = RecordedAction::new(
            0,
            ActionKind::MouseClick {
                button: MouseButton::Left,
                x: 26,
                y: 26,
            },
        );
        action.before_screenshot = Some(ScreenshotRef {
            path: shot_path,
            captured_at: Utc::now(),
        });
        rec.actions.push(action);

        let run = engine.play(&rec, &PlaybackOptions::default());
        assert_eq!(run.status, PlaybackStatus::Completed);
        assert_eq!(run.results[0].outcome, ActionOutcome::Succeeded);
        // Match center: crop at (20, 20), 12x12 -> (26, 26).
        assert_eq!(
            *calls.lock(),
            vec![Injected::Click(26, 26, MouseButton::Left, 1)]
        );
    }
}
