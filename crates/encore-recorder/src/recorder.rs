//! Converts the raw input stream into an ordered action stream.
//!
//! One recording session owns the event subscription and a conversion
//! worker. Keystrokes aggregate into text runs, scrolls debounce into a
//! single action, clicks pick up visual context, and an armed credential
//! mark swallows the next keystroke run without ever buffering it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use encore_core::action::{
    ActionKind, CredentialField, MouseButton, RecordedAction, Recording, ScreenshotRef,
};
use encore_core::clock::Clock;
use encore_core::error::Result;
use encore_core::screen::{Region, ScreenCapture, ScreenService};

use crate::tap::{EventTap, RawEvent};

/// Recorder configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Edge length of the context region captured around each click.
    pub click_region_size: u32,
    /// Quiet period that flushes the keystroke buffer into one KeyType.
    pub text_timeout_ms: u64,
    /// Quiet period that flushes accumulated scroll deltas.
    pub scroll_timeout_ms: u64,
    /// Capture before/after context screenshots on clicks.
    pub capture_screenshots: bool,
    /// Delay before the after-click context capture.
    pub settle_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            click_region_size: 100,
            text_timeout_ms: 500,
            scroll_timeout_ms: 300,
            capture_screenshots: true,
            settle_ms: 150,
        }
    }
}

/// Keystroke run in progress.
enum TextRun {
    Idle,
    Typing {
        text: String,
        started_ms: u64,
        last_ms: u64,
    },
    /// Credential entry: characters are counted as activity and dropped.
    Sensitive {
        name: String,
        field: CredentialField,
        started_ms: u64,
        last_ms: u64,
    },
}

struct ScrollRun {
    dx: i32,
    dy: i32,
    x: i32,
    y: i32,
    started_ms: u64,
    last_ms: u64,
}

/// The event-to-action state machine. Driven by the session worker; every
/// transition is synchronous so it can be exercised directly in tests.
struct Converter<C> {
    screen: Arc<ScreenService<C>>,
    clock: Arc<dyn Clock>,
    config: RecorderConfig,
    base_ms: u64,
    /// One-shot credential mark; consumed by the next keystroke run.
    armed: Option<(String, CredentialField)>,
    text: TextRun,
    scroll: Option<ScrollRun>,
    actions: Vec<RecordedAction>,
}

impl<C: ScreenCapture> Converter<C> {
    fn new(
        screen: Arc<ScreenService<C>>,
        clock: Arc<dyn Clock>,
        config: RecorderConfig,
    ) -> Self {
        let base_ms = clock.now_ms();
        Self {
            screen,
            clock,
            config,
            base_ms,
            armed: None,
            text: TextRun::Idle,
            scroll: None,
            actions: Vec::new(),
        }
    }

    fn offset(&self, at_ms: u64) -> u64 {
        at_ms.saturating_sub(self.base_ms)
    }

    fn handle(&mut self, event: RawEvent) {
        let now = self.clock.now_ms();
        match event {
            RawEvent::Char(c) => self.on_char(c, now),
            RawEvent::Key(name) => self.on_key(&name, now),
            RawEvent::Button {
                button,
                x,
                y,
                clicks,
            } => self.on_button(button, x, y, clicks, now),
            RawEvent::Scroll { dx, dy, x, y } => self.on_scroll(dx, dy, x, y, now),
        }
    }

    /// Flush runs whose quiet period has elapsed.
    fn tick(&mut self) {
        let now = self.clock.now_ms();
        let text_expired = match &self.text {
            TextRun::Idle => false,
            TextRun::Typing { last_ms, .. } | TextRun::Sensitive { last_ms, .. } => {
                now.saturating_sub(*last_ms) >= self.config.text_timeout_ms
            }
        };
        if text_expired {
            self.flush_text();
        }
        if let Some(run) = &self.scroll {
            if now.saturating_sub(run.last_ms) >= self.config.scroll_timeout_ms {
                self.flush_scroll();
            }
        }
    }

    /// Arm the one-shot credential mark. The next contiguous keystroke run
    /// becomes a single CredentialInput and its characters are discarded.
    fn arm(&mut self, name: String, field: CredentialField) {
        self.flush_pending();
        tracing::info!(credential = %name, field = %field, "credential marking armed");
        self.armed = Some((name, field));
    }

    fn on_char(&mut self, c: char, now: u64) {
        match &mut self.text {
            TextRun::Typing { text, last_ms, .. } => {
                text.push(c);
                *last_ms = now;
            }
            TextRun::Sensitive { last_ms, .. } => {
                *last_ms = now;
            }
            TextRun::Idle => {
                self.text = match self.armed.take() {
                    Some((name, field)) => TextRun::Sensitive {
                        name,
                        field,
                        started_ms: now,
                        last_ms: now,
                    },
                    None => TextRun::Typing {
                        text: c.to_string(),
                        started_ms: now,
                        last_ms: now,
                    },
                };
            }
        }
    }

    fn on_key(&mut self, name: &str, now: u64) {
        match name {
            "enter" | "tab" | "escape" => {
                self.flush_text();
                self.push(now, ActionKind::KeyPress { key: name.to_string() }, None, None);
            }
            "backspace" => match &mut self.text {
                TextRun::Typing { text, last_ms, .. } => {
                    text.pop();
                    *last_ms = now;
                }
                TextRun::Sensitive { last_ms, .. } => {
                    *last_ms = now;
                }
                TextRun::Idle => {
                    self.push(
                        now,
                        ActionKind::KeyPress {
                            key: "backspace".to_string(),
                        },
                        None,
                        None,
                    );
                }
            },
            other => {
                self.flush_text();
                self.push(
                    now,
                    ActionKind::KeyPress {
                        key: other.to_string(),
                    },
                    None,
                    None,
                );
            }
        }
    }

    fn on_button(&mut self, button: MouseButton, x: i32, y: i32, clicks: u8, now: u64) {
        self.flush_pending();

        // The OS reports the second press of a double-click with clicks = 2;
        // upgrade the single click already recorded for the same spot.
        if clicks >= 2 && button == MouseButton::Left {
            if let Some(last) = self.actions.last_mut() {
                if last.kind == (ActionKind::MouseClick { button, x, y }) {
                    last.kind = ActionKind::MouseDoubleClick { x, y };
                    return;
                }
            }
        }

        let before = self.capture_context(x, y);
        if before.is_some() && self.config.settle_ms > 0 {
            self.clock.sleep(Duration::from_millis(self.config.settle_ms));
        }
        let after = self.capture_context(x, y);

        let kind = match button {
            MouseButton::Right => ActionKind::MouseRightClick { x, y },
            button => ActionKind::MouseClick { button, x, y },
        };
        self.push(now, kind, before, after);
    }

    fn on_scroll(&mut self, dx: i32, dy: i32, x: i32, y: i32, now: u64) {
        match &mut self.scroll {
            Some(run) => {
                run.dx += dx;
                run.dy += dy;
                run.x = x;
                run.y = y;
                run.last_ms = now;
            }
            None => {
                self.scroll = Some(ScrollRun {
                    dx,
                    dy,
                    x,
                    y,
                    started_ms: now,
                    last_ms: now,
                });
            }
        }
    }

    fn capture_context(&self, x: i32, y: i32) -> Option<ScreenshotRef> {
        if !self.config.capture_screenshots {
            return None;
        }
        let size = self.config.click_region_size;
        match self.screen.capture_region(Region::centered_on(x, y, size, size)) {
            Ok(shot) => Some(shot),
            Err(err) => {
                tracing::warn!(%err, x, y, "context capture failed, recording degraded action");
                None
            }
        }
    }

    fn manual_screenshot(&mut self) -> Result<()> {
        self.flush_pending();
        let now = self.clock.now_ms();
        let shot = self.screen.capture_full()?;
        self.push(now, ActionKind::Screenshot { shot }, None, None);
        Ok(())
    }

    fn add_wait(&mut self, duration_ms: u64) {
        self.flush_pending();
        let now = self.clock.now_ms();
        self.push(now, ActionKind::Wait { duration_ms }, None, None);
    }

    fn add_open_url(&mut self, url: String) {
        self.flush_pending();
        let now = self.clock.now_ms();
        self.push(now, ActionKind::OpenUrl { url }, None, None);
    }

    /// Flush both pending runs, oldest first.
    fn flush_pending(&mut self) {
        let text_start = match &self.text {
            TextRun::Idle => None,
            TextRun::Typing { started_ms, .. } | TextRun::Sensitive { started_ms, .. } => {
                Some(*started_ms)
            }
        };
        let scroll_start = self.scroll.as_ref().map(|run| run.started_ms);
        match (text_start, scroll_start) {
            (Some(t), Some(s)) if s < t => {
                self.flush_scroll();
                self.flush_text();
            }
            (Some(_), Some(_)) => {
                self.flush_text();
                self.flush_scroll();
            }
            (Some(_), None) => self.flush_text(),
            (None, Some(_)) => self.flush_scroll(),
            (None, None) => {}
        }
    }

    fn flush_text(&mut self) {
        match std::mem::replace(&mut self.text, TextRun::Idle) {
            TextRun::Idle => {}
            TextRun::Typing {
                text, started_ms, ..
            } => {
                if !text.is_empty() {
                    let offset = self.offset(started_ms);
                    self.push_at(offset, ActionKind::KeyType { text }, None, None);
                }
            }
            TextRun::Sensitive {
                name,
                field,
                started_ms,
                ..
            } => {
                tracing::info!(credential = %name, field = %field, "recorded credential reference");
                let offset = self.offset(started_ms);
                self.push_at(
                    offset,
                    ActionKind::CredentialInput {
                        credential_name: name,
                        field,
                    },
                    None,
                    None,
                );
            }
        }
    }

    fn flush_scroll(&mut self) {
        if let Some(run) = self.scroll.take() {
            let offset = self.offset(run.started_ms);
            self.push_at(
                offset,
                ActionKind::Scroll {
                    dx: run.dx,
                    dy: run.dy,
                    x: run.x,
                    y: run.y,
                },
                None,
                None,
            );
        }
    }

    fn push(
        &mut self,
        at_ms: u64,
        kind: ActionKind,
        before: Option<ScreenshotRef>,
        after: Option<ScreenshotRef>,
    ) {
        let offset = self.offset(at_ms);
        self.push_at(offset, kind, before, after);
    }

    /// Append with the offset clamped to the last recorded one, keeping the
    /// stream non-decreasing even when a debounced run flushes late.
    fn push_at(
        &mut self,
        offset_ms: u64,
        kind: ActionKind,
        before: Option<ScreenshotRef>,
        after: Option<ScreenshotRef>,
    ) {
        let floor = self.actions.last().map(|a| a.offset_ms).unwrap_or(0);
        let mut action = RecordedAction::new(offset_ms.max(floor), kind);
        action.before_screenshot = before;
        action.after_screenshot = after;
        tracing::debug!(action = action.kind.label(), offset_ms = action.offset_ms, "recorded");
        self.actions.push(action);
    }

    fn finish(&mut self) -> Vec<RecordedAction> {
        self.flush_pending();
        std::mem::take(&mut self.actions)
    }
}

/// Factory for recording sessions. Idle until `start`.
pub struct ActionRecorder<C> {
    screen: Arc<ScreenService<C>>,
    clock: Arc<dyn Clock>,
    config: RecorderConfig,
}

impl<C: ScreenCapture + 'static> ActionRecorder<C> {
    pub fn new(
        screen: Arc<ScreenService<C>>,
        clock: Arc<dyn Clock>,
        config: RecorderConfig,
    ) -> Self {
        Self {
            screen,
            clock,
            config,
        }
    }

    /// Open the input subscription and begin converting events.
    ///
    /// A denied subscription surfaces as [`encore_core::Error::Permission`]
    /// and no session is created.
    pub fn start(
        &self,
        tap: &dyn EventTap,
        name: impl Into<String>,
        url: Option<String>,
    ) -> Result<RecordingSession<C>> {
        let subscription = tap.open()?;
        let recording = Recording::new(name, url);
        tracing::info!(recording = %recording.name, "recording started");

        let converter = Arc::new(Mutex::new(Converter::new(
            self.screen.clone(),
            self.clock.clone(),
            self.config.clone(),
        )));
        let stop = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));

        let worker = {
            let converter = converter.clone();
            let stop = stop.clone();
            let paused = paused.clone();
            thread::spawn(move || {
                let subscription = subscription;
                while !stop.load(Ordering::SeqCst) {
                    if let Some(event) = subscription.recv_timeout(Duration::from_millis(50)) {
                        if !paused.load(Ordering::SeqCst) {
                            converter.lock().handle(event);
                        }
                    }
                    converter.lock().tick();
                }
                // Drain whatever is still queued before the subscription closes.
                while let Some(event) = subscription.try_recv() {
                    if !paused.load(Ordering::SeqCst) {
                        converter.lock().handle(event);
                    }
                }
            })
        };

        Ok(RecordingSession {
            converter,
            stop,
            paused,
            worker: Some(worker),
            recording: Some(recording),
        })
    }
}

/// A live recording session. Dropping it stops the worker; `stop` returns
/// the finalized recording.
pub struct RecordingSession<C> {
    converter: Arc<Mutex<Converter<C>>>,
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    recording: Option<Recording>,
}

impl<C: ScreenCapture> RecordingSession<C> {
    /// Arm the one-shot credential mark for the next keystroke run.
    pub fn mark_credential(&self, name: impl Into<String>, field: CredentialField) {
        self.converter.lock().arm(name.into(), field);
    }

    /// Append a Screenshot action with a fresh full-screen capture.
    pub fn manual_screenshot(&self) -> Result<()> {
        self.converter.lock().manual_screenshot()
    }

    pub fn add_wait(&self, duration_ms: u64) {
        self.converter.lock().add_wait(duration_ms);
    }

    pub fn add_open_url(&self, url: impl Into<String>) {
        self.converter.lock().add_open_url(url.into());
    }

    /// Suspend conversion; events arriving while paused are discarded.
    pub fn pause(&self) {
        self.converter.lock().flush_pending();
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
    }

    /// Stop the session, close the subscription and return the recording.
    pub fn stop(mut self) -> Recording {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let actions = self.converter.lock().finish();
        let mut recording = self.recording.take().expect("session consumed exactly once");
        recording.actions = actions;
        recording.updated_at = Utc::now();
        tracing::info!(
            recording = %recording.name,
            actions = recording.actions.len(),
            "recording stopped"
        );
        recording
    }
}

impl<C> Drop for RecordingSession<C> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
