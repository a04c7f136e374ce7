//! Global input event subscription seam.
//!
//! The platform collaborator owns the OS hook (event tap, low-level hook,
//! evdev); it hands back raw events over a channel. The subscription is an
//! owned resource released on drop, on every exit path.

use std::time::Duration;

use crossbeam_channel::Receiver;
use encore_core::action::MouseButton;
use encore_core::error::Result;

/// Raw event delivered by the capture collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// Button press at screen coordinates. `clicks` is the click-run count
    /// reported by the OS (2 for the second press of a double-click).
    Button {
        button: MouseButton,
        x: i32,
        y: i32,
        clicks: u8,
    },
    Scroll {
        dx: i32,
        dy: i32,
        x: i32,
        y: i32,
    },
    /// Printable character, already resolved through the keyboard layout.
    Char(char),
    /// Named non-printing key ("enter", "tab", "escape", "backspace", ...).
    Key(String),
}

/// Capability implemented by the platform input-capture collaborator.
pub trait EventTap {
    /// Establish the process-wide capture subscription.
    ///
    /// Fails with [`encore_core::Error::Permission`] when the OS will not
    /// grant input monitoring; no partial subscription survives a failure.
    fn open(&self) -> Result<EventSubscription>;
}

/// Owned subscription handle.
pub struct EventSubscription {
    rx: Receiver<RawEvent>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl EventSubscription {
    pub fn new(rx: Receiver<RawEvent>, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Subscription with no platform resource behind it.
    pub fn from_receiver(rx: Receiver<RawEvent>) -> Self {
        Self { rx, on_close: None }
    }

    pub fn try_recv(&self) -> Option<RawEvent> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<RawEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(close) = self.on_close.take() {
            close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn drop_releases_the_capture_resource() {
        let (tx, rx) = bounded(4);
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let sub = EventSubscription::new(rx, move || flag.store(true, Ordering::SeqCst));

        tx.send(RawEvent::Char('a')).unwrap();
        assert_eq!(sub.try_recv(), Some(RawEvent::Char('a')));
        assert!(!released.load(Ordering::SeqCst));

        drop(sub);
        assert!(released.load(Ordering::SeqCst));
    }
}
