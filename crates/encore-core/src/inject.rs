//! Input injection capability consumed by the playback engine.
//!
//! Implemented by the platform collaborator (SendInput, CGEventPost, ...).
//! Each call delivers one complete input and is never interrupted mid-flight.

use crate::action::MouseButton;
use crate::error::Result;

pub trait InputInjector: Send {
    /// Click at screen coordinates. `clicks` is 1 for single, 2 for double.
    fn click(&mut self, x: i32, y: i32, button: MouseButton, clicks: u8) -> Result<()>;

    fn type_text(&mut self, text: &str) -> Result<()>;

    /// Press a named non-printing key ("enter", "tab", ...).
    fn press_key(&mut self, key: &str) -> Result<()>;

    fn scroll(&mut self, x: i32, y: i32, dx: i32, dy: i32) -> Result<()>;

    /// Open a URL in the default browser.
    fn open_url(&mut self, url: &str) -> Result<()>;
}
