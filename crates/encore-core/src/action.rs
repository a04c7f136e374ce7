//! Recordable action vocabulary shared by the recorder and the playback engine.
//!
//! Actions serialize to compact tagged JSON, one object per action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::ValidationError;

/// A recorded interaction sequence with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Starting URL opened before the first action on replay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub actions: Vec<RecordedAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recording {
    pub fn new(name: impl Into<String>, url: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            url,
            actions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append an action, re-stamping `updated_at`.
    pub fn push(&mut self, action: RecordedAction) {
        self.actions.push(action);
        self.updated_at = Utc::now();
    }
}

/// Single action with timing and optional visual context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedAction {
    /// Milliseconds since recording start. Non-decreasing across the stream.
    pub offset_ms: u64,
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Region around the target captured just before the input was delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_screenshot: Option<ScreenshotRef>,
    /// Same region captured once the input had landed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_screenshot: Option<ScreenshotRef>,
}

impl RecordedAction {
    pub fn new(offset_ms: u64, kind: ActionKind) -> Self {
        Self {
            offset_ms,
            kind,
            before_screenshot: None,
            after_screenshot: None,
        }
    }
}

/// Action data - tagged union, exhaustively matched by the playback engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    MouseClick { button: MouseButton, x: i32, y: i32 },
    MouseDoubleClick { x: i32, y: i32 },
    MouseRightClick { x: i32, y: i32 },
    Scroll { dx: i32, dy: i32, x: i32, y: i32 },
    /// Named non-printing key ("enter", "tab", "escape", ...).
    KeyPress { key: String },
    /// Aggregated run of printable keystrokes.
    KeyType { text: String },
    /// Reference to a stored credential. Never carries the value itself.
    CredentialInput {
        credential_name: String,
        field: CredentialField,
    },
    /// Explicit full-screen capture requested during recording.
    Screenshot { shot: ScreenshotRef },
    Wait { duration_ms: u64 },
    OpenUrl { url: String },
}

impl ActionKind {
    /// Click-type actions carry visual context and are gated by verification.
    pub fn is_click(&self) -> bool {
        matches!(
            self,
            ActionKind::MouseClick { .. }
                | ActionKind::MouseDoubleClick { .. }
                | ActionKind::MouseRightClick { .. }
        )
    }

    /// Navigation actions trigger stability detection after execution.
    pub fn is_navigation(&self) -> bool {
        matches!(self, ActionKind::OpenUrl { .. })
    }

    pub fn click_point(&self) -> Option<(i32, i32)> {
        match self {
            ActionKind::MouseClick { x, y, .. }
            | ActionKind::MouseDoubleClick { x, y }
            | ActionKind::MouseRightClick { x, y } => Some((*x, *y)),
            _ => None,
        }
    }

    /// Short log label. Never includes typed text or credential material.
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::MouseClick { .. } => "mouse_click",
            ActionKind::MouseDoubleClick { .. } => "mouse_double_click",
            ActionKind::MouseRightClick { .. } => "mouse_right_click",
            ActionKind::Scroll { .. } => "scroll",
            ActionKind::KeyPress { .. } => "key_press",
            ActionKind::KeyType { .. } => "key_type",
            ActionKind::CredentialInput { .. } => "credential_input",
            ActionKind::Screenshot { .. } => "screenshot",
            ActionKind::Wait { .. } => "wait",
            ActionKind::OpenUrl { .. } => "open_url",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Which field of a stored credential an input refers to.
///
/// A closed set: a secret value cannot be smuggled through this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialField {
    Username,
    Password,
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialField::Username => write!(f, "username"),
            CredentialField::Password => write!(f, "password"),
        }
    }
}

/// Opaque handle to a captured image artifact. Immutable once created;
/// the referencing recording owns its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotRef {
    pub path: PathBuf,
    pub captured_at: DateTime<Utc>,
}

/// Check the stream invariants: offsets never regress, and credential
/// references carry a label, not something shaped like a secret value.
pub fn validate(recording: &Recording) -> Result<(), ValidationError> {
    let mut prev_ms = 0u64;
    for (index, action) in recording.actions.iter().enumerate() {
        if action.offset_ms < prev_ms {
            return Err(ValidationError::OffsetRegression {
                index,
                offset_ms: action.offset_ms,
                prev_ms,
            });
        }
        prev_ms = action.offset_ms;

        match &action.kind {
            ActionKind::CredentialInput {
                credential_name, ..
            } => {
                if credential_name.is_empty() {
                    return Err(ValidationError::EmptyCredentialName { index });
                }
                if looks_like_secret(credential_name) {
                    return Err(ValidationError::SecretShapedName { index });
                }
            }
            ActionKind::KeyType { text } if text.is_empty() => {
                return Err(ValidationError::EmptyText { index });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Defensive copy taken before any export or logging path.
///
/// A compliant recorder output round-trips unchanged; anything that slipped a
/// secret-shaped value into a credential label is replaced with a placeholder.
pub fn redact(recording: &Recording) -> Recording {
    let mut out = recording.clone();
    for action in &mut out.actions {
        if let ActionKind::CredentialInput {
            credential_name, ..
        } = &mut action.kind
        {
            if looks_like_secret(credential_name) {
                *credential_name = "[redacted]".to_string();
            }
        }
    }
    out
}

/// Credential labels are short human-chosen names. A long single token
/// mixing several character classes reads as a pasted secret instead.
fn looks_like_secret(s: &str) -> bool {
    if s.len() > 64 || s.chars().any(char::is_control) {
        return true;
    }
    if s.contains(char::is_whitespace) || s.len() < 12 {
        return false;
    }
    let classes = [
        s.chars().any(|c| c.is_ascii_lowercase()),
        s.chars().any(|c| c.is_ascii_uppercase()),
        s.chars().any(|c| c.is_ascii_digit()),
        s.chars().any(|c| c.is_ascii_punctuation()),
    ]
    .iter()
    .filter(|&&b| b)
    .count();
    classes >= 3
}
