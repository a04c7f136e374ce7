//! encore-core - shared vocabulary and services for desktop action
//! recording and replay.
//!
//! The platform-specific pieces (event capture, input injection, screen
//! grabbing, the secret-store backend) are capability traits implemented
//! by collaborators; everything here is platform-neutral.

pub mod abort;
pub mod action;
pub mod clock;
pub mod error;
pub mod inject;
pub mod screen;
pub mod secret;

pub use abort::AbortSignal;
pub use action::{
    redact, validate, ActionKind, CredentialField, MouseButton, RecordedAction, Recording,
    ScreenshotRef,
};
pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{Error, ResolveError, Result, ValidationError};
pub use inject::InputInjector;
pub use screen::{
    Frame, MatchResult, Region, ScreenCapture, ScreenHash, ScreenService, StabilityOptions,
};
pub use secret::{CredentialResolver, Secret, SecretStore};

pub mod prelude {
    pub use crate::abort::AbortSignal;
    pub use crate::action::{
        redact, validate, ActionKind, CredentialField, MouseButton, RecordedAction, Recording,
        ScreenshotRef,
    };
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::error::{Error, ResolveError, Result, ValidationError};
    pub use crate::inject::InputInjector;
    pub use crate::screen::{
        Frame, MatchResult, Region, ScreenCapture, ScreenService, StabilityOptions,
    };
    pub use crate::secret::{CredentialResolver, Secret, SecretStore};
}
