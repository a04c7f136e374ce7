//! encore-recorder - action recording sessions, playback and storage.
//!
//! Records global input into an ordered action stream and replays it with
//! visual verification, retry, credential substitution and stability
//! detection. Platform capture/injection backends plug in through the
//! capability traits in `encore-core`.

pub mod playback;
pub mod recorder;
pub mod storage;
pub mod tap;

pub use playback::{
    ActionOutcome, ActionResult, Backoff, PlaybackControl, PlaybackEngine, PlaybackOptions,
    PlaybackRun, PlaybackStatus,
};
pub use recorder::{ActionRecorder, RecorderConfig, RecordingSession};
pub use storage::RecordingStorage;
pub use tap::{EventSubscription, EventTap, RawEvent};

pub mod prelude {
    pub use crate::playback::{
        ActionOutcome, ActionResult, Backoff, PlaybackControl, PlaybackEngine, PlaybackOptions,
        PlaybackRun, PlaybackStatus,
    };
    pub use crate::recorder::{ActionRecorder, RecorderConfig, RecordingSession};
    pub use crate::storage::RecordingStorage;
    pub use crate::tap::{EventSubscription, EventTap, RawEvent};
    pub use encore_core::prelude::*;
}
