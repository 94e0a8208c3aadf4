//! The two tagged-record types that cross the caller/worker boundary, plus
//! the finish-reason enum carried by sound-finished events.

/// A payload to play: either a file path or an in-memory buffer.
///
/// Both variants can resolve to the same file id if the caller already
/// preloaded that exact path/pointer on this device (see
/// [`crate::capability::PlaybackDevice`]).
#[derive(Debug, Clone)]
pub enum SoundSource {
    Path(String),
    Bytes(std::sync::Arc<[u8]>),
}

/// Caller-thread → worker-thread request. Always targets one device.
#[derive(Debug, Clone)]
pub enum Command {
    Preload {
        file_id: i32,
        source: SoundSource,
    },
    Play {
        sound_id: i32,
        file_id: i32,
        source: SoundSource,
        volume: f32,
        looping: bool,
        relative: bool,
        x: f32,
        y: f32,
        z: f32,
    },
    Pause {
        sound_id: i32,
    },
    Resume {
        sound_id: i32,
    },
    Stop {
        sound_id: i32,
    },
    PauseDevice,
    ResumeDevice,
    StopAll,
    SetSoundPosition {
        sound_id: i32,
        x: f32,
        y: f32,
        z: f32,
    },
    SetSoundVolume {
        sound_id: i32,
        volume: f32,
    },
    SetListenerPosition {
        x: f32,
        y: f32,
        z: f32,
    },
    SetListenerVolume {
        volume: f32,
    },
}

/// A command addressed to a specific device, as it sits in the command
/// queue. [`Command`] itself carries no device id so that
/// [`crate::capability::PlaybackDevice`] can build one without knowing queue
/// internals; the queue pairs it with a device id at the point of posting.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub device_id: i32,
    pub command: Command,
}

/// Reason a sound-finished event was emitted.
///
/// `Completed` and `FileNotFound` come from the worker thread; `Aborted` and
/// `ListenerRemoved` are synthesized by finalization (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedType {
    Completed,
    Aborted,
    ListenerRemoved,
    FileNotFound,
}

/// Worker-thread → caller-thread notification. Always targets one device.
#[derive(Debug, Clone)]
pub enum Event {
    SoundFinished {
        sound_id: i32,
    },
    DeviceAdded {
        name: String,
        is_default: bool,
    },
    DeviceRemoved,
    DeviceChanged {
        is_default: bool,
    },
    PlayError {
        file_id: i32,
        sound_id: i32,
        message: String,
    },
}

/// An [`Event`] addressed to a specific device, as it sits in the event
/// queue.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub device_id: i32,
    pub event: Event,
}

/// Clamp a volume into the native library's accepted gain range.
pub fn clamp_volume(volume: f32) -> f32 {
    volume.clamp(0.0, 1.0)
}

/// Clamp a coordinate into the native single-precision range. OpenAL accepts
/// any finite `f32`; this guards against NaN/infinite input from callers.
pub fn clamp_coordinate(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_volume_bounds() {
        assert_eq!(clamp_volume(-1.0), 0.0);
        assert_eq!(clamp_volume(2.0), 1.0);
        assert_eq!(clamp_volume(0.5), 0.5);
    }

    #[test]
    fn clamp_coordinate_rejects_non_finite() {
        assert_eq!(clamp_coordinate(f32::NAN), 0.0);
        assert_eq!(clamp_coordinate(f32::INFINITY), 0.0);
        assert_eq!(clamp_coordinate(-3.5), -3.5);
    }
}
