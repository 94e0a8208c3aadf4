use thiserror::Error;

/// Native AL/ALC error, surfaced by [`crate::native::NativeAudio`] calls.
///
/// Error reporting from OpenAL is out-of-band (`alGetError`/`alcGetError`)
/// and must be cleared between calls; this enum is the mapped, safe
/// representation the rest of the crate works with.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OalError {
    #[error("invalid name")]
    InvalidName,
    #[error("invalid enum")]
    InvalidEnum,
    #[error("invalid value")]
    InvalidValue,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid device")]
    InvalidDevice,
    #[error("invalid context")]
    InvalidContext,
    #[error("unknown AL/ALC error")]
    Unknown,
}

impl From<u32> for OalError {
    fn from(err: u32) -> OalError {
        match err {
            openal_sys::AL_INVALID_NAME => OalError::InvalidName,
            openal_sys::AL_INVALID_ENUM => OalError::InvalidEnum,
            openal_sys::AL_INVALID_VALUE => OalError::InvalidValue,
            openal_sys::AL_INVALID_OPERATION => OalError::InvalidOperation,
            openal_sys::AL_OUT_OF_MEMORY => OalError::OutOfMemory,
            openal_sys::ALC_INVALID_DEVICE => OalError::InvalidDevice,
            openal_sys::ALC_INVALID_CONTEXT => OalError::InvalidContext,
            _ => OalError::Unknown,
        }
    }
}

/// Crate-level error surfaced at the synchronous, caller-facing boundary.
///
/// Per the spec's error taxonomy, this is only ever produced by
/// [`crate::manager::PlaybackDeviceManager::new`] (startup enumeration
/// failure). Every other caller-visible failure is a plain `false`/`-1`
/// return, not a `Result`, because unknown ids and device-gone conditions
/// are expected, frequent, and never warrant unwinding.
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("failed to enumerate or open audio devices: {0}")]
    Enumeration(String),
    #[error("an OpenAL playback device manager already exists in this process")]
    AlreadyConstructed,
}
