// Seems to trigger incorrectly frequently
#![allow(clippy::needless_lifetimes)]

mod backend;
pub mod capability;
mod command;
mod error;
pub mod host;
mod ids;
pub mod manager;
pub mod native;

pub use crate::{
    capability::{PlaybackCapability, PlaybackDevice, SoundData},
    command::FinishedType,
    error::{OalError, PlaybackError},
    host::{DeviceManagementEvent, EventClass, HostEvent, ALL_EVENT_CLASSES},
    manager::{PlaybackDeviceManager, PlaybackManagementCapability},
    native::{AlureBackend, DeviceDesc, NativeAudio, NativeHandle},
};

#[cfg(feature = "test-util")]
pub use crate::native::MockNativeAudio;
