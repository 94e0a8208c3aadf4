//! Thin, synchronous wrapper around the native 3D audio library.
//!
//! Every method here is only ever called from the worker thread (see
//! [`crate::backend`]); the trait boundary exists so the worker loop, device
//! registry and finalization logic can be driven by [`MockNativeAudio`] in
//! tests instead of linking real OpenAL/Alure.
//!
//! The native library's "play with a finished callback" primitive does not
//! translate into a mockable trait method directly (it hands the native
//! library a raw C callback pointer, invoked synchronously from inside the
//! library's own update tick). Instead, [`NativeAudio::update`] returns the
//! set of sources that finished since the previous tick, which the worker
//! maps back to active-sound records. This mirrors the polling style
//! `audio.rs`'s `OalSource::playing`/`reclaim_processed_buffers` already use
//! in the teacher crate, rather than carrying an opaque callback pointer
//! across the trait boundary.

use anyhow::{Context, Result};
use log::{debug, error, info};
use openal_sys as oal;
use std::collections::HashMap;
use std::ffi::CString;
use std::ptr::NonNull;

#[cfg(feature = "test-util")]
use mockall::automock;

use crate::error::OalError;

/// Opaque handle to an open native device+context pair.
///
/// Stable for the lifetime of the device as seen by the worker thread; never
/// interpreted by callers of this trait, only passed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// One entry from the native library's device enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDesc {
    pub name: String,
    pub is_default: bool,
}

/// The native 3D audio library surface the worker thread depends on.
///
/// All coordinates and volumes arriving here are already clamped by the
/// caller (see [`crate::command`]); implementations forward them unchanged.
#[cfg_attr(feature = "test-util", automock)]
pub trait NativeAudio: Send {
    fn enumerate_devices(&mut self) -> Result<Vec<DeviceDesc>>;
    fn open_device(&mut self, name: &str) -> Result<NativeHandle>;
    fn close_device(&mut self, device: NativeHandle);

    fn create_buffer_from_file(&mut self, device: NativeHandle, path: &str) -> Result<u32>;
    fn create_buffer_from_memory(&mut self, device: NativeHandle, bytes: &[u8]) -> Result<u32>;
    fn delete_buffer(&mut self, device: NativeHandle, buffer: u32);

    fn gen_source(&mut self, device: NativeHandle) -> Result<u32>;
    fn delete_source(&mut self, device: NativeHandle, source: u32);

    fn set_source_gain(&mut self, device: NativeHandle, source: u32, gain: f32);
    fn set_source_looping(&mut self, device: NativeHandle, source: u32, looping: bool);
    fn set_source_relative(&mut self, device: NativeHandle, source: u32, relative: bool);
    fn set_source_position(&mut self, device: NativeHandle, source: u32, x: f32, y: f32, z: f32);
    fn bind_source_buffer(&mut self, device: NativeHandle, source: u32, buffer: u32);
    fn detach_source_buffer(&mut self, device: NativeHandle, source: u32);

    fn play_source(&mut self, device: NativeHandle, source: u32) -> Result<()>;
    fn pause_source(&mut self, device: NativeHandle, source: u32);
    fn resume_source(&mut self, device: NativeHandle, source: u32);
    fn stop_source(&mut self, device: NativeHandle, source: u32);

    fn set_listener_gain(&mut self, device: NativeHandle, gain: f32);
    fn set_listener_position(&mut self, device: NativeHandle, x: f32, y: f32, z: f32);

    /// Periodic update tick. Returns the native source ids that finished
    /// playing since the previous call.
    fn update(&mut self, device: NativeHandle) -> Vec<u32>;
}

fn oal_result() -> Result<()> {
    unsafe {
        let err = oal::alGetError() as u32;
        if err == oal::AL_NO_ERROR {
            return Ok(());
        }
        Err(OalError::from(err).into())
    }
}

fn alc_result(device: *mut oal::ALCdevice) -> Result<()> {
    unsafe {
        let err = oal::alcGetError(device) as u32;
        if err == oal::ALC_NO_ERROR {
            return Ok(());
        }
        Err(OalError::from(err).into())
    }
}

struct OpenDevice {
    device: NonNull<oal::ALCdevice>,
    context: NonNull<oal::ALCcontext>,
    /// Sources with a play-with-callback outstanding, polled for completion
    /// on every [`AlureBackend::update`] call.
    playing_sources: Vec<u32>,
}

/// Real implementation of [`NativeAudio`] against OpenAL/Alure via
/// `openal-sys`.
///
/// Follows `audio.rs::OalSource`'s discipline: every native call is wrapped
/// tightly in `unsafe`, immediately followed by an error check, and resource
/// teardown happens in `Drop` rather than an explicit `close` the caller
/// might forget.
pub struct AlureBackend {
    devices: HashMap<u64, OpenDevice>,
    next_handle: u64,
}

impl AlureBackend {
    pub fn new() -> AlureBackend {
        AlureBackend {
            devices: HashMap::new(),
            next_handle: 0,
        }
    }

    fn device(&mut self, handle: NativeHandle) -> Option<&mut OpenDevice> {
        self.devices.get_mut(&handle.0)
    }

    fn make_current(&self, open: &OpenDevice) {
        unsafe {
            oal::alcMakeContextCurrent(open.context.as_ptr());
        }
    }
}

impl Default for AlureBackend {
    fn default() -> Self {
        AlureBackend::new()
    }
}

impl NativeAudio for AlureBackend {
    fn enumerate_devices(&mut self) -> Result<Vec<DeviceDesc>> {
        unsafe {
            let specifiers = oal::alcGetString(std::ptr::null_mut(), oal::ALC_DEVICE_SPECIFIER as i32);
            if specifiers.is_null() {
                return Ok(Vec::new());
            }

            let default_specifier =
                oal::alcGetString(std::ptr::null_mut(), oal::ALC_DEFAULT_DEVICE_SPECIFIER as i32);
            let default_name = if default_specifier.is_null() {
                None
            } else {
                Some(
                    std::ffi::CStr::from_ptr(default_specifier as *const i8)
                        .to_string_lossy()
                        .into_owned(),
                )
            };

            let mut names = Vec::new();
            let mut cursor = specifiers as *const i8;
            loop {
                let cstr = std::ffi::CStr::from_ptr(cursor);
                let bytes = cstr.to_bytes();
                if bytes.is_empty() {
                    break;
                }
                let name = cstr.to_string_lossy().into_owned();
                cursor = cursor.add(bytes.len() + 1);
                names.push(name);
            }

            Ok(names
                .into_iter()
                .map(|name| {
                    let is_default = default_name.as_deref() == Some(name.as_str());
                    DeviceDesc { name, is_default }
                })
                .collect())
        }
    }

    fn open_device(&mut self, name: &str) -> Result<NativeHandle> {
        unsafe {
            let cname = CString::new(name).context("device name contained a NUL byte")?;
            let device =
                NonNull::new(oal::alcOpenDevice(cname.as_ptr())).context("alcOpenDevice returned null")?;

            let context = oal::alcCreateContext(device.as_ptr(), std::ptr::null());
            alc_result(device.as_ptr()).context("failed to create ALC context")?;
            let context = NonNull::new(context).context("alcCreateContext returned null")?;

            oal::alcMakeContextCurrent(context.as_ptr());
            alc_result(device.as_ptr()).context("failed to make ALC context current")?;

            let handle = self.next_handle;
            self.next_handle += 1;

            self.devices.insert(
                handle,
                OpenDevice {
                    device,
                    context,
                    playing_sources: Vec::new(),
                },
            );

            debug!("Opened OpenAL device '{}' as handle {}", name, handle);

            Ok(NativeHandle(handle))
        }
    }

    fn close_device(&mut self, device: NativeHandle) {
        if let Some(open) = self.devices.remove(&device.0) {
            unsafe {
                oal::alcMakeContextCurrent(std::ptr::null_mut());
                oal::alcDestroyContext(open.context.as_ptr());
                if oal::alcCloseDevice(open.device.as_ptr()) == oal::ALC_FALSE as i8 {
                    error!("alcCloseDevice reported failure for handle {}", device.0);
                }
            }
            info!("Closed OpenAL device handle {}", device.0);
        }
    }

    fn create_buffer_from_file(&mut self, device: NativeHandle, path: &str) -> Result<u32> {
        let open = self
            .devices
            .get(&device.0)
            .context("create_buffer_from_file on unknown device handle")?;
        self.make_current(open);
        unsafe {
            let cpath = CString::new(path).context("file path contained a NUL byte")?;
            let buffer = oal::alureCreateBufferFromFile(cpath.as_ptr());
            if buffer == 0 {
                return Err(anyhow::anyhow!("alureCreateBufferFromFile failed for {}", path));
            }
            Ok(buffer)
        }
    }

    fn create_buffer_from_memory(&mut self, device: NativeHandle, bytes: &[u8]) -> Result<u32> {
        let open = self
            .devices
            .get(&device.0)
            .context("create_buffer_from_memory on unknown device handle")?;
        self.make_current(open);
        unsafe {
            let buffer = oal::alureCreateBufferFromMemory(bytes.as_ptr(), bytes.len() as i32);
            if buffer == 0 {
                return Err(anyhow::anyhow!("alureCreateBufferFromMemory failed"));
            }
            Ok(buffer)
        }
    }

    fn delete_buffer(&mut self, device: NativeHandle, buffer: u32) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alDeleteBuffers(1, &buffer);
                if let Err(e) = oal_result() {
                    error!("Failed to delete buffer {}: {}", buffer, e);
                }
            }
        }
    }

    fn gen_source(&mut self, device: NativeHandle) -> Result<u32> {
        let open = self
            .devices
            .get(&device.0)
            .context("gen_source on unknown device handle")?;
        self.make_current(open);
        unsafe {
            let mut source = 0u32;
            oal::alGenSources(1, &mut source);
            oal_result().context("alGenSources failed")?;
            Ok(source)
        }
    }

    fn delete_source(&mut self, device: NativeHandle, source: u32) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alDeleteSources(1, &source);
                if let Err(e) = oal_result() {
                    error!("Failed to delete source {}: {}", source, e);
                }
            }
        }
    }

    fn set_source_gain(&mut self, device: NativeHandle, source: u32, gain: f32) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alSourcef(source, oal::AL_GAIN as i32, gain);
            }
        }
    }

    fn set_source_looping(&mut self, device: NativeHandle, source: u32, looping: bool) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alSourcei(
                    source,
                    oal::AL_LOOPING as i32,
                    if looping { oal::AL_TRUE } else { oal::AL_FALSE } as i32,
                );
            }
        }
    }

    fn set_source_relative(&mut self, device: NativeHandle, source: u32, relative: bool) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alSourcei(
                    source,
                    oal::AL_SOURCE_RELATIVE as i32,
                    if relative { oal::AL_TRUE } else { oal::AL_FALSE } as i32,
                );
            }
        }
    }

    fn set_source_position(&mut self, device: NativeHandle, source: u32, x: f32, y: f32, z: f32) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alSource3f(source, oal::AL_POSITION as i32, x, y, z);
            }
        }
    }

    fn bind_source_buffer(&mut self, device: NativeHandle, source: u32, buffer: u32) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alSourcei(source, oal::AL_BUFFER as i32, buffer as i32);
            }
        }
    }

    fn detach_source_buffer(&mut self, device: NativeHandle, source: u32) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alSourcei(source, oal::AL_BUFFER as i32, 0);
            }
        }
    }

    fn play_source(&mut self, device: NativeHandle, source: u32) -> Result<()> {
        let open = self
            .devices
            .get_mut(&device.0)
            .context("play_source on unknown device handle")?;
        unsafe {
            oal::alcMakeContextCurrent(open.context.as_ptr());
            // No end-of-source callback: finished sources are picked up by
            // polling in `update()` instead.
            oal::alurePlaySource(source, None, std::ptr::null_mut());
        }
        oal_result().context("alurePlaySource failed")?;
        open.playing_sources.push(source);
        Ok(())
    }

    fn pause_source(&mut self, device: NativeHandle, source: u32) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alurePauseSource(source);
            }
        }
    }

    fn resume_source(&mut self, device: NativeHandle, source: u32) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alureResumeSource(source);
            }
        }
    }

    fn stop_source(&mut self, device: NativeHandle, source: u32) {
        if let Some(open) = self.devices.get_mut(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alureStopSource(source, oal::AL_FALSE as i8);
            }
            open.playing_sources.retain(|&s| s != source);
        }
    }

    fn set_listener_gain(&mut self, device: NativeHandle, gain: f32) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alListenerf(oal::AL_GAIN as i32, gain);
            }
        }
    }

    fn set_listener_position(&mut self, device: NativeHandle, x: f32, y: f32, z: f32) {
        if let Some(open) = self.devices.get(&device.0) {
            self.make_current(open);
            unsafe {
                oal::alListener3f(oal::AL_POSITION as i32, x, y, z);
            }
        }
    }

    fn update(&mut self, device: NativeHandle) -> Vec<u32> {
        let open = match self.devices.get_mut(&device.0) {
            Some(open) => open,
            None => return Vec::new(),
        };

        unsafe {
            oal::alcMakeContextCurrent(open.context.as_ptr());
            oal::alureUpdate();
        }

        let mut finished = Vec::new();
        open.playing_sources.retain(|&source| {
            let mut state = oal::AL_PLAYING as i32;
            unsafe {
                oal::alGetSourcei(source, oal::AL_SOURCE_STATE as i32, &mut state);
            }
            if state == oal::AL_STOPPED as i32 {
                finished.push(source);
                false
            } else {
                true
            }
        });

        finished
    }
}

impl Drop for AlureBackend {
    fn drop(&mut self) {
        let handles: Vec<u64> = self.devices.keys().copied().collect();
        for handle in handles {
            self.close_device(NativeHandle(handle));
        }
    }
}
