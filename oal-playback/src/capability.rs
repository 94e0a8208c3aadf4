//! The application-visible playback device and the playback capability it
//! implements (spec.md §4.4, §6).
//!
//! Mirrors `playbackdevice.cc`'s method surface: id allocation and the
//! per-sound/per-file tracking tables the original keeps in `PlaybackDevice`
//! live here too, on the caller thread, alongside the device's weak
//! back-reference to the manager (spec.md §9 "Cyclic ownership between
//! device manager and device" — lock on use, a failed lock means the manager
//! is gone and the call is a no-op).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::command::{Command, FinishedType, SoundSource};
use crate::host::{EventClass, HostEvent, Listener};
use crate::ids;
use crate::manager::ManagerCore;

/// `{sound-id, file-id}` returned by the file/buffer flavors of `play_sound`.
///
/// A negative `sound_id` means the call failed (device gone); `file_id` is
/// likewise negative in that case. The default value matches the original's
/// `SoundData{}` (`-1, -1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoundData {
    pub sound_id: i32,
    pub file_id: i32,
}

impl Default for SoundData {
    fn default() -> Self {
        SoundData {
            sound_id: -1,
            file_id: -1,
        }
    }
}

/// The playback operations exposed per device (spec.md §4.4/§6).
///
/// Coordinate convention (documented once, here, per spec.md §9): the
/// listener's initial position is the origin; +Y is up, -X is left, +Z is
/// behind, which is a 180-degree flip around X from typical screen
/// coordinates. Callers are responsible for negating Y/Z themselves; this
/// crate forwards whatever it is given straight to the native library.
pub trait PlaybackCapability: Send + Sync {
    fn preload_sound_file(&self, path: &str) -> i32;
    fn preload_sound_bytes(&self, bytes: Arc<[u8]>) -> i32;

    #[allow(clippy::too_many_arguments)]
    fn play_sound_file(
        &self,
        path: &str,
        volume: f32,
        looping: bool,
        relative: bool,
        x: f32,
        y: f32,
        z: f32,
    ) -> SoundData;

    #[allow(clippy::too_many_arguments)]
    fn play_sound_bytes(
        &self,
        bytes: Arc<[u8]>,
        volume: f32,
        looping: bool,
        relative: bool,
        x: f32,
        y: f32,
        z: f32,
    ) -> SoundData;

    fn play_sound_id(
        &self,
        file_id: i32,
        volume: f32,
        looping: bool,
        relative: bool,
        x: f32,
        y: f32,
        z: f32,
    ) -> i32;

    fn set_sound_pos(&self, sound_id: i32, x: f32, y: f32, z: f32) -> bool;
    fn set_sound_vol(&self, sound_id: i32, volume: f32) -> bool;
    fn set_listener_pos(&self, x: f32, y: f32, z: f32) -> bool;
    fn set_listener_vol(&self, volume: f32) -> bool;

    fn pause_sound(&self, sound_id: i32) -> bool;
    fn resume_sound(&self, sound_id: i32) -> bool;
    fn stop_sound(&self, sound_id: i32) -> bool;

    fn pause_device(&self) -> bool;
    fn resume_device(&self) -> bool;
    fn stop_all_sounds(&self);

    fn is_default_device(&self) -> bool;
}

struct FileNameToId {
    name: String,
    file_id: i32,
}

struct BufferToId {
    buffer: Arc<[u8]>,
    file_id: i32,
}

/// Application-visible handle for one device record; implements
/// [`PlaybackCapability`].
pub struct PlaybackDevice {
    device_id: i32,
    name: String,
    is_default: AtomicBool,
    owner: Weak<ManagerCore>,
    file_names: Mutex<Vec<FileNameToId>>,
    file_buffers: Mutex<Vec<BufferToId>>,
    /// `(sound_id, start_timestamp)`, in the order played; removed by
    /// swap-with-last on finish, matching spec.md §4.6 step 1.
    active_sounds: Mutex<Vec<(i32, u64)>>,
}

fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl PlaybackDevice {
    pub(crate) fn new(device_id: i32, name: String, is_default: bool, owner: Weak<ManagerCore>) -> Arc<PlaybackDevice> {
        Arc::new(PlaybackDevice {
            device_id,
            name,
            is_default: AtomicBool::new(is_default),
            owner,
            file_names: Mutex::new(Vec::new()),
            file_buffers: Mutex::new(Vec::new()),
            active_sounds: Mutex::new(Vec::new()),
        })
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_is_default(&self, is_default: bool) {
        self.is_default.store(is_default, Ordering::Relaxed);
    }

    fn owner(&self) -> Option<Arc<ManagerCore>> {
        self.owner.upgrade()
    }

    fn post(&self, owner: &Arc<ManagerCore>, command: Command) {
        owner.backend.post(self.device_id, command);
    }

    fn file_id_for_path(&self, path: &str) -> Option<i32> {
        self.file_names
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.name == path)
            .map(|entry| entry.file_id)
    }

    fn file_id_for_bytes(&self, bytes: &Arc<[u8]>) -> Option<i32> {
        self.file_buffers
            .lock()
            .unwrap()
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.buffer, bytes))
            .map(|entry| entry.file_id)
    }

    fn path_for_file_id(&self, file_id: i32) -> Option<String> {
        self.file_names
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.file_id == file_id)
            .map(|entry| entry.name.clone())
    }

    fn bytes_for_file_id(&self, file_id: i32) -> Option<Arc<[u8]>> {
        self.file_buffers
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.file_id == file_id)
            .map(|entry| entry.buffer.clone())
    }

    fn is_active(&self, sound_id: i32) -> bool {
        self.active_sounds.lock().unwrap().iter().any(|(id, _)| *id == sound_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn play(
        &self,
        owner: &Arc<ManagerCore>,
        file_id: i32,
        source: SoundSource,
        volume: f32,
        looping: bool,
        relative: bool,
        x: f32,
        y: f32,
        z: f32,
    ) -> i32 {
        let sound_id = ids::next_sound_id();
        let start_timestamp = owner.host.lock().unwrap().next_timestamp();
        self.active_sounds.lock().unwrap().push((sound_id, start_timestamp));

        self.post(
            owner,
            Command::Play {
                sound_id,
                file_id,
                source,
                volume,
                looping,
                relative,
                x,
                y,
                z,
            },
        );
        sound_id
    }

    /// Removes `sound_id` from the active list (swap-with-last, spec.md
    /// §4.6) and returns its start timestamp, if it was active.
    pub(crate) fn take_active_sound(&self, sound_id: i32) -> Option<u64> {
        let mut active = self.active_sounds.lock().unwrap();
        let idx = active.iter().position(|(id, _)| *id == sound_id)?;
        let (_, start_timestamp) = active.swap_remove(idx);
        Some(start_timestamp)
    }

    /// Dispatches a `COMPLETED`/`FILE_NOT_FOUND` finished event for
    /// `sound_id`, applying the listener-visibility rule (spec.md §4.6).
    pub(crate) fn dispatch_finished(&self, sound_id: i32, finished_type: FinishedType) {
        let start_timestamp = match self.take_active_sound(sound_id) {
            Some(ts) => ts,
            None => return,
        };
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return,
        };
        let host = owner.host.lock().unwrap();
        if !host.sound_finished_class_enabled() {
            return;
        }
        let event_time_usec = now_usec();
        for listener in host.listeners() {
            if !listener.wants(EventClass::SoundFinished) {
                continue;
            }
            self.notify_if_visible(listener, start_timestamp, event_time_usec, finished_type, sound_id);
        }
    }

    fn notify_if_visible(
        &self,
        listener: &Listener,
        start_timestamp: u64,
        event_time_usec: u64,
        finished_type: FinishedType,
        sound_id: i32,
    ) {
        if listener.added_timestamp > start_timestamp {
            // Listener was registered after this sound started.
            return;
        }
        listener.notify(HostEvent::SoundFinished {
            device_id: self.device_id,
            sound_id,
            finished_type,
            event_time_usec,
        });
    }

    /// `ABORTED` finalization: called by the manager when this device is
    /// being removed, for every sound still active on it.
    pub(crate) fn finalize_aborted(&self) {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return,
        };
        let sounds: Vec<(i32, u64)> = std::mem::take(&mut *self.active_sounds.lock().unwrap());
        let host = owner.host.lock().unwrap();
        if !host.sound_finished_class_enabled() {
            return;
        }
        let event_time_usec = now_usec();
        host.with_finalization(|host| {
            for (sound_id, start_timestamp) in &sounds {
                for listener in host.listeners() {
                    if !listener.wants(EventClass::SoundFinished) {
                        continue;
                    }
                    self.finalize_one(listener, *start_timestamp, event_time_usec, FinishedType::Aborted, *sound_id);
                }
            }
        });
    }

    /// `LISTENER_REMOVED` finalization: called by the manager for every
    /// still-active sound on this device when `listener` is being removed.
    pub(crate) fn finalize_listener_removed(&self, listener: &Listener) {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return,
        };
        let host = owner.host.lock().unwrap();
        if !host.sound_finished_class_enabled() || !listener.wants(EventClass::SoundFinished) {
            return;
        }
        let event_time_usec = now_usec();
        let sounds: Vec<(i32, u64)> = self.active_sounds.lock().unwrap().clone();
        for (sound_id, start_timestamp) in sounds {
            self.finalize_one(listener, start_timestamp, event_time_usec, FinishedType::ListenerRemoved, sound_id);
        }
    }

    fn finalize_one(
        &self,
        listener: &Listener,
        start_timestamp: u64,
        event_time_usec: u64,
        finished_type: FinishedType,
        sound_id: i32,
    ) {
        if listener.added_timestamp > start_timestamp {
            return;
        }
        let mut extra = listener.extra_data.lock().unwrap();
        if extra.is_finalized(sound_id) {
            return;
        }
        extra.mark_finalized(sound_id);
        drop(extra);
        listener.notify(HostEvent::SoundFinished {
            device_id: self.device_id,
            sound_id,
            finished_type,
            event_time_usec,
        });
    }
}

impl PlaybackCapability for PlaybackDevice {
    fn preload_sound_file(&self, path: &str) -> i32 {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return -1,
        };
        if let Some(file_id) = self.file_id_for_path(path) {
            return file_id;
        }
        let file_id = ids::next_file_id();
        self.file_names.lock().unwrap().push(FileNameToId {
            name: path.to_string(),
            file_id,
        });
        self.post(
            &owner,
            Command::Preload {
                file_id,
                source: SoundSource::Path(path.to_string()),
            },
        );
        file_id
    }

    fn preload_sound_bytes(&self, bytes: Arc<[u8]>) -> i32 {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return -1,
        };
        if let Some(file_id) = self.file_id_for_bytes(&bytes) {
            return file_id;
        }
        let file_id = ids::next_file_id();
        self.file_buffers.lock().unwrap().push(BufferToId {
            buffer: bytes.clone(),
            file_id,
        });
        self.post(
            &owner,
            Command::Preload {
                file_id,
                source: SoundSource::Bytes(bytes),
            },
        );
        file_id
    }

    fn play_sound_file(
        &self,
        path: &str,
        volume: f32,
        looping: bool,
        relative: bool,
        x: f32,
        y: f32,
        z: f32,
    ) -> SoundData {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return SoundData::default(),
        };
        let file_id = match self.file_id_for_path(path) {
            Some(id) => id,
            None => {
                let file_id = ids::next_file_id();
                self.file_names.lock().unwrap().push(FileNameToId {
                    name: path.to_string(),
                    file_id,
                });
                file_id
            }
        };
        let sound_id = self.play(
            &owner,
            file_id,
            SoundSource::Path(path.to_string()),
            volume,
            looping,
            relative,
            x,
            y,
            z,
        );
        SoundData { sound_id, file_id }
    }

    fn play_sound_bytes(
        &self,
        bytes: Arc<[u8]>,
        volume: f32,
        looping: bool,
        relative: bool,
        x: f32,
        y: f32,
        z: f32,
    ) -> SoundData {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return SoundData::default(),
        };
        let file_id = match self.file_id_for_bytes(&bytes) {
            Some(id) => id,
            None => {
                let file_id = ids::next_file_id();
                self.file_buffers.lock().unwrap().push(BufferToId {
                    buffer: bytes.clone(),
                    file_id,
                });
                file_id
            }
        };
        let sound_id = self.play(&owner, file_id, SoundSource::Bytes(bytes), volume, looping, relative, x, y, z);
        SoundData { sound_id, file_id }
    }

    fn play_sound_id(
        &self,
        file_id: i32,
        volume: f32,
        looping: bool,
        relative: bool,
        x: f32,
        y: f32,
        z: f32,
    ) -> i32 {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return -1,
        };
        let source = if let Some(path) = self.path_for_file_id(file_id) {
            SoundSource::Path(path)
        } else if let Some(bytes) = self.bytes_for_file_id(file_id) {
            SoundSource::Bytes(bytes)
        } else {
            return -1;
        };
        self.play(&owner, file_id, source, volume, looping, relative, x, y, z)
    }

    fn set_sound_pos(&self, sound_id: i32, x: f32, y: f32, z: f32) -> bool {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return false,
        };
        if !self.is_active(sound_id) {
            return false;
        }
        self.post(&owner, Command::SetSoundPosition { sound_id, x, y, z });
        true
    }

    fn set_sound_vol(&self, sound_id: i32, volume: f32) -> bool {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return false,
        };
        if !self.is_active(sound_id) {
            return false;
        }
        self.post(&owner, Command::SetSoundVolume { sound_id, volume });
        true
    }

    fn set_listener_pos(&self, x: f32, y: f32, z: f32) -> bool {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return false,
        };
        self.post(&owner, Command::SetListenerPosition { x, y, z });
        true
    }

    fn set_listener_vol(&self, volume: f32) -> bool {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return false,
        };
        self.post(&owner, Command::SetListenerVolume { volume });
        true
    }

    fn pause_sound(&self, sound_id: i32) -> bool {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return false,
        };
        if !self.is_active(sound_id) {
            return false;
        }
        self.post(&owner, Command::Pause { sound_id });
        true
    }

    fn resume_sound(&self, sound_id: i32) -> bool {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return false,
        };
        if !self.is_active(sound_id) {
            return false;
        }
        self.post(&owner, Command::Resume { sound_id });
        true
    }

    fn stop_sound(&self, sound_id: i32) -> bool {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return false,
        };
        if !self.is_active(sound_id) {
            return false;
        }
        self.take_active_sound(sound_id);
        self.post(&owner, Command::Stop { sound_id });
        true
    }

    fn pause_device(&self) -> bool {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return false,
        };
        self.post(&owner, Command::PauseDevice);
        true
    }

    fn resume_device(&self) -> bool {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return false,
        };
        self.post(&owner, Command::ResumeDevice);
        true
    }

    fn stop_all_sounds(&self) {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => {
                warn!("stop_all_sounds on device {} with no owning manager", self.device_id);
                return;
            }
        };
        self.active_sounds.lock().unwrap().clear();
        self.post(&owner, Command::StopAll);
    }

    fn is_default_device(&self) -> bool {
        if self.owner().is_none() {
            return false;
        }
        self.is_default.load(Ordering::Relaxed)
    }
}

/// Convenience overloads matching the original's non-virtual overloads
/// (`playSound(path)` at max volume, non-looping, listener-relative, origin).
impl PlaybackDevice {
    pub fn play_sound_file_default(&self, path: &str) -> SoundData {
        self.play_sound_file(path, 1.0, false, true, 0.0, 0.0, 0.0)
    }

    pub fn play_sound_bytes_default(&self, bytes: Arc<[u8]>) -> SoundData {
        self.play_sound_bytes(bytes, 1.0, false, true, 0.0, 0.0, 0.0)
    }

    pub fn play_sound_id_default(&self, file_id: i32) -> i32 {
        self.play_sound_id(file_id, 1.0, false, true, 0.0, 0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ALL_EVENT_CLASSES;
    use crate::manager::PlaybackDeviceManager;
    use crate::native::{DeviceDesc, MockNativeAudio, NativeHandle};

    fn mock_one_device() -> MockNativeAudio {
        let mut mock = MockNativeAudio::new();
        mock.expect_enumerate_devices().returning(|| {
            Ok(vec![DeviceDesc {
                name: "mock device".into(),
                is_default: true,
            }])
        });
        mock.expect_open_device().returning(|_| Ok(NativeHandle(0)));
        mock.expect_close_device().returning(|_| ());
        mock
    }

    fn expect_full_play(mock: &mut MockNativeAudio) {
        mock.expect_create_buffer_from_file().returning(|_, _| Ok(1));
        mock.expect_gen_source().returning(|_| Ok(7));
        mock.expect_set_source_gain().returning(|_, _, _| ());
        mock.expect_set_source_looping().returning(|_, _, _| ());
        mock.expect_set_source_relative().returning(|_, _, _| ());
        mock.expect_set_source_position().returning(|_, _, _, _, _| ());
        mock.expect_bind_source_buffer().returning(|_, _, _| ());
        mock.expect_play_source().returning(|_, _| Ok(()));
        mock.expect_update().returning(|_| Vec::new());
    }

    #[test]
    fn play_sound_id_replays_a_file_played_earlier() {
        let mut mock = mock_one_device();
        expect_full_play(&mut mock);

        let manager = PlaybackDeviceManager::new(Box::new(mock)).unwrap();
        let device = manager.playback_device(0).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        manager.register_listener(ALL_EVENT_CLASSES, false, move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        let first = device.play_sound_file("a.ogg", 1.0, false, true, 0.0, 0.0, 0.0);
        assert!(first.file_id >= 0);
        assert!(device.is_active(first.sound_id));

        let second_sound_id = device.play_sound_id(first.file_id, 1.0, false, true, 0.0, 0.0, 0.0);
        assert!(second_sound_id >= 0);
        assert!(second_sound_id > first.sound_id);
        assert!(device.is_active(second_sound_id));

        // Only one path entry was ever recorded: play_sound_id looked up the
        // file id from play_sound_file's own table instead of minting a new
        // one or re-resolving the path.
        assert_eq!(device.file_names.lock().unwrap().len(), 1);

        device.dispatch_finished(first.sound_id, FinishedType::Completed);
        device.dispatch_finished(second_sound_id, FinishedType::Completed);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen
            .iter()
            .any(|e| matches!(e, HostEvent::SoundFinished { sound_id, .. } if *sound_id == first.sound_id)));
        assert!(seen
            .iter()
            .any(|e| matches!(e, HostEvent::SoundFinished { sound_id, .. } if *sound_id == second_sound_id)));
    }

    #[test]
    fn play_sound_id_with_unknown_file_id_fails_without_posting() {
        let mut mock = mock_one_device();
        mock.expect_update().returning(|_| Vec::new());

        let manager = PlaybackDeviceManager::new(Box::new(mock)).unwrap();
        let device = manager.playback_device(0).unwrap();

        assert_eq!(device.play_sound_id(999, 1.0, false, true, 0.0, 0.0, 0.0), -1);
        assert!(device.active_sounds.lock().unwrap().is_empty());
    }
}
