//! The device manager core: enumerates devices at startup, routes worker
//! events to listener dispatch, and owns the playback-device objects
//! (spec.md §4.5).

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::backend::{self, BackendHandle};
use crate::capability::PlaybackDevice;
use crate::command::{Event, FinishedType};
use crate::error::PlaybackError;
use crate::host::{DeviceManagementEvent, EventClass, HostEvent, HostFramework};
use crate::native::NativeAudio;

/// Shared state between [`PlaybackDeviceManager`] and every
/// [`PlaybackDevice`] it owns, reached by the device through a weak
/// back-reference (spec.md §9 "Cyclic ownership").
pub(crate) struct ManagerCore {
    pub(crate) backend: BackendHandle,
    pub(crate) host: Mutex<HostFramework>,
    devices: Mutex<Vec<Option<Arc<PlaybackDevice>>>>,
    default_device_id: AtomicI32,
}

/// The device-manager-wide capability exposing default-device and
/// spatial-support metadata (spec.md §6).
pub trait PlaybackManagementCapability {
    fn max_playback_devices(&self) -> i32;
    fn default_playback(&self) -> Option<Arc<PlaybackDevice>>;
    fn supports_spatial_sounds(&self) -> bool;
}

/// Enumerates devices at startup, tracks the default device, and routes
/// worker-thread events to registered listeners.
///
/// One process may construct at most one of these, for the same reason
/// `audio.rs::AudioManager` guards itself with `SINGLE_INSTANCE_GUARD`: the
/// native audio library is process-global state.
pub struct PlaybackDeviceManager {
    core: Arc<ManagerCore>,
}

impl PlaybackDeviceManager {
    /// Starts the worker thread, blocks for startup phase 1 (device
    /// enumeration), builds the matching application-visible playback
    /// devices, then signals startup phase 2 so the worker can enter its
    /// main loop (spec.md §4.1).
    pub fn new(native: Box<dyn NativeAudio>) -> Result<PlaybackDeviceManager, PlaybackError> {
        let handle = backend::spawn(native);

        if let Some(error) = handle.enumeration_error.clone() {
            handle.confirm_devices_created();
            return Err(PlaybackError::Enumeration(error));
        }

        let core = Arc::new(ManagerCore {
            host: Mutex::new(HostFramework::new()),
            devices: Mutex::new(Vec::new()),
            default_device_id: AtomicI32::new(-1),
            backend: handle,
        });

        {
            let mut devices = core.devices.lock().unwrap();
            for announcement in &core.backend.initial_devices {
                let idx = announcement.device_id as usize;
                ensure_slot(&mut devices, idx);
                devices[idx] = Some(PlaybackDevice::new(
                    announcement.device_id,
                    announcement.name.clone(),
                    announcement.is_default,
                    Arc::downgrade(&core),
                ));
                if announcement.is_default {
                    core.default_device_id.store(announcement.device_id, Ordering::Relaxed);
                }
            }
        }

        core.backend.confirm_devices_created();

        Ok(PlaybackDeviceManager { core })
    }

    pub fn playback_device(&self, device_id: i32) -> Option<Arc<PlaybackDevice>> {
        self.core
            .devices
            .lock()
            .unwrap()
            .get(device_id as usize)
            .cloned()
            .flatten()
    }

    pub fn devices(&self) -> Vec<Arc<PlaybackDevice>> {
        self.core.devices.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn default_device_id(&self) -> i32 {
        self.core.default_device_id.load(Ordering::Relaxed)
    }

    /// Registers a listener for the given event classes. `finalize_on_remove`
    /// enables the `LISTENER_REMOVED` finalization path when this listener is
    /// later unregistered.
    pub fn register_listener<F>(&self, classes: &[EventClass], finalize_on_remove: bool, callback: F) -> u64
    where
        F: Fn(HostEvent) + Send + Sync + 'static,
    {
        self.core.host.lock().unwrap().register_listener(classes, finalize_on_remove, callback)
    }

    /// Unregisters a listener, first running `LISTENER_REMOVED`
    /// finalization across every device if it was registered with the
    /// finalization flag (spec.md §4.6).
    pub fn unregister_listener(&self, id: u64) {
        let finalize = self
            .core
            .host
            .lock()
            .unwrap()
            .listeners()
            .iter()
            .find(|l| l.id == id)
            .map(|l| l.finalize_on_remove);

        if finalize == Some(true) {
            self.finalize_listener(id);
        }

        self.core.host.lock().unwrap().unregister_listener(id);
    }

    fn finalize_listener(&self, id: u64) {
        let devices = self.devices();
        let host = self.core.host.lock().unwrap();
        let listener = match host.listeners().iter().find(|l| l.id == id) {
            Some(listener) => listener,
            None => return,
        };
        host.with_finalization(|_host| {
            for device in &devices {
                device.finalize_listener_removed(listener);
            }
        });
    }

    pub fn set_sound_finished_events_enabled(&self, enabled: bool) {
        self.core.host.lock().unwrap().set_sound_finished_class_enabled(enabled);
    }

    /// Drains events the worker thread has posted and dispatches them.
    ///
    /// Spec.md §5 calls for a caller-thread periodic timer (~200ms); this
    /// crate does not spawn that timer itself (the host application owns
    /// its own event loop), so callers drive it by invoking this from
    /// whatever timer or poll loop they already run.
    pub fn pump_events(&self) {
        let events = self.core.backend.drain_events();
        for queued in events {
            self.handle_event(queued.device_id, queued.event);
        }
    }

    fn handle_event(&self, device_id: i32, event: Event) {
        match event {
            Event::DeviceAdded { name, is_default } => self.on_device_added(device_id, name, is_default),
            Event::DeviceRemoved => self.on_device_removed(device_id),
            Event::DeviceChanged { is_default } => self.on_device_changed(device_id, is_default),
            Event::SoundFinished { sound_id } => {
                if let Some(device) = self.playback_device(device_id) {
                    device.dispatch_finished(sound_id, FinishedType::Completed);
                }
            }
            Event::PlayError { sound_id, message, .. } => {
                warn!("playback error on device {} sound {}: {}", device_id, sound_id, message);
                if let Some(device) = self.playback_device(device_id) {
                    device.dispatch_finished(sound_id, FinishedType::FileNotFound);
                }
            }
        }
    }

    fn on_device_added(&self, device_id: i32, name: String, is_default: bool) {
        let device = PlaybackDevice::new(device_id, name.clone(), is_default, Arc::downgrade(&self.core));
        {
            let mut devices = self.core.devices.lock().unwrap();
            ensure_slot(&mut devices, device_id as usize);
            devices[device_id as usize] = Some(device);
        }
        if is_default {
            self.core.default_device_id.store(device_id, Ordering::Relaxed);
        }
        self.core
            .host
            .lock()
            .unwrap()
            .dispatch_device_management(DeviceManagementEvent::Added { device_id, name, is_default });
    }

    fn on_device_removed(&self, device_id: i32) {
        let removed = self
            .core
            .devices
            .lock()
            .unwrap()
            .get_mut(device_id as usize)
            .and_then(|slot| slot.take());

        if let Some(device) = removed {
            device.finalize_aborted();
        }

        if self.core.default_device_id.load(Ordering::Relaxed) == device_id {
            self.core.default_device_id.store(-1, Ordering::Relaxed);
        }

        self.core
            .host
            .lock()
            .unwrap()
            .dispatch_device_management(DeviceManagementEvent::Removed { device_id });
    }

    fn on_device_changed(&self, device_id: i32, is_default: bool) {
        if let Some(device) = self.playback_device(device_id) {
            device.set_is_default(is_default);
        }

        if is_default {
            self.core.default_device_id.store(device_id, Ordering::Relaxed);
        } else if self.core.default_device_id.load(Ordering::Relaxed) == device_id {
            self.core.default_device_id.store(-1, Ordering::Relaxed);
        }

        self.core
            .host
            .lock()
            .unwrap()
            .dispatch_device_management(DeviceManagementEvent::Changed { device_id, is_default });
    }
}

impl PlaybackManagementCapability for PlaybackDeviceManager {
    fn max_playback_devices(&self) -> i32 {
        i32::MAX
    }

    fn default_playback(&self) -> Option<Arc<PlaybackDevice>> {
        let id = self.default_device_id();
        if id < 0 {
            None
        } else {
            self.playback_device(id)
        }
    }

    fn supports_spatial_sounds(&self) -> bool {
        true
    }
}

fn ensure_slot(devices: &mut Vec<Option<Arc<PlaybackDevice>>>, idx: usize) {
    if devices.len() <= idx {
        devices.resize_with(idx + 1, || None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::PlaybackCapability;
    use crate::host::ALL_EVENT_CLASSES;
    use crate::native::{DeviceDesc, MockNativeAudio, NativeHandle};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

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
        mock.expect_detach_source_buffer().returning(|_, _| ());
        mock.expect_play_source().returning(|_, _| Ok(()));
        mock.expect_stop_source().returning(|_, _| ());
        mock.expect_delete_source().returning(|_, _| ());
        mock.expect_delete_buffer().returning(|_, _| ());
        mock.expect_update().returning(|_| Vec::new());
    }

    #[test]
    fn enumeration_failure_surfaces_as_playback_error() {
        let mut mock = MockNativeAudio::new();
        mock.expect_enumerate_devices()
            .returning(|| Err(anyhow::anyhow!("no audio subsystem")));
        let result = PlaybackDeviceManager::new(Box::new(mock));
        assert!(matches!(result, Err(PlaybackError::Enumeration(_))));
    }

    #[test]
    fn simple_play_complete_notifies_listener() {
        let mut mock = mock_one_device();
        expect_full_play(&mut mock);
        mock.expect_update().returning(|_| vec![7]);

        let manager = PlaybackDeviceManager::new(Box::new(mock)).unwrap();
        let device = manager.playback_device(0).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        manager.register_listener(ALL_EVENT_CLASSES, false, move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        let data = device.play_sound_file("a.ogg", 1.0, false, true, 0.0, 0.0, 0.0);
        assert!(data.sound_id >= 0);
        assert!(data.file_id >= 0);

        std::thread::sleep(Duration::from_millis(200));
        manager.pump_events();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            seen[0],
            HostEvent::SoundFinished {
                sound_id,
                finished_type: FinishedType::Completed,
                ..
            } if sound_id == data.sound_id
        ));
    }

    #[test]
    fn stop_suppresses_finished_event() {
        let mut mock = mock_one_device();
        expect_full_play(&mut mock);

        let manager = PlaybackDeviceManager::new(Box::new(mock)).unwrap();
        let device = manager.playback_device(0).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        manager.register_listener(ALL_EVENT_CLASSES, false, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        let data = device.play_sound_file("loop.ogg", 1.0, true, true, 0.0, 0.0, 0.0);
        std::thread::sleep(Duration::from_millis(20));
        assert!(device.stop_sound(data.sound_id));
        std::thread::sleep(Duration::from_millis(50));
        manager.pump_events();

        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn late_listener_does_not_see_earlier_sound() {
        let mut mock = mock_one_device();
        expect_full_play(&mut mock);

        let manager = PlaybackDeviceManager::new(Box::new(mock)).unwrap();
        let device = manager.playback_device(0).unwrap();

        let first = device.play_sound_file("a.ogg", 1.0, false, true, 0.0, 0.0, 0.0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        manager.register_listener(ALL_EVENT_CLASSES, false, move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        let second = device.play_sound_file("b.ogg", 1.0, false, true, 0.0, 0.0, 0.0);
        assert!(second.sound_id > first.sound_id);

        device.dispatch_finished(first.sound_id, FinishedType::Completed);
        device.dispatch_finished(second.sound_id, FinishedType::Completed);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], HostEvent::SoundFinished { sound_id, .. } if sound_id == second.sound_id));
    }

    #[test]
    fn device_removal_aborts_active_sounds_and_emits_removed() {
        let mut mock = mock_one_device();
        expect_full_play(&mut mock);

        let manager = PlaybackDeviceManager::new(Box::new(mock)).unwrap();
        let device = manager.playback_device(0).unwrap();

        let first = device.play_sound_file("a.ogg", 1.0, false, true, 0.0, 0.0, 0.0);
        let second = device.play_sound_file("b.ogg", 1.0, false, true, 0.0, 0.0, 0.0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        manager.register_listener(ALL_EVENT_CLASSES, false, move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        // Simulate the worker reporting the device removed.
        manager.on_device_removed(0);

        let seen = seen.lock().unwrap();
        let aborted_ids: Vec<i32> = seen
            .iter()
            .filter_map(|e| match e {
                HostEvent::SoundFinished {
                    sound_id,
                    finished_type: FinishedType::Aborted,
                    ..
                } => Some(*sound_id),
                _ => None,
            })
            .collect();
        assert_eq!(aborted_ids.len(), 2);
        assert!(aborted_ids.contains(&first.sound_id));
        assert!(aborted_ids.contains(&second.sound_id));
        assert!(seen
            .iter()
            .any(|e| matches!(e, HostEvent::DeviceManagement(DeviceManagementEvent::Removed { device_id: 0 }))));
        assert!(manager.playback_device(0).is_none());
    }

    #[test]
    fn finalize_on_listener_removal_reports_each_sound_once() {
        let mut mock = mock_one_device();
        expect_full_play(&mut mock);

        let manager = PlaybackDeviceManager::new(Box::new(mock)).unwrap();
        let device = manager.playback_device(0).unwrap();

        let sound = device.play_sound_file("a.ogg", 1.0, false, true, 0.0, 0.0, 0.0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let listener_id = manager.register_listener(ALL_EVENT_CLASSES, true, move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        manager.unregister_listener(listener_id);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            seen[0],
            HostEvent::SoundFinished {
                sound_id,
                finished_type: FinishedType::ListenerRemoved,
                ..
            } if sound_id == sound.sound_id
        ));
    }
}
