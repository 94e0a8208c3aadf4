//! The worker thread: sole owner of native audio state after startup.
//!
//! [`spawn`] starts the thread and drives the three-phase startup handshake
//! described in spec.md §4.1; [`BackendHandle`] is the caller-side remote
//! control (post a command, drain events, shut down).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::command::{clamp_coordinate, clamp_volume, Command, Event, QueuedCommand, QueuedEvent, SoundSource};
use crate::native::{DeviceDesc, NativeAudio, NativeHandle};

const T_WAIT: Duration = Duration::from_millis(10);
const T_UPDATE: Duration = Duration::from_millis(120);
const T_DEVSCAN: Duration = Duration::from_secs(1);

/// A device as reported to the caller thread during startup or a hot-plug
/// scan.
#[derive(Debug, Clone)]
pub struct DeviceAnnouncement {
    pub device_id: i32,
    pub name: String,
    pub is_default: bool,
}

#[derive(Default)]
struct StartupResult {
    devices: Vec<DeviceAnnouncement>,
    error: Option<String>,
}

#[derive(Default)]
struct Handshake {
    devices_ready: Mutex<bool>,
    devices_ready_cv: Condvar,
    devices_created: Mutex<bool>,
    devices_created_cv: Condvar,
}

#[derive(Default)]
struct CommandQueue {
    queue: Mutex<Vec<QueuedCommand>>,
    cv: Condvar,
}

impl CommandQueue {
    fn push(&self, command: QueuedCommand) {
        let mut queue = self.queue.lock().unwrap();
        queue.push(command);
        self.cv.notify_one();
    }

    /// Blocks up to `timeout` if empty, then takes everything currently
    /// queued.
    fn drain_wait(&self, timeout: Duration) -> Vec<QueuedCommand> {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            let (guard, _timed_out) = self.cv.wait_timeout(queue, timeout).unwrap();
            queue = guard;
        }
        std::mem::take(&mut *queue)
    }

    /// Non-blocking variant used to re-drain after unlocked native work.
    fn try_drain(&self) -> Vec<QueuedCommand> {
        let mut queue = self.queue.lock().unwrap();
        std::mem::take(&mut *queue)
    }
}

#[derive(Default)]
struct EventQueue {
    queue: Mutex<Vec<QueuedEvent>>,
}

impl EventQueue {
    fn push(&self, event: QueuedEvent) {
        self.queue.lock().unwrap().push(event);
    }

    fn drain(&self) -> Vec<QueuedEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap())
    }
}

struct ActiveSound {
    sound_id: i32,
    source: u32,
    paused: bool,
    started_while_device_paused: bool,
}

struct DeviceRecord {
    name: String,
    handle: NativeHandle,
    is_default: bool,
    paused: bool,
    removed: bool,
    buffer_cache: HashMap<i32, u32>,
    active_sounds: Vec<ActiveSound>,
    unused_sources: Vec<u32>,
}

impl DeviceRecord {
    fn find_sound(&self, sound_id: i32) -> Option<usize> {
        self.active_sounds.iter().position(|s| s.sound_id == sound_id)
    }
}

/// Looks up a live device record by id.
///
/// A free function over `&mut [Option<DeviceRecord>]` rather than a
/// `&mut self` method: it lets callers keep the returned borrow alive while
/// also calling `self.native...`, since the borrow checker can see the two
/// borrows (`self.devices` and `self.native`) are disjoint only when the
/// `self.devices` borrow is taken directly, not through an opaque method.
fn find_device(devices: &mut [Option<DeviceRecord>], device_id: i32) -> Option<&mut DeviceRecord> {
    let idx = usize::try_from(device_id).ok()?;
    devices.get_mut(idx)?.as_mut().filter(|d| !d.removed)
}

/// Caller-side remote control for the worker thread.
///
/// Holds no native state; every field is either a queue guarded by its own
/// mutex or an atomic/handshake flag, per spec.md §5.
pub struct BackendHandle {
    command_queue: Arc<CommandQueue>,
    event_queue: Arc<EventQueue>,
    shutdown: Arc<AtomicBool>,
    handshake: Arc<Handshake>,
    join_handle: Option<JoinHandle<()>>,
    pub initial_devices: Vec<DeviceAnnouncement>,
    pub enumeration_error: Option<String>,
}

impl BackendHandle {
    pub fn post(&self, device_id: i32, command: Command) {
        self.command_queue.push(QueuedCommand { device_id, command });
    }

    pub fn drain_events(&self) -> Vec<QueuedEvent> {
        self.event_queue.drain()
    }

    /// Signals the end of startup phase 2: the caller has finished creating
    /// its playback-device objects and registering them with the host
    /// framework. The worker enters its main loop only after this call.
    pub fn confirm_devices_created(&self) {
        let mut created = self.handshake.devices_created.lock().unwrap();
        *created = true;
        self.handshake.devices_created_cv.notify_one();
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Wake the worker if it's parked in the bounded command wait.
        self.command_queue.cv.notify_one();
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                error!("Audio worker thread panicked during shutdown");
            }
        }
    }
}

struct Backend {
    native: Box<dyn NativeAudio>,
    devices: Vec<Option<DeviceRecord>>,
    command_queue: Arc<CommandQueue>,
    event_queue: Arc<EventQueue>,
    shutdown: Arc<AtomicBool>,
    handshake: Arc<Handshake>,
    last_update: Instant,
    last_scan: Instant,
}

/// Starts the worker thread and blocks until startup phase 1 completes
/// (device enumeration done, or recorded as failed).
pub fn spawn(native: Box<dyn NativeAudio>) -> BackendHandle {
    let command_queue = Arc::new(CommandQueue::default());
    let event_queue = Arc::new(EventQueue::default());
    let shutdown = Arc::new(AtomicBool::new(false));
    let handshake = Arc::new(Handshake::default());
    let startup = Arc::new(Mutex::new(StartupResult::default()));

    let thread_command_queue = command_queue.clone();
    let thread_event_queue = event_queue.clone();
    let thread_shutdown = shutdown.clone();
    let thread_handshake = handshake.clone();
    let thread_startup = startup.clone();

    let join_handle = thread::spawn(move || {
        let mut backend = Backend {
            native,
            devices: Vec::new(),
            command_queue: thread_command_queue,
            event_queue: thread_event_queue,
            shutdown: thread_shutdown,
            handshake: thread_handshake,
            last_update: Instant::now(),
            last_scan: Instant::now(),
        };
        backend.run(thread_startup);
    });

    let result = {
        let mut ready = handshake.devices_ready.lock().unwrap();
        while !*ready {
            ready = handshake.devices_ready_cv.wait(ready).unwrap();
        }
        std::mem::take(&mut *startup.lock().unwrap())
    };

    BackendHandle {
        command_queue,
        event_queue,
        shutdown,
        handshake,
        join_handle: Some(join_handle),
        initial_devices: result.devices,
        enumeration_error: result.error,
    }
}

impl Backend {
    fn run(&mut self, startup: Arc<Mutex<StartupResult>>) {
        let result = self.enumerate_and_open_all();
        *startup.lock().unwrap() = result;
        {
            let mut ready = self.handshake.devices_ready.lock().unwrap();
            *ready = true;
            self.handshake.devices_ready_cv.notify_one();
        }

        {
            let mut created = self.handshake.devices_created.lock().unwrap();
            while !*created {
                created = self.handshake.devices_created_cv.wait(created).unwrap();
            }
        }

        self.last_update = Instant::now();
        self.last_scan = Instant::now();

        while !self.shutdown.load(Ordering::Acquire) {
            self.tick();
        }

        self.shutdown_all_devices();
    }

    fn enumerate_and_open_all(&mut self) -> StartupResult {
        let descs = match self.native.enumerate_devices() {
            Ok(descs) => descs,
            Err(e) => {
                return StartupResult {
                    devices: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        let mut announcements = Vec::with_capacity(descs.len());
        for desc in descs {
            match self.open_one(&desc) {
                Ok(announcement) => announcements.push(announcement),
                Err(e) => warn!("Failed to open audio device '{}': {}", desc.name, e),
            }
        }

        StartupResult {
            devices: announcements,
            error: None,
        }
    }

    fn open_one(&mut self, desc: &DeviceDesc) -> anyhow::Result<DeviceAnnouncement> {
        let handle = self.native.open_device(&desc.name)?;
        let device_id = self.alloc_device_id();
        self.devices[device_id as usize] = Some(DeviceRecord {
            name: desc.name.clone(),
            handle,
            is_default: desc.is_default,
            paused: false,
            removed: false,
            buffer_cache: HashMap::new(),
            active_sounds: Vec::new(),
            unused_sources: Vec::new(),
        });
        Ok(DeviceAnnouncement {
            device_id,
            name: desc.name.clone(),
            is_default: desc.is_default,
        })
    }

    /// Finds a free slot: either genuinely empty, or holding a
    /// logically-removed device record (spec.md §4.1 "a removed slot may be
    /// reused for a new device").
    fn alloc_device_id(&mut self) -> i32 {
        let free = self.devices.iter().position(|slot| match slot {
            None => true,
            Some(record) => record.removed,
        });
        match free {
            Some(idx) => idx as i32,
            None => {
                self.devices.push(None);
                (self.devices.len() - 1) as i32
            }
        }
    }

    fn tick(&mut self) {
        let mut commands = self.command_queue.drain_wait(T_WAIT);

        loop {
            for queued in commands.drain(..) {
                self.execute(queued.device_id, queued.command);
            }

            let now = Instant::now();
            let mut did_unlocked_work = false;

            if now.duration_since(self.last_update) >= T_UPDATE {
                self.run_update_tick();
                self.last_update = now;
                did_unlocked_work = true;
            }

            if now.duration_since(self.last_scan) >= T_DEVSCAN {
                self.scan_devices();
                self.last_scan = now;
                did_unlocked_work = true;
            }

            if !did_unlocked_work {
                break;
            }

            commands = self.command_queue.try_drain();
            if commands.is_empty() {
                break;
            }
        }
    }

    fn run_update_tick(&mut self) {
        let device_ids: Vec<i32> = self
            .devices
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_ref().filter(|d| !d.removed).map(|_| i as i32))
            .collect();

        for device_id in device_ids {
            let handle = match find_device(&mut self.devices, device_id) {
                Some(d) => d.handle,
                None => continue,
            };
            let finished_sources = self.native.update(handle);
            for source in finished_sources {
                self.handle_finished(device_id, source);
            }
        }
    }

    fn handle_finished(&mut self, device_id: i32, source: u32) {
        let sound_id = {
            let device = match find_device(&mut self.devices, device_id) {
                Some(d) => d,
                None => return,
            };
            let idx = match device.active_sounds.iter().position(|s| s.source == source) {
                Some(idx) => idx,
                None => return,
            };
            let sound = device.active_sounds.swap_remove(idx);
            device.unused_sources.push(sound.source);
            sound.sound_id
        };

        if let Some(device) = find_device(&mut self.devices, device_id) {
            let handle = device.handle;
            self.native.detach_source_buffer(handle, source);
        }

        self.event_queue.push(QueuedEvent {
            device_id,
            event: Event::SoundFinished { sound_id },
        });
    }

    fn scan_devices(&mut self) {
        let descs = match self.native.enumerate_devices() {
            Ok(descs) => descs,
            Err(e) => {
                warn!("Device scan failed: {}", e);
                return;
            }
        };

        let current_names: Vec<&str> = self
            .devices
            .iter()
            .filter_map(|d| d.as_ref())
            .filter(|d| !d.removed)
            .map(|d| d.name.as_str())
            .collect();

        let changed = current_names.len() != descs.len()
            || current_names
                .iter()
                .any(|name| !descs.iter().any(|d| d.name == *name));

        if !changed {
            return;
        }

        debug!("Device topology changed, rebuilding device set");

        let removed_ids: Vec<i32> = self
            .devices
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_ref().filter(|d| !d.removed).map(|_| i as i32))
            .collect();

        for device_id in removed_ids {
            self.remove_device(device_id);
        }

        for desc in &descs {
            match self.open_one(desc) {
                Ok(announcement) => {
                    self.event_queue.push(QueuedEvent {
                        device_id: announcement.device_id,
                        event: Event::DeviceAdded {
                            name: announcement.name,
                            is_default: announcement.is_default,
                        },
                    });
                }
                Err(e) => warn!("Failed to reopen audio device '{}': {}", desc.name, e),
            }
        }
    }

    fn remove_device(&mut self, device_id: i32) {
        self.shutdown_device(device_id);
        self.event_queue.push(QueuedEvent {
            device_id,
            event: Event::DeviceRemoved,
        });
    }

    fn shutdown_device(&mut self, device_id: i32) {
        let (handle, buffers, sources): (NativeHandle, Vec<u32>, Vec<u32>) = {
            let device = match self.devices.get_mut(device_id as usize).and_then(|s| s.as_mut()) {
                Some(d) if !d.removed => d,
                _ => return,
            };
            let handle = device.handle;
            for sound in device.active_sounds.drain(..) {
                self.native.stop_source(handle, sound.source);
                self.native.detach_source_buffer(handle, sound.source);
                device.unused_sources.push(sound.source);
            }
            let sources: Vec<u32> = device.unused_sources.drain(..).collect();
            let buffers: Vec<u32> = device.buffer_cache.drain().map(|(_, b)| b).collect();
            device.removed = true;
            (handle, buffers, sources)
        };

        for source in sources {
            self.native.delete_source(handle, source);
        }
        for buffer in buffers {
            self.native.delete_buffer(handle, buffer);
        }
        self.native.close_device(handle);
    }

    fn shutdown_all_devices(&mut self) {
        let ids: Vec<i32> = self
            .devices
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_ref().filter(|d| !d.removed).map(|_| i as i32))
            .collect();
        for id in ids {
            self.shutdown_device(id);
        }
    }

    fn execute(&mut self, device_id: i32, command: Command) {
        match command {
            Command::Preload { file_id, source } => self.exec_preload(device_id, file_id, &source),
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
            } => self.exec_play(device_id, sound_id, file_id, &source, volume, looping, relative, x, y, z),
            Command::Pause { sound_id } => self.exec_pause(device_id, sound_id),
            Command::Resume { sound_id } => self.exec_resume(device_id, sound_id),
            Command::Stop { sound_id } => self.exec_stop(device_id, sound_id),
            Command::PauseDevice => self.exec_pause_device(device_id),
            Command::ResumeDevice => self.exec_resume_device(device_id),
            Command::StopAll => self.exec_stop_all(device_id),
            Command::SetSoundPosition { sound_id, x, y, z } => {
                self.exec_set_sound_position(device_id, sound_id, x, y, z)
            }
            Command::SetSoundVolume { sound_id, volume } => {
                self.exec_set_sound_volume(device_id, sound_id, volume)
            }
            Command::SetListenerPosition { x, y, z } => self.exec_set_listener_position(device_id, x, y, z),
            Command::SetListenerVolume { volume } => self.exec_set_listener_volume(device_id, volume),
        }
    }

    fn ensure_buffer(&mut self, device_id: i32, file_id: i32, source: &SoundSource) -> Result<u32, String> {
        let handle = match find_device(&mut self.devices, device_id) {
            Some(d) => {
                if let Some(&buffer) = d.buffer_cache.get(&file_id) {
                    return Ok(buffer);
                }
                d.handle
            }
            None => return Err("device not found".to_string()),
        };

        let result = match source {
            SoundSource::Path(path) => self.native.create_buffer_from_file(handle, path),
            SoundSource::Bytes(bytes) => self.native.create_buffer_from_memory(handle, bytes),
        };

        match result {
            Ok(buffer) => {
                if let Some(d) = find_device(&mut self.devices, device_id) {
                    d.buffer_cache.insert(file_id, buffer);
                }
                Ok(buffer)
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn exec_preload(&mut self, device_id: i32, file_id: i32, source: &SoundSource) {
        if let Err(e) = self.ensure_buffer(device_id, file_id, source) {
            warn!("Preload failed for device {} file {}: {}", device_id, file_id, e);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_play(
        &mut self,
        device_id: i32,
        sound_id: i32,
        file_id: i32,
        source: &SoundSource,
        volume: f32,
        looping: bool,
        relative: bool,
        x: f32,
        y: f32,
        z: f32,
    ) {
        let buffer = match self.ensure_buffer(device_id, file_id, source) {
            Ok(b) => b,
            Err(e) => {
                self.event_queue.push(QueuedEvent {
                    device_id,
                    event: Event::PlayError {
                        file_id,
                        sound_id,
                        message: e,
                    },
                });
                return;
            }
        };

        let (handle, device_paused, popped_source) = match find_device(&mut self.devices, device_id) {
            Some(d) => (d.handle, d.paused, d.unused_sources.pop()),
            None => return,
        };

        let native_source = match popped_source {
            Some(s) => Ok(s),
            None => self.native.gen_source(handle),
        };

        let native_source = match native_source {
            Ok(s) => s,
            Err(e) => {
                self.event_queue.push(QueuedEvent {
                    device_id,
                    event: Event::PlayError {
                        file_id,
                        sound_id,
                        message: e.to_string(),
                    },
                });
                return;
            }
        };

        self.native.set_source_gain(handle, native_source, clamp_volume(volume));
        self.native.set_source_looping(handle, native_source, looping);
        self.native.set_source_relative(handle, native_source, relative);
        self.native.set_source_position(
            handle,
            native_source,
            clamp_coordinate(x),
            clamp_coordinate(y),
            clamp_coordinate(z),
        );
        self.native.bind_source_buffer(handle, native_source, buffer);

        if let Some(device) = find_device(&mut self.devices, device_id) {
            device.active_sounds.push(ActiveSound {
                sound_id,
                source: native_source,
                paused: false,
                started_while_device_paused: device_paused,
            });
        }

        match self.native.play_source(handle, native_source) {
            Ok(()) => {
                if device_paused {
                    self.native.pause_source(handle, native_source);
                }
            }
            Err(e) => {
                if let Some(device) = find_device(&mut self.devices, device_id) {
                    device.active_sounds.retain(|s| s.sound_id != sound_id);
                    device.unused_sources.push(native_source);
                }
                self.event_queue.push(QueuedEvent {
                    device_id,
                    event: Event::PlayError {
                        file_id,
                        sound_id,
                        message: e.to_string(),
                    },
                });
            }
        }
    }

    fn exec_pause(&mut self, device_id: i32, sound_id: i32) {
        let device = match find_device(&mut self.devices, device_id) {
            Some(d) => d,
            None => return,
        };
        let device_paused = device.paused;
        let idx = match device.find_sound(sound_id) {
            Some(idx) => idx,
            None => return,
        };
        let sound = &mut device.active_sounds[idx];
        if sound.paused {
            return;
        }
        sound.paused = true;
        let should_pause_native = !device_paused || sound.started_while_device_paused;
        let (handle, source) = (device.handle, sound.source);
        if should_pause_native {
            self.native.pause_source(handle, source);
        }
    }

    fn exec_resume(&mut self, device_id: i32, sound_id: i32) {
        let device = match find_device(&mut self.devices, device_id) {
            Some(d) => d,
            None => return,
        };
        let device_paused = device.paused;
        let idx = match device.find_sound(sound_id) {
            Some(idx) => idx,
            None => return,
        };
        let sound = &mut device.active_sounds[idx];
        // A sound started while the device was paused is never individually
        // marked `paused`; `started_while_device_paused` staying set past a
        // resume-device call (see exec_resume_device) is its only remaining
        // signal that it is still silent and needs an explicit resume.
        if !sound.paused && !sound.started_while_device_paused {
            return;
        }
        sound.paused = false;
        let was_started_while_paused = sound.started_while_device_paused;
        sound.started_while_device_paused = false;
        let should_resume_native = !device_paused || was_started_while_paused;
        let (handle, source) = (device.handle, sound.source);
        if should_resume_native {
            self.native.resume_source(handle, source);
        }
    }

    fn exec_stop(&mut self, device_id: i32, sound_id: i32) {
        let device = match find_device(&mut self.devices, device_id) {
            Some(d) => d,
            None => return,
        };
        let idx = match device.find_sound(sound_id) {
            Some(idx) => idx,
            None => return,
        };
        let sound = device.active_sounds.swap_remove(idx);
        let handle = device.handle;
        self.native.stop_source(handle, sound.source);
        self.native.detach_source_buffer(handle, sound.source);
        if let Some(device) = find_device(&mut self.devices, device_id) {
            device.unused_sources.push(sound.source);
        }
    }

    fn exec_pause_device(&mut self, device_id: i32) {
        let device = match find_device(&mut self.devices, device_id) {
            Some(d) => d,
            None => return,
        };
        if device.paused {
            return;
        }
        let handle = device.handle;
        let sources: Vec<u32> = device
            .active_sounds
            .iter()
            .filter(|s| !s.paused)
            .map(|s| s.source)
            .collect();
        for source in sources {
            self.native.pause_source(handle, source);
        }
        device.paused = true;
    }

    fn exec_resume_device(&mut self, device_id: i32) {
        let device = match find_device(&mut self.devices, device_id) {
            Some(d) => d,
            None => return,
        };
        if !device.paused {
            return;
        }
        let handle = device.handle;
        let mut to_resume = Vec::new();
        for sound in device.active_sounds.iter_mut().filter(|s| !s.paused) {
            // Sounds started during the pause stay flagged: they were never
            // actually resumed, so `started_while_device_paused` remains the
            // only record that a later explicit resumeSound still owes them
            // a native resume (see exec_resume).
            if !sound.started_while_device_paused {
                to_resume.push(sound.source);
            }
        }
        for source in to_resume {
            self.native.resume_source(handle, source);
        }
        device.paused = false;
    }

    fn exec_stop_all(&mut self, device_id: i32) {
        let device = match find_device(&mut self.devices, device_id) {
            Some(d) => d,
            None => return,
        };
        let handle = device.handle;
        while let Some(sound) = device.active_sounds.pop() {
            self.native.stop_source(handle, sound.source);
            self.native.detach_source_buffer(handle, sound.source);
            device.unused_sources.push(sound.source);
        }
    }

    fn exec_set_sound_position(&mut self, device_id: i32, sound_id: i32, x: f32, y: f32, z: f32) {
        let device = match find_device(&mut self.devices, device_id) {
            Some(d) => d,
            None => return,
        };
        let idx = match device.find_sound(sound_id) {
            Some(idx) => idx,
            None => return,
        };
        let (handle, source) = (device.handle, device.active_sounds[idx].source);
        self.native
            .set_source_position(handle, source, clamp_coordinate(x), clamp_coordinate(y), clamp_coordinate(z));
    }

    fn exec_set_sound_volume(&mut self, device_id: i32, sound_id: i32, volume: f32) {
        let device = match find_device(&mut self.devices, device_id) {
            Some(d) => d,
            None => return,
        };
        let idx = match device.find_sound(sound_id) {
            Some(idx) => idx,
            None => return,
        };
        let (handle, source) = (device.handle, device.active_sounds[idx].source);
        self.native.set_source_gain(handle, source, clamp_volume(volume));
    }

    fn exec_set_listener_position(&mut self, device_id: i32, x: f32, y: f32, z: f32) {
        let device = match find_device(&mut self.devices, device_id) {
            Some(d) => d,
            None => return,
        };
        let handle = device.handle;
        self.native
            .set_listener_position(handle, clamp_coordinate(x), clamp_coordinate(y), clamp_coordinate(z));
    }

    fn exec_set_listener_volume(&mut self, device_id: i32, volume: f32) {
        let device = match find_device(&mut self.devices, device_id) {
            Some(d) => d,
            None => return,
        };
        let handle = device.handle;
        self.native.set_listener_gain(handle, clamp_volume(volume));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::MockNativeAudio;
    use std::sync::atomic::AtomicUsize;

    fn mock_with_one_device() -> MockNativeAudio {
        let mut mock = MockNativeAudio::new();
        mock.expect_enumerate_devices().returning(|| {
            Ok(vec![DeviceDesc {
                name: "mock device".to_string(),
                is_default: true,
            }])
        });
        mock.expect_open_device()
            .returning(|_| Ok(NativeHandle(0)));
        mock.expect_close_device().returning(|_| ());
        mock
    }

    #[test]
    fn startup_handshake_reports_one_device() {
        let mock = mock_with_one_device();
        let handle = spawn(Box::new(mock));
        assert_eq!(handle.initial_devices.len(), 1);
        assert_eq!(handle.initial_devices[0].device_id, 0);
        assert!(handle.initial_devices[0].is_default);
        handle.confirm_devices_created();
    }

    #[test]
    fn enumeration_failure_is_reported_not_panicked() {
        let mut mock = MockNativeAudio::new();
        mock.expect_enumerate_devices()
            .returning(|| Err(anyhow::anyhow!("no audio subsystem")));
        let handle = spawn(Box::new(mock));
        assert!(handle.initial_devices.is_empty());
        assert_eq!(handle.enumeration_error.as_deref(), Some("no audio subsystem"));
        handle.confirm_devices_created();
    }

    #[test]
    fn play_then_stop_suppresses_finished_event() {
        let mut mock = mock_with_one_device();
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

        let handle = spawn(Box::new(mock));
        handle.confirm_devices_created();

        handle.post(
            0,
            Command::Play {
                sound_id: 0,
                file_id: 0,
                source: SoundSource::Path("a.ogg".to_string()),
                volume: 1.0,
                looping: false,
                relative: true,
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
        );
        handle.post(0, Command::Stop { sound_id: 0 });

        // Give the worker a moment to drain and execute both commands.
        std::thread::sleep(Duration::from_millis(50));

        let events = handle.drain_events();
        assert!(!events
            .iter()
            .any(|e| matches!(e.event, Event::SoundFinished { .. })));
    }

    #[test]
    fn replaying_same_file_id_reuses_buffer_cache() {
        let mut mock = mock_with_one_device();
        let create_calls = Arc::new(AtomicUsize::new(0));
        let create_calls_clone = create_calls.clone();
        mock.expect_create_buffer_from_file().returning(move |_, _| {
            create_calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        mock.expect_gen_source().returning(|_| Ok(7));
        mock.expect_set_source_gain().returning(|_, _, _| ());
        mock.expect_set_source_looping().returning(|_, _, _| ());
        mock.expect_set_source_relative().returning(|_, _, _| ());
        mock.expect_set_source_position().returning(|_, _, _, _, _| ());
        mock.expect_bind_source_buffer().returning(|_, _, _| ());
        mock.expect_play_source().returning(|_, _| Ok(()));

        let handle = spawn(Box::new(mock));
        handle.confirm_devices_created();

        let play = |sound_id: i32| Command::Play {
            sound_id,
            file_id: 0,
            source: SoundSource::Path("a.ogg".to_string()),
            volume: 1.0,
            looping: false,
            relative: true,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        };

        handle.post(0, play(0));
        std::thread::sleep(Duration::from_millis(30));
        handle.post(0, play(1));
        std::thread::sleep(Duration::from_millis(30));

        // A second play against the same file id must hit the device's
        // buffer cache instead of re-decoding.
        assert_eq!(create_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn device_pause_defers_sounds_started_while_paused_until_resume_sound() {
        let mut mock = mock_with_one_device();
        mock.expect_create_buffer_from_file().returning(|_, _| Ok(1));
        mock.expect_gen_source().returning(|_| Ok(7)).times(1);
        mock.expect_gen_source().returning(|_| Ok(8));
        mock.expect_set_source_gain().returning(|_, _, _| ());
        mock.expect_set_source_looping().returning(|_, _, _| ());
        mock.expect_set_source_relative().returning(|_, _, _| ());
        mock.expect_set_source_position().returning(|_, _, _, _, _| ());
        mock.expect_bind_source_buffer().returning(|_, _, _| ());
        mock.expect_play_source().returning(|_, _| Ok(()));

        let paused: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let resumed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let paused_clone = paused.clone();
        let resumed_clone = resumed.clone();
        mock.expect_pause_source().returning(move |_, source| paused_clone.lock().unwrap().push(source));
        mock.expect_resume_source().returning(move |_, source| resumed_clone.lock().unwrap().push(source));

        let handle = spawn(Box::new(mock));
        handle.confirm_devices_created();

        handle.post(
            0,
            Command::Play {
                sound_id: 0,
                file_id: 0,
                source: SoundSource::Path("a.ogg".to_string()),
                volume: 1.0,
                looping: false,
                relative: true,
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
        );
        std::thread::sleep(Duration::from_millis(30));

        handle.post(0, Command::PauseDevice);
        std::thread::sleep(Duration::from_millis(30));

        handle.post(
            0,
            Command::Play {
                sound_id: 1,
                file_id: 0,
                source: SoundSource::Path("a.ogg".to_string()),
                volume: 1.0,
                looping: false,
                relative: true,
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
        );
        std::thread::sleep(Duration::from_millis(30));

        // Sound 1 started while the device was already paused: it must be
        // silent immediately, same as sound 0 which pause-device paused.
        assert_eq!(*paused.lock().unwrap(), vec![7, 8]);

        handle.post(0, Command::ResumeDevice);
        std::thread::sleep(Duration::from_millis(30));

        // Only sound 0 (not started during the pause) comes back.
        assert_eq!(*resumed.lock().unwrap(), vec![7]);

        handle.post(0, Command::Resume { sound_id: 1 });
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(*resumed.lock().unwrap(), vec![7, 8]);
    }

    #[test]
    fn stopped_source_is_reused_instead_of_allocating_a_new_one() {
        let mut mock = mock_with_one_device();
        mock.expect_create_buffer_from_file().returning(|_, _| Ok(1));
        let gen_calls = Arc::new(AtomicUsize::new(0));
        let gen_calls_clone = gen_calls.clone();
        mock.expect_gen_source().returning(move |_| {
            gen_calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        });
        mock.expect_set_source_gain().returning(|_, _, _| ());
        mock.expect_set_source_looping().returning(|_, _, _| ());
        mock.expect_set_source_relative().returning(|_, _, _| ());
        mock.expect_set_source_position().returning(|_, _, _, _, _| ());
        mock.expect_bind_source_buffer().returning(|_, _, _| ());
        mock.expect_play_source().returning(|_, _| Ok(()));
        mock.expect_stop_source().returning(|_, _| ());

        let handle = spawn(Box::new(mock));
        handle.confirm_devices_created();

        let play = |sound_id: i32| Command::Play {
            sound_id,
            file_id: 0,
            source: SoundSource::Path("a.ogg".to_string()),
            volume: 1.0,
            looping: false,
            relative: true,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        };

        handle.post(0, play(0));
        std::thread::sleep(Duration::from_millis(30));
        handle.post(0, Command::Stop { sound_id: 0 });
        std::thread::sleep(Duration::from_millis(30));
        handle.post(0, play(1));
        std::thread::sleep(Duration::from_millis(30));

        // The source freed by stopping sound 0 must be handed to sound 1
        // rather than generating a fresh native source.
        assert_eq!(gen_calls.load(Ordering::SeqCst), 1);
    }
}
