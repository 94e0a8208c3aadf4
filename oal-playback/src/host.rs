//! A minimal host device-manager framework.
//!
//! spec.md §1/§6 describe the core as plugging into an external "host
//! device-manager framework" that aggregates capabilities and routes events
//! to listeners, referenced only by interface. No public crate implements
//! that framework, so this module supplies the smallest faithful
//! implementation of the interface spec.md §6 requires of it: event-class
//! enable/disable, device-management broadcast events, listener
//! registration with class-filter/added-timestamp/finalize-flag/extra-data
//! slot, monotonic timestamp allocation, and a listener-extra-data reset
//! hook fired at nested-depth zero (spec.md §9 "Listener extra-data").
//! [`crate::manager::PlaybackDeviceManager`] both owns and drives it, the
//! way the original `stmm-input-openal` library plugs its `Backend` into
//! the sibling `stmm-input` device-manager framework it was designed
//! against.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::command::FinishedType;

/// Event classes a listener can filter on at registration time (spec.md
/// §1's "two capability classes", surfaced to listeners per spec.md §6's
/// "listener registration with (class-filter, ...)"):
/// `handleEventCallIf(nClassIdxSoundFinishedEvent, ...)` in the original
/// framework gates sound-finished delivery the same way per listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    SoundFinished,
    DeviceManagement,
}

/// Convenience filter for listeners that want every class this core emits.
pub const ALL_EVENT_CLASSES: &[EventClass] = &[EventClass::SoundFinished, EventClass::DeviceManagement];

/// Per-listener scratch space used to de-duplicate finalization events
/// (spec.md §4.6 "Finalization de-dup").
#[derive(Debug, Default)]
pub struct ListenerExtraData {
    finalized: HashSet<i32>,
}

impl ListenerExtraData {
    pub fn is_finalized(&self, sound_id: i32) -> bool {
        self.finalized.contains(&sound_id)
    }

    pub fn mark_finalized(&mut self, sound_id: i32) {
        self.finalized.insert(sound_id);
    }

    fn reset(&mut self) {
        self.finalized.clear();
    }
}

/// One sound-finished or device-management notification delivered to a
/// registered listener.
#[derive(Debug, Clone)]
pub enum HostEvent {
    SoundFinished {
        device_id: i32,
        sound_id: i32,
        finished_type: FinishedType,
        event_time_usec: u64,
    },
    DeviceManagement(DeviceManagementEvent),
}

#[derive(Debug, Clone)]
pub enum DeviceManagementEvent {
    Added { device_id: i32, name: String, is_default: bool },
    Removed { device_id: i32 },
    Changed { device_id: i32, is_default: bool },
}

/// A registered consumer of [`HostEvent`]s.
pub struct Listener {
    pub id: u64,
    pub added_timestamp: u64,
    pub finalize_on_remove: bool,
    pub extra_data: Mutex<ListenerExtraData>,
    class_filter: HashSet<EventClass>,
    callback: Box<dyn Fn(HostEvent) + Send + Sync>,
}

impl Listener {
    pub fn notify(&self, event: HostEvent) {
        (self.callback)(event);
    }

    /// Whether this listener registered interest in `class`.
    pub fn wants(&self, class: EventClass) -> bool {
        self.class_filter.contains(&class)
    }
}

/// Owns the listener registry and the monotonic timestamp source shared by
/// sound-start timestamps and listener-added timestamps (spec.md §4.4: "both
/// from the same source").
#[derive(Default)]
pub struct HostFramework {
    listeners: Vec<Listener>,
    next_listener_id: AtomicU64,
    next_timestamp: AtomicU64,
    sound_finished_class_enabled: bool,
    // Cell, not a plain u32: with_finalization takes &self (device-removal and
    // listener-removal finalization can nest) but still needs to mutate the
    // depth counter across that call.
    nested_finalization_depth: Cell<u32>,
}

impl HostFramework {
    pub fn new() -> HostFramework {
        HostFramework {
            sound_finished_class_enabled: true,
            ..Default::default()
        }
    }

    pub fn next_timestamp(&self) -> u64 {
        self.next_timestamp.fetch_add(1, Ordering::Relaxed)
    }

    pub fn sound_finished_class_enabled(&self) -> bool {
        self.sound_finished_class_enabled
    }

    pub fn set_sound_finished_class_enabled(&mut self, enabled: bool) {
        self.sound_finished_class_enabled = enabled;
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn register_listener<F>(&mut self, classes: &[EventClass], finalize_on_remove: bool, callback: F) -> u64
    where
        F: Fn(HostEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let added_timestamp = self.next_timestamp();
        self.listeners.push(Listener {
            id,
            added_timestamp,
            finalize_on_remove,
            extra_data: Mutex::new(ListenerExtraData::default()),
            class_filter: classes.iter().copied().collect(),
            callback: Box::new(callback),
        });
        id
    }

    pub fn unregister_listener(&mut self, id: u64) -> Option<Listener> {
        let idx = self.listeners.iter().position(|l| l.id == id)?;
        Some(self.listeners.remove(idx))
    }

    pub fn dispatch_device_management(&self, event: DeviceManagementEvent) {
        for listener in &self.listeners {
            if !listener.wants(EventClass::DeviceManagement) {
                continue;
            }
            listener.notify(HostEvent::DeviceManagement(event.clone()));
        }
    }

    /// Runs `body` as one finalization episode. `body` may itself call back
    /// into `with_finalization` (the original device-removal and
    /// listener-removal paths can be nested); every listener's extra data is
    /// reset only once the nested depth returns to zero, per spec.md §4.6's
    /// reentrancy rule.
    pub fn with_finalization<F: FnOnce(&HostFramework)>(&self, body: F) {
        self.nested_finalization_depth.set(self.nested_finalization_depth.get() + 1);
        body(self);
        let depth = self.nested_finalization_depth.get() - 1;
        self.nested_finalization_depth.set(depth);
        if depth == 0 {
            for listener in &self.listeners {
                listener.extra_data.lock().unwrap().reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn listener_added_timestamp_is_monotonic_with_sound_timestamps() {
        let mut host = HostFramework::new();
        let t0 = host.next_timestamp();
        let id = host.register_listener(ALL_EVENT_CLASSES, false, |_| {});
        let t1 = host.next_timestamp();
        assert!(t0 < host.listeners()[0].added_timestamp);
        assert!(host.listeners()[0].added_timestamp < t1);
        assert_eq!(host.listeners()[0].id, id);
    }

    #[test]
    fn finalization_resets_extra_data_only_at_depth_zero() {
        let mut host = HostFramework::new();
        host.register_listener(ALL_EVENT_CLASSES, true, |_| {});
        let seen = Arc::new(StdMutex::new(Vec::new()));

        host.with_finalization(|h| {
            let listener = &h.listeners()[0];
            listener.extra_data.lock().unwrap().mark_finalized(7);
            let seen = seen.clone();
            h.with_finalization(|h2| {
                // Nested episode: depth is still > 0 on the way out of this
                // inner call, so extra data must not be reset yet.
                assert!(h2.listeners()[0].extra_data.lock().unwrap().is_finalized(7));
                seen.lock().unwrap().push(());
            });
            assert!(listener.extra_data.lock().unwrap().is_finalized(7));
        });

        assert!(!host.listeners()[0].extra_data.lock().unwrap().is_finalized(7));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn dispatch_device_management_skips_listeners_not_filtering_on_it() {
        let mut host = HostFramework::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let seen_clone = seen.clone();
        host.register_listener(&[EventClass::SoundFinished], false, move |event| {
            seen_clone.lock().unwrap().push(event);
        });
        let seen_clone = seen.clone();
        host.register_listener(&[EventClass::DeviceManagement], false, move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        host.dispatch_device_management(DeviceManagementEvent::Removed { device_id: 0 });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], HostEvent::DeviceManagement(DeviceManagementEvent::Removed { device_id: 0 })));
    }
}
