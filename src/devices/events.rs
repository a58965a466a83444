//! Per-device publish/subscribe channel for trigger and error events

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::TriggerEvent;

/// Listener for discrete inputs reported by a device
pub type TriggerCallback = Arc<dyn Fn(TriggerEvent) + Send + Sync>;

/// Listener for the fatal error of a device
pub type ErrorCallback = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Event channel owned by every device.
///
/// Enforces the emission rules of the device contract:
/// - nothing is delivered before [`DeviceEvents::activate`] (i.e. before `init()` succeeded)
/// - the first error latches the channel; later triggers and errors are dropped
pub struct DeviceEvents {
    trigger_listeners: RwLock<Vec<TriggerCallback>>,
    error_listeners: RwLock<Vec<ErrorCallback>>,
    active: AtomicBool,
    faulted: AtomicBool,
    early_fault: Mutex<Option<String>>,
}

impl Default for DeviceEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEvents {
    pub fn new() -> Self {
        Self {
            trigger_listeners: RwLock::new(Vec::new()),
            error_listeners: RwLock::new(Vec::new()),
            active: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            early_fault: Mutex::new(None),
        }
    }

    pub fn on_trigger(&self, callback: TriggerCallback) {
        self.trigger_listeners.write().push(callback);
    }

    pub fn on_error(&self, callback: ErrorCallback) {
        self.error_listeners.write().push(callback);
    }

    /// Open the channel once the device finished initializing.
    ///
    /// Fails if the device already faulted while initializing, so `init()` can
    /// report that instead of going live.
    pub fn activate(&self) -> anyhow::Result<()> {
        if self.faulted.load(Ordering::SeqCst) {
            let reason = self
                .early_fault
                .lock()
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(anyhow!("device faulted during initialization: {}", reason));
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    pub fn emit_trigger(&self, event: TriggerEvent) {
        if !self.is_active() || self.is_faulted() {
            trace!("Dropping trigger '{}' (channel closed)", event.trigger_id);
            return;
        }
        // Clone the list so listeners may detach from inside the callback
        let listeners = self.trigger_listeners.read().clone();
        for listener in listeners {
            listener(event.clone());
        }
    }

    pub fn emit_error(&self, error: anyhow::Error) {
        if self.faulted.swap(true, Ordering::SeqCst) {
            trace!("Dropping repeated device error: {:#}", error);
            return;
        }
        if !self.is_active() {
            *self.early_fault.lock() = Some(format!("{:#}", error));
            return;
        }
        let listeners = self.error_listeners.read().clone();
        for listener in listeners {
            listener(&error);
        }
    }

    /// Drop every listener; used by `destroy()`
    pub fn detach_all(&self) {
        self.trigger_listeners.write().clear();
        self.error_listeners.write().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.trigger_listeners.read().len() + self.error_listeners.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_channel() -> (DeviceEvents, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let events = DeviceEvents::new();
        let triggers = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let t = triggers.clone();
        events.on_trigger(Arc::new(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        }));
        let e = errors.clone();
        events.on_error(Arc::new(move |_: &anyhow::Error| {
            e.fetch_add(1, Ordering::SeqCst);
        }));

        (events, triggers, errors)
    }

    #[test]
    fn test_nothing_delivered_before_activation() {
        let (events, triggers, _) = counting_channel();

        events.emit_trigger(TriggerEvent::new("t1"));
        assert_eq!(triggers.load(Ordering::SeqCst), 0);

        events.activate().unwrap();
        events.emit_trigger(TriggerEvent::new("t1"));
        assert_eq!(triggers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_latches_channel() {
        let (events, triggers, errors) = counting_channel();
        events.activate().unwrap();

        events.emit_error(anyhow!("unplugged"));
        events.emit_error(anyhow!("unplugged again"));
        events.emit_trigger(TriggerEvent::new("t1"));

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(triggers.load(Ordering::SeqCst), 0);
        assert!(events.is_faulted());
    }

    #[test]
    fn test_fault_before_activation_fails_activate() {
        let (events, _, errors) = counting_channel();

        events.emit_error(anyhow!("port vanished"));
        let err = events.activate().unwrap_err();

        assert!(err.to_string().contains("port vanished"));
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert!(!events.is_active());
    }

    #[test]
    fn test_detach_all() {
        let (events, triggers, _) = counting_channel();
        events.activate().unwrap();
        assert_eq!(events.listener_count(), 2);

        events.detach_all();
        events.emit_trigger(TriggerEvent::new("t1"));

        assert_eq!(events.listener_count(), 0);
        assert_eq!(triggers.load(Ordering::SeqCst), 0);
    }
}
