//! Device creation, eviction and the reconciliation pass

use anyhow::anyhow;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{DeviceTrigger, ManagerInner, Slot, SlotState};
use crate::devices::{Device, TriggerEvent};

/// Clears the in-progress flag even if the pass is cancelled
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ManagerInner {
    pub(super) fn active_device(&self, device_id: &str) -> Option<Arc<dyn Device>> {
        self.registry
            .lock()
            .get(device_id)
            .filter(|slot| slot.state == SlotState::Active)
            .map(|slot| slot.device.clone())
    }

    /// Snapshot of active devices in id order
    pub(super) fn active_devices(&self) -> Vec<(String, Arc<dyn Device>)> {
        self.registry
            .lock()
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::Active)
            .map(|(id, slot)| (id.clone(), slot.device.clone()))
            .collect()
    }

    /// Build, register and initialize one configured device.
    ///
    /// Does nothing if the id already has a live instance. Failures are logged
    /// and leave the id absent.
    pub(super) async fn create_device(self: &Arc<Self>, device_id: String) {
        let Some(config) = self.config.devices.get(&device_id) else {
            warn!("No configuration for device '{}'", device_id);
            return;
        };

        if self.destroyed.load(Ordering::SeqCst) || self.registry.lock().contains_key(&device_id) {
            return;
        }

        // Construction may do real work (HTTP client setup), so it stays outside the lock
        let device = match self.factory.create(&device_id, config) {
            Ok(device) => device,
            Err(e) => {
                warn!("Failed to create {} device '{}': {:#}", config.kind(), device_id, e);
                return;
            }
        };

        {
            let mut registry = self.registry.lock();
            if self.destroyed.load(Ordering::SeqCst) || registry.contains_key(&device_id) {
                debug!("Device '{}' was created concurrently, dropping duplicate", device_id);
                return;
            }

            // Listeners go in before init() so no event can be missed
            self.subscribe(&device_id, &device);
            registry.insert(
                device_id.clone(),
                Slot {
                    device: device.clone(),
                    state: SlotState::Creating,
                },
            );
        }

        debug!("Initializing {} device '{}'...", device.kind(), device_id);

        let timeout = self.config.manager.init_timeout();
        let outcome = match tokio::time::timeout(timeout, device.init()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("initialization timed out after {:?}", timeout)),
        };

        match outcome {
            Ok(()) => {
                if self.promote(&device_id, &device) {
                    info!("Device '{}' ({}) active", device_id, device.kind());
                } else {
                    debug!("Device '{}' was released while initializing", device_id);
                    self.evict(&device_id, &device).await;
                }
            }
            Err(e) => {
                warn!("Failed to initialize device '{}': {:#}", device_id, e);
                self.evict(&device_id, &device).await;
            }
        }
    }

    /// Mark a creating slot active if it still holds this instance
    fn promote(&self, device_id: &str, device: &Arc<dyn Device>) -> bool {
        let mut registry = self.registry.lock();
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        match registry.get_mut(device_id) {
            Some(slot) if Arc::ptr_eq(&slot.device, device) => {
                slot.state = SlotState::Active;
                true
            }
            _ => false,
        }
    }

    /// Destroy an instance, then free its slot if the registry still maps the id to it
    async fn evict(&self, device_id: &str, device: &Arc<dyn Device>) {
        if let Err(e) = device.destroy().await {
            warn!("Failed to destroy device '{}': {:#}", device_id, e);
        }

        let mut registry = self.registry.lock();
        let current = registry
            .get(device_id)
            .is_some_and(|slot| Arc::ptr_eq(&slot.device, device));
        if current {
            registry.remove(device_id);
            debug!("Device '{}' removed from registry", device_id);
        }
    }

    fn subscribe(self: &Arc<Self>, device_id: &str, device: &Arc<dyn Device>) {
        let manager = Arc::downgrade(self);
        let id = device_id.to_string();
        device.events().on_trigger(Arc::new(move |event| {
            if let Some(inner) = manager.upgrade() {
                inner.forward_trigger(&id, event);
            }
        }));

        let manager = Arc::downgrade(self);
        let instance = Arc::downgrade(device);
        let id = device_id.to_string();
        // Errors may be raised from driver threads outside the runtime
        let runtime = Handle::current();
        device.events().on_error(Arc::new(move |error: &anyhow::Error| {
            warn!("Device '{}' failed: {:#}", id, error);
            let (Some(inner), Some(device)) = (manager.upgrade(), instance.upgrade()) else {
                return;
            };
            let id = id.clone();
            runtime.spawn(async move {
                inner.evict(&id, &device).await;
            });
        }));
    }

    fn forward_trigger(&self, device_id: &str, event: TriggerEvent) {
        let trigger = DeviceTrigger {
            device_id: device_id.to_string(),
            event,
        };
        trace!("Trigger {}/{}", trigger.device_id, trigger.event.trigger_id);

        let listeners = self.trigger_listeners.read().clone();
        for listener in listeners {
            listener(&trigger);
        }
    }

    /// One reconciliation pass. A pass started while another runs is a no-op.
    pub(super) async fn refresh_devices(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconciliation already in progress, skipping");
            return;
        }
        let _guard = RefreshGuard(&self.refreshing);

        let absent: Vec<String> = {
            let registry = self.registry.lock();
            self.config
                .devices
                .keys()
                .filter(|id| !registry.contains_key(*id))
                .cloned()
                .collect()
        };
        if absent.is_empty() {
            return;
        }

        debug!("Reconciling {} absent device(s): {:?}", absent.len(), absent);
        join_all(absent.into_iter().map(|device_id| self.create_device(device_id))).await;
    }

    /// Spawn the periodic reconciliation task (once)
    pub(super) fn start_reconciliation(self: &Arc<Self>) {
        let period = self.config.manager.refresh_interval();
        let manager = Arc::downgrade(self);

        let mut task = self.refresh_task.lock();
        if self.destroyed.load(Ordering::SeqCst) || task.is_some() {
            return;
        }

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = manager.upgrade() else {
                    break;
                };
                inner.refresh_devices().await;
            }
        }));
        debug!("Reconciliation every {:?}", period);
    }
}
