//! Device manager: owns every configured device, keeps the set alive and
//! fans device triggers out to subscribers.
//!
//! Each configured id moves through `ABSENT -> CREATING -> ACTIVE`. A device
//! that fails (init error, init timeout or a runtime `error` event) is torn
//! down and its id goes back to `ABSENT`, where the periodic reconciliation
//! pass picks it up again.

mod error;
mod factory;
mod lifecycle;


pub use error::ManagerError;
pub use factory::{DeviceFactory, IntegrationFactory};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use schemars::schema::RootSchema;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{self, AppConfig, DeviceKind};
use crate::devices::{Device, TriggerEvent};
use crate::feedback::{self, Feedback};

/// Trigger re-emitted by the manager, tagged with its source device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTrigger {
    pub device_id: String,
    #[serde(flatten)]
    pub event: TriggerEvent,
}

/// Subscriber for device triggers
pub type DeviceTriggerCallback = Arc<dyn Fn(&DeviceTrigger) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Creating,
    Active,
}

struct Slot {
    device: Arc<dyn Device>,
    state: SlotState,
}

struct ManagerInner {
    config: AppConfig,
    factory: Arc<dyn DeviceFactory>,
    registry: Mutex<BTreeMap<String, Slot>>,
    trigger_listeners: RwLock<Vec<DeviceTriggerCallback>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    refreshing: AtomicBool,
    started: AtomicBool,
    destroyed: AtomicBool,
}

/// Handle to a device manager. Cloning shares the same registry.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Create a manager for `config` using the built-in integrations
    pub fn new(config: AppConfig) -> Self {
        Self::with_factory(config, Arc::new(IntegrationFactory))
    }

    pub fn with_factory(config: AppConfig, factory: Arc<dyn DeviceFactory>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                factory,
                registry: Mutex::new(BTreeMap::new()),
                trigger_listeners: RwLock::new(Vec::new()),
                refresh_task: Mutex::new(None),
                refreshing: AtomicBool::new(false),
                started: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Configuration manifest (JSON schema) for every device type
    pub fn config_manifests() -> BTreeMap<DeviceKind, RootSchema> {
        config::config_manifests()
    }

    /// Create every configured device, then start periodic reconciliation.
    ///
    /// Individual device failures are logged and left to reconciliation; they
    /// never fail `init()`. Calling it again is a no-op.
    pub async fn init(&self) -> Result<(), ManagerError> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(ManagerError::Destroyed);
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            debug!("Device manager already initialized");
            return Ok(());
        }

        feedback::init();

        let configured = inner.config.devices.len();
        info!("Initializing {} configured device(s)...", configured);
        join_all(
            inner
                .config
                .devices
                .keys()
                .map(|device_id| inner.create_device(device_id.clone())),
        )
        .await;

        info!(
            "Device manager ready: {}/{} device(s) active",
            self.device_ids().len(),
            configured
        );

        inner.start_reconciliation();
        Ok(())
    }

    /// Retry creation of every configured device that is currently absent
    pub async fn refresh_devices(&self) {
        self.inner.refresh_devices().await;
    }

    /// Send feedback to one control of one device
    pub async fn set_feedback(
        &self,
        device_id: &str,
        trigger_id: &str,
        feedback: &Feedback,
    ) -> Result<(), ManagerError> {
        let device = self
            .inner
            .active_device(device_id)
            .ok_or_else(|| ManagerError::DeviceNotFound(device_id.to_string()))?;

        device
            .set_feedback(trigger_id, feedback)
            .await
            .map_err(|source| ManagerError::Device {
                device_id: device_id.to_string(),
                source,
            })
    }

    /// Reset feedback on every active device, one device at a time in id order.
    ///
    /// A failing device does not stop the pass; the ids that failed are reported
    /// together once every device was tried.
    pub async fn clear_feedback_all(&self) -> Result<(), ManagerError> {
        let mut failed = Vec::new();
        for (device_id, device) in self.inner.active_devices() {
            if let Err(e) = device.clear_feedback_all().await {
                warn!("Failed to clear feedback on '{}': {:#}", device_id, e);
                failed.push(device_id);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::ClearFeedback { failed })
        }
    }

    /// Register a trigger subscriber. Subscribers are called in registration order.
    pub fn subscribe_triggers(&self, callback: DeviceTriggerCallback) {
        self.inner.trigger_listeners.write().push(callback);
    }

    /// Ids of the devices that finished initializing, sorted
    pub fn device_ids(&self) -> Vec<String> {
        self.inner
            .registry
            .lock()
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::Active)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_active(&self, device_id: &str) -> bool {
        self.inner.active_device(device_id).is_some()
    }

    /// Stop reconciliation, drop subscribers and destroy every device.
    ///
    /// Device teardown failures are logged. Calling it again is a no-op.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            debug!("Device manager already destroyed");
            return;
        }

        let task = inner.refresh_task.lock().take();
        if let Some(task) = task {
            task.abort();
            debug!("Reconciliation stopped");
        }

        inner.trigger_listeners.write().clear();

        let devices: Vec<(String, Arc<dyn Device>)> = {
            let mut registry = inner.registry.lock();
            std::mem::take(&mut *registry)
                .into_iter()
                .map(|(id, slot)| (id, slot.device))
                .collect()
        };

        let count = devices.len();
        join_all(devices.iter().map(|(device_id, device)| async move {
            match device.destroy().await {
                Ok(()) => debug!("Device '{}' destroyed", device_id),
                Err(e) => warn!("Failed to destroy device '{}': {:#}", device_id, e),
            }
        }))
        .await;

        info!("Device manager destroyed ({} device(s) released)", count);
    }
}
