use thiserror::Error;

/// Errors surfaced by the [`Manager`](super::Manager) public API
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    #[error("device '{device_id}' failed: {source}")]
    Device {
        device_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("clearing feedback failed for {} device(s): {}", failed.len(), failed.join(", "))]
    ClearFeedback { failed: Vec<String> },

    #[error("device manager has been destroyed")]
    Destroyed,
}
