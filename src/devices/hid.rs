//! Shared hidapi access and the blocking report reader used by HID panels

use anyhow::{anyhow, bail, Context, Result};
use hidapi::{DeviceInfo, HidApi, HidDevice};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Read timeout per poll of the reader thread, bounds how long writers wait for the handle
const READ_TIMEOUT_MS: i32 = 20;

static HID_API: Lazy<Mutex<Option<HidApi>>> = Lazy::new(|| Mutex::new(None));

/// Summary of an enumerated HID device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidSummary {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    pub product: Option<String>,
}

impl From<&DeviceInfo> for HidSummary {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            serial: info.serial_number().map(str::to_string),
            product: info.product_string().map(str::to_string),
        }
    }
}

/// Run `f` against the process-wide HID API with a fresh device list
fn with_api<T>(f: impl FnOnce(&HidApi) -> Result<T>) -> Result<T> {
    let mut guard = HID_API.lock();
    if let Some(api) = guard.as_mut() {
        api.refresh_devices().context("Failed to refresh HID device list")?;
    } else {
        *guard = Some(HidApi::new().context("Failed to initialize HID API")?);
    }
    let Some(api) = guard.as_ref() else {
        bail!("HID API unavailable");
    };
    f(api)
}

/// Every HID device currently attached
pub fn list_devices() -> Result<Vec<HidSummary>> {
    with_api(|api| Ok(api.device_list().map(HidSummary::from).collect()))
}

/// Open the first device accepted by `filter`
pub(crate) fn open_first(filter: impl Fn(&HidSummary) -> bool) -> Result<(HidDevice, HidSummary)> {
    with_api(|api| {
        let info = api
            .device_list()
            .find(|info| filter(&HidSummary::from(*info)))
            .ok_or_else(|| anyhow!("no matching HID device attached"))?;
        let summary = HidSummary::from(info);
        let device = info.open_device(api).with_context(|| {
            format!(
                "Failed to open HID device {:04x}:{:04x}",
                summary.vendor_id, summary.product_id
            )
        })?;
        debug!(
            "Opened HID device {:04x}:{:04x} ({})",
            summary.vendor_id,
            summary.product_id,
            summary.product.as_deref().unwrap_or("unknown")
        );
        Ok((device, summary))
    })
}

/// Run blocking HID work (enumeration, open, report writes) off the async workers
pub(crate) async fn run_blocking<T: Send + 'static>(
    work: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    tokio::task::spawn_blocking(work)
        .await
        .context("Blocking HID task failed")?
}

/// Background thread pumping input reports out of a HID handle.
///
/// The thread stops when [`ReportReader::stop`] is called or the reader is dropped.
pub(crate) struct ReportReader {
    stop: Arc<AtomicBool>,
}

impl ReportReader {
    pub(crate) fn spawn(
        name: String,
        device: Arc<Mutex<HidDevice>>,
        report_len: usize,
        mut on_report: impl FnMut(&[u8]) + Send + 'static,
        on_error: impl FnOnce(anyhow::Error) + Send + 'static,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        std::thread::Builder::new()
            .name(format!("hid-{}", name))
            .spawn(move || {
                let mut buf = vec![0u8; report_len];
                while !flag.load(Ordering::SeqCst) {
                    let read = device.lock().read_timeout(&mut buf, READ_TIMEOUT_MS);
                    match read {
                        Ok(0) => continue,
                        Ok(n) => on_report(&buf[..n]),
                        Err(e) => {
                            if !flag.load(Ordering::SeqCst) {
                                on_error(anyhow!("HID read on '{}' failed: {}", name, e));
                            }
                            break;
                        }
                    }
                }
                trace!("HID reader '{}' stopped", name);
            })
            .context("Failed to spawn HID reader thread")?;

        Ok(Self { stop })
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for ReportReader {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Zero-pad a report to the device's fixed report length
pub(crate) fn padded(mut report: Vec<u8>, len: usize) -> Vec<u8> {
    if report.len() < len {
        report.resize(len, 0);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_blocking_propagates_result() {
        assert_eq!(run_blocking(|| Ok(7)).await.unwrap(), 7);

        let err = run_blocking(|| -> Result<()> { bail!("device busy") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("device busy"));
    }

    #[test]
    fn test_padded() {
        assert_eq!(padded(vec![3, 2], 4), vec![3, 2, 0, 0]);
        assert_eq!(padded(vec![1, 2, 3], 2), vec![1, 2, 3]);
    }
}
