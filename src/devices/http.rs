//! HTTP-polled device integration
//!
//! Polls a URL that answers with a JSON array of trigger events. Feedback is
//! POSTed as `{ "triggerId", "feedback" }` to an optional feedback URL, which
//! also receives a DELETE when all feedback is cleared.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::{Device, DeviceEvents, TriggerEvent};
use crate::config::{DeviceKind, HttpDeviceConfig};
use crate::feedback::Feedback;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackRequest<'a> {
    trigger_id: &'a str,
    feedback: &'a Feedback,
}

/// Fetch one batch of trigger events
async fn poll_once(client: &Client, url: &str) -> Result<Vec<TriggerEvent>> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {} failed", url))?
        .error_for_status()
        .with_context(|| format!("GET {} returned an error status", url))?;

    if response.status() == StatusCode::NO_CONTENT {
        return Ok(Vec::new());
    }

    let body = response.bytes().await.context("Failed to read poll response")?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    serde_json::from_slice(&body).with_context(|| format!("Invalid trigger list from {}", url))
}

/// Device backed by a polled HTTP endpoint
pub struct HttpDevice {
    id: String,
    config: HttpDeviceConfig,
    client: Client,
    events: Arc<DeviceEvents>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl HttpDevice {
    pub fn new(id: impl Into<String>, config: HttpDeviceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            id: id.into(),
            config,
            client,
            events: Arc::new(DeviceEvents::new()),
            poller: Mutex::new(None),
        })
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let url = self.config.url.clone();
        let events = self.events.clone();
        let device_id = self.id.clone();
        let max_failures = self.config.max_failures;
        let period = Duration::from_millis(self.config.poll_interval_ms);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            let mut failures = 0u32;
            loop {
                ticker.tick().await;
                match poll_once(&client, &url).await {
                    Ok(triggers) => {
                        failures = 0;
                        for trigger in triggers {
                            trace!("HTTP trigger [{}] {}", device_id, trigger.trigger_id);
                            events.emit_trigger(trigger);
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "Poll {}/{} failed for '{}': {:#}",
                            failures, max_failures, device_id, e
                        );
                        if failures >= max_failures {
                            events.emit_error(
                                e.context(format!("{} consecutive polls failed", failures)),
                            );
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Device for HttpDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Http
    }

    fn events(&self) -> &DeviceEvents {
        &self.events
    }

    async fn init(&self) -> Result<()> {
        debug!("Initializing HTTP device '{}': {}", self.id, self.config.url);

        // The first poll only proves the endpoint is reachable; its backlog is not replayed
        let backlog = poll_once(&self.client, &self.config.url).await?;
        if !backlog.is_empty() {
            debug!("Discarding {} pending trigger(s) for '{}'", backlog.len(), self.id);
        }

        self.events.activate()?;
        *self.poller.lock() = Some(self.spawn_poller());

        debug!("HTTP device '{}' active", self.id);
        Ok(())
    }

    async fn set_feedback(&self, trigger_id: &str, feedback: &Feedback) -> Result<()> {
        let Some(url) = &self.config.feedback_url else {
            trace!("HTTP feedback skipped for '{}' (no feedback_url)", self.id);
            return Ok(());
        };

        self.client
            .post(url)
            .json(&FeedbackRequest { trigger_id, feedback })
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?
            .error_for_status()
            .with_context(|| format!("POST {} returned an error status", url))?;
        Ok(())
    }

    async fn clear_feedback_all(&self) -> Result<()> {
        let Some(url) = &self.config.feedback_url else {
            return Ok(());
        };

        self.client
            .delete(url)
            .send()
            .await
            .with_context(|| format!("DELETE {} failed", url))?
            .error_for_status()
            .with_context(|| format!("DELETE {} returned an error status", url))?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
            debug!("HTTP device '{}' stopped polling", self.id);
        }
        self.events.detach_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ArgValue;
    use crate::feedback::Rgb;
    use mockito::Matcher;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn config(server: &mockito::ServerGuard, feedback: bool) -> HttpDeviceConfig {
        HttpDeviceConfig {
            url: format!("{}/triggers", server.url()),
            poll_interval_ms: 20,
            feedback_url: feedback.then(|| format!("{}/feedback", server.url())),
            max_failures: 2,
            request_timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_init_fails_when_endpoint_errors() {
        let mut server = mockito::Server::new_async().await;
        let _get = server.mock("GET", "/triggers").with_status(500).create_async().await;

        let device = HttpDevice::new("tally", config(&server, false)).unwrap();
        assert!(device.init().await.is_err());
        assert!(!device.events().is_active());
    }

    #[tokio::test]
    async fn test_polled_triggers_are_emitted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/triggers")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"triggerId": "t1", "arguments": {"n": 1}}]"#)
            .expect_at_least(2)
            .create_async()
            .await;

        let device = HttpDevice::new("tally", config(&server, false)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        device.events().on_trigger(Arc::new(move |event| {
            let _ = tx.send(event);
        }));

        device.init().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.trigger_id, "t1");
        assert_eq!(event.arguments.unwrap()["n"], ArgValue::Int(1));

        device.destroy().await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_repeated_poll_failures_emit_error() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/triggers")
            .with_status(204)
            .create_async()
            .await;

        let device = HttpDevice::new("tally", config(&server, false)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        device.events().on_error(Arc::new(move |e: &anyhow::Error| {
            let _ = tx.send(format!("{:#}", e));
        }));

        device.init().await.unwrap();

        // Unmatched requests are answered with 501 from here on
        ok.remove_async().await;

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(message.contains("consecutive polls failed"));
        assert!(device.events().is_faulted());

        device.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_feedback_is_posted() {
        let mut server = mockito::Server::new_async().await;
        let _get = server.mock("GET", "/triggers").with_status(204).create_async().await;
        let post = server
            .mock("POST", "/feedback")
            .match_body(Matcher::Json(json!({
                "triggerId": "t1",
                "feedback": {"type": "color", "r": 255, "g": 0, "b": 0}
            })))
            .with_status(200)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/feedback")
            .with_status(204)
            .create_async()
            .await;

        let device = HttpDevice::new("tally", config(&server, true)).unwrap();
        device.init().await.unwrap();

        device
            .set_feedback("t1", &Feedback::Color(Rgb::new(255, 0, 0)))
            .await
            .unwrap();
        device.clear_feedback_all().await.unwrap();
        device.destroy().await.unwrap();

        post.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn test_feedback_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _post = server.mock("POST", "/feedback").with_status(500).create_async().await;

        let device = HttpDevice::new("tally", config(&server, true)).unwrap();
        assert!(device.set_feedback("t1", &Feedback::Off).await.is_err());
    }

    #[tokio::test]
    async fn test_feedback_without_url_is_dropped() {
        let server = mockito::Server::new_async().await;
        let device = HttpDevice::new("tally", config(&server, false)).unwrap();

        device.set_feedback("t1", &Feedback::Off).await.unwrap();
        device.clear_feedback_all().await.unwrap();
    }
}
