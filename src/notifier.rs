//! Delivery of call events to the outside world.

use crate::call_detector::CallEvent;
use crate::config::WebhookConfig;
use crate::error::MonitorError;
use log::{debug, info, warn};
use reqwest::Url;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;

/// Receives every event the detector produces, exactly once per transition.
pub trait CallObserver: Send + Sync {
    fn notify(&self, event: &CallEvent);
}

/// Shared HTTP client with a short timeout; webhooks are fire-and-forget.
fn webhook_http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build webhook HTTP client ({}), using defaults", e);
                reqwest::Client::new()
            })
    })
}

fn parse_webhook_url(name: &str, value: Option<&str>) -> Option<Url> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
        Ok(url) => {
            warn!("Ignoring {} webhook with unsupported scheme '{}'", name, url.scheme());
            None
        }
        Err(e) => {
            warn!("Ignoring invalid {} webhook '{}': {}", name, value, e);
            None
        }
    }
}

/// Logs events and POSTs start/end notifications as JSON.
pub struct WebhookNotifier {
    call_start: Option<Url>,
    call_end: Option<Url>,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Self {
        let call_start = parse_webhook_url("call_start", config.call_start.as_deref());
        let call_end = parse_webhook_url("call_end", config.call_end.as_deref());
        info!(
            "Webhooks: start={}, end={}",
            call_start.as_ref().map_or("none", |u| u.as_str()),
            call_end.as_ref().map_or("none", |u| u.as_str())
        );
        WebhookNotifier { call_start, call_end }
    }

    /// Target URL and JSON body for an event, if it is delivered at all.
    pub fn payload(&self, event: &CallEvent) -> Option<(Url, Value)> {
        match event {
            CallEvent::UnknownNetwork { .. } => None,
            CallEvent::CallStarted { provider, .. } => self
                .call_start
                .clone()
                .map(|url| (url, json!({ "provider": provider }))),
            CallEvent::CallEnded { duration, .. } => self
                .call_end
                .clone()
                .map(|url| (url, json!({ "duration": duration.as_secs_f64() }))),
        }
    }

    fn post(url: Url, body: Value) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime, dropping webhook to {}", url);
                return;
            }
        };

        handle.spawn(async move {
            let sent = webhook_http_client()
                .post(url.clone())
                .json(&body)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            match sent {
                Ok(response) => debug!("Webhook {} -> {}", url, response.status()),
                Err(e) => warn!("{}", MonitorError::Webhook(format!("{} failed: {}", url, e))),
            }
        });
    }
}

impl CallObserver for WebhookNotifier {
    fn notify(&self, event: &CallEvent) {
        match event {
            CallEvent::UnknownNetwork { remote, rate } => {
                debug!("Unmapped network {} count {}", remote, rate);
            }
            CallEvent::CallStarted { remote, provider, rate } => {
                info!("Call started for {} on {} count {}", provider, remote, rate);
            }
            CallEvent::CallEnded { provider, duration } => {
                info!("Call ended for {}, time {} seconds", provider, duration.as_secs());
            }
        }

        if let Some((url, body)) = self.payload(event) {
            Self::post(url, body);
        }
    }
}
