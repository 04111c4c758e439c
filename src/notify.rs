//! Run completion notices posted to a chat webhook.

use crate::error::{MetricsError, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<()>;
}

/// Mattermost/Slack style incoming webhook: `{"text": ...}`.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MetricsError::Notify(format!("{} - {}", status, body)));
        }
        info!("Posted run notice");
        Ok(())
    }
}

/// Send a notice if a notifier is configured. Failures are only logged.
pub async fn send_notice(notifier: Option<&dyn Notifier>, text: &str) {
    let Some(notifier) = notifier else {
        return;
    };
    if let Err(e) = notifier.notify(text).await {
        warn!("Run notice failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, text: &str) -> Result<()> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn notify(&self, _text: &str) -> Result<()> {
            Err(MetricsError::Notify("down".to_string()))
        }
    }

    #[tokio::test]
    async fn notices_are_best_effort() {
        let recorder = Recorder::default();
        send_notice(Some(&recorder), "done").await;
        send_notice(Some(&Failing), "done").await;
        send_notice(None, "done").await;
        assert_eq!(*recorder.0.lock().unwrap(), vec!["done".to_string()]);
    }
}
