use crate::config::SlackConfig;
use crate::types::{LinkEvent, LinkState};
use log::{debug, info};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook rejected the message: {0}")]
    Rejected(String),

    #[error("Invalid notifier configuration: {0}")]
    Config(String),
}

pub type NotifyResult<T> = Result<T, NotifyError>;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts link state changes to a Slack incoming webhook. Delivery is
/// best-effort: a failed post is reported to the caller and dropped.
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    channel: String,
    username: String,
}

impl SlackNotifier {
    pub fn new(config: &SlackConfig) -> NotifyResult<Self> {
        let webhook_url = config
            .webhook_url
            .clone()
            .ok_or_else(|| NotifyError::Config("webhook_url is required".to_string()))?;
        let channel = config
            .channel
            .clone()
            .ok_or_else(|| NotifyError::Config("channel is required".to_string()))?;
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        info!("Slack notifications enabled for {}", channel);
        Ok(Self {
            client,
            webhook_url,
            channel,
            username: config.username.clone(),
        })
    }

    /// One line per state change, green for recovery, red otherwise
    pub fn build_message(events: &[LinkEvent]) -> String {
        let mut items = Vec::new();
        for event in events {
            if let LinkEvent::State { link, after, .. } = event {
                let line = if *after == LinkState::Good {
                    format!("{} : :large_green_circle: *GOOD*", link)
                } else {
                    format!("{} : :red_circle: *{}*", link, after.as_str().to_uppercase())
                };
                items.push(line);
            }
        }
        items.join("\n")
    }

    /// Post the state changes among `events`; no-op when there are none
    pub async fn notify(&self, events: &[LinkEvent]) -> NotifyResult<()> {
        let text = Self::build_message(events);
        if text.is_empty() {
            return Ok(());
        }
        debug!("posting notification: {}", text);
        let message = serde_json::json!({
            "channel": self.channel,
            "username": self.username,
            "text": text,
        });
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&message)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().to_string()));
        }
        Ok(())
    }
}
